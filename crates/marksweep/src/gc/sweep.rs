//! Sweeping and the major collection protocol.
//!
//! A sweep first *checks* every block: the block is claimed through its
//! slot in the allocated-block array, its mark bits are counted, and it is
//! either freed (nothing marked) or moved to NEED_SWEEPING and put back on
//! a free-block list. Unless sweeping is lazy, the checker then rebuilds
//! the block's free list right away.
//!
//! The sweep job walks the array from high to low. A mutator that needs the
//! sweep finished walks it from low to high without waiting on claimed
//! slots, then waits for the job. The job compacts the array only once no
//! mutator is walking it.
//!
//! ```text
//! sweep state:  NEED_SWEEPING -> SWEEPING <-> SWEEPING_AND_ITERATING
//!                                   |
//!                               COMPACTING -> SWEPT -> NEED_SWEEPING
//! ```

use std::ptr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam::utils::Backoff;

use crate::block::{slot_word, write_fence, zero_slot, BlockRef, BlockState};
use crate::gc::CollectionPhase;
use crate::heap::{BlockSlot, MajorHeap};
use crate::metrics::{CollectionKind, HeapCounters, PhaseTimer};

/// A size class needs at least this many sampled blocks to be evacuated.
pub const MIN_EVACUATION_BLOCKS: usize = 5;

/// Progress of the current sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SweepState {
    /// The last sweep is over.
    Swept = 0,
    /// Marking is running; a sweep must follow.
    NeedSweeping = 1,
    /// The sweep job is checking blocks.
    Sweeping = 2,
    /// A mutator is helping check blocks.
    SweepingAndIterating = 3,
    /// The sweep job is compacting the block array.
    Compacting = 4,
}

impl SweepState {
    /// Decodes a raw state byte.
    #[must_use]
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Swept),
            1 => Some(Self::NeedSweeping),
            2 => Some(Self::Sweeping),
            3 => Some(Self::SweepingAndIterating),
            4 => Some(Self::Compacting),
            _ => None,
        }
    }

    /// Whether a sweep has started and not finished.
    #[must_use]
    pub const fn is_in_progress(self) -> bool {
        matches!(
            self,
            Self::Sweeping | Self::SweepingAndIterating | Self::Compacting
        )
    }
}

/// What checking one slot of the block array found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockCheck {
    /// The slot is empty, or its block had nothing marked and was freed.
    Empty,
    /// Another thread holds the slot and we did not wait.
    Busy,
    /// The block is still in the heap; `checked` if this call checked it.
    Present { checked: bool },
}

impl MajorHeap {
    // ========================================================================
    // Sweep state
    // ========================================================================

    /// Current sweep state.
    #[must_use]
    pub fn sweep_state(&self) -> SweepState {
        let raw = self.sweep_state.load(Ordering::Acquire);
        SweepState::from_u8(raw)
            .unwrap_or_else(|| crate::gc_fatal!("illegal sweep state {raw}"))
    }

    fn try_set_sweep_state(&self, to: SweepState, from: SweepState) -> bool {
        self.sweep_state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn set_sweep_state(&self, to: SweepState, from: SweepState) {
        crate::gc_assert!(
            self.try_set_sweep_state(to, from),
            "sweep state should be {from:?} moving to {to:?}, but is {:?}",
            self.sweep_state()
        );
    }

    /// Whether a sweep has started and not finished.
    #[must_use]
    pub fn sweep_in_progress(&self) -> bool {
        self.sweep_state().is_in_progress()
    }

    /// Whether the last sweep has finished.
    #[must_use]
    pub fn have_swept(&self) -> bool {
        self.sweep_state() == SweepState::Swept
    }

    pub(crate) fn set_block_state(&self, block: BlockRef, from: BlockState, to: BlockState) {
        block.set_state(from, to);
        self.collab.recorder.block_set_state(block.start(), from, to);
    }

    // ========================================================================
    // Collection protocol
    // ========================================================================

    /// Starts a major collection. Must run with the mutators stopped.
    ///
    /// Finishes the previous sweep, chooses the blocks to evacuate, moves
    /// every block to MARKING and clears large object marks.
    ///
    /// # Panics
    ///
    /// Panics if a collection is already running.
    pub fn start_major_collection(&self, concurrent: bool) {
        let gc_id = crate::tracing::internal::next_gc_id();
        self.last_gc_id.store(gc_id.0, Ordering::Relaxed);

        #[cfg(feature = "tracing")]
        let _span = crate::tracing::internal::trace_major_collection(gc_id, concurrent);
        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_phase_start(
            crate::tracing::internal::GcPhase::Start,
            self.num_major_sections(),
        );

        crate::gc_assert!(
            !self.collection_in_progress(),
            "a major collection is already running"
        );
        self.finish_sweeping();

        // Evacuated size classes get fresh to-space blocks for everything
        // allocated during this collection.
        for (index, evacuate) in self.evacuate.iter().enumerate() {
            if evacuate.load(Ordering::Acquire) {
                self.collab
                    .recorder
                    .evacuating_blocks(self.size_classes.size(index));
                self.clear_evacuating_free_lists(index);
            }
        }

        if self.config.lazy_sweep && self.config.concurrent_sweep {
            let job = self.sweep_blocks_job.lock().take();
            if let Some(job) = job {
                job.wait();
            }
        }

        let sweep_now = self.config.lazy_sweep;
        if sweep_now {
            self.collab.recorder.sweep_begin();
        }
        for block in self.block_snapshot() {
            if sweep_now && self.sweep_block(block) {
                HeapCounters::bump(&self.counters.blocks_pre_swept);
            }
            self.set_block_state(block, BlockState::Swept, BlockState::Marking);
            // Full blocks are not worth evacuating.
            if self.evacuate[block.obj_size_index()].load(Ordering::Relaxed)
                && block.free_list_head() == 0
            {
                block.set_to_space(true);
            }
            block.free_mod_union();
        }
        if sweep_now {
            self.collab.recorder.sweep_end();
        }

        self.collab.large_objects.clear_marks();
        self.set_sweep_state(SweepState::NeedSweeping, SweepState::Swept);

        let (phase, kind) = if concurrent {
            (CollectionPhase::Concurrent, CollectionKind::ConcurrentMajor)
        } else {
            (CollectionPhase::Major, CollectionKind::Major)
        };
        self.phase.store(phase as u8, Ordering::Release);
        self.counters.record_collection(kind);
    }

    /// Ends the collection, sweeping first if [`MajorHeap::sweep`] has not
    /// been called.
    pub fn finish_major_collection(self: &Arc<Self>) {
        if self.sweep_state() == SweepState::NeedSweeping {
            self.sweep();
        }
        self.phase
            .store(CollectionPhase::Idle as u8, Ordering::Release);
    }

    /// Ends marking and sweeps, on the job pool if sweeping is concurrent.
    ///
    /// # Panics
    ///
    /// Panics if no collection is waiting to be swept.
    pub fn sweep(self: &Arc<Self>) {
        // No allocation may mark objects once the sweep has started.
        self.phase
            .store(CollectionPhase::Idle as u8, Ordering::Release);
        self.set_sweep_state(SweepState::Sweeping, SweepState::NeedSweeping);

        self.sweep_samples.reset();
        self.clear_free_block_lists();
        self.num_major_sections_before_sweep
            .store(self.num_major_sections(), Ordering::Release);
        self.num_major_sections_freed_in_sweep
            .store(0, Ordering::Release);
        self.collab.recorder.sweep_begin();

        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_phase_start(
            crate::tracing::internal::GcPhase::Sweep,
            self.num_major_sections(),
        );

        if self.config.concurrent_sweep {
            let mut job = self.sweep_job.lock();
            // The previous job may still be wrapping up after publishing SWEPT.
            if let Some(previous) = job.take() {
                previous.wait();
            }
            let heap = Arc::clone(self);
            *job = Some(
                self.collab
                    .jobs
                    .enqueue(Box::new(move || heap.sweep_job_func())),
            );
        } else {
            self.sweep_job_func();
        }
    }

    /// Makes sure every block has been checked and waits for the sweep job.
    ///
    /// Blocks the sweep job has not reached yet are checked by the caller,
    /// from the low end of the block array.
    pub fn finish_sweeping(&self) {
        let backoff = Backoff::new();
        loop {
            match self.sweep_state() {
                SweepState::Swept | SweepState::NeedSweeping => return,
                SweepState::Sweeping => {
                    if self.try_set_sweep_state(
                        SweepState::SweepingAndIterating,
                        SweepState::Sweeping,
                    ) {
                        break;
                    }
                }
                // Another thread is helping; let it finish.
                SweepState::SweepingAndIterating => backoff.snooze(),
                SweepState::Compacting => {
                    self.wait_for_sweep_job();
                    return;
                }
            }
        }

        // The array neither grows nor shrinks while we iterate: allocators
        // and the compactor both wait for SWEEPING_AND_ITERATING to end.
        let len = self.allocated_blocks.read().len();
        let mut helped = 0;
        for index in 0..len {
            if self.ensure_block_is_checked_for_sweeping(index, false)
                == (BlockCheck::Present { checked: true })
            {
                helped += 1;
            }
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(helped, "mutator finished sweep checking");
        #[cfg(not(feature = "tracing"))]
        let _ = helped;

        self.set_sweep_state(SweepState::Sweeping, SweepState::SweepingAndIterating);
        self.wait_for_sweep_job();
    }

    fn wait_for_sweep_job(&self) {
        let job = self.sweep_job.lock().clone();
        if let Some(job) = job {
            job.wait();
        }
        crate::gc_assert!(
            self.have_swept(),
            "sweep job is done but the sweep state is {:?}",
            self.sweep_state()
        );
        let mut job = self.sweep_job.lock();
        if job.as_ref().is_some_and(|j| j.is_done()) {
            *job = None;
        }
    }

    // ========================================================================
    // Checking
    // ========================================================================

    /// Checks the block at `index` of the allocated-block array.
    ///
    /// With `wait` unset, a slot claimed by another thread is reported as
    /// [`BlockCheck::Busy`] instead of being waited for.
    pub(crate) fn ensure_block_is_checked_for_sweeping(&self, index: usize, wait: bool) -> BlockCheck {
        let blocks = self.allocated_blocks.read();
        blocks
            .get(index)
            .map_or(BlockCheck::Empty, |slot| self.check_block_for_sweeping(slot, wait))
    }

    fn check_block_for_sweeping(&self, slot: &BlockSlot, wait: bool) -> BlockCheck {
        crate::gc_assert!(self.sweep_in_progress(), "blocks are only checked during a sweep");

        let backoff = Backoff::new();
        loop {
            if slot.get().is_none() {
                return BlockCheck::Empty;
            }
            if slot
                .checking
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
            if !wait {
                return BlockCheck::Busy;
            }
            backoff.snooze();
        }

        // The previous holder may have freed the block.
        let result = match slot.get() {
            Some(block) => self.check_claimed_block(slot, block),
            None => BlockCheck::Empty,
        };
        // Everything done to the block must be visible before the slot is
        // released.
        write_fence();
        slot.checking.store(false, Ordering::Release);
        result
    }

    fn check_claimed_block(&self, slot: &BlockSlot, block: BlockRef) -> BlockCheck {
        match block.state() {
            BlockState::Swept | BlockState::NeedSweeping | BlockState::Sweeping => {
                return BlockCheck::Present { checked: false };
            }
            BlockState::Checking => {
                crate::gc_fatal!("claimed {block:?} is already being checked")
            }
            BlockState::Marking => {}
        }

        self.set_block_state(block, BlockState::Marking, BlockState::Checking);
        block.set_has_pinned(block.pinned());
        block.set_to_space(false);
        block.free_mod_union();

        let count = block.obj_count();
        let used = block.count_marked();

        if used == 0 {
            crate::gc_assert!(
                slot.block.load(Ordering::Acquire) == block.as_ptr(),
                "{block:?} moved while claimed"
            );
            slot.block.store(ptr::null_mut(), Ordering::Release);
            self.free_block(block);
            self.num_major_sections.fetch_sub(1, Ordering::AcqRel);
            self.num_major_sections_freed_in_sweep
                .fetch_add(1, Ordering::AcqRel);
            return BlockCheck::Empty;
        }

        let has_pinned = block.has_pinned();
        let index = block.obj_size_index();
        self.set_block_state(block, BlockState::Checking, BlockState::NeedSweeping);

        if !self.config.lazy_sweep {
            self.sweep_block(block);
        }
        if !has_pinned {
            self.sweep_samples.record(index, used, count);
        }
        if used < count {
            if !self.config.lazy_sweep {
                crate::gc_assert!(
                    block.free_list_head() != 0,
                    "{block:?} has free slots but no free list"
                );
            }
            self.add_free_block(
                self.free_list(block.pinned(), block.has_references(), index),
                block,
            );
        }
        BlockCheck::Present { checked: true }
    }

    // ========================================================================
    // Sweeping one block
    // ========================================================================

    /// Rebuilds `block`'s free list from its mark bits and clears the marks.
    ///
    /// Returns `false` if the block was already swept, waiting first if
    /// another thread is sweeping it.
    ///
    /// # Panics
    ///
    /// Panics if the block is MARKING or CHECKING, or has a mark bit on an
    /// unallocated slot.
    pub(crate) fn sweep_block(&self, block: BlockRef) -> bool {
        let backoff = Backoff::new();
        loop {
            match block.state() {
                BlockState::Swept => return false,
                BlockState::Marking | BlockState::Checking => {
                    crate::gc_fatal!("sweeping {block:?} in the wrong state")
                }
                BlockState::Sweeping => backoff.snooze(),
                BlockState::NeedSweeping => {
                    if block.cas_state(BlockState::NeedSweeping, BlockState::Sweeping) {
                        break;
                    }
                }
            }
        }
        self.collab.recorder.block_set_state(
            block.start(),
            BlockState::NeedSweeping,
            BlockState::Sweeping,
        );

        let obj_size = block.obj_size();
        let mut free_head = 0;
        for index in (0..block.obj_count()).rev() {
            let slot = block.slot_addr(index);
            if block.is_marked(slot) {
                crate::gc_assert!(
                    block.slot_is_allocated(slot),
                    "unallocated slot {slot:#x} of {block:?} is marked"
                );
                continue;
            }
            // SAFETY: unmarked slots are dead and we own the block while
            // it is SWEEPING.
            unsafe {
                if block.slot_is_allocated(slot) {
                    zero_slot(slot, obj_size);
                }
                slot_word(slot, 0).store(free_head, Ordering::Relaxed);
            }
            free_head = slot;
        }
        block.set_free_list(free_head);
        block.clear_marks();

        write_fence();
        self.set_block_state(block, BlockState::Sweeping, BlockState::Swept);
        true
    }

    // ========================================================================
    // The sweep job
    // ========================================================================

    fn sweep_job_func(self: &Arc<Self>) {
        #[cfg(feature = "tracing")]
        let _span = crate::tracing::internal::trace_phase(crate::tracing::internal::GcPhase::Sweep);

        let mut timer = PhaseTimer::new();
        timer.start();
        {
            // Mutators helping out walk upwards; walk down to meet them.
            let blocks = self.allocated_blocks.read();
            for slot in blocks.iter().rev() {
                self.check_block_for_sweeping(slot, true);
            }
        }
        timer.end_check();

        // Wait for helpers before the array changes underneath them.
        let backoff = Backoff::new();
        while !self.try_set_sweep_state(SweepState::Compacting, SweepState::Sweeping) {
            backoff.snooze();
        }

        timer.start();
        self.allocated_blocks
            .write()
            .retain(|slot| slot.get().is_some());

        if self.config.lazy_sweep && self.config.concurrent_sweep {
            let heap = Arc::clone(self);
            let job = self
                .collab
                .jobs
                .enqueue(Box::new(move || heap.sweep_remaining_blocks()));
            *self.sweep_blocks_job.lock() = Some(job);
        }

        timer.end_compact();
        self.counters.record_sweep(timer.total());
        self.collab.recorder.sweep_end();
        self.sweep_finish();
    }

    /// Background sweep of blocks a lazy sweep left behind.
    fn sweep_remaining_blocks(&self) {
        for block in self.block_snapshot() {
            if block.state() == BlockState::NeedSweeping && self.sweep_block(block) {
                HeapCounters::bump(&self.counters.blocks_lazy_swept);
            }
        }
    }

    /// Picks the size classes to evacuate next time and ends the sweep.
    fn sweep_finish(&self) {
        let samples = &self.sweep_samples;
        let threshold = self.config.evacuation_threshold;
        let mut evacuating = 0;
        for (index, evacuate) in self.evacuate.iter().enumerate() {
            let blocks = samples.num_blocks[index].load(Ordering::Relaxed);
            let used = samples.slots_used[index].load(Ordering::Relaxed);
            let available = samples.slots_available[index].load(Ordering::Relaxed);
            #[allow(clippy::cast_precision_loss)]
            let sparse = blocks >= MIN_EVACUATION_BLOCKS
                && (used as f64) < threshold * available as f64;
            evacuate.store(sparse, Ordering::Release);
            evacuating += usize::from(sparse);
        }

        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_sweep_end(
            self.num_major_sections_before_sweep.load(Ordering::Relaxed),
            self.num_major_sections_freed_in_sweep
                .load(Ordering::Relaxed),
            evacuating,
        );
        #[cfg(not(feature = "tracing"))]
        let _ = evacuating;

        self.set_sweep_state(SweepState::Swept, SweepState::Compacting);
    }

    // ========================================================================
    // Evacuation queries
    // ========================================================================

    /// Whether any size class is being evacuated.
    #[must_use]
    pub fn is_evacuating(&self) -> bool {
        self.evacuate.iter().any(|e| e.load(Ordering::Relaxed))
    }

    /// Whether size class `index` is selected for evacuation.
    #[must_use]
    pub fn size_class_is_evacuating(&self, index: usize) -> bool {
        self.evacuate
            .get(index)
            .is_some_and(|e| e.load(Ordering::Relaxed))
    }

    /// Whether objects in `block` are moved out by the running collection.
    #[must_use]
    pub fn block_is_evacuating(&self, block: BlockRef) -> bool {
        self.size_class_is_evacuating(block.obj_size_index())
            && !block.has_pinned()
            && !block.is_to_space()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Collaborators, Descriptor};
    use crate::config::MajorConfig;
    use crate::job::InlinePool;
    use crate::test_util::{SimpleObjectModel, SimpleVTable};

    fn heap() -> Arc<MajorHeap> {
        let model = SimpleObjectModel::new(4096);
        let collab = Collaborators::new(model).with_jobs(Arc::new(InlinePool));
        MajorHeap::new(MajorConfig::new().with_concurrent_sweep(false), collab)
    }

    #[test]
    fn test_sweeping_a_swept_block_is_a_noop() {
        let heap = heap();
        let vtable = SimpleVTable::leak(64, Descriptor::NoRefs);
        let obj = heap.alloc_object(vtable, 64, false).unwrap();
        let block = heap.find_block(obj.addr()).unwrap();
        let head = block.free_list_head();

        assert_eq!(block.state(), BlockState::Swept);
        assert!(!heap.sweep_block(block));
        assert_eq!(block.state(), BlockState::Swept);
        assert_eq!(block.free_list_head(), head);
        assert!(!block.is_marked(obj.addr()));
    }

    #[test]
    fn test_fully_marked_block_keeps_every_slot() {
        let heap = heap();
        let vtable = SimpleVTable::leak(4000, Descriptor::NoRefs);
        let objs: Vec<_> = (0..4)
            .map(|_| heap.alloc_object(vtable, 4000, false).unwrap())
            .collect();
        let block = heap.find_block(objs[0].addr()).unwrap();
        assert_eq!(block.obj_count(), objs.len());

        heap.start_major_collection(false);
        let mut queue = heap.new_gray_queue();
        for obj in &objs {
            heap.mark_and_enqueue(block, *obj, &mut queue);
        }
        heap.sweep();
        heap.finish_major_collection();

        assert_eq!(heap.block_snapshot(), vec![block]);
        assert_eq!(block.state(), BlockState::Swept);
        assert_eq!(block.free_list_head(), 0);
        for obj in &objs {
            assert!(heap.is_valid_object(obj.addr()));
            assert!(!block.is_marked(obj.addr()));
        }
    }

    #[test]
    fn test_sweep_clears_marks_and_frees_dead_slots() {
        let heap = heap();
        let vtable = SimpleVTable::leak(64, Descriptor::NoRefs);
        let live = heap.alloc_object(vtable, 64, false).unwrap();
        let dead = heap.alloc_object(vtable, 64, false).unwrap();
        let block = heap.find_block(live.addr()).unwrap();

        heap.start_major_collection(false);
        let mut queue = heap.new_gray_queue();
        heap.mark_and_enqueue(block, live, &mut queue);
        assert!(queue.is_empty());
        heap.sweep();

        assert!(!block.is_marked(live.addr()));
        assert!(heap.is_valid_object(live.addr()));
        assert!(!heap.is_valid_object(dead.addr()));
        assert_eq!(block.free_list_head(), dead.addr());
        heap.finish_major_collection();
    }

    #[test]
    fn test_sweep_state_decoding() {
        for state in [
            SweepState::Swept,
            SweepState::NeedSweeping,
            SweepState::Sweeping,
            SweepState::SweepingAndIterating,
            SweepState::Compacting,
        ] {
            assert_eq!(SweepState::from_u8(state as u8), Some(state));
        }
        assert_eq!(SweepState::from_u8(9), None);
        assert!(SweepState::Compacting.is_in_progress());
        assert!(!SweepState::NeedSweeping.is_in_progress());
    }
}
