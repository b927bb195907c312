//! The major heap.
//!
//! [`MajorHeap`] owns every block, the per-size-class free-block lists and
//! the empty-block pool. This module holds allocation and the heap queries;
//! the collection protocol (start/finish, sweep) lives in [`crate::gc`].
//!
//! # Free-block lists
//!
//! There is one lock-free list of blocks with free slots per size class and
//! per block kind (pinned or not, with or without references). Mutators pop
//! slots from the head block of a list. The thread that takes the last slot
//! of a block first unlinks the block from the list, so a block never sits
//! on a list with an empty free list once it is swept. Blocks are pushed
//! onto lists only while the block array grows, during sweeps, or when an
//! object is explicitly freed with the world stopped, which rules out ABA
//! on the list heads.

use std::fmt;
use std::io::{self, Write};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use crossbeam::utils::Backoff;
use parking_lot::{Mutex, RwLock};

use crate::block::{
    slot_word, zero_slot, BlockFlags, BlockInfo, BlockRef, BlockState, MAX_SMALL_OBJ_SIZE,
    MS_BLOCK_MASK, MS_BLOCK_SIZE,
};
use crate::block_pool::EmptyBlockPool;
use crate::client::{Collaborators, ObjPtr, VTablePtr};
use crate::config::MajorConfig;
use crate::error::AllocError;
use crate::gc::gray::GrayQueue;
use crate::gc::sweep::SweepState;
use crate::gc::CollectionPhase;
use crate::job::JobHandle;
use crate::metrics::{HeapCounters, MajorStats};
use crate::size_class::SizeClasses;
use crate::tracing::GcId;

const FREE_LIST_PINNED: usize = 1;
const FREE_LIST_REFS: usize = 2;
const FREE_LIST_KINDS: usize = 4;

#[inline]
const fn free_list_kind(pinned: bool, has_references: bool) -> usize {
    (if pinned { FREE_LIST_PINNED } else { 0 }) | (if has_references { FREE_LIST_REFS } else { 0 })
}

bitflags! {
    /// What [`MajorHeap::iterate_objects`] visits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IterateFlags: u8 {
        /// Sweep lazily-unswept blocks first so dead objects are skipped.
        const SWEEP = 1 << 0;
        /// Visit blocks of the regular allocator.
        const NON_PINNED = 1 << 1;
        /// Visit blocks of the pinned allocator.
        const PINNED = 1 << 2;
        /// Both block kinds.
        const ALL = Self::NON_PINNED.bits() | Self::PINNED.bits();
    }
}

/// An entry of the allocated-block array.
///
/// `checking` is set while one thread has the block claimed for the sweep
/// check; a freed block leaves a null pointer behind until the array is
/// compacted.
#[derive(Debug)]
pub(crate) struct BlockSlot {
    pub(crate) block: AtomicPtr<BlockInfo>,
    pub(crate) checking: AtomicBool,
}

impl BlockSlot {
    fn new(block: BlockRef) -> Self {
        Self {
            block: AtomicPtr::new(block.as_ptr()),
            checking: AtomicBool::new(false),
        }
    }

    #[inline]
    pub(crate) fn get(&self) -> Option<BlockRef> {
        BlockRef::from_ptr(self.block.load(Ordering::Acquire))
    }
}

/// Per-size-class occupancy collected while checking blocks for the sweep.
#[derive(Debug)]
pub(crate) struct SweepSamples {
    pub(crate) num_blocks: Box<[AtomicUsize]>,
    pub(crate) slots_used: Box<[AtomicUsize]>,
    pub(crate) slots_available: Box<[AtomicUsize]>,
}

impl SweepSamples {
    fn new(len: usize) -> Self {
        let zeros = || (0..len).map(|_| AtomicUsize::new(0)).collect();
        Self {
            num_blocks: zeros(),
            slots_used: zeros(),
            slots_available: zeros(),
        }
    }

    pub(crate) fn reset(&self) {
        for counter in self
            .num_blocks
            .iter()
            .chain(self.slots_used.iter())
            .chain(self.slots_available.iter())
        {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub(crate) fn record(&self, index: usize, used: usize, available: usize) {
        self.num_blocks[index].fetch_add(1, Ordering::Relaxed);
        self.slots_used[index].fetch_add(used, Ordering::Relaxed);
        self.slots_available[index].fetch_add(available, Ordering::Relaxed);
    }
}

/// Where a pointer points, see [`MajorHeap::describe_pointer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerInfo {
    /// Start of the containing block.
    pub block: usize,
    /// Slot size of the block.
    pub obj_size: usize,
    /// Size class index of the block.
    pub size_index: usize,
    /// Start of the slot containing the pointer.
    pub slot: usize,
    /// Index of that slot.
    pub slot_index: usize,
    /// Whether the slot holds an object.
    pub allocated: bool,
    /// Whether the slot's mark bit is set.
    pub marked: bool,
    /// Whether the block serves pinned allocations.
    pub pinned_block: bool,
    /// The block's state.
    pub state: BlockState,
}

impl fmt::Display for PointerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let interior = if self.allocated { "object" } else { "free slot" };
        write!(
            f,
            "{interior} {:#x} (index {}) in {} block {:#x}, size {}, {}marked, state {:?}",
            self.slot,
            self.slot_index,
            if self.pinned_block { "pinned" } else { "major" },
            self.block,
            self.obj_size,
            if self.marked { "" } else { "not " },
            self.state,
        )
    }
}

/// Occupancy of one size class, see [`MajorHeap::size_class_usage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClassUsage {
    /// Slot size.
    pub obj_size: usize,
    /// Blocks of this size.
    pub blocks: usize,
    /// Slots in those blocks.
    pub slots: usize,
    /// Slots on the blocks' free lists.
    pub free_slots: usize,
}

/// The major heap.
pub struct MajorHeap {
    pub(crate) config: MajorConfig,
    pub(crate) collab: Collaborators,
    pub(crate) size_classes: SizeClasses,
    free_block_lists: [Box<[AtomicPtr<BlockInfo>]>; FREE_LIST_KINDS],
    pub(crate) allocated_blocks: RwLock<Vec<BlockSlot>>,
    pub(crate) empty_blocks: EmptyBlockPool,
    pub(crate) num_major_sections: AtomicUsize,
    pub(crate) num_major_sections_before_sweep: AtomicUsize,
    pub(crate) num_major_sections_freed_in_sweep: AtomicUsize,
    old_num_major_sections: AtomicUsize,
    pub(crate) sweep_state: AtomicU8,
    pub(crate) sweep_job: Mutex<Option<JobHandle>>,
    pub(crate) sweep_blocks_job: Mutex<Option<JobHandle>>,
    pub(crate) sweep_samples: SweepSamples,
    pub(crate) evacuate: Box<[AtomicBool]>,
    pub(crate) phase: AtomicU8,
    pub(crate) counters: HeapCounters,
    pub(crate) last_gc_id: AtomicU64,
}

impl fmt::Debug for MajorHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MajorHeap")
            .field("config", &self.config)
            .field("num_major_sections", &self.num_major_sections())
            .field("sweep_state", &self.sweep_state())
            .field("phase", &self.collection_phase())
            .finish_non_exhaustive()
    }
}

impl MajorHeap {
    /// Creates an empty heap.
    #[must_use]
    pub fn new(config: MajorConfig, collab: Collaborators) -> Arc<Self> {
        let size_classes = SizeClasses::new();
        let n = size_classes.len();
        let lists = || (0..n).map(|_| AtomicPtr::new(ptr::null_mut())).collect();

        #[cfg(feature = "tracing")]
        tracing::debug!(
            size_classes = n,
            lazy_sweep = config.lazy_sweep,
            concurrent_sweep = config.concurrent_sweep,
            "major heap created"
        );

        Arc::new(Self {
            config,
            collab,
            free_block_lists: [lists(), lists(), lists(), lists()],
            allocated_blocks: RwLock::new(Vec::new()),
            empty_blocks: EmptyBlockPool::new(config.block_alloc_batch),
            num_major_sections: AtomicUsize::new(0),
            num_major_sections_before_sweep: AtomicUsize::new(0),
            num_major_sections_freed_in_sweep: AtomicUsize::new(0),
            old_num_major_sections: AtomicUsize::new(0),
            sweep_state: AtomicU8::new(SweepState::Swept as u8),
            sweep_job: Mutex::new(None),
            sweep_blocks_job: Mutex::new(None),
            sweep_samples: SweepSamples::new(n),
            evacuate: (0..n).map(|_| AtomicBool::new(false)).collect(),
            phase: AtomicU8::new(CollectionPhase::Idle as u8),
            counters: HeapCounters::new(),
            last_gc_id: AtomicU64::new(0),
            size_classes,
        })
    }

    /// The configuration the heap was created with.
    #[must_use]
    pub const fn config(&self) -> &MajorConfig {
        &self.config
    }

    /// The heap's collaborators.
    #[must_use]
    pub const fn collaborators(&self) -> &Collaborators {
        &self.collab
    }

    /// The size-class table.
    #[must_use]
    pub const fn size_classes(&self) -> &SizeClasses {
        &self.size_classes
    }

    /// The running collection, if any.
    #[must_use]
    pub fn collection_phase(&self) -> CollectionPhase {
        CollectionPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Whether a major collection is between start and sweep.
    #[inline]
    #[must_use]
    pub fn collection_in_progress(&self) -> bool {
        self.phase.load(Ordering::Acquire) != CollectionPhase::Idle as u8
    }

    /// Id of the most recently started collection (0 before the first one,
    /// and always 0 without the `tracing` feature).
    #[must_use]
    pub fn last_gc_id(&self) -> GcId {
        GcId(self.last_gc_id.load(Ordering::Relaxed))
    }

    /// A gray queue configured for this heap.
    #[must_use]
    pub fn new_gray_queue(&self) -> GrayQueue {
        GrayQueue::new().with_prefetch(self.config.prefetch)
    }

    /// Statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> MajorStats {
        self.counters.snapshot(self.num_major_sections())
    }

    // ========================================================================
    // Free-block lists
    // ========================================================================

    #[inline]
    pub(crate) fn free_list(
        &self,
        pinned: bool,
        has_references: bool,
        index: usize,
    ) -> &AtomicPtr<BlockInfo> {
        &self.free_block_lists[free_list_kind(pinned, has_references)][index]
    }

    pub(crate) fn add_free_block(&self, list: &AtomicPtr<BlockInfo>, block: BlockRef) {
        let mut head = list.load(Ordering::Acquire);
        loop {
            block.set_next_free(head);
            match list.compare_exchange_weak(
                head,
                block.as_ptr(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// Empties every free-block list.
    pub(crate) fn clear_free_block_lists(&self) {
        for list in self.free_block_lists.iter().flat_map(|lists| lists.iter()) {
            list.store(ptr::null_mut(), Ordering::Release);
        }
    }

    /// Empties the non-pinned lists of size class `index`.
    pub(crate) fn clear_evacuating_free_lists(&self, index: usize) {
        self.free_list(false, false, index)
            .store(ptr::null_mut(), Ordering::Release);
        self.free_list(false, true, index)
            .store(ptr::null_mut(), Ordering::Release);
    }

    /// Makes `block`'s free list valid: blocks left unswept by a lazy
    /// sweep are swept here, blocks another thread is sweeping are waited
    /// for.
    pub(crate) fn ensure_can_access_block_free_list(&self, block: BlockRef) {
        let backoff = Backoff::new();
        loop {
            match block.state() {
                BlockState::Swept | BlockState::Marking => return,
                BlockState::Checking => {
                    crate::gc_fatal!("{block:?} is being checked but sits on a free list")
                }
                BlockState::NeedSweeping => {
                    if self.sweep_block(block) {
                        HeapCounters::bump(&self.counters.blocks_lazy_swept);
                    }
                }
                BlockState::Sweeping => backoff.snooze(),
            }
        }
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Allocates a small object, `None` if the heap may not grow.
    ///
    /// `size` must be at most [`MAX_SMALL_OBJ_SIZE`].
    #[must_use]
    pub fn alloc_object(&self, vtable: VTablePtr, size: usize, has_references: bool) -> Option<ObjPtr> {
        self.try_alloc_object(vtable, size, has_references).ok()
    }

    /// Allocates a small object.
    ///
    /// # Errors
    ///
    /// Fails if the object is too large for a block, the governor refuses
    /// a new block or the OS cannot supply one.
    pub fn try_alloc_object(
        &self,
        vtable: VTablePtr,
        size: usize,
        has_references: bool,
    ) -> Result<ObjPtr, AllocError> {
        self.alloc_obj(vtable, size, false, has_references)
    }

    /// Allocation used when the nursery is unavailable; behaves like
    /// [`MajorHeap::alloc_object`] and counts the allocation.
    #[must_use]
    pub fn alloc_degraded(&self, vtable: VTablePtr, size: usize, has_references: bool) -> Option<ObjPtr> {
        let obj = self.alloc_obj(vtable, size, false, has_references).ok()?;
        HeapCounters::bump(&self.counters.degraded_allocations);
        Some(obj)
    }

    /// Allocates an object that will never move.
    ///
    /// If the heap is full, one forced collection runs through the
    /// [`CollectionTrigger`](crate::client::CollectionTrigger) before the
    /// allocation is retried.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::TooLarge`] for oversized requests and
    /// [`AllocError::OutOfMemory`] if the retry fails too.
    pub fn alloc_small_pinned_object(
        &self,
        vtable: VTablePtr,
        size: usize,
        has_references: bool,
    ) -> Result<ObjPtr, AllocError> {
        match self.alloc_obj(vtable, size, true, has_references) {
            Ok(obj) => Ok(obj),
            Err(err @ AllocError::TooLarge { .. }) => Err(err),
            Err(_) => {
                self.collab.trigger.collect("pinned alloc failure");
                self.alloc_obj(vtable, size, true, has_references)
                    .map_err(|_| AllocError::OutOfMemory { size })
            }
        }
    }

    pub(crate) fn alloc_obj(
        &self,
        vtable: VTablePtr,
        size: usize,
        pinned: bool,
        has_references: bool,
    ) -> Result<ObjPtr, AllocError> {
        if size > MAX_SMALL_OBJ_SIZE {
            return Err(AllocError::TooLarge { size });
        }
        let index = self.size_classes.index_for(size);
        let list = self.free_list(pinned, has_references, index);

        loop {
            let Some(block) = BlockRef::from_ptr(list.load(Ordering::Acquire)) else {
                self.alloc_block(index, pinned, has_references)?;
                continue;
            };
            if let Some(slot) = self.take_slot(list, block) {
                return Ok(self.finish_alloc(block, slot, vtable));
            }
        }
    }

    /// One attempt at taking a slot from `block`, the head of `list`.
    fn take_slot(&self, list: &AtomicPtr<BlockInfo>, block: BlockRef) -> Option<usize> {
        self.ensure_can_access_block_free_list(block);

        let slot = block.free_list_head();
        if slot == 0 {
            // Whoever took the last slot unlinked the block before emptying it.
            crate::gc_assert!(
                list.load(Ordering::Acquire) != block.as_ptr(),
                "{block:?} heads a free-block list with an empty free list"
            );
            return None;
        }
        // SAFETY: `slot` was on the free list; free slots keep their link
        // word until they are handed out.
        let next = unsafe { slot_word(slot, 0).load(Ordering::Acquire) };
        if next != 0 {
            return block.cas_free_list(slot, next).then_some(slot);
        }

        // Last slot: unlink the block first so no allocator sees it empty.
        if list
            .compare_exchange(block.as_ptr(), block.next_free(), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        crate::gc_assert!(
            block.cas_free_list(slot, 0),
            "free list of {block:?} changed while the block was unlinked"
        );
        block.set_next_free(ptr::null_mut());
        Some(slot)
    }

    fn finish_alloc(&self, block: BlockRef, slot: usize, vtable: VTablePtr) -> ObjPtr {
        // SAFETY: `slot` is ours now; every word but the link is zero.
        unsafe { slot_word(slot, 0).store(vtable.addr(), Ordering::Release) };
        // Objects born while marking are live for this collection.
        if self.collection_in_progress() && block.state() == BlockState::Marking {
            block.set_mark(slot);
        }
        ObjPtr::from_addr(slot)
            .unwrap_or_else(|| crate::gc_fatal!("null slot handed out by {block:?}"))
    }

    fn alloc_block(&self, index: usize, pinned: bool, has_references: bool) -> Result<(), AllocError> {
        let size = self.size_classes.size(index);

        if !self.collab.governor.try_alloc_space(MS_BLOCK_SIZE) {
            return Err(AllocError::GovernorRejected { size: MS_BLOCK_SIZE });
        }
        let memory = match self.empty_blocks.get() {
            Ok(memory) => memory,
            Err(err) => {
                self.collab.governor.release_space(MS_BLOCK_SIZE);
                return Err(err.into());
            }
        };

        // Blocks allocated while marking are to-space: their objects are
        // black and they are never evacuated by this collection.
        let to_space = self.collection_in_progress();
        let mut flags = BlockFlags::empty();
        if pinned {
            flags |= BlockFlags::PINNED | BlockFlags::HAS_PINNED;
        }
        if has_references {
            flags |= BlockFlags::HAS_REFERENCES;
        }
        if to_space {
            flags |= BlockFlags::IS_TO_SPACE;
        }
        let state = if to_space {
            BlockState::Marking
        } else {
            BlockState::Swept
        };

        // SAFETY: fresh pool memory, block-aligned and zeroed.
        let block = unsafe { BlockRef::init(memory, size, index, flags, state) };
        self.collab.recorder.block_alloc(block.start(), MS_BLOCK_SIZE);
        HeapCounters::bump(&self.counters.blocks_allocated);

        self.add_free_block(self.free_list(pinned, has_references, index), block);

        // The sweep job walks the block array; it must not grow underneath it.
        self.finish_sweeping();
        self.allocated_blocks.write().push(BlockSlot::new(block));
        self.num_major_sections.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    // ========================================================================
    // Explicit frees
    // ========================================================================

    /// Returns a regular object's slot to its block.
    ///
    /// # Safety
    ///
    /// `obj` must be an allocated, unreachable object of this heap's
    /// regular allocator, and no thread may allocate concurrently.
    pub unsafe fn free_non_pinned_object(&self, obj: ObjPtr) {
        unsafe { self.free_object(obj, false) };
    }

    /// Returns a pinned object's slot to its block.
    ///
    /// # Safety
    ///
    /// As [`MajorHeap::free_non_pinned_object`], for the pinned allocator.
    pub unsafe fn free_pinned_object(&self, obj: ObjPtr) {
        unsafe { self.free_object(obj, true) };
    }

    unsafe fn free_object(&self, obj: ObjPtr, pinned: bool) {
        crate::gc_assert!(self.have_swept(), "objects may only be freed after the sweep finished");

        // SAFETY: the caller promises `obj` is one of ours.
        let block = unsafe { BlockRef::for_object(obj) };
        self.ensure_can_access_block_free_list(block);
        crate::gc_assert!(
            block.pinned() == pinned,
            "free of {obj:?} with pinned={pinned} from {block:?}"
        );
        crate::gc_assert!(block.slot_is_allocated(obj.addr()), "{obj:?} is already free");
        crate::gc_assert!(!block.is_marked(obj.addr()), "{obj:?} is freed while marked");

        // SAFETY: the caller promises the object is unreachable.
        let was_empty = unsafe {
            zero_slot(obj.addr(), block.obj_size());
            block.push_free_slot(obj.addr())
        };
        if was_empty {
            crate::gc_assert!(
                block.next_free().is_null(),
                "{block:?} has no free slot but is on a free-block list"
            );
            self.add_free_block(
                self.free_list(pinned, block.has_references(), block.obj_size_index()),
                block,
            );
        }
    }

    // ========================================================================
    // Block array access
    // ========================================================================

    /// The blocks currently in the heap.
    ///
    /// Blocks are only freed by sweeps, so the handles stay valid until the
    /// next [`MajorHeap::sweep`].
    pub(crate) fn block_snapshot(&self) -> Vec<BlockRef> {
        self.allocated_blocks
            .read()
            .iter()
            .filter_map(BlockSlot::get)
            .collect()
    }

    /// The heap block containing `addr`, if any.
    pub(crate) fn find_block(&self, addr: usize) -> Option<BlockRef> {
        let start = addr & MS_BLOCK_MASK;
        self.allocated_blocks
            .read()
            .iter()
            .filter_map(BlockSlot::get)
            .find(|block| block.start() == start)
    }

    /// Start addresses of every block in the heap.
    #[must_use]
    pub fn block_starts(&self) -> Vec<usize> {
        self.block_snapshot().into_iter().map(BlockRef::start).collect()
    }

    /// Blocks in the heap.
    #[must_use]
    pub fn num_major_sections(&self) -> usize {
        self.num_major_sections.load(Ordering::Acquire)
    }

    /// Blocks waiting in the empty pool.
    #[must_use]
    pub fn num_empty_blocks(&self) -> usize {
        self.empty_blocks.len()
    }

    /// Whether `addr` lies in memory reserved by this heap.
    #[must_use]
    pub fn owns(&self, addr: usize) -> bool {
        self.empty_blocks.owns(addr)
    }

    // ========================================================================
    // Pinning
    // ========================================================================

    /// Pins a major object for the running collection: its block will not
    /// be evacuated and the object is marked and queued for scanning.
    ///
    /// # Safety
    ///
    /// `obj` must be an allocated object in a block of this heap.
    ///
    /// # Panics
    ///
    /// Panics during concurrent marking, where pinning is done through
    /// [`MajorHeap::pin_objects`] at the start of the cycle.
    pub unsafe fn pin_object(&self, obj: ObjPtr, queue: &mut GrayQueue) {
        crate::gc_assert!(
            self.collection_phase() != CollectionPhase::Concurrent,
            "{obj:?} pinned during concurrent marking"
        );
        // SAFETY: forwarded from the caller.
        let block = unsafe { BlockRef::for_object(obj) };
        block.set_has_pinned(true);
        self.mark_and_enqueue(block, obj, queue);
    }

    /// Pins every allocated slot that one of `addresses` points into.
    ///
    /// Addresses outside the heap, and addresses of free slots, are
    /// ignored. Returns the number of objects pinned.
    pub fn pin_objects(&self, addresses: &[usize], queue: &mut GrayQueue) -> usize {
        let mut addresses = addresses.to_vec();
        addresses.sort_unstable();
        addresses.dedup();

        let mut pinned = 0;
        for block in self.block_snapshot() {
            let lo = addresses.partition_point(|&a| a < block.slot_addr(0));
            let hi = addresses.partition_point(|&a| a < block.start() + MS_BLOCK_SIZE);
            let mut last_index = None;
            for &addr in &addresses[lo..hi] {
                let index = block.slot_index(addr);
                if index >= block.obj_count() || last_index == Some(index) {
                    continue;
                }
                last_index = Some(index);
                let slot = block.slot_addr(index);
                if !block.slot_is_allocated(slot) {
                    continue;
                }
                let Some(obj) = ObjPtr::from_addr(slot) else {
                    continue;
                };
                block.set_has_pinned(true);
                self.mark_and_enqueue(block, obj, queue);
                pinned += 1;
            }
        }
        pinned
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Whether a marking cycle reached `obj`.
    ///
    /// Marks are cleared when a block is swept, so this is meaningful
    /// between marking and sweeping; afterwards every object of a swept
    /// block reports dead.
    #[must_use]
    pub fn is_object_live(&self, obj: ObjPtr) -> bool {
        if self.collab.object_model.in_nursery(obj) {
            return false;
        }
        match self.find_block(obj.addr()) {
            Some(block) => block.is_marked(obj.addr()),
            None => self.collab.large_objects.is_marked(obj),
        }
    }

    /// Whether `addr` is the start of an allocated object in this heap.
    #[must_use]
    pub fn is_valid_object(&self, addr: usize) -> bool {
        self.find_block(addr).is_some_and(|block| {
            block.contains(addr)
                && block.slot_index(addr) < block.obj_count()
                && block.slot_addr(block.slot_index(addr)) == addr
                && block.slot_is_allocated(addr)
        })
    }

    /// Start of the regular-allocator slot containing `addr`, if any.
    #[must_use]
    pub fn ptr_is_in_non_pinned_space(&self, addr: usize) -> Option<usize> {
        let block = self.find_block(addr)?;
        if block.pinned() || !block.contains(addr) {
            return None;
        }
        let index = block.slot_index(addr);
        (index < block.obj_count()).then(|| block.slot_addr(index))
    }

    /// Whether `obj` came from the pinned allocator.
    #[must_use]
    pub fn obj_is_from_pinned_alloc(&self, obj: ObjPtr) -> bool {
        self.find_block(obj.addr()).is_some_and(|block| block.pinned())
    }

    /// Describes what `addr` points at, `None` outside the heap's blocks.
    #[must_use]
    pub fn describe_pointer(&self, addr: usize) -> Option<PointerInfo> {
        let block = self.find_block(addr)?;
        if !block.contains(addr) {
            return None;
        }
        let slot_index = block.slot_index(addr);
        if slot_index >= block.obj_count() {
            return None;
        }
        let slot = block.slot_addr(slot_index);
        Some(PointerInfo {
            block: block.start(),
            obj_size: block.obj_size(),
            size_index: block.obj_size_index(),
            slot,
            slot_index,
            allocated: block.slot_is_allocated(slot),
            marked: block.is_marked(slot),
            pinned_block: block.pinned(),
            state: block.state(),
        })
    }

    /// Calls `f(obj, slot_size)` for every object selected by `flags`.
    ///
    /// Unswept blocks only report marked objects; with
    /// [`IterateFlags::SWEEP`] lazily skipped blocks are swept first.
    pub fn iterate_objects(&self, flags: IterateFlags, mut f: impl FnMut(ObjPtr, usize)) {
        self.finish_sweeping();
        for block in self.block_snapshot() {
            let wanted = if block.pinned() {
                IterateFlags::PINNED
            } else {
                IterateFlags::NON_PINNED
            };
            if !flags.contains(wanted) {
                continue;
            }
            if flags.contains(IterateFlags::SWEEP)
                && self.config.lazy_sweep
                && !block.state().is_swept_or_marking()
            {
                self.sweep_block(block);
            }
            for index in 0..block.obj_count() {
                let slot = block.slot_addr(index);
                if !block.state().is_swept_or_marking() && !block.is_marked(slot) {
                    continue;
                }
                if block.slot_is_allocated(slot) {
                    if let Some(obj) = ObjPtr::from_addr(slot) {
                        f(obj, block.obj_size());
                    }
                }
            }
        }
    }

    /// Calls `f(start, len)` for every block whose objects may hold
    /// references. A running sweep is finished first, so blocks it frees
    /// are not reported.
    pub fn iterate_live_block_ranges(&self, mut f: impl FnMut(usize, usize)) {
        self.finish_sweeping();
        for block in self.block_snapshot() {
            if block.has_references() {
                f(block.start(), MS_BLOCK_SIZE);
            }
        }
    }

    /// Bytes in allocated slots.
    #[must_use]
    pub fn get_used_size(&self) -> usize {
        self.finish_sweeping();
        self.block_snapshot()
            .into_iter()
            .map(|block| (block.obj_count() - block.free_slots().count()) * block.obj_size())
            .sum()
    }

    /// Block memory that survived the last sweep.
    ///
    /// # Panics
    ///
    /// Panics if a sweep is still running.
    #[must_use]
    pub fn bytes_survived_last_sweep(&self) -> usize {
        crate::gc_assert!(self.have_swept(), "survival is only known once the sweep finished");
        let before = self.num_major_sections_before_sweep.load(Ordering::Acquire);
        let freed = self.num_major_sections_freed_in_sweep.load(Ordering::Acquire);
        before.saturating_sub(freed) * MS_BLOCK_SIZE
    }

    /// Per-size-class block and slot counts.
    #[must_use]
    pub fn size_class_usage(&self) -> Vec<SizeClassUsage> {
        self.finish_sweeping();
        let mut usage: Vec<SizeClassUsage> = self
            .size_classes
            .sizes()
            .iter()
            .map(|&obj_size| SizeClassUsage {
                obj_size,
                blocks: 0,
                slots: 0,
                free_slots: 0,
            })
            .collect();
        for block in self.block_snapshot() {
            let entry = &mut usage[block.obj_size_index()];
            entry.blocks += 1;
            entry.slots += block.obj_count();
            entry.free_slots += block.free_slots().count();
        }
        usage
    }

    // ========================================================================
    // Nursery collection hooks
    // ========================================================================

    /// Called when a nursery collection starts.
    pub fn start_nursery_collection(&self) {
        #[cfg(feature = "consistency-check")]
        self.consistency_check();
        self.old_num_major_sections
            .store(self.num_major_sections(), Ordering::Relaxed);
    }

    /// Called when a nursery collection ends.
    pub fn finish_nursery_collection(&self) {
        #[cfg(feature = "consistency-check")]
        self.consistency_check();
    }

    /// Blocks added since the last nursery collection started.
    #[must_use]
    pub fn sections_grown_since_nursery_collection(&self) -> usize {
        self.num_major_sections()
            .saturating_sub(self.old_num_major_sections.load(Ordering::Relaxed))
    }

    // ========================================================================
    // Debugging
    // ========================================================================

    /// Verifies free lists, mark bits and the free-block lists.
    ///
    /// # Panics
    ///
    /// Panics on the first inconsistency found.
    pub fn consistency_check(&self) {
        self.finish_sweeping();
        let blocks = self.block_snapshot();

        for &block in &blocks {
            let count = block.obj_count();
            let unallocated = (0..count)
                .filter(|&i| !block.slot_is_allocated(block.slot_addr(i)))
                .count();
            let mut on_list = 0;
            for slot in block.free_slots() {
                crate::gc_assert!(
                    block.contains(slot) && on_list < count,
                    "free list of {block:?} leaves the block at {slot:#x}"
                );
                crate::gc_assert!(
                    block.slot_addr(block.slot_index(slot)) == slot,
                    "free list of {block:?} links the unaligned address {slot:#x}"
                );
                crate::gc_assert!(!block.is_marked(slot), "free slot {slot:#x} of {block:?} is marked");
                on_list += 1;
            }
            crate::gc_assert!(
                on_list == unallocated,
                "{block:?} has {unallocated} unallocated slots but {on_list} on its free list"
            );
            if !self.collection_in_progress() && block.state().is_swept_or_marking() {
                crate::gc_assert!(block.marks_are_clear(), "{block:?} has stale mark bits");
            }
        }

        for (kind, lists) in self.free_block_lists.iter().enumerate() {
            let pinned = kind & FREE_LIST_PINNED != 0;
            let has_references = kind & FREE_LIST_REFS != 0;
            for (index, list) in lists.iter().enumerate() {
                let mut cursor = list.load(Ordering::Acquire);
                let mut seen = 0;
                while let Some(block) = BlockRef::from_ptr(cursor) {
                    crate::gc_assert!(
                        seen < blocks.len() && blocks.contains(&block),
                        "free-block list {kind}/{index} reaches unknown {block:?}"
                    );
                    crate::gc_assert!(
                        block.obj_size_index() == index
                            && block.pinned() == pinned
                            && block.has_references() == has_references,
                        "{block:?} is on the wrong free-block list {kind}/{index}"
                    );
                    if block.state().is_swept_or_marking() {
                        crate::gc_assert!(
                            block.free_list_head() != 0,
                            "full {block:?} is on a free-block list"
                        );
                    }
                    seen += 1;
                    cursor = block.next_free();
                }
            }
        }
    }

    /// Writes a per-size-class occupancy table.
    ///
    /// # Errors
    ///
    /// Propagates write errors.
    pub fn dump_heap(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(
            out,
            "major heap: {} blocks, {} empty, {} bytes used",
            self.num_major_sections(),
            self.num_empty_blocks(),
            self.get_used_size()
        )?;
        writeln!(out, "{:>6} {:>7} {:>8} {:>8}", "size", "blocks", "slots", "free")?;
        for usage in self.size_class_usage().iter().filter(|u| u.blocks > 0) {
            writeln!(
                out,
                "{:>6} {:>7} {:>8} {:>8}",
                usage.obj_size, usage.blocks, usage.slots, usage.free_slots
            )?;
        }
        Ok(())
    }

    // ========================================================================
    // Block release
    // ========================================================================

    /// Hands a block with no live slot back to the empty pool.
    pub(crate) fn free_block(&self, block: BlockRef) {
        block.free_mod_union();
        self.collab.recorder.block_free(block.start(), MS_BLOCK_SIZE);
        self.collab.governor.release_space(MS_BLOCK_SIZE);
        HeapCounters::bump(&self.counters.blocks_freed);
        // SAFETY: the block left the allocated array and no free list
        // references it.
        unsafe {
            self.empty_blocks
                .put(NonNull::new_unchecked(block.start() as *mut u8));
        }
    }

    /// Unmaps empty blocks beyond `allowance` bytes worth of spares.
    /// Returns the number of blocks given back to the OS.
    ///
    /// # Panics
    ///
    /// Panics if a sweep is still running.
    pub fn free_swept_blocks(&self, allowance: usize) -> usize {
        crate::gc_assert!(self.have_swept(), "blocks may only be released after the sweep");
        let released = self
            .empty_blocks
            .release_empty_regions(allowance / MS_BLOCK_SIZE);

        #[cfg(feature = "tracing")]
        tracing::debug!(released, allowance, "released empty blocks");

        released
    }
}

impl Drop for MajorHeap {
    fn drop(&mut self) {
        for block in self.block_snapshot() {
            block.free_mod_union();
        }
    }
}
