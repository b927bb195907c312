//! Marking and copying.
//!
//! Four variants of the trace routines exist, chosen statically through a
//! [`MarkPolicy`] type parameter:
//!
//! | policy                 | moves nursery objects | evacuates blocks |
//! |------------------------|-----------------------|------------------|
//! | `Serial`               | yes                   | no               |
//! | `SerialEvacuating`     | yes                   | yes              |
//! | `Concurrent`           | no                    | no               |
//! | `ConcurrentEvacuating` | no                    | follows forwards |
//!
//! Concurrent variants run alongside the mutator and therefore never move an
//! object or rewrite a field; nursery objects are left to the finishing
//! pause. A [`Tracer`] picks the variant from its [`MarkMode`] and whether
//! the heap is evacuating.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::block::{copy_object_body, BlockRef, ALLOC_ALIGN, MAX_SMALL_OBJ_SIZE};
use crate::client::{Descriptor, ObjPtr};
use crate::gc::gray::{DrainResult, GrayQueue};
use crate::heap::MajorHeap;
use crate::metrics::HeapCounters;

/// Compile-time selection of a trace variant.
pub trait MarkPolicy {
    /// Objects in evacuating blocks are copied out.
    const EVACUATE: bool;
    /// Runs concurrently with the mutator.
    const CONCURRENT: bool;
}

/// Stop-the-world marking without evacuation.
#[derive(Debug, Clone, Copy)]
pub struct Serial;
/// Stop-the-world marking with evacuation.
#[derive(Debug, Clone, Copy)]
pub struct SerialEvacuating;
/// Concurrent marking.
#[derive(Debug, Clone, Copy)]
pub struct Concurrent;
/// Concurrent marking while evacuation candidates exist.
#[derive(Debug, Clone, Copy)]
pub struct ConcurrentEvacuating;

impl MarkPolicy for Serial {
    const EVACUATE: bool = false;
    const CONCURRENT: bool = false;
}

impl MarkPolicy for SerialEvacuating {
    const EVACUATE: bool = true;
    const CONCURRENT: bool = false;
}

impl MarkPolicy for Concurrent {
    const EVACUATE: bool = false;
    const CONCURRENT: bool = true;
}

impl MarkPolicy for ConcurrentEvacuating {
    const EVACUATE: bool = true;
    const CONCURRENT: bool = true;
}

/// Which pause, if any, a tracer runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkMode {
    /// A stop-the-world collection.
    Serial,
    /// Concurrent marking, mutators running.
    ConcurrentStart,
    /// The pause that finishes a concurrent collection.
    ConcurrentFinish,
}

#[inline]
const fn align_up(size: usize) -> usize {
    (size + ALLOC_ALIGN - 1) & !(ALLOC_ALIGN - 1)
}

impl MajorHeap {
    /// A tracer for this heap.
    #[must_use]
    pub const fn tracer(&self, mode: MarkMode) -> Tracer<'_> {
        Tracer { heap: self, mode }
    }

    /// Marks `obj` in `block` and queues it if it has references.
    pub(crate) fn mark_and_enqueue(&self, block: BlockRef, obj: ObjPtr, queue: &mut GrayQueue) {
        if block.set_mark(obj.addr()) {
            HeapCounters::bump(&self.counters.objects_marked);
            self.collab.recorder.mark_object(obj, block.obj_size());
            let desc = self.collab.object_model.descriptor(obj);
            if desc.has_references() {
                queue.enqueue(obj, desc);
            }
        }
    }

    /// Processes one reference field.
    fn copy_or_mark_object<P: MarkPolicy>(&self, field: &AtomicUsize, queue: &mut GrayQueue) {
        let Some(mut obj) = ObjPtr::from_addr(field.load(Ordering::Acquire)) else {
            return;
        };
        let model = &*self.collab.object_model;

        if model.in_nursery(obj) {
            if P::CONCURRENT {
                return;
            }
            if let Some(to) = model.forwarded(obj) {
                field.store(to.addr(), Ordering::Release);
                return;
            }
            if model.is_pinned(obj) {
                return;
            }
            match self.copy_object(obj, queue) {
                Some(to) => field.store(to.addr(), Ordering::Release),
                None => {
                    // Out of major memory: the object stays where it is.
                    model.pin(obj);
                    HeapCounters::bump(&self.counters.objects_pinned_on_copy_failure);
                    let desc = model.descriptor(obj);
                    if desc.has_references() {
                        queue.enqueue(obj, desc);
                    }
                }
            }
            return;
        }

        if P::EVACUATE || P::CONCURRENT {
            if let Some(to) = model.forwarded(obj) {
                if !P::CONCURRENT {
                    field.store(to.addr(), Ordering::Release);
                    return;
                }
                // The copy is what survives; the mutator fixes its own
                // fields.
                obj = to;
            }
        }

        let size = align_up(model.size(obj));
        if size > MAX_SMALL_OBJ_SIZE {
            if self.collab.large_objects.mark(obj) {
                HeapCounters::bump(&self.counters.objects_marked);
                self.collab.recorder.mark_object(obj, size);
                let desc = model.descriptor(obj);
                if desc.has_references() {
                    queue.enqueue(obj, desc);
                }
            }
            return;
        }

        // SAFETY: major objects that are not large live in our blocks.
        let block = unsafe { BlockRef::for_object(obj) };
        if P::EVACUATE
            && !P::CONCURRENT
            && self.block_is_evacuating(block)
            && !block.is_marked(obj.addr())
        {
            if let Some(to) = self.copy_object(obj, queue) {
                field.store(to.addr(), Ordering::Release);
                return;
            }
        }
        self.mark_and_enqueue(block, obj, queue);
    }

    /// Copies `obj` into a fresh major slot, forwards it and queues the
    /// copy. `None` if no major memory is left.
    fn copy_object(&self, obj: ObjPtr, queue: &mut GrayQueue) -> Option<ObjPtr> {
        let model = &*self.collab.object_model;
        let size = align_up(model.size(obj));
        let desc = model.descriptor(obj);
        let to = self
            .alloc_obj(model.vtable(obj), size, false, desc.has_references())
            .ok()?;
        // SAFETY: `to` was just allocated for `size` bytes.
        let to_block = unsafe { BlockRef::for_object(to) };
        to_block.set_mark(to.addr());
        // SAFETY: `obj` is not written during a pause; `to` is ours.
        unsafe { copy_object_body(obj.addr(), to.addr(), size) };

        if let Err(winner) = model.try_forward(obj, to) {
            // Another worker copied it first; our copy becomes garbage.
            to_block.clear_mark(to.addr());
            return Some(winner);
        }

        HeapCounters::bump(&self.counters.objects_copied);
        HeapCounters::bump(&self.counters.objects_marked);
        self.collab.recorder.copy_object(obj, to, size);
        if desc.has_references() {
            queue.enqueue(to, desc);
        }
        Some(to)
    }

    fn scan_object<P: MarkPolicy>(&self, obj: ObjPtr, desc: Descriptor, queue: &mut GrayQueue) {
        match desc {
            Descriptor::NoRefs => {}
            Descriptor::Bitmap(mut bits) => {
                while bits != 0 {
                    let index = bits.trailing_zeros() as usize;
                    bits &= bits - 1;
                    // SAFETY: the descriptor only names words of the object.
                    let field = unsafe { obj.word(index) };
                    self.copy_or_mark_object::<P>(field, queue);
                }
            }
            Descriptor::Complex => {
                self.collab
                    .object_model
                    .for_each_reference(obj, &mut |field| {
                        self.copy_or_mark_object::<P>(field, queue);
                    });
            }
        }
    }

    fn drain_gray_stack<P: MarkPolicy>(&self, queue: &mut GrayQueue) -> DrainResult {
        if queue.prefetch_enabled() {
            if !queue.fill_prefetch() {
                return DrainResult::NeedsRefill;
            }
            while let Some(entry) = queue.dequeue_prefetched() {
                self.scan_object::<P>(entry.obj, entry.desc, queue);
            }
        } else {
            while let Some(entry) = queue.dequeue() {
                self.scan_object::<P>(entry.obj, entry.desc, queue);
            }
        }
        DrainResult::Drained
    }
}

/// Marks through one heap with the variant fitting the current pause.
#[derive(Debug, Clone, Copy)]
pub struct Tracer<'h> {
    heap: &'h MajorHeap,
    mode: MarkMode,
}

macro_rules! dispatch {
    ($tracer:expr, $method:ident ( $($arg:expr),* )) => {{
        let heap = $tracer.heap;
        match ($tracer.mode, heap.is_evacuating()) {
            (MarkMode::ConcurrentStart, false) => heap.$method::<Concurrent>($($arg),*),
            (MarkMode::ConcurrentStart, true) => heap.$method::<ConcurrentEvacuating>($($arg),*),
            (MarkMode::Serial | MarkMode::ConcurrentFinish, false) => heap.$method::<Serial>($($arg),*),
            (MarkMode::Serial | MarkMode::ConcurrentFinish, true) => {
                heap.$method::<SerialEvacuating>($($arg),*)
            }
        }
    }};
}

impl Tracer<'_> {
    /// The tracer's mode.
    #[must_use]
    pub const fn mode(&self) -> MarkMode {
        self.mode
    }

    /// Processes a reference field, or a root slot: marks or copies the
    /// referenced object and updates the field if it moved.
    pub fn copy_or_mark(&self, field: &AtomicUsize, queue: &mut GrayQueue) {
        dispatch!(self, copy_or_mark_object(field, queue));
    }

    /// Scans `obj`'s reference fields.
    pub fn scan_object(&self, obj: ObjPtr, queue: &mut GrayQueue) {
        let desc = self.heap.collab.object_model.descriptor(obj);
        dispatch!(self, scan_object(obj, desc, queue));
    }

    /// Scans objects until `queue` is empty.
    pub fn drain(&self, queue: &mut GrayQueue) -> DrainResult {
        dispatch!(self, drain_gray_stack(queue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(1), 8);
        assert_eq!(align_up(8), 8);
        assert_eq!(align_up(17), 24);
    }

    #[test]
    fn test_policies() {
        const fn flags<P: MarkPolicy>() -> (bool, bool) {
            (P::EVACUATE, P::CONCURRENT)
        }
        assert_eq!(flags::<Serial>(), (false, false));
        assert_eq!(flags::<SerialEvacuating>(), (true, false));
        assert_eq!(flags::<Concurrent>(), (false, true));
        assert_eq!(flags::<ConcurrentEvacuating>(), (true, true));
    }
}
