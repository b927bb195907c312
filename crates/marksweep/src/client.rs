//! Interfaces the collector consumes from the surrounding runtime.
//!
//! The major heap does not know what objects look like, who owns the
//! nursery, how much memory the process may use or where background work
//! runs. Those questions are answered by the traits in this module, bundled
//! into [`Collaborators`] when the heap is created.

use std::collections::HashSet;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::block::BlockState;
use crate::job::{JobPool, ThreadPool};

// ============================================================================
// Object pointers
// ============================================================================

/// Pointer to the first byte of a managed object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ObjPtr(NonNull<u8>);

// Objects are shared between mutators and GC workers; synchronization is
// the collector's job, not the pointer's.
unsafe impl Send for ObjPtr {}
unsafe impl Sync for ObjPtr {}

impl ObjPtr {
    /// Wraps a raw pointer, `None` if null.
    #[inline]
    #[must_use]
    pub fn new(ptr: *mut u8) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    /// Wraps a non-zero address, `None` if zero.
    #[inline]
    #[must_use]
    pub fn from_addr(addr: usize) -> Option<Self> {
        Self::new(addr as *mut u8)
    }

    /// The object's address.
    #[inline]
    #[must_use]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// The object's raw pointer.
    #[inline]
    #[must_use]
    pub const fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// Atomic view of word `index` of the object.
    ///
    /// # Safety
    ///
    /// The object must be live and at least `(index + 1) * 8` bytes long.
    #[inline]
    #[must_use]
    pub unsafe fn word<'a>(self, index: usize) -> &'a AtomicUsize {
        unsafe { crate::block::slot_word(self.addr(), index) }
    }
}

impl fmt::Debug for ObjPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjPtr({:#x})", self.addr())
    }
}

/// Opaque type information stored in an object's first word.
///
/// The collector writes it on allocation and never interprets it; the
/// [`ObjectModel`] does. Vtables must be at least 8-byte aligned and must
/// never live inside the major heap.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct VTablePtr(NonNull<u8>);

unsafe impl Send for VTablePtr {}
unsafe impl Sync for VTablePtr {}

impl VTablePtr {
    /// Wraps a raw vtable pointer, `None` if null.
    #[must_use]
    pub fn new(ptr: *const u8) -> Option<Self> {
        NonNull::new(ptr.cast_mut()).map(Self)
    }

    /// The vtable's address.
    #[inline]
    #[must_use]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }
}

impl fmt::Debug for VTablePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VTablePtr({:#x})", self.addr())
    }
}

/// How to find the reference fields of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Descriptor {
    /// The object holds no references.
    NoRefs,
    /// Bit `i` set means word `i` of the object (word 0 being the vtable)
    /// holds a reference.
    Bitmap(u64),
    /// Fields are enumerated by [`ObjectModel::for_each_reference`].
    Complex,
}

impl Descriptor {
    /// Whether scanning the object can find any reference.
    #[inline]
    #[must_use]
    pub const fn has_references(self) -> bool {
        match self {
            Self::NoRefs => false,
            Self::Bitmap(bits) => bits != 0,
            Self::Complex => true,
        }
    }
}

// ============================================================================
// Collaborator traits
// ============================================================================

/// Object layout and nursery knowledge supplied by the runtime.
pub trait ObjectModel: Send + Sync {
    /// The object's vtable with any tag bits removed.
    fn vtable(&self, obj: ObjPtr) -> VTablePtr;

    /// How to scan the object.
    fn descriptor(&self, obj: ObjPtr) -> Descriptor;

    /// Object size in bytes.
    fn size(&self, obj: ObjPtr) -> usize;

    /// Forwarding target if the object has been copied.
    fn forwarded(&self, obj: ObjPtr) -> Option<ObjPtr>;

    /// Records that `obj` now lives at `to`.
    ///
    /// Fails with the existing target if another thread forwarded the
    /// object first.
    ///
    /// # Errors
    ///
    /// Returns the winning copy when the object was already forwarded.
    fn try_forward(&self, obj: ObjPtr, to: ObjPtr) -> Result<(), ObjPtr>;

    /// Whether the nursery has pinned the object in place.
    fn is_pinned(&self, obj: ObjPtr) -> bool;

    /// Pins a nursery object in place.
    fn pin(&self, obj: ObjPtr);

    /// Whether the object lives in the nursery.
    fn in_nursery(&self, obj: ObjPtr) -> bool;

    /// Calls `visit` with every reference field of an object whose
    /// descriptor is [`Descriptor::Complex`].
    fn for_each_reference(&self, obj: ObjPtr, visit: &mut dyn FnMut(&AtomicUsize));
}

/// Admission control for heap growth.
pub trait MemoryGovernor: Send + Sync {
    /// Asks for `size` more bytes; `false` means the heap may not grow.
    fn try_alloc_space(&self, size: usize) -> bool;

    /// Returns `size` bytes previously granted.
    fn release_space(&self, size: usize);
}

/// Fire-and-forget diagnostic hooks.
///
/// Every method has an empty default body.
#[allow(unused_variables)]
pub trait GcRecorder: Send + Sync {
    /// A block was allocated.
    fn block_alloc(&self, block: usize, size: usize) {}
    /// A block was returned to the empty pool.
    fn block_free(&self, block: usize, size: usize) {}
    /// A block changed state.
    fn block_set_state(&self, block: usize, from: BlockState, to: BlockState) {}
    /// An object was marked.
    fn mark_object(&self, obj: ObjPtr, size: usize) {}
    /// An object was copied.
    fn copy_object(&self, from: ObjPtr, to: ObjPtr, size: usize) {}
    /// A size class was selected for evacuation.
    fn evacuating_blocks(&self, obj_size: usize) {}
    /// A sweep started.
    fn sweep_begin(&self) {}
    /// A sweep finished.
    fn sweep_end(&self) {}
}

/// Mark path for objects too large for blocks.
pub trait LargeObjectSpace: Send + Sync {
    /// Marks `obj`; returns `true` if it was unmarked before.
    fn mark(&self, obj: ObjPtr) -> bool;

    /// Whether `obj` is marked.
    fn is_marked(&self, obj: ObjPtr) -> bool;

    /// Forgets every mark, at the start of a collection.
    fn clear_marks(&self);
}

/// Runs a full collection on behalf of an allocation that failed.
pub trait CollectionTrigger: Send + Sync {
    /// Collects; `reason` is for diagnostics.
    fn collect(&self, reason: &str);
}

// ============================================================================
// Default implementations
// ============================================================================

/// A governor that grants everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnboundedGovernor;

impl MemoryGovernor for UnboundedGovernor {
    fn try_alloc_space(&self, _size: usize) -> bool {
        true
    }

    fn release_space(&self, _size: usize) {}
}

/// A governor with a fixed byte budget.
#[derive(Debug)]
pub struct CappedGovernor {
    limit: usize,
    used: AtomicUsize,
}

impl CappedGovernor {
    /// Allows at most `limit` bytes of block memory.
    #[must_use]
    pub const fn new(limit: usize) -> Self {
        Self {
            limit,
            used: AtomicUsize::new(0),
        }
    }

    /// Bytes currently granted.
    #[must_use]
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }
}

impl MemoryGovernor for CappedGovernor {
    fn try_alloc_space(&self, size: usize) -> bool {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|&total| total <= self.limit)
            })
            .is_ok()
    }

    fn release_space(&self, size: usize) {
        self.used.fetch_sub(size, Ordering::AcqRel);
    }
}

/// A recorder that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecorder;

impl GcRecorder for NoopRecorder {}

/// A recorder that forwards every hook to `tracing` at trace level.
#[cfg(feature = "tracing")]
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRecorder;

#[cfg(feature = "tracing")]
impl GcRecorder for TracingRecorder {
    fn block_alloc(&self, block: usize, size: usize) {
        tracing::trace!(block = format_args!("{block:#x}"), size, "block_alloc");
    }

    fn block_free(&self, block: usize, size: usize) {
        tracing::trace!(block = format_args!("{block:#x}"), size, "block_free");
    }

    fn block_set_state(&self, block: usize, from: BlockState, to: BlockState) {
        tracing::trace!(block = format_args!("{block:#x}"), ?from, ?to, "block_set_state");
    }

    fn mark_object(&self, obj: ObjPtr, size: usize) {
        tracing::trace!(obj = ?obj, size, "mark");
    }

    fn copy_object(&self, from: ObjPtr, to: ObjPtr, size: usize) {
        tracing::trace!(from = ?from, to = ?to, size, "copy");
    }

    fn evacuating_blocks(&self, obj_size: usize) {
        tracing::trace!(obj_size, "evacuating_blocks");
    }

    fn sweep_begin(&self) {
        tracing::trace!("sweep_begin");
    }

    fn sweep_end(&self) {
        tracing::trace!("sweep_end");
    }
}

/// Large object marks kept in a set.
#[derive(Debug, Default)]
pub struct LargeObjectMarks {
    marked: Mutex<HashSet<usize>>,
}

impl LargeObjectMarks {
    /// An empty mark set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of marked large objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.marked.lock().len()
    }

    /// Whether no large object is marked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.marked.lock().is_empty()
    }
}

impl LargeObjectSpace for LargeObjectMarks {
    fn mark(&self, obj: ObjPtr) -> bool {
        self.marked.lock().insert(obj.addr())
    }

    fn is_marked(&self, obj: ObjPtr) -> bool {
        self.marked.lock().contains(&obj.addr())
    }

    fn clear_marks(&self) {
        self.marked.lock().clear();
    }
}

/// A trigger that does nothing; pinned allocation retries once and fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTrigger;

impl CollectionTrigger for NoopTrigger {
    fn collect(&self, _reason: &str) {}
}

// ============================================================================
// Collaborators
// ============================================================================

/// Everything the heap needs from the outside world.
#[derive(Clone)]
pub struct Collaborators {
    /// Object layout accessor.
    pub object_model: Arc<dyn ObjectModel>,
    /// Admission control for new blocks.
    pub governor: Arc<dyn MemoryGovernor>,
    /// Where background sweeps run.
    pub jobs: Arc<dyn JobPool>,
    /// Diagnostic hooks.
    pub recorder: Arc<dyn GcRecorder>,
    /// Mark path for large objects.
    pub large_objects: Arc<dyn LargeObjectSpace>,
    /// Forced collection for pinned allocation retries.
    pub trigger: Arc<dyn CollectionTrigger>,
}

impl Collaborators {
    /// Defaults for everything but the object model: unbounded governor,
    /// a one-thread job pool, no-op recorder and trigger, set-based large
    /// object marks.
    #[must_use]
    pub fn new(object_model: Arc<dyn ObjectModel>) -> Self {
        Self {
            object_model,
            governor: Arc::new(UnboundedGovernor),
            jobs: Arc::new(ThreadPool::new(1)),
            recorder: Arc::new(NoopRecorder),
            large_objects: Arc::new(LargeObjectMarks::new()),
            trigger: Arc::new(NoopTrigger),
        }
    }

    /// Replaces the memory governor.
    #[must_use]
    pub fn with_governor(mut self, governor: Arc<dyn MemoryGovernor>) -> Self {
        self.governor = governor;
        self
    }

    /// Replaces the job pool.
    #[must_use]
    pub fn with_jobs(mut self, jobs: Arc<dyn JobPool>) -> Self {
        self.jobs = jobs;
        self
    }

    /// Replaces the diagnostic recorder.
    #[must_use]
    pub fn with_recorder(mut self, recorder: Arc<dyn GcRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    /// Replaces the large object space.
    #[must_use]
    pub fn with_large_objects(mut self, large_objects: Arc<dyn LargeObjectSpace>) -> Self {
        self.large_objects = large_objects;
        self
    }

    /// Replaces the collection trigger.
    #[must_use]
    pub fn with_trigger(mut self, trigger: Arc<dyn CollectionTrigger>) -> Self {
        self.trigger = trigger;
        self
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
