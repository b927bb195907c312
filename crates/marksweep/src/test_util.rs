//! A small object model and instrumented collaborators for tests.
//!
//! Objects start with a word pointing at a leaked [`SimpleVTable`]. Bit 0 of
//! that word marks a forwarded object (the rest of the word is the copy),
//! bit 1 a pinned nursery object. The nursery is a leaked bump arena.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::block::{slot_word, BlockState};
use crate::client::{
    Collaborators, CollectionTrigger, Descriptor, GcRecorder, ObjPtr, ObjectModel, VTablePtr,
};
use crate::config::MajorConfig;
use crate::heap::MajorHeap;
use crate::job::{InlinePool, Job, JobHandle, JobPool};

const FORWARDED: usize = 1;
const PINNED: usize = 2;
const TAGS: usize = FORWARDED | PINNED;

/// Type information of a test object.
#[derive(Debug)]
#[repr(align(8))]
pub struct SimpleVTable {
    /// Object size in bytes, vtable word included.
    pub size: usize,
    /// How to scan the object.
    pub descriptor: Descriptor,
    /// Reference word indices for [`Descriptor::Complex`].
    pub complex_refs: &'static [usize],
}

impl SimpleVTable {
    /// Leaks a vtable for objects of `size` bytes.
    #[must_use]
    pub fn leak(size: usize, descriptor: Descriptor) -> VTablePtr {
        Self::leak_complex(size, descriptor, &[])
    }

    /// Leaks a vtable whose [`Descriptor::Complex`] fields are `refs`.
    #[must_use]
    pub fn leak_complex(size: usize, descriptor: Descriptor, refs: &[usize]) -> VTablePtr {
        let vtable: &'static Self = Box::leak(Box::new(Self {
            size,
            descriptor,
            complex_refs: Box::leak(refs.to_vec().into_boxed_slice()),
        }));
        VTablePtr::new(std::ptr::from_ref(vtable).cast()).expect("leaked vtable is not null")
    }
}

/// Object model over [`SimpleVTable`] objects with a bump-allocated nursery.
#[derive(Debug)]
pub struct SimpleObjectModel {
    nursery_start: usize,
    nursery_end: usize,
    cursor: AtomicUsize,
}

impl SimpleObjectModel {
    /// A model with a nursery of `nursery_bytes` bytes.
    #[must_use]
    pub fn new(nursery_bytes: usize) -> Arc<Self> {
        let words = nursery_bytes.div_ceil(8);
        let arena: &'static mut [u64] = Box::leak(vec![0u64; words].into_boxed_slice());
        let start = arena.as_mut_ptr() as usize;
        Arc::new(Self {
            nursery_start: start,
            nursery_end: start + words * 8,
            cursor: AtomicUsize::new(start),
        })
    }

    /// Bump-allocates a nursery object.
    ///
    /// # Panics
    ///
    /// Panics when the nursery is exhausted.
    #[must_use]
    pub fn alloc_nursery(&self, vtable: VTablePtr) -> ObjPtr {
        let size = vtable_of(vtable.addr()).size.next_multiple_of(8);
        let addr = self.cursor.fetch_add(size, Ordering::Relaxed);
        assert!(addr + size <= self.nursery_end, "test nursery exhausted");
        // SAFETY: the arena is leaked and the range was just reserved.
        unsafe { slot_word(addr, 0).store(vtable.addr(), Ordering::Release) };
        ObjPtr::from_addr(addr).expect("nursery is not at address 0")
    }

    /// Allocates an object outside both the nursery and the major heap, as
    /// a large object space would.
    #[must_use]
    pub fn alloc_large(&self, vtable: VTablePtr) -> ObjPtr {
        let words = vtable_of(vtable.addr()).size.div_ceil(8);
        let memory: &'static mut [u64] = Box::leak(vec![0u64; words].into_boxed_slice());
        let addr = memory.as_mut_ptr() as usize;
        // SAFETY: leaked memory owned by the object from now on.
        unsafe { slot_word(addr, 0).store(vtable.addr(), Ordering::Release) };
        ObjPtr::from_addr(addr).expect("leaked memory is not at address 0")
    }

    fn header(obj: ObjPtr) -> &'static AtomicUsize {
        // SAFETY: every test object starts with its header word.
        unsafe { slot_word(obj.addr(), 0) }
    }

    fn resolve(obj: ObjPtr) -> &'static SimpleVTable {
        let mut word = Self::header(obj).load(Ordering::Acquire);
        while word & FORWARDED != 0 {
            // SAFETY: forwarding targets are objects too.
            word = unsafe { slot_word(word & !TAGS, 0).load(Ordering::Acquire) };
        }
        vtable_of(word & !TAGS)
    }
}

fn vtable_of(addr: usize) -> &'static SimpleVTable {
    // SAFETY: test vtables are leaked `SimpleVTable`s.
    unsafe { &*(addr as *const SimpleVTable) }
}

impl ObjectModel for SimpleObjectModel {
    fn vtable(&self, obj: ObjPtr) -> VTablePtr {
        VTablePtr::new(std::ptr::from_ref(Self::resolve(obj)).cast())
            .expect("vtable is not null")
    }

    fn descriptor(&self, obj: ObjPtr) -> Descriptor {
        Self::resolve(obj).descriptor
    }

    fn size(&self, obj: ObjPtr) -> usize {
        Self::resolve(obj).size
    }

    fn forwarded(&self, obj: ObjPtr) -> Option<ObjPtr> {
        let word = Self::header(obj).load(Ordering::Acquire);
        (word & FORWARDED != 0)
            .then(|| ObjPtr::from_addr(word & !TAGS))
            .flatten()
    }

    fn try_forward(&self, obj: ObjPtr, to: ObjPtr) -> Result<(), ObjPtr> {
        let header = Self::header(obj);
        let current = header.load(Ordering::Acquire);
        if current & FORWARDED != 0 {
            return Err(ObjPtr::from_addr(current & !TAGS).expect("forward target"));
        }
        header
            .compare_exchange(current, to.addr() | FORWARDED, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|winner| ObjPtr::from_addr(winner & !TAGS).expect("forward target"))
    }

    fn is_pinned(&self, obj: ObjPtr) -> bool {
        Self::header(obj).load(Ordering::Acquire) & PINNED != 0
    }

    fn pin(&self, obj: ObjPtr) {
        Self::header(obj).fetch_or(PINNED, Ordering::AcqRel);
    }

    fn in_nursery(&self, obj: ObjPtr) -> bool {
        (self.nursery_start..self.nursery_end).contains(&obj.addr())
    }

    fn for_each_reference(&self, obj: ObjPtr, visit: &mut dyn FnMut(&AtomicUsize)) {
        for &index in Self::resolve(obj).complex_refs {
            // SAFETY: the vtable only lists words inside the object.
            visit(unsafe { obj.word(index) });
        }
    }
}

/// Reads reference word `index` of `obj`.
#[must_use]
pub fn read_ref(obj: ObjPtr, index: usize) -> Option<ObjPtr> {
    // SAFETY: test objects are large enough for the words tests use.
    ObjPtr::from_addr(unsafe { obj.word(index) }.load(Ordering::Acquire))
}

/// Writes reference word `index` of `obj` without a barrier.
pub fn write_ref(obj: ObjPtr, index: usize, value: Option<ObjPtr>) {
    // SAFETY: as in `read_ref`.
    unsafe { obj.word(index) }.store(value.map_or(0, ObjPtr::addr), Ordering::Release);
}

/// A root slot holding `obj`.
#[must_use]
pub fn root(obj: ObjPtr) -> AtomicUsize {
    AtomicUsize::new(obj.addr())
}

/// The object a root slot currently holds.
#[must_use]
pub fn root_target(slot: &AtomicUsize) -> Option<ObjPtr> {
    ObjPtr::from_addr(slot.load(Ordering::Acquire))
}

/// Counts recorder events.
#[derive(Debug, Default)]
pub struct CountingRecorder {
    /// Blocks allocated.
    pub blocks_allocated: AtomicUsize,
    /// Blocks freed.
    pub blocks_freed: AtomicUsize,
    /// Objects copied.
    pub copies: AtomicUsize,
    /// Sweeps finished.
    pub sweeps: AtomicUsize,
    /// Object sizes selected for evacuation.
    pub evacuating: Mutex<Vec<usize>>,
    /// Every block state transition observed.
    pub transitions: Mutex<Vec<(BlockState, BlockState)>>,
}

impl GcRecorder for CountingRecorder {
    fn block_alloc(&self, _block: usize, _size: usize) {
        self.blocks_allocated.fetch_add(1, Ordering::Relaxed);
    }

    fn block_free(&self, _block: usize, _size: usize) {
        self.blocks_freed.fetch_add(1, Ordering::Relaxed);
    }

    fn block_set_state(&self, _block: usize, from: BlockState, to: BlockState) {
        self.transitions.lock().push((from, to));
    }

    fn copy_object(&self, _from: ObjPtr, _to: ObjPtr, _size: usize) {
        self.copies.fetch_add(1, Ordering::Relaxed);
    }

    fn evacuating_blocks(&self, obj_size: usize) {
        self.evacuating.lock().push(obj_size);
    }

    fn sweep_end(&self) {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
    }
}

/// Counts forced collections.
#[derive(Debug, Default)]
pub struct CountingTrigger {
    /// Number of `collect` calls.
    pub collections: AtomicUsize,
}

impl CollectionTrigger for CountingTrigger {
    fn collect(&self, _reason: &str) {
        self.collections.fetch_add(1, Ordering::Relaxed);
    }
}

/// Holds jobs until the test runs them with [`DeferredPool::run_pending`].
#[derive(Default)]
pub struct DeferredPool {
    pending: Mutex<Vec<(Job, JobHandle)>>,
}

impl DeferredPool {
    /// Jobs waiting to run.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Runs every waiting job on the calling thread, returns how many ran.
    pub fn run_pending(&self) -> usize {
        let jobs = std::mem::take(&mut *self.pending.lock());
        let ran = jobs.len();
        for (job, handle) in jobs {
            job();
            handle.complete();
        }
        ran
    }
}

impl JobPool for DeferredPool {
    fn enqueue(&self, job: Job) -> JobHandle {
        let handle = JobHandle::new();
        self.pending.lock().push((job, handle.clone()));
        handle
    }
}

impl fmt::Debug for DeferredPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredPool")
            .field("pending", &self.pending())
            .finish()
    }
}

/// A heap with a 64 KiB test nursery whose sweeps run inline.
#[must_use]
pub fn inline_heap(config: MajorConfig) -> (Arc<MajorHeap>, Arc<SimpleObjectModel>) {
    let model = SimpleObjectModel::new(64 * 1024);
    let collab = Collaborators::new(model.clone()).with_jobs(Arc::new(InlinePool));
    (MajorHeap::new(config, collab), model)
}
