//! Gray queues.
//!
//! A gray queue is a stack of fixed-size sections holding objects that are
//! marked but not yet scanned. Whole sections are the unit of sharing:
//! [`SharedSections`] lets idle workers take sections published by busy
//! ones. Exhausted sections go to a per-queue free list and are reused.
//!
//! Draining goes through a two-entry prefetch ring so the next object's
//! memory is on its way while the current one is scanned.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_queue::SegQueue;

use crate::client::{Descriptor, ObjPtr};

/// Entries per section.
pub const SECTION_SIZE: usize = 125;

const PREFETCH_RING: usize = 2;

/// An object waiting to be scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrayEntry {
    /// The object.
    pub obj: ObjPtr,
    /// How to scan it.
    pub desc: Descriptor,
}

/// A fixed-capacity chunk of a gray queue.
#[derive(Debug)]
pub struct GraySection {
    entries: Vec<GrayEntry>,
    next: Option<Box<GraySection>>,
}

impl GraySection {
    /// An empty section.
    #[must_use]
    pub fn new() -> Box<Self> {
        Box::new(Self {
            entries: Vec::with_capacity(SECTION_SIZE),
            next: None,
        })
    }

    /// Entries in the section.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the section holds no entry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the section is full.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.entries.len() >= SECTION_SIZE
    }
}

/// Outcome of [`Tracer::drain`](crate::gc::Tracer::drain).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainResult {
    /// The queue is empty.
    Drained,
    /// The queue was empty on entry; the caller should find more work.
    NeedsRefill,
}

/// Supplies sections when a queue runs out of spare ones.
pub type PrepareFn = Box<dyn FnMut() -> Option<Box<GraySection>> + Send>;

/// A worker-local gray queue.
pub struct GrayQueue {
    first: Option<Box<GraySection>>,
    free_list: Option<Box<GraySection>>,
    num_sections: usize,
    prepare: Option<PrepareFn>,
    prefetch: bool,
    ring: [Option<GrayEntry>; PREFETCH_RING],
    ring_head: usize,
    ring_len: usize,
}

impl fmt::Debug for GrayQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrayQueue")
            .field("sections", &self.num_sections)
            .field("prefetched", &self.ring_len)
            .field("prefetch", &self.prefetch)
            .finish_non_exhaustive()
    }
}

impl Default for GrayQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl GrayQueue {
    /// An empty queue without prefetching.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            first: None,
            free_list: None,
            num_sections: 0,
            prepare: None,
            prefetch: false,
            ring: [None; PREFETCH_RING],
            ring_head: 0,
            ring_len: 0,
        }
    }

    /// Enables or disables the prefetch ring used by draining.
    #[must_use]
    pub const fn with_prefetch(mut self, prefetch: bool) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Installs a callback consulted for a section before allocating one.
    #[must_use]
    pub fn with_prepare(mut self, prepare: PrepareFn) -> Self {
        self.prepare = Some(prepare);
        self
    }

    /// Whether draining uses the prefetch ring.
    #[must_use]
    pub const fn prefetch_enabled(&self) -> bool {
        self.prefetch
    }

    /// Whether the queue holds nothing, counting prefetched entries.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.first.is_none() && self.ring_len == 0
    }

    /// Entries in the queue, counting prefetched ones.
    #[must_use]
    pub fn len(&self) -> usize {
        let mut len = self.ring_len;
        let mut cursor = self.first.as_deref();
        while let Some(section) = cursor {
            len += section.len();
            cursor = section.next.as_deref();
        }
        len
    }

    /// Sections holding entries.
    #[must_use]
    pub const fn num_sections(&self) -> usize {
        self.num_sections
    }

    /// Pushes an object.
    #[inline]
    pub fn enqueue(&mut self, obj: ObjPtr, desc: Descriptor) {
        let entry = GrayEntry { obj, desc };
        if let Some(section) = self.first.as_mut() {
            if !section.is_full() {
                section.entries.push(entry);
                return;
            }
        }
        self.enqueue_slow(entry);
    }

    #[cold]
    fn enqueue_slow(&mut self, entry: GrayEntry) {
        let mut section = self.alloc_section();
        section.entries.push(entry);
        section.next = self.first.take();
        self.first = Some(section);
        self.num_sections += 1;
    }

    fn alloc_section(&mut self) -> Box<GraySection> {
        if let Some(mut section) = self.free_list.take() {
            self.free_list = section.next.take();
            return section;
        }
        if let Some(prepare) = self.prepare.as_mut() {
            if let Some(mut section) = prepare() {
                section.entries.clear();
                section.next = None;
                return section;
            }
        }
        GraySection::new()
    }

    fn recycle(&mut self, mut section: Box<GraySection>) {
        section.entries.clear();
        section.next = self.free_list.take();
        self.free_list = Some(section);
    }

    /// Pops the most recently pushed object, prefetched entries first.
    #[inline]
    pub fn dequeue(&mut self) -> Option<GrayEntry> {
        self.ring_pop().or_else(|| self.pop_entry())
    }

    fn pop_entry(&mut self) -> Option<GrayEntry> {
        let section = self.first.as_mut()?;
        let entry = section.entries.pop();
        debug_assert!(entry.is_some(), "gray queue kept an empty section");
        if section.is_empty() {
            if let Some(mut exhausted) = self.first.take() {
                self.first = exhausted.next.take();
                self.num_sections -= 1;
                self.recycle(exhausted);
            }
        }
        entry
    }

    /// Detaches the newest section, for handing to another worker.
    pub fn dequeue_section(&mut self) -> Option<Box<GraySection>> {
        let mut section = self.first.take()?;
        self.first = section.next.take();
        self.num_sections -= 1;
        Some(section)
    }

    /// Adopts a section, which becomes the top of the stack.
    pub fn enqueue_section(&mut self, mut section: Box<GraySection>) {
        debug_assert!(section.len() <= SECTION_SIZE);
        if section.is_empty() {
            self.recycle(section);
            return;
        }
        section.next = self.first.take();
        self.first = Some(section);
        self.num_sections += 1;
    }

    // ------------------------------------------------------------------
    // Prefetch ring
    // ------------------------------------------------------------------

    fn ring_pop(&mut self) -> Option<GrayEntry> {
        if self.ring_len == 0 {
            return None;
        }
        let entry = self.ring[self.ring_head].take();
        self.ring_head = (self.ring_head + 1) % PREFETCH_RING;
        self.ring_len -= 1;
        entry
    }

    /// Tops the ring up from the section stack, prefetching each entry.
    /// Returns whether the ring holds anything.
    pub(crate) fn fill_prefetch(&mut self) -> bool {
        while self.ring_len < PREFETCH_RING {
            let Some(entry) = self.pop_entry() else {
                break;
            };
            prefetch(entry.obj.addr());
            let tail = (self.ring_head + self.ring_len) % PREFETCH_RING;
            self.ring[tail] = Some(entry);
            self.ring_len += 1;
        }
        self.ring_len > 0
    }

    /// Takes the oldest prefetched entry and refills the ring.
    #[inline]
    pub(crate) fn dequeue_prefetched(&mut self) -> Option<GrayEntry> {
        self.fill_prefetch();
        self.ring_pop()
    }
}

#[inline]
fn prefetch(addr: usize) {
    #[cfg(target_arch = "x86_64")]
    {
        use std::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};
        // SAFETY: prefetching is a hint and never faults.
        unsafe { _mm_prefetch::<_MM_HINT_T0>(addr as *const i8) };
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = addr;
}

/// Sections shared between workers.
#[derive(Debug, Default)]
pub struct SharedSections {
    sections: SegQueue<Box<GraySection>>,
    published: AtomicUsize,
}

impl SharedSections {
    /// An empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves `queue`'s newest section into the pool. Returns whether there
    /// was one.
    pub fn publish(&self, queue: &mut GrayQueue) -> bool {
        match queue.dequeue_section() {
            Some(section) => {
                self.push(section);
                true
            }
            None => false,
        }
    }

    /// Adds a section to the pool.
    pub fn push(&self, section: Box<GraySection>) {
        self.sections.push(section);
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    /// Moves one pooled section into `queue`. Returns whether there was one.
    pub fn steal_into(&self, queue: &mut GrayQueue) -> bool {
        match self.sections.pop() {
            Some(section) => {
                queue.enqueue_section(section);
                true
            }
            None => false,
        }
    }

    /// Whether no section is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Sections ever published.
    #[must_use]
    pub fn published(&self) -> usize {
        self.published.load(Ordering::Relaxed)
    }
}
