//! Collector metrics and statistics.

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Kind of the most recent major collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum CollectionKind {
    /// No collection has run yet.
    #[default]
    None = 0,
    /// Marking ran entirely inside a pause.
    Major = 1,
    /// Marking ran alongside the mutator, finished by a pause.
    ConcurrentMajor = 2,
}

impl CollectionKind {
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Major,
            2 => Self::ConcurrentMajor,
            _ => Self::None,
        }
    }
}

/// A snapshot of [`HeapCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MajorStats {
    /// Blocks currently in the heap.
    pub major_sections: usize,
    /// Blocks taken from the empty pool since the heap was created.
    pub blocks_allocated: usize,
    /// Blocks returned to the empty pool since the heap was created.
    pub blocks_freed: usize,
    /// Blocks swept on demand by an allocator or card scanner.
    pub blocks_lazy_swept: usize,
    /// Blocks swept at collection start because lazy sweeping never got to them.
    pub blocks_pre_swept: usize,
    /// Objects marked by the tracer.
    pub objects_marked: usize,
    /// Objects copied by the tracer (nursery promotion or evacuation).
    pub objects_copied: usize,
    /// Objects that could not be copied and were pinned instead.
    pub objects_pinned_on_copy_failure: usize,
    /// Dirty cards scanned.
    pub cards_scanned: usize,
    /// Allocations served by the degraded path.
    pub degraded_allocations: usize,
    /// Major collections started.
    pub collections: usize,
    /// Sweeps completed.
    pub sweeps: usize,
    /// Kind of the last collection.
    pub last_collection: CollectionKind,
    /// Wall time of the last completed sweep job.
    pub last_sweep_duration: Duration,
}

/// Cumulative, lock-free counters owned by a heap.
#[derive(Debug, Default)]
pub struct HeapCounters {
    pub(crate) blocks_allocated: AtomicUsize,
    pub(crate) blocks_freed: AtomicUsize,
    pub(crate) blocks_lazy_swept: AtomicUsize,
    pub(crate) blocks_pre_swept: AtomicUsize,
    pub(crate) objects_marked: AtomicUsize,
    pub(crate) objects_copied: AtomicUsize,
    pub(crate) objects_pinned_on_copy_failure: AtomicUsize,
    pub(crate) cards_scanned: AtomicUsize,
    pub(crate) degraded_allocations: AtomicUsize,
    pub(crate) collections: AtomicUsize,
    pub(crate) sweeps: AtomicUsize,
    pub(crate) last_collection: AtomicU8,
    pub(crate) last_sweep_ns: AtomicU64,
}

impl HeapCounters {
    /// All counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add(counter: &AtomicUsize, n: usize) {
        if n != 0 {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_collection(&self, kind: CollectionKind) {
        Self::bump(&self.collections);
        self.last_collection.store(kind as u8, Ordering::Relaxed);
    }

    pub(crate) fn record_sweep(&self, duration: Duration) {
        Self::bump(&self.sweeps);
        #[allow(clippy::cast_possible_truncation)]
        self.last_sweep_ns
            .store(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Takes a snapshot; `major_sections` is supplied by the heap.
    #[must_use]
    pub fn snapshot(&self, major_sections: usize) -> MajorStats {
        let load = |c: &AtomicUsize| c.load(Ordering::Relaxed);
        MajorStats {
            major_sections,
            blocks_allocated: load(&self.blocks_allocated),
            blocks_freed: load(&self.blocks_freed),
            blocks_lazy_swept: load(&self.blocks_lazy_swept),
            blocks_pre_swept: load(&self.blocks_pre_swept),
            objects_marked: load(&self.objects_marked),
            objects_copied: load(&self.objects_copied),
            objects_pinned_on_copy_failure: load(&self.objects_pinned_on_copy_failure),
            cards_scanned: load(&self.cards_scanned),
            degraded_allocations: load(&self.degraded_allocations),
            collections: load(&self.collections),
            sweeps: load(&self.sweeps),
            last_collection: CollectionKind::from_u8(self.last_collection.load(Ordering::Relaxed)),
            last_sweep_duration: Duration::from_nanos(self.last_sweep_ns.load(Ordering::Relaxed)),
        }
    }
}

/// Times the phases of one sweep.
///
/// ```
/// use marksweep::metrics::PhaseTimer;
///
/// let mut timer = PhaseTimer::new();
/// timer.start();
/// // ... check blocks ...
/// timer.end_check();
/// timer.start();
/// // ... compact the block array ...
/// timer.end_compact();
/// assert!(timer.total() >= timer.check);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTimer {
    /// Time spent checking blocks.
    pub check: Duration,
    /// Time spent compacting the block array and computing evacuation.
    pub compact: Duration,
    current_start: Option<Instant>,
}

impl PhaseTimer {
    /// All durations zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            check: Duration::ZERO,
            compact: Duration::ZERO,
            current_start: None,
        }
    }

    /// Starts timing a phase.
    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    /// Ends the check phase.
    pub fn end_check(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.check = start.elapsed();
        }
    }

    /// Ends the compact phase.
    pub fn end_compact(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.compact = start.elapsed();
        }
    }

    /// Sum of both phases.
    #[must_use]
    pub fn total(&self) -> Duration {
        self.check + self.compact
    }
}
