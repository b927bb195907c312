//! Collector tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! spans and events for major collections and sweeps.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};
    use tracing::{span, Level};

    /// Phases of a major collection as seen by this collector.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum GcPhase {
        /// Blocks move to MARKING, evacuation candidates are chosen.
        Start,
        /// Blocks are checked and swept.
        Sweep,
        /// Dirty cards are rescanned.
        CardScan,
    }

    /// Identifier correlating the events of one collection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

    /// Next collection id.
    pub fn next_gc_id() -> GcId {
        GcId(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Span covering the start of a major collection.
    pub fn trace_major_collection(gc_id: GcId, concurrent: bool) -> span::EnteredSpan {
        span!(
            Level::DEBUG,
            "major_collection",
            gc_id = gc_id.0,
            concurrent
        )
        .entered()
    }

    /// Span for one phase.
    pub fn trace_phase(phase: GcPhase) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_phase", phase = ?phase).entered()
    }

    /// Logs the start of a phase.
    pub fn log_phase_start(phase: GcPhase, major_sections: usize) {
        tracing::debug!(phase = ?phase, major_sections, "phase_start");
    }

    /// Logs the end of a sweep.
    pub fn log_sweep_end(sections_before: usize, sections_freed: usize, evacuating: usize) {
        tracing::debug!(
            sections_before,
            sections_freed,
            evacuating_size_classes = evacuating,
            "sweep_end"
        );
    }
}

#[cfg(not(feature = "tracing"))]
pub mod internal {
    /// Stub type when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    /// Stub function when tracing is disabled.
    pub const fn next_gc_id() -> GcId {
        GcId(0)
    }
}

pub use internal::GcId;
