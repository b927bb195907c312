//! Collection: tracing, card scanning and sweeping.
//!
//! A major collection runs as
//!
//! 1. [`MajorHeap::start_major_collection`](crate::MajorHeap::start_major_collection)
//!    in a pause: finish the previous sweep, pick evacuation candidates,
//!    move every block to MARKING.
//! 2. Marking through a [`Tracer`] and a [`GrayQueue`], in the pause or
//!    concurrently. Concurrent marking ends with a pause that rescans the
//!    mod-union card tables.
//! 3. [`MajorHeap::sweep`](crate::MajorHeap::sweep), which ends marking and
//!    checks and sweeps every block, in the pause or on the job pool.
//! 4. [`MajorHeap::finish_major_collection`](crate::MajorHeap::finish_major_collection)
//!    for bookkeeping.

pub mod cardtable;
pub mod gray;
pub mod sweep;
pub mod trace;

pub use cardtable::CardSource;
pub use gray::{DrainResult, GrayEntry, GrayQueue, GraySection, SharedSections, SECTION_SIZE};
pub use sweep::SweepState;
pub use trace::{MarkMode, Tracer};

/// Whether, and how, a major collection is marking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CollectionPhase {
    /// No collection is marking.
    #[default]
    Idle = 0,
    /// Marking inside a pause.
    Major = 1,
    /// Marking alongside the mutator.
    Concurrent = 2,
}

impl CollectionPhase {
    /// Decodes a raw phase byte; unknown values read as `Idle`.
    #[must_use]
    pub const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Major,
            2 => Self::Concurrent,
            _ => Self::Idle,
        }
    }
}
