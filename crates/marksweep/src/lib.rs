//! A concurrent mark-sweep major heap.
//!
//! `marksweep` is the old generation of a generational collector. Objects
//! promoted out of a nursery (or allocated directly when they must never
//! move) live in 16 KiB **blocks**, each carved into equally sized slots of
//! one size class. Free slots are threaded into per-block free lists, and
//! blocks with free slots hang off lock-free per-size-class lists.
//!
//! # Collection
//!
//! A major collection marks through a [`GrayQueue`] with a [`Tracer`]. The
//! trace can run in a pause, or concurrently with the mutator; in the latter
//! case a write barrier dirties the block's cards and the finishing pause
//! rescans them through the per-block mod-union tables. Sparse size classes
//! are **evacuated**: their live objects are copied into fresh blocks so
//! the old ones can be freed.
//!
//! Sweeping checks every block, frees the empty ones and rebuilds the free
//! lists of the rest. It runs in the pause or on a background job, and with
//! lazy sweeping the per-block work is deferred until a block is needed.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use marksweep::{Collaborators, MajorConfig, MajorHeap, MarkMode};
//!
//! let heap = MajorHeap::new(MajorConfig::default(), Collaborators::new(model));
//! let obj = heap.alloc_object(vtable, 64, true).unwrap();
//!
//! heap.start_major_collection(false);
//! let mut queue = heap.new_gray_queue();
//! let tracer = heap.tracer(MarkMode::Serial);
//! for root in &roots {
//!     tracer.copy_or_mark(root, &mut queue);
//! }
//! tracer.drain(&mut queue);
//! heap.sweep();
//! heap.finish_major_collection();
//! ```
//!
//! The runtime around the heap (object layout, the nursery, memory limits,
//! background threads) is plugged in through the traits in [`client`].

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod block;
mod block_pool;
pub mod client;
pub mod config;
pub mod error;
pub mod gc;
pub mod heap;
pub mod job;
pub mod metrics;
pub mod size_class;
mod tracing;

pub(crate) use error::{gc_assert, gc_fatal};

pub use block::{BlockFlags, BlockState, MAX_SMALL_OBJ_SIZE, MS_BLOCK_SIZE};
pub use client::{
    Collaborators, CollectionTrigger, Descriptor, GcRecorder, LargeObjectSpace, MemoryGovernor,
    ObjPtr, ObjectModel, VTablePtr,
};
pub use config::{ConfigError, MajorConfig};
pub use error::AllocError;
pub use gc::{
    CardSource, CollectionPhase, DrainResult, GrayQueue, MarkMode, SharedSections, SweepState,
    Tracer,
};
pub use heap::{IterateFlags, MajorHeap, PointerInfo, SizeClassUsage};
pub use job::{InlinePool, JobHandle, JobPool, ThreadPool};
pub use metrics::{CollectionKind, MajorStats};
pub use crate::tracing::GcId;

#[cfg(any(test, feature = "test-util"))]
#[doc(hidden)]
pub mod test_util;
