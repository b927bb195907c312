//! Error types and fatal assertions.
//!
//! Only resource exhaustion is recoverable. Anything that indicates a
//! corrupted heap (illegal state transition, double free, broken free list)
//! goes through [`gc_fatal!`] and never returns.

use std::io;

use thiserror::Error;

/// Failure to obtain memory for an object.
#[derive(Debug, Error)]
pub enum AllocError {
    /// The memory governor refused to let the heap grow.
    #[error("memory governor refused {size} bytes of block memory")]
    GovernorRejected {
        /// Bytes requested from the governor.
        size: usize,
    },
    /// Allocation failed even after a forced collection.
    #[error("out of memory allocating a {size}-byte object")]
    OutOfMemory {
        /// Object size.
        size: usize,
    },
    /// The object does not fit in a block slot.
    #[error("object of {size} bytes exceeds the small object limit")]
    TooLarge {
        /// Object size.
        size: usize,
    },
    /// The OS refused to map more block memory.
    #[error("failed to reserve block memory")]
    Os(#[from] io::Error),
}

/// Reports a corrupted heap and panics.
///
/// The message is logged at error level first when tracing is enabled.
macro_rules! gc_fatal {
    ($($arg:tt)*) => {{
        #[cfg(feature = "tracing")]
        ::tracing::error!($($arg)*);
        panic!($($arg)*)
    }};
}

/// Asserts a heap invariant, reporting violations through [`gc_fatal!`].
macro_rules! gc_assert {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            $crate::gc_fatal!($($arg)*);
        }
    };
}

pub(crate) use gc_assert;
pub(crate) use gc_fatal;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_error_messages() {
        let err = AllocError::GovernorRejected { size: 16384 };
        assert_eq!(
            err.to_string(),
            "memory governor refused 16384 bytes of block memory"
        );
        let err = AllocError::TooLarge { size: 9000 };
        assert!(err.to_string().contains("9000"));
    }

    #[test]
    #[should_panic(expected = "broken invariant 7")]
    fn test_gc_assert_panics() {
        gc_assert!(1 + 1 == 3, "broken invariant {}", 7);
    }
}
