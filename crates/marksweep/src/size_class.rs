//! Block object size classes.
//!
//! Every 8-byte step from the minimum object size up to four times that
//! size gets its own class; above that, slot sizes grow geometrically by
//! `2^(1/3)` and are chosen so a block divides evenly into slots.

use crate::block::{ALLOC_ALIGN, MAX_SMALL_OBJ_SIZE, MIN_OBJECT_SIZE, MS_BLOCK_FREE};

/// Growth factor between consecutive large size classes.
const SIZE_FACTOR: f64 = 1.259_921_049_894_873_2; // 2^(1/3)

/// Sizes `< FAST_INDEX_LEN * 8` are looked up with one table read.
pub const FAST_INDEX_LEN: usize = 32;

/// The slot size table and its lookup accelerator.
#[derive(Debug, Clone)]
pub struct SizeClasses {
    sizes: Box<[usize]>,
    fast_index: [u8; FAST_INDEX_LEN],
}

impl SizeClasses {
    /// Computes the size class table.
    #[must_use]
    pub fn new() -> Self {
        let sizes = compute_sizes().into_boxed_slice();
        let mut fast_index = [0u8; FAST_INDEX_LEN];
        for (i, slot) in fast_index.iter_mut().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            {
                *slot = slow_index(&sizes, i * 8) as u8;
            }
        }
        Self { sizes, fast_index }
    }

    /// Number of size classes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    /// Always false; there is at least one class.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    /// Slot size of class `index`.
    #[must_use]
    pub fn size(&self, index: usize) -> usize {
        self.sizes[index]
    }

    /// All slot sizes in increasing order.
    #[must_use]
    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    /// Index of the smallest class that fits `size` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `size` exceeds [`MAX_SMALL_OBJ_SIZE`].
    #[inline]
    #[must_use]
    pub fn index_for(&self, size: usize) -> usize {
        assert!(size <= MAX_SMALL_OBJ_SIZE, "{size} is not a small object size");
        let fast = (size + 7) >> 3;
        if fast < FAST_INDEX_LEN {
            usize::from(self.fast_index[fast])
        } else {
            slow_index(&self.sizes, size)
        }
    }
}

impl Default for SizeClasses {
    fn default() -> Self {
        Self::new()
    }
}

fn slow_index(sizes: &[usize], size: usize) -> usize {
    sizes
        .iter()
        .position(|&s| s >= size)
        .unwrap_or_else(|| crate::gc_fatal!("no size class for {size} bytes"))
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn compute_sizes() -> Vec<usize> {
    let mut sizes: Vec<usize> = (MIN_OBJECT_SIZE..=4 * MIN_OBJECT_SIZE)
        .step_by(ALLOC_ALIGN)
        .collect();
    let mut last = *sizes.last().unwrap_or(&MIN_OBJECT_SIZE);
    let mut target = last as f64;

    while last < MAX_SMALL_OBJ_SIZE {
        let target_count = (MS_BLOCK_FREE as f64 / target).floor() as usize;
        let size = ((MS_BLOCK_FREE / target_count) & !(ALLOC_ALIGN - 1)).min(MAX_SMALL_OBJ_SIZE);
        if size != last {
            sizes.push(size);
            last = size;
        }
        target *= SIZE_FACTOR;
    }
    sizes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes_are_sorted_and_aligned() {
        let classes = SizeClasses::new();
        assert!(classes.len() > 20 && classes.len() < 50);
        assert_eq!(classes.size(0), MIN_OBJECT_SIZE);
        assert_eq!(*classes.sizes().last().unwrap(), MAX_SMALL_OBJ_SIZE);
        assert!(classes.sizes().windows(2).all(|w| w[0] < w[1]));
        assert!(classes.sizes().iter().all(|s| s % ALLOC_ALIGN == 0));
    }

    #[test]
    fn test_small_sizes_are_dense() {
        let classes = SizeClasses::new();
        for (i, size) in (MIN_OBJECT_SIZE..=4 * MIN_OBJECT_SIZE).step_by(8).enumerate() {
            assert_eq!(classes.size(i), size);
        }
    }

    #[test]
    fn test_fast_lookup_matches_linear_scan() {
        let classes = SizeClasses::new();
        for size in 0..=MAX_SMALL_OBJ_SIZE {
            assert_eq!(classes.index_for(size), slow_index(classes.sizes(), size));
        }
    }

    #[test]
    fn test_index_fits_size() {
        let classes = SizeClasses::new();
        for size in [1, 16, 17, 24, 255, 256, 257, 1000, 7999, 8000] {
            let index = classes.index_for(size);
            assert!(classes.size(index) >= size);
            if index > 0 {
                assert!(classes.size(index - 1) < size);
            }
        }
    }

    #[test]
    #[should_panic(expected = "not a small object size")]
    fn test_large_size_panics() {
        let _ = SizeClasses::new().index_for(MAX_SMALL_OBJ_SIZE + 1);
    }
}
