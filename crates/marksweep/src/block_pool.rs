//! The empty-block pool.
//!
//! Blocks are reserved from the OS in batches of `block_alloc_batch`
//! (halving the batch on failure) through `sys_alloc`, which hands back
//! block-aligned regions. Unused blocks sit in a lock-free queue until an
//! allocator needs one; freed blocks are zeroed and pushed back.

use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use sys_alloc::{Mmap, MmapOptions};

use crate::block::MS_BLOCK_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EmptyBlock(NonNull<u8>);

// Empty blocks are unowned memory; whoever pops one owns it.
unsafe impl Send for EmptyBlock {}

/// Pool of zeroed, block-aligned memory.
#[derive(Debug)]
pub struct EmptyBlockPool {
    free: SegQueue<EmptyBlock>,
    num_empty: AtomicUsize,
    regions: Mutex<Vec<Mmap>>,
    batch: usize,
}

impl EmptyBlockPool {
    /// An empty pool that reserves `batch` blocks at a time.
    #[must_use]
    pub fn new(batch: usize) -> Self {
        Self {
            free: SegQueue::new(),
            num_empty: AtomicUsize::new(0),
            regions: Mutex::new(Vec::new()),
            batch: batch.max(1),
        }
    }

    /// Takes a zeroed block, reserving a new batch if the pool is empty.
    ///
    /// # Errors
    ///
    /// Returns the OS error once even a single-block reservation fails.
    pub fn get(&self) -> io::Result<NonNull<u8>> {
        loop {
            if let Some(EmptyBlock(block)) = self.free.pop() {
                self.num_empty.fetch_sub(1, Ordering::AcqRel);
                return Ok(block);
            }
            self.reserve_batch()?;
        }
    }

    /// Returns a block to the pool, zeroing it first.
    ///
    /// # Safety
    ///
    /// `block` must have come from [`EmptyBlockPool::get`] on this pool and
    /// must no longer be referenced.
    pub unsafe fn put(&self, block: NonNull<u8>) {
        // SAFETY: the caller gives up the whole block.
        unsafe { std::ptr::write_bytes(block.as_ptr(), 0, MS_BLOCK_SIZE) };
        // Count before publishing: whoever pops the block subtracts it.
        self.num_empty.fetch_add(1, Ordering::AcqRel);
        self.free.push(EmptyBlock(block));
    }

    /// Number of blocks waiting in the pool.
    #[must_use]
    pub fn len(&self) -> usize {
        self.num_empty.load(Ordering::Acquire)
    }

    /// Whether the pool holds no block.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Blocks currently reserved from the OS, used or not.
    #[must_use]
    pub fn reserved_blocks(&self) -> usize {
        self.regions.lock().iter().map(|r| r.len() / MS_BLOCK_SIZE).sum()
    }

    /// Whether `addr` lies in memory owned by this pool.
    #[must_use]
    pub fn owns(&self, addr: usize) -> bool {
        self.regions.lock().iter().any(|r| r.contains(addr))
    }

    fn reserve_batch(&self) -> io::Result<()> {
        let mut regions = self.regions.lock();
        // Someone else may have refilled the pool while we waited.
        if !self.free.is_empty() {
            return Ok(());
        }

        let mut count = self.batch;
        let region = loop {
            match MmapOptions::new()
                .len(count * MS_BLOCK_SIZE)
                .align(MS_BLOCK_SIZE)
                .map_anon()
            {
                Ok(region) => break region,
                Err(err) if count == 1 => return Err(err),
                Err(_) => count /= 2,
            }
        };

        let start = region.ptr() as usize;
        self.num_empty.fetch_add(count, Ordering::AcqRel);
        for i in 0..count {
            let block = (start + i * MS_BLOCK_SIZE) as *mut u8;
            // SAFETY: mappings are never null.
            self.free
                .push(EmptyBlock(unsafe { NonNull::new_unchecked(block) }));
        }
        regions.push(region);

        #[cfg(feature = "tracing")]
        tracing::debug!(blocks = count, "reserved block batch");

        Ok(())
    }

    /// Unmaps whole OS batches whose blocks are all in the pool, as long as
    /// at least `keep` empty blocks remain pooled. Returns the number of
    /// blocks given back.
    ///
    /// Safe to run alongside [`EmptyBlockPool::get`] and
    /// [`EmptyBlockPool::put`]: a block popped or pushed while the queue is
    /// drained keeps its region mapped, and refills wait on the regions
    /// lock.
    pub fn release_empty_regions(&self, keep: usize) -> usize {
        let mut regions = self.regions.lock();

        // Drain whatever is queued now. Blocks pushed after this stay in
        // the queue and keep their region alive.
        let mut empty = Vec::with_capacity(self.len());
        while let Some(block) = self.free.pop() {
            empty.push(block);
        }
        empty.sort_unstable_by_key(|b| b.0.as_ptr() as usize);

        let mut remaining = empty.len();
        let mut released = 0;
        regions.retain(|region| {
            let blocks = region.len() / MS_BLOCK_SIZE;
            if remaining < keep + blocks {
                return true;
            }
            let pooled = empty
                .iter()
                .filter(|b| region.contains(b.0.as_ptr() as usize))
                .count();
            if pooled < blocks {
                return true;
            }
            empty.retain(|b| !region.contains(b.0.as_ptr() as usize));
            remaining -= blocks;
            released += blocks;
            false
        });

        for block in empty {
            self.free.push(block);
        }
        // Only the unmapped blocks leave the count; concurrent gets and
        // puts account for themselves.
        self.num_empty.fetch_sub(released, Ordering::AcqRel);
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_reserves_aligned_batch() {
        let pool = EmptyBlockPool::new(4);
        let block = pool.get().unwrap();
        assert_eq!(block.as_ptr() as usize % MS_BLOCK_SIZE, 0);
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.reserved_blocks(), 4);
        assert!(pool.owns(block.as_ptr() as usize + 100));
    }

    #[test]
    fn test_put_zeroes_and_recycles() {
        let pool = EmptyBlockPool::new(1);
        let block = pool.get().unwrap();
        unsafe {
            block.as_ptr().add(64).write(0xAB);
            pool.put(block);
        }
        assert_eq!(pool.len(), 1);
        let again = pool.get().unwrap();
        assert_eq!(again, block);
        assert_eq!(unsafe { again.as_ptr().add(64).read() }, 0);
    }

    #[test]
    fn test_release_keeps_allowance() {
        let pool = EmptyBlockPool::new(2);
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        let c = pool.get().unwrap();
        assert_eq!(pool.reserved_blocks(), 4);

        unsafe {
            pool.put(a);
            pool.put(b);
        }
        // One region is fully empty, the other still holds `c`.
        assert_eq!(pool.release_empty_regions(0), 2);
        assert_eq!(pool.reserved_blocks(), 2);
        assert_eq!(pool.len(), 1);

        unsafe { pool.put(c) };
        assert_eq!(pool.release_empty_regions(2), 0);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_release_races_with_get_and_put() {
        let pool = EmptyBlockPool::new(4);
        let rounds = 200;

        std::thread::scope(|scope| {
            for _ in 0..2 {
                scope.spawn(|| {
                    for _ in 0..rounds {
                        let block = pool.get().unwrap();
                        unsafe {
                            block.as_ptr().write(0x5A);
                            pool.put(block);
                        }
                    }
                });
            }
            scope.spawn(|| {
                for _ in 0..rounds {
                    pool.release_empty_regions(0);
                }
            });
        });

        // Every block is back: the count matches the queue and the
        // reserved regions.
        let mut drained = Vec::new();
        while let Some(block) = pool.free.pop() {
            drained.push(block);
        }
        assert_eq!(pool.len(), drained.len());
        assert_eq!(pool.reserved_blocks(), drained.len());
        for block in &drained {
            assert!(pool.owns(block.0.as_ptr() as usize));
        }
    }
}
