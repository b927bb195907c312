//! Tests for the block allocator.
//!
//! These tests drive allocation through the public heap API and check
//! block creation, kind segregation, admission control and the pinned
//! allocation retry.

#![cfg(feature = "test-util")]

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use marksweep::block::MS_BLOCK_FREE;
use marksweep::client::CappedGovernor;
use marksweep::test_util::{inline_heap, CountingTrigger, SimpleObjectModel, SimpleVTable};
use marksweep::{
    AllocError, Collaborators, Descriptor, InlinePool, IterateFlags, MajorConfig, MajorHeap,
    MS_BLOCK_SIZE,
};

fn config() -> MajorConfig {
    MajorConfig::new().with_concurrent_sweep(false)
}

#[test]
fn test_alloc_returns_distinct_aligned_objects() {
    let (heap, _model) = inline_heap(config());
    let vtable = SimpleVTable::leak(24, Descriptor::NoRefs);

    let mut seen = HashSet::new();
    for _ in 0..1000 {
        let obj = heap.alloc_object(vtable, 24, false).unwrap();
        assert_eq!(obj.addr() % 8, 0);
        assert!(heap.is_valid_object(obj.addr()));
        assert!(seen.insert(obj.addr()), "slot handed out twice");
    }
    heap.consistency_check();
}

#[test]
fn test_blocks_fill_before_growing() {
    let (heap, _model) = inline_heap(config());
    let vtable = SimpleVTable::leak(512, Descriptor::NoRefs);
    let index = heap.size_classes().index_for(512);
    let per_block = MS_BLOCK_FREE / heap.size_classes().size(index);

    for _ in 0..per_block {
        heap.alloc_object(vtable, 512, false).unwrap();
    }
    assert_eq!(heap.num_major_sections(), 1);

    heap.alloc_object(vtable, 512, false).unwrap();
    assert_eq!(heap.num_major_sections(), 2);

    let usage = heap.size_class_usage();
    assert_eq!(usage[index].blocks, 2);
    assert_eq!(usage[index].slots, 2 * per_block);
    assert_eq!(usage[index].free_slots, per_block - 1);
}

#[test]
fn test_free_slot_accounting_for_small_objects() {
    let (heap, _model) = inline_heap(config());
    let vtable = SimpleVTable::leak(24, Descriptor::NoRefs);
    let index = heap.size_classes().index_for(24);
    assert_eq!(heap.size_classes().size(index), 24);

    for _ in 0..1000 {
        let obj = heap.alloc_object(vtable, 24, false).unwrap();
        assert_eq!(heap.describe_pointer(obj.addr()).unwrap().obj_size, 24);
    }
    let usage = &heap.size_class_usage()[index];
    assert_eq!(usage.free_slots, (MS_BLOCK_FREE / 24) * usage.blocks - 1000);
    assert_eq!(usage.slots - usage.free_slots, 1000);
    heap.consistency_check();
}

#[test]
fn test_size_classes_share_no_blocks() {
    let (heap, _model) = inline_heap(config());
    let small = SimpleVTable::leak(16, Descriptor::NoRefs);
    let large = SimpleVTable::leak(2048, Descriptor::NoRefs);

    let a = heap.alloc_object(small, 16, false).unwrap();
    let b = heap.alloc_object(large, 2048, false).unwrap();
    assert_ne!(a.addr() / MS_BLOCK_SIZE, b.addr() / MS_BLOCK_SIZE);
    assert_eq!(heap.block_starts().len(), 2);
}

#[test]
fn test_governor_rejection() {
    let model = SimpleObjectModel::new(4096);
    let governor = Arc::new(CappedGovernor::new(MS_BLOCK_SIZE));
    let collab = Collaborators::new(model)
        .with_jobs(Arc::new(InlinePool))
        .with_governor(governor.clone());
    let heap = MajorHeap::new(config(), collab);
    let vtable = SimpleVTable::leak(4000, Descriptor::NoRefs);
    let per_block = MS_BLOCK_FREE / heap.size_classes().size(heap.size_classes().index_for(4000));

    for _ in 0..per_block {
        heap.alloc_object(vtable, 4000, false).unwrap();
    }
    assert_eq!(governor.used(), MS_BLOCK_SIZE);
    assert!(heap.alloc_object(vtable, 4000, false).is_none());
    assert!(matches!(
        heap.try_alloc_object(vtable, 4000, false),
        Err(AllocError::GovernorRejected { .. })
    ));
    assert_eq!(heap.num_major_sections(), 1);
}

#[test]
fn test_pinned_alloc_retries_once_after_collection() {
    let model = SimpleObjectModel::new(4096);
    let trigger = Arc::new(CountingTrigger::default());
    let collab = Collaborators::new(model)
        .with_jobs(Arc::new(InlinePool))
        .with_governor(Arc::new(CappedGovernor::new(0)))
        .with_trigger(trigger.clone());
    let heap = MajorHeap::new(config(), collab);
    let vtable = SimpleVTable::leak(64, Descriptor::NoRefs);

    let err = heap.alloc_small_pinned_object(vtable, 64, false).unwrap_err();
    assert!(matches!(err, AllocError::OutOfMemory { size: 64 }));
    assert_eq!(trigger.collections.load(Ordering::Relaxed), 1);
}

#[test]
fn test_pinned_alloc_too_large_skips_collection() {
    let model = SimpleObjectModel::new(4096);
    let trigger = Arc::new(CountingTrigger::default());
    let collab = Collaborators::new(model)
        .with_jobs(Arc::new(InlinePool))
        .with_trigger(trigger.clone());
    let heap = MajorHeap::new(config(), collab);
    let vtable = SimpleVTable::leak(64, Descriptor::NoRefs);

    let err = heap.alloc_small_pinned_object(vtable, 9000, false).unwrap_err();
    assert!(matches!(err, AllocError::TooLarge { size: 9000 }));
    assert_eq!(trigger.collections.load(Ordering::Relaxed), 0);
}

#[test]
fn test_degraded_allocations_are_counted() {
    let (heap, _model) = inline_heap(config());
    let vtable = SimpleVTable::leak(32, Descriptor::Bitmap(0b10));
    for _ in 0..3 {
        heap.alloc_degraded(vtable, 32, true).unwrap();
    }
    let stats = heap.stats();
    assert_eq!(stats.degraded_allocations, 3);
    assert_eq!(stats.blocks_allocated, 1);
    assert_eq!(stats.major_sections, 1);
}

#[test]
fn test_iterate_objects_by_kind() {
    let (heap, _model) = inline_heap(config());
    let vtable = SimpleVTable::leak(32, Descriptor::NoRefs);
    let plain: HashSet<_> = (0..10)
        .map(|_| heap.alloc_object(vtable, 32, false).unwrap().addr())
        .collect();
    let pinned: HashSet<_> = (0..4)
        .map(|_| heap.alloc_small_pinned_object(vtable, 32, false).unwrap().addr())
        .collect();

    let mut found = HashSet::new();
    heap.iterate_objects(IterateFlags::NON_PINNED, |obj, size| {
        assert_eq!(size, 32);
        found.insert(obj.addr());
    });
    assert_eq!(found, plain);

    found.clear();
    heap.iterate_objects(IterateFlags::PINNED, |obj, _| {
        found.insert(obj.addr());
    });
    assert_eq!(found, pinned);

    let mut all = 0;
    heap.iterate_objects(IterateFlags::ALL, |_, _| all += 1);
    assert_eq!(all, 14);
    assert_eq!(heap.get_used_size(), 14 * 32);
}

#[test]
fn test_concurrent_allocation() {
    let (heap, _model) = inline_heap(config());
    let vtable = SimpleVTable::leak(48, Descriptor::NoRefs);

    let threads: Vec<_> = (0..4)
        .map(|_| {
            let heap = Arc::clone(&heap);
            std::thread::spawn(move || {
                (0..2000)
                    .map(|_| heap.alloc_object(vtable, 48, false).unwrap().addr())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for thread in threads {
        for addr in thread.join().unwrap() {
            assert!(seen.insert(addr), "slot {addr:#x} handed out twice");
        }
    }
    assert_eq!(seen.len(), 8000);
    heap.consistency_check();
}

#[test]
fn test_dump_heap() {
    let (heap, _model) = inline_heap(config());
    let vtable = SimpleVTable::leak(64, Descriptor::NoRefs);
    heap.alloc_object(vtable, 64, false).unwrap();

    let mut out = Vec::new();
    heap.dump_heap(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.starts_with("major heap: 1 blocks"));
    assert!(text.lines().any(|line| line.trim_start().starts_with("64 ")));
}

#[test]
fn test_free_pinned_object() {
    let (heap, _model) = inline_heap(config());
    let vtable = SimpleVTable::leak(24, Descriptor::NoRefs);
    let obj = heap.alloc_small_pinned_object(vtable, 24, false).unwrap();
    assert!(heap.obj_is_from_pinned_alloc(obj));

    unsafe { heap.free_pinned_object(obj) };
    assert!(!heap.is_valid_object(obj.addr()));
    // The freed slot heads the free list again.
    let again = heap.alloc_small_pinned_object(vtable, 24, false).unwrap();
    assert_eq!(again, obj);
    heap.consistency_check();
}

#[test]
fn test_sections_grown_since_nursery_collection() {
    let (heap, _model) = inline_heap(config());
    let vtable = SimpleVTable::leak(4000, Descriptor::NoRefs);
    heap.alloc_object(vtable, 4000, false).unwrap();

    heap.start_nursery_collection();
    assert_eq!(heap.sections_grown_since_nursery_collection(), 0);
    let before = heap.num_major_sections();
    while heap.num_major_sections() < before + 2 {
        heap.alloc_object(vtable, 4000, false).unwrap();
    }
    heap.finish_nursery_collection();
    assert_eq!(heap.sections_grown_since_nursery_collection(), 2);
}

#[test]
fn test_live_block_ranges_cover_blocks_with_references() {
    let (heap, _model) = inline_heap(config());
    let with_refs = SimpleVTable::leak(32, Descriptor::Bitmap(0b10));
    let without = SimpleVTable::leak(32, Descriptor::NoRefs);
    let a = heap.alloc_object(with_refs, 32, true).unwrap();
    let b = heap.alloc_object(without, 32, false).unwrap();

    let mut ranges = Vec::new();
    heap.iterate_live_block_ranges(|start, size| ranges.push((start, size)));
    assert_eq!(ranges, vec![(a.addr() & !(MS_BLOCK_SIZE - 1), MS_BLOCK_SIZE)]);
    assert_ne!(b.addr() & !(MS_BLOCK_SIZE - 1), ranges[0].0);
}
