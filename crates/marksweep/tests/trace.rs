//! Tests for the trace engine.
//!
//! These tests verify copying of nursery objects into the major heap,
//! forwarding, pinning on copy failure and the concurrent variants'
//! refusal to move anything.

#![cfg(feature = "test-util")]

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use marksweep::client::CappedGovernor;
use marksweep::test_util::{
    inline_heap, read_ref, root, root_target, write_ref, SimpleObjectModel, SimpleVTable,
};
use marksweep::{
    Collaborators, Descriptor, DrainResult, InlinePool, MajorConfig, MajorHeap, MarkMode,
    ObjectModel, MS_BLOCK_SIZE,
};

fn config() -> MajorConfig {
    MajorConfig::new().with_concurrent_sweep(false)
}

#[test]
fn test_nursery_objects_are_copied() {
    let (heap, model) = inline_heap(config());
    let node = SimpleVTable::leak(32, Descriptor::Bitmap(0b110));
    let a = model.alloc_nursery(node);
    let b = model.alloc_nursery(node);
    write_ref(a, 1, Some(b));
    write_ref(a, 2, Some(b));

    heap.start_major_collection(false);
    let mut queue = heap.new_gray_queue();
    let tracer = heap.tracer(MarkMode::Serial);
    let slot = root(a);
    tracer.copy_or_mark(&slot, &mut queue);
    tracer.drain(&mut queue);

    let a2 = root_target(&slot).unwrap();
    assert_ne!(a2, a);
    assert!(!model.in_nursery(a2));
    assert_eq!(model.forwarded(a), Some(a2));
    assert!(heap.is_object_live(a2));

    // Both fields now point at the single copy of `b`.
    let b2 = read_ref(a2, 1).unwrap();
    assert!(!model.in_nursery(b2));
    assert_eq!(read_ref(a2, 2), Some(b2));
    assert_eq!(model.forwarded(b), Some(b2));
    assert_eq!(heap.stats().objects_copied, 2);

    heap.sweep();
    heap.finish_major_collection();
    assert!(heap.is_valid_object(a2.addr()));
    assert!(heap.is_valid_object(b2.addr()));
}

#[test]
fn test_pinned_nursery_objects_stay() {
    let (heap, model) = inline_heap(config());
    let leaf = SimpleVTable::leak(16, Descriptor::NoRefs);
    let obj = model.alloc_nursery(leaf);
    model.pin(obj);

    heap.start_major_collection(false);
    let mut queue = heap.new_gray_queue();
    let slot = root(obj);
    heap.tracer(MarkMode::Serial).copy_or_mark(&slot, &mut queue);
    assert_eq!(root_target(&slot), Some(obj));
    assert!(queue.is_empty());
    heap.sweep();
    heap.finish_major_collection();
}

#[test]
fn test_copy_failure_pins_the_object() {
    let model = SimpleObjectModel::new(4096);
    let collab = Collaborators::new(model.clone())
        .with_jobs(Arc::new(InlinePool))
        .with_governor(Arc::new(CappedGovernor::new(0)));
    let heap = MajorHeap::new(config(), collab);
    let node = SimpleVTable::leak(24, Descriptor::Bitmap(0b10));
    let a = model.alloc_nursery(node);
    let b = model.alloc_nursery(node);
    write_ref(a, 1, Some(b));

    heap.start_major_collection(false);
    let mut queue = heap.new_gray_queue();
    let tracer = heap.tracer(MarkMode::Serial);
    let slot = root(a);
    tracer.copy_or_mark(&slot, &mut queue);
    // `a` is pinned in place but still scanned.
    assert_eq!(queue.len(), 1);
    tracer.drain(&mut queue);

    assert_eq!(root_target(&slot), Some(a));
    assert!(model.is_pinned(a));
    assert!(model.is_pinned(b));
    assert_eq!(read_ref(a, 1), Some(b));
    assert_eq!(heap.stats().objects_pinned_on_copy_failure, 2);
    heap.sweep();
    heap.finish_major_collection();
}

#[test]
fn test_concurrent_marking_leaves_nursery_alone() {
    let (heap, model) = inline_heap(config());
    let node = SimpleVTable::leak(24, Descriptor::Bitmap(0b10));
    let young = model.alloc_nursery(node);
    let old = heap.alloc_object(node, 24, true).unwrap();
    write_ref(old, 1, Some(young));

    heap.start_major_collection(true);
    let mut queue = heap.new_gray_queue();
    let tracer = heap.tracer(MarkMode::ConcurrentStart);
    let slot = root(old);
    tracer.copy_or_mark(&slot, &mut queue);
    tracer.drain(&mut queue);

    assert!(heap.is_object_live(old));
    assert_eq!(read_ref(old, 1), Some(young));
    assert_eq!(model.forwarded(young), None);

    // The finishing pause copies it.
    let finish = heap.tracer(MarkMode::ConcurrentFinish);
    finish.scan_object(old, &mut queue);
    finish.drain(&mut queue);
    let copied = read_ref(old, 1).unwrap();
    assert!(!model.in_nursery(copied));
    assert!(heap.is_object_live(copied));

    heap.sweep();
    heap.finish_major_collection();
}

#[test]
fn test_complex_descriptors() {
    let (heap, _model) = inline_heap(config());
    let leaf = SimpleVTable::leak(16, Descriptor::NoRefs);
    let array = SimpleVTable::leak_complex(64, Descriptor::Complex, &[2, 5, 7]);
    let holder = heap.alloc_object(array, 64, true).unwrap();
    let leaves: Vec<_> = (0..4)
        .map(|_| heap.alloc_object(leaf, 16, false).unwrap())
        .collect();
    write_ref(holder, 2, Some(leaves[0]));
    write_ref(holder, 5, Some(leaves[1]));
    write_ref(holder, 7, Some(leaves[2]));
    // Word 3 is not a reference field; its target dies.
    write_ref(holder, 3, Some(leaves[3]));

    heap.start_major_collection(false);
    let mut queue = heap.new_gray_queue();
    let tracer = heap.tracer(MarkMode::Serial);
    tracer.copy_or_mark(&root(holder), &mut queue);
    tracer.drain(&mut queue);

    for leaf in &leaves[..3] {
        assert!(heap.is_object_live(*leaf));
    }
    assert!(!heap.is_object_live(leaves[3]));
    heap.sweep();
    heap.finish_major_collection();
}

#[test]
fn test_drain_reports_empty_queue() {
    let (heap, _model) = inline_heap(config().with_prefetch(true));
    let leaf = SimpleVTable::leak(16, Descriptor::Bitmap(0b10));
    let obj = heap.alloc_object(leaf, 16, true).unwrap();

    heap.start_major_collection(false);
    let mut queue = heap.new_gray_queue();
    assert!(queue.prefetch_enabled());
    let tracer = heap.tracer(MarkMode::Serial);
    assert_eq!(tracer.drain(&mut queue), DrainResult::NeedsRefill);

    tracer.copy_or_mark(&root(obj), &mut queue);
    assert_eq!(tracer.drain(&mut queue), DrainResult::Drained);
    heap.sweep();
    heap.finish_major_collection();
}

#[test]
fn test_deep_list_marking() {
    let (heap, _model) = inline_heap(config());
    let node = SimpleVTable::leak(16, Descriptor::Bitmap(0b10));
    let mut head = None;
    for _ in 0..5000 {
        let obj = heap.alloc_object(node, 16, true).unwrap();
        write_ref(obj, 1, head);
        head = Some(obj);
    }
    let slots = [root(head.unwrap())];

    heap.start_major_collection(false);
    let mut queue = heap.new_gray_queue();
    let tracer = heap.tracer(MarkMode::Serial);
    tracer.copy_or_mark(&slots[0], &mut queue);
    tracer.drain(&mut queue);
    assert_eq!(heap.stats().objects_marked, 5000);
    heap.sweep();
    heap.finish_major_collection();

    let mut count = 0;
    let mut cursor = root_target(&slots[0]);
    while let Some(obj) = cursor {
        assert!(heap.is_valid_object(obj.addr()));
        count += 1;
        cursor = read_ref(obj, 1);
    }
    assert_eq!(count, 5000);
    assert!(heap.num_major_sections() * MS_BLOCK_SIZE >= 5000 * 16);
}

#[test]
fn test_parallel_workers_share_sections() {
    use marksweep::SharedSections;

    let (heap, _model) = inline_heap(config());
    let node = SimpleVTable::leak(24, Descriptor::Bitmap(0b10));
    let objs: Vec<_> = (0..2000)
        .map(|_| heap.alloc_object(node, 24, true).unwrap())
        .collect();
    let roots: Vec<AtomicUsize> = objs.iter().map(|&o| root(o)).collect();

    heap.start_major_collection(false);
    let shared = SharedSections::new();
    let mut queue = heap.new_gray_queue();
    let tracer = heap.tracer(MarkMode::Serial);
    for slot in &roots {
        tracer.copy_or_mark(slot, &mut queue);
    }
    while shared.publish(&mut queue) {}
    assert!(shared.published() >= 2000 / marksweep::gc::SECTION_SIZE);

    std::thread::scope(|scope| {
        for _ in 0..3 {
            scope.spawn(|| {
                let mut local = heap.new_gray_queue();
                let tracer = heap.tracer(MarkMode::Serial);
                while shared.steal_into(&mut local) {
                    tracer.drain(&mut local);
                }
            });
        }
    });
    assert!(shared.is_empty());
    assert_eq!(heap.stats().objects_marked, 2000);
    for obj in &objs {
        assert!(heap.is_object_live(*obj), "{obj:?} was never scanned");
    }
    heap.sweep();
    heap.finish_major_collection();
    assert_eq!(heap.get_used_size(), 2000 * 24);
}
