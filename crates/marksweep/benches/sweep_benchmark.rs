//! Benchmark: eager, lazy and concurrent sweeping
//!
//! Measures allocation throughput and the pause a major collection takes
//! under each sweep configuration.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use marksweep::test_util::{root, root_target, write_ref, SimpleObjectModel, SimpleVTable};
use marksweep::{
    Collaborators, Descriptor, InlinePool, MajorConfig, MajorHeap, MarkMode, ObjPtr, ThreadPool,
    VTablePtr,
};
use std::hint::black_box;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn new_heap(config: MajorConfig) -> Arc<MajorHeap> {
    let model = SimpleObjectModel::new(4096);
    let collab = if config.concurrent_sweep {
        Collaborators::new(model).with_jobs(Arc::new(ThreadPool::new(1)))
    } else {
        Collaborators::new(model).with_jobs(Arc::new(InlinePool))
    };
    MajorHeap::new(config, collab)
}

/// Allocates `count` nodes, keeping every `keep`-th one linked from `head`.
fn populate(heap: &MajorHeap, node: VTablePtr, count: usize, keep: usize) -> Option<ObjPtr> {
    let mut head = None;
    for i in 0..count {
        let obj = heap.alloc_object(node, 32, true).unwrap();
        if i % keep == 0 {
            write_ref(obj, 1, head);
            head = Some(obj);
        }
    }
    head
}

/// One stop-the-world collection; returns where `head` lives afterwards.
fn collect(heap: &Arc<MajorHeap>, head: Option<ObjPtr>) -> Option<ObjPtr> {
    heap.start_major_collection(false);
    let slot = head.map(root);
    if let Some(slot) = &slot {
        let mut queue = heap.new_gray_queue();
        let tracer = heap.tracer(MarkMode::Serial);
        tracer.copy_or_mark(slot, &mut queue);
        tracer.drain(&mut queue);
    }
    heap.sweep();
    heap.finish_major_collection();
    slot.as_ref().and_then(root_target)
}

fn bench_alloc_throughput(c: &mut Criterion) {
    let heap = new_heap(MajorConfig::new().with_concurrent_sweep(false));
    let node = SimpleVTable::leak(32, Descriptor::Bitmap(0b10));
    c.bench_function("alloc_10000_objects", |b| {
        b.iter(|| {
            black_box(populate(&heap, node, 10_000, usize::MAX));
            collect(&heap, None);
        });
    });
}

fn bench_collection_pause(c: &mut Criterion) {
    let node = SimpleVTable::leak(32, Descriptor::Bitmap(0b10));
    let mut group = c.benchmark_group("collection_pause");
    let configs = [
        ("eager", MajorConfig::new().with_concurrent_sweep(false)),
        (
            "lazy",
            MajorConfig::new()
                .with_concurrent_sweep(false)
                .with_lazy_sweep(true),
        ),
        ("concurrent", MajorConfig::new()),
    ];
    for (name, config) in configs {
        let heap = new_heap(config);
        group.bench_with_input(BenchmarkId::from_parameter(name), &heap, |b, heap| {
            b.iter_custom(|iterations| {
                let mut total = Duration::ZERO;
                for _ in 0..iterations {
                    let head = populate(heap, node, 20_000, 10);
                    let start = Instant::now();
                    collect(heap, head);
                    total += start.elapsed();
                }
                heap.finish_sweeping();
                total
            });
        });
    }
    group.finish();
}

fn bench_sparse_heap_evacuation(c: &mut Criterion) {
    let heap = new_heap(
        MajorConfig::new()
            .with_concurrent_sweep(false)
            .with_evacuation_threshold(0.9),
    );
    let wide = SimpleVTable::leak(2000, Descriptor::Bitmap(0b10));
    c.bench_function("sparse_heap_evacuation", |b| {
        b.iter(|| {
            let mut head = None;
            for i in 0..100 {
                let obj = heap.alloc_object(wide, 2000, true).unwrap();
                if i % 7 == 0 {
                    write_ref(obj, 1, head);
                    head = Some(obj);
                }
            }
            // The first pass picks the size class, the second evacuates it.
            let head = collect(&heap, head);
            black_box(collect(&heap, head));
            collect(&heap, None);
        });
    });
}

criterion_group!(
    name = sweep_comparison;
    config = Criterion::default()
        .sample_size(30)
        .warm_up_time(Duration::from_millis(200))
        .measurement_time(Duration::from_secs(2))
        .noise_threshold(0.05);
    targets =
        bench_alloc_throughput,
        bench_collection_pause,
        bench_sparse_heap_evacuation,
);
criterion_main!(sweep_comparison);
