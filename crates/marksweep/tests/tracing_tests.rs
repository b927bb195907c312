//! Integration tests for the `tracing` feature.
//!
//! These tests install a formatting subscriber that writes into a buffer and
//! check that collections, sweeps and card scans leave their spans and
//! events behind.

#![cfg(all(feature = "tracing", feature = "test-util"))]

use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::util::SubscriberInitExt;

use marksweep::client::TracingRecorder;
use marksweep::test_util::{root, SimpleObjectModel, SimpleVTable};
use marksweep::{
    CardSource, Collaborators, Descriptor, InlinePool, MajorConfig, MajorHeap, MarkMode,
};

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Runs `f` with a subscriber capturing everything at `level` and above.
fn capture(level: LevelFilter, f: impl FnOnce()) -> String {
    let out = Captured::default();
    let writer = out.clone();
    let _guard = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish()
        .set_default();
    f();
    out.text()
}

fn heap_with_recorder() -> Arc<MajorHeap> {
    let model = SimpleObjectModel::new(4096);
    let collab = Collaborators::new(model)
        .with_jobs(Arc::new(InlinePool))
        .with_recorder(Arc::new(TracingRecorder));
    MajorHeap::new(MajorConfig::new().with_concurrent_sweep(false), collab)
}

#[test]
fn test_collection_emits_phase_events() {
    let heap = heap_with_recorder();
    let vtable = SimpleVTable::leak(32, Descriptor::NoRefs);
    let obj = heap.alloc_object(vtable, 32, false).unwrap();

    let text = capture(LevelFilter::DEBUG, || {
        heap.start_major_collection(false);
        let mut queue = heap.new_gray_queue();
        let tracer = heap.tracer(MarkMode::Serial);
        tracer.copy_or_mark(&root(obj), &mut queue);
        tracer.drain(&mut queue);
        heap.sweep();
        heap.finish_major_collection();
    });

    assert!(text.contains("major_collection"), "{text}");
    assert!(text.contains("phase_start"), "{text}");
    assert!(text.contains("sweep_end"), "{text}");
    assert!(text.contains("phase=Sweep"), "{text}");
}

#[test]
fn test_recorder_hooks_log_at_trace_level() {
    let heap = heap_with_recorder();
    let vtable = SimpleVTable::leak(32, Descriptor::NoRefs);

    let text = capture(LevelFilter::TRACE, || {
        heap.alloc_object(vtable, 32, false).unwrap();
        heap.start_major_collection(false);
        heap.sweep();
        heap.finish_major_collection();
    });

    assert!(text.contains("block_alloc"), "{text}");
    assert!(text.contains("block_set_state"), "{text}");
    assert!(text.contains("sweep_begin"), "{text}");
    // The unreachable block is freed by the sweep.
    assert!(text.contains("block_free"), "{text}");
}

#[test]
fn test_recorder_hooks_silent_at_debug_level() {
    let heap = heap_with_recorder();
    let vtable = SimpleVTable::leak(32, Descriptor::NoRefs);

    let text = capture(LevelFilter::DEBUG, || {
        heap.alloc_object(vtable, 32, false).unwrap();
    });
    assert!(!text.contains("block_alloc"), "{text}");
}

#[test]
fn test_card_scan_is_logged() {
    let heap = heap_with_recorder();
    let node = SimpleVTable::leak(32, Descriptor::Bitmap(0b10));
    let a = heap.alloc_object(node, 32, true).unwrap();
    let b = heap.alloc_object(node, 32, true).unwrap();

    let text = capture(LevelFilter::DEBUG, || {
        heap.start_major_collection(true);
        let mut queue = heap.new_gray_queue();
        let tracer = heap.tracer(MarkMode::ConcurrentStart);
        tracer.copy_or_mark(&root(a), &mut queue);
        tracer.drain(&mut queue);
        unsafe { heap.write_reference(a, 1, Some(b)) };
        heap.scan_card_table(CardSource::Live, MarkMode::ConcurrentFinish, &mut queue);
        heap.tracer(MarkMode::ConcurrentFinish).drain(&mut queue);
        heap.sweep();
        heap.finish_major_collection();
    });

    assert!(text.contains("card scan finished"), "{text}");
    assert!(text.contains("scanned=1"), "{text}");
    assert!(text.contains("phase=CardScan"), "{text}");
}

#[test]
fn test_collections_without_subscriber() {
    let heap = heap_with_recorder();
    for _ in 0..3 {
        heap.start_major_collection(false);
        heap.sweep();
        heap.finish_major_collection();
    }
    assert_eq!(heap.stats().collections, 3);
}
