//! End-to-end UOW pipeline scenarios (spec §8 table, rows 2, 3, 6).

use pagestore::uow::types::{MessageKey, MessageRecord, QueueEntryRecord, QueueKey};
use pagestore::uow::UowPipeline;
use pagestore::{Config, PagedEngine};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn spawn_pipeline(flush_delay_ms: i64) -> (Arc<PagedEngine>, UowPipeline, tempfile::TempDir) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let dir = tempfile::TempDir::new().unwrap();
    let config = Config::new(dir.path()).with_page_size(64).with_page_limit(256);
    let engine = PagedEngine::open(dir.path().join("db"), config.page_size, config.page_limit).unwrap();

    let mut registry = pagestore::CodecRegistry::new();
    registry.register::<MessageRecord>(Arc::new(pagestore::store::MessageRecordCodec));
    registry.register::<QueueEntryRecord>(Arc::new(pagestore::store::QueueEntryRecordCodec));

    let pipeline = UowPipeline::spawn(engine.clone(), Arc::new(registry), flush_delay_ms);
    (engine, pipeline, dir)
}

#[tokio::test(flavor = "multi_thread")]
async fn matched_enqueue_dequeue_cancels_both_uows_without_disk_write() {
    let (_engine, pipeline, _dir) = spawn_pipeline(200);

    let u1_done = Arc::new(AtomicBool::new(false));
    let u2_done = Arc::new(AtomicBool::new(false));

    let u1 = pipeline.create_uow();
    let msg = MessageKey(7);
    u1.store(msg, MessageRecord { key: msg, payload: b"A".to_vec() });
    u1.enqueue(QueueEntryRecord { queue: QueueKey(1), seq: 1, message: msg });
    {
        let flag = u1_done.clone();
        u1.on_complete(move |_| flag.store(true, Ordering::SeqCst));
    }
    u1.dispose();

    let u2 = pipeline.create_uow();
    u2.dequeue(QueueEntryRecord { queue: QueueKey(1), seq: 1, message: msg });
    {
        let flag = u2_done.clone();
        u2.on_complete(move |_| flag.store(true, Ordering::SeqCst));
    }
    u2.dispose();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(u1_done.load(Ordering::SeqCst), "u1 should be canceled promptly, not wait out the flush delay");
    assert!(u2_done.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread")]
async fn unmatched_entries_survive_cancellation_of_a_sibling() {
    let (_engine, pipeline, _dir) = spawn_pipeline(200);

    let u1 = pipeline.create_uow();
    let msg = MessageKey(7);
    u1.store(msg, MessageRecord { key: msg, payload: b"A".to_vec() });
    u1.enqueue(QueueEntryRecord { queue: QueueKey(1), seq: 1, message: msg });
    u1.enqueue(QueueEntryRecord { queue: QueueKey(2), seq: 1, message: msg });
    let u1_done = Arc::new(AtomicBool::new(false));
    {
        let flag = u1_done.clone();
        u1.on_complete(move |ok| flag.store(ok, Ordering::SeqCst));
    }
    u1.dispose();

    let u2 = pipeline.create_uow();
    u2.dequeue(QueueEntryRecord { queue: QueueKey(1), seq: 1, message: msg });
    u2.dispose();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(u1_done.load(Ordering::SeqCst), "u1 should eventually flush with its surviving enqueue");
}

#[tokio::test(flavor = "multi_thread")]
async fn complete_asap_bypasses_the_flush_delay() {
    let (_engine, pipeline, _dir) = spawn_pipeline(10_000);

    let uow = pipeline.create_uow();
    let msg = MessageKey(1);
    uow.store(msg, MessageRecord { key: msg, payload: b"X".to_vec() });
    uow.complete_asap();
    let done = Arc::new(AtomicBool::new(false));
    {
        let flag = done.clone();
        uow.on_complete(move |_| flag.store(true, Ordering::SeqCst));
    }
    uow.dispose();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(done.load(Ordering::SeqCst), "completeASAP must flush well before the 10s delay");
}
