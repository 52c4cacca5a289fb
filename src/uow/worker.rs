//! Flush worker (component H): the single writer against the paged
//! engine. Mirrors the teacher's `TransactionMonitor`
//! (`engine/transaction_monitor.rs`), which likewise serializes every
//! writer through one owned slot — here that slot is a single `tokio`
//! task instead of a thread-affinity map, since there is exactly one
//! writer by contract (spec §4.H).

use crate::codec::CodecRegistry;
use crate::engine::PagedEngine;
use crate::store::{message_page_of, queue_entry_page_of};
use crate::uow::types::{QueueIndex, Uow};
use std::sync::Arc;
use tokio::sync::mpsc;

pub(crate) struct FlushBatch {
    pub uows: Vec<Arc<Uow>>,
}

pub(crate) struct WorkerDone {
    pub uow_ids: Vec<u64>,
    pub success: bool,
}

pub(crate) async fn run(
    engine: Arc<PagedEngine>,
    registry: Arc<CodecRegistry>,
    queue_index: Arc<QueueIndex>,
    mut batches: mpsc::UnboundedReceiver<FlushBatch>,
    done: mpsc::UnboundedSender<WorkerDone>,
) {
    while let Some(batch) = batches.recv().await {
        for uow in batch.uows {
            let success = flush_one(&engine, &registry, &queue_index, &uow).await;
            let _ = done.send(WorkerDone {
                uow_ids: vec![uow.id],
                success,
            });
        }
    }
}

async fn flush_one(engine: &Arc<PagedEngine>, registry: &Arc<CodecRegistry>, queue_index: &QueueIndex, uow: &Uow) -> bool {
    let message_codec = registry.get::<crate::uow::types::MessageRecord>().expect("message codec registered");
    let entry_codec = registry.get::<crate::uow::types::QueueEntryRecord>().expect("queue-entry codec registered");

    let mut tx = engine.begin(false);
    let mut ok = true;
    let mut enqueued = Vec::new();
    let mut dequeued = Vec::new();

    let actions = std::mem::take(&mut *uow.actions.lock().unwrap());
    for (message, action) in actions {
        if let Some(record) = action.record {
            if let Err(err) = tx.put(&message_codec, message_page_of(message), record) {
                tracing::warn!(error = %err, uow = uow.id, "failed to store message record");
                ok = false;
                break;
            }
        }
        for entry in action.enqueues {
            let page = queue_entry_page_of(entry.queue, entry.seq);
            if let Err(err) = tx.put(&entry_codec, page, entry) {
                tracing::warn!(error = %err, uow = uow.id, "failed to store queue entry");
                ok = false;
                break;
            }
            enqueued.push(entry);
        }
        for entry in action.dequeues {
            let page = queue_entry_page_of(entry.queue, entry.seq);
            if let Err(err) = tx.remove(&entry_codec, page) {
                tracing::warn!(error = %err, uow = uow.id, "failed to remove queue entry");
                ok = false;
                break;
            }
            dequeued.push(entry);
        }
        if !ok {
            break;
        }
    }

    if ok {
        match tx.commit().await {
            Ok(()) => {
                for entry in &enqueued {
                    queue_index.record_enqueue(entry.queue, entry.seq);
                }
                for entry in &dequeued {
                    queue_index.record_dequeue(entry.queue, entry.seq);
                }
                true
            }
            Err(err) => {
                tracing::warn!(error = %err, uow = uow.id, "commit failed");
                false
            }
        }
    } else {
        tx.rollback();
        false
    }
}
