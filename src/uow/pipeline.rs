//! UOW pipeline (component G): a single-writer coordinator that accepts
//! broker actions, cancels matched enqueue/dequeue pairs, delays flushing
//! within a bounded window, and dispatches batches to the flush worker.
//!
//! The coordinator is one `tokio::task` owning all pipeline-private maps
//! (`pending_stores`, `pending_enqueues`, `delayed_uows`) — the closest
//! idiomatic equivalent, in this stack, of the "single serial dispatch
//! queue" spec §4.G calls for. Submission and flush-trigger messages
//! arrive over an unbounded channel; nothing outside this task ever
//! touches the maps directly, so the state needs no lock of its own
//! (teacher precedent: `TransactionMonitor` serializes all transaction
//! bookkeeping through one owned `HashMap`, `engine/transaction_monitor.rs`).

use crate::codec::CodecRegistry;
use crate::engine::PagedEngine;
use crate::uow::types::{MessageKey, QueueEntryRecord, QueueIndex, QueueKey, SequenceGenerator, Uow, UowState};
use crate::uow::worker::{self, FlushBatch, WorkerDone};
use indexmap::IndexMap;
use std::sync::Arc;
use tokio::sync::mpsc;

enum SubmitMsg {
    Accept(Arc<Uow>),
    /// Accelerates and/or observes the flush of whatever UOW currently owns
    /// `message`'s pending store, if any (spec §6 `flushMessage`).
    FlushMessage(MessageKey, Box<dyn FnOnce(bool) + Send>),
}

struct CoordinatorState {
    pending_stores: IndexMap<MessageKey, Arc<Uow>>,
    pending_enqueues: IndexMap<(QueueKey, u64), Arc<Uow>>,
    delayed_uows: IndexMap<u64, Arc<Uow>>,
}

/// Handle to a pipeline running on its own coordinator + worker tasks.
pub struct UowPipeline {
    submit_tx: mpsc::UnboundedSender<SubmitMsg>,
    flush_tx: mpsc::UnboundedSender<u64>,
    uow_ids: Arc<SequenceGenerator>,
    flush_delay_ms: i64,
}

impl UowPipeline {
    pub fn spawn(engine: Arc<PagedEngine>, registry: Arc<CodecRegistry>, flush_delay_ms: i64) -> Self {
        Self::spawn_with_index(engine, registry, flush_delay_ms, Arc::new(QueueIndex::default()))
    }

    pub(crate) fn spawn_with_index(
        engine: Arc<PagedEngine>,
        registry: Arc<CodecRegistry>,
        flush_delay_ms: i64,
        queue_index: Arc<QueueIndex>,
    ) -> Self {
        let (submit_tx, submit_rx) = mpsc::unbounded_channel();
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        let (batch_tx, batch_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();

        tokio::spawn(worker::run(engine, registry, queue_index, batch_rx, done_tx));
        tokio::spawn(coordinate(submit_rx, flush_rx, flush_tx.clone(), batch_tx, done_rx, flush_delay_ms));

        UowPipeline {
            submit_tx,
            flush_tx,
            uow_ids: Arc::new(SequenceGenerator::default()),
            flush_delay_ms,
        }
    }

    pub fn create_uow(&self) -> UowHandle {
        UowHandle {
            uow: Some(Arc::new(Uow::new(self.uow_ids.next()))),
            submit_tx: self.submit_tx.clone(),
        }
    }

    /// Forces the UOW currently holding a pending store for `message` (if
    /// any) to flush ahead of its delay window, and runs `callback` once
    /// that flush (or the absence of one) is settled.
    pub fn flush_message(&self, message: MessageKey, callback: impl FnOnce(bool) + Send + 'static) {
        let _ = self.submit_tx.send(SubmitMsg::FlushMessage(message, Box::new(callback)));
    }
}

/// Caller-facing UOW builder (spec §4.G "UOW construction"). Disposing the
/// handle — explicitly via [`UowHandle::dispose`] or implicitly on drop —
/// hands the UOW to the coordinator exactly once.
pub struct UowHandle {
    uow: Option<Arc<Uow>>,
    submit_tx: mpsc::UnboundedSender<SubmitMsg>,
}

impl UowHandle {
    pub fn id(&self) -> u64 {
        self.uow.as_ref().unwrap().id
    }

    pub fn store(&self, key: MessageKey, record: crate::uow::types::MessageRecord) {
        self.uow.as_ref().unwrap().store(key, record);
    }

    pub fn enqueue(&self, entry: QueueEntryRecord) {
        self.uow.as_ref().unwrap().enqueue(entry);
    }

    pub fn dequeue(&self, entry: QueueEntryRecord) {
        self.uow.as_ref().unwrap().dequeue(entry);
    }

    pub fn on_complete(&self, listener: impl FnOnce(bool) + Send + 'static) {
        self.uow.as_ref().unwrap().on_complete(listener);
    }

    pub fn complete_asap(&self) {
        self.uow.as_ref().unwrap().complete_asap();
    }

    pub fn dispose(mut self) {
        self.dispose_inner();
    }

    fn dispose_inner(&mut self) {
        if let Some(uow) = self.uow.take() {
            uow.set_state(UowState::Submitted);
            let _ = self.submit_tx.send(SubmitMsg::Accept(uow));
        }
    }
}

impl Drop for UowHandle {
    fn drop(&mut self) {
        self.dispose_inner();
    }
}

async fn coordinate(
    mut submit_rx: mpsc::UnboundedReceiver<SubmitMsg>,
    mut flush_rx: mpsc::UnboundedReceiver<u64>,
    flush_tx: mpsc::UnboundedSender<u64>,
    batch_tx: mpsc::UnboundedSender<FlushBatch>,
    mut done_rx: mpsc::UnboundedReceiver<WorkerDone>,
    flush_delay_ms: i64,
) {
    let mut state = CoordinatorState {
        pending_stores: IndexMap::new(),
        pending_enqueues: IndexMap::new(),
        delayed_uows: IndexMap::new(),
    };

    loop {
        tokio::select! {
            biased;
            msg = submit_rx.recv() => {
                match msg {
                    Some(SubmitMsg::Accept(uow)) => accept(&mut state, uow, &flush_tx, flush_delay_ms),
                    Some(SubmitMsg::FlushMessage(key, callback)) => flush_message(&state, key, callback, &flush_tx),
                    None => break,
                }
            }
            id = flush_rx.recv() => {
                let Some(id) = id else { break };
                let mut ids = vec![id];
                while let Ok(more) = flush_rx.try_recv() {
                    ids.push(more);
                }
                drain_flush(&mut state, ids, &batch_tx);
            }
            done = done_rx.recv() => {
                match done {
                    Some(done) => complete(&mut state, done),
                    None => break,
                }
            }
        }
    }
}

/// Coordinator drain for one submitted UOW (spec §4.G "Coordinator drain").
fn accept(state: &mut CoordinatorState, uow: Arc<Uow>, flush_tx: &mpsc::UnboundedSender<u64>, flush_delay_ms: i64) {
    state.delayed_uows.insert(uow.id, uow.clone());

    let dequeues: Vec<QueueEntryRecord> = {
        let actions = uow.actions.lock().unwrap();
        actions.values().flat_map(|a| a.dequeues.iter().copied()).collect()
    };

    for entry in dequeues {
        let key = (entry.queue, entry.seq);
        let Some(prior) = state.pending_enqueues.get(&key).cloned() else {
            continue;
        };
        if prior.state() == UowState::Flushing {
            continue;
        }

        let Some(action_emptied) = prior.cancel_enqueue(entry.message, entry.queue, entry.seq) else {
            continue;
        };
        state.pending_enqueues.shift_remove(&key);

        if action_emptied {
            let action_removed = prior.remove_action_if_empty(entry.message);
            if action_removed {
                state.pending_stores.shift_remove(&entry.message);
            }
        }

        if prior.is_empty() {
            state.delayed_uows.shift_remove(&prior.id);
            prior.set_state(UowState::Canceled);
            tracing::debug!(uow = prior.id, "canceled: every action matched out");
            prior.fire_complete(true);
        } else if !prior.is_delayable(flush_delay_ms) {
            tracing::trace!(uow = prior.id, "no longer delayable after cancellation, flushing now");
            let _ = flush_tx.send(prior.id);
        }

        let mut actions = uow.actions.lock().unwrap();
        if let Some(action) = actions.get_mut(&entry.message) {
            if let Some(pos) = action.dequeues.iter().position(|d| *d == entry) {
                action.dequeues.remove(pos);
            }
            if action.is_empty() {
                actions.shift_remove(&entry.message);
            }
        }
    }

    if uow.is_empty() {
        state.delayed_uows.shift_remove(&uow.id);
        uow.set_state(UowState::Canceled);
        tracing::debug!(uow = uow.id, "canceled: no actions survived cancellation");
        uow.fire_complete(true);
        return;
    }

    {
        let actions = uow.actions.lock().unwrap();
        for (&message, action) in actions.iter() {
            if action.record.is_some() {
                state.pending_stores.insert(message, uow.clone());
                uow.track_store(message);
            }
            for entry in &action.enqueues {
                state.pending_enqueues.insert((entry.queue, entry.seq), uow.clone());
                uow.track_enqueue(entry.queue, entry.seq);
            }
        }
    }

    if uow.is_delayable(flush_delay_ms) {
        uow.set_state(UowState::Delayed);
        let flush_tx = flush_tx.clone();
        let id = uow.id;
        let delay = std::time::Duration::from_millis(flush_delay_ms.max(0) as u64);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = flush_tx.send(id);
        });
    } else {
        uow.set_state(UowState::Submitted);
        let _ = flush_tx.send(uow.id);
    }
}

/// Looks up whatever UOW currently owns `message`'s pending store and pushes
/// it ahead of its delay window; if nothing is pending the message is
/// already as durable as it will ever get from this pipeline, so the
/// callback fires immediately with success.
fn flush_message(
    state: &CoordinatorState,
    message: MessageKey,
    callback: Box<dyn FnOnce(bool) + Send>,
    flush_tx: &mpsc::UnboundedSender<u64>,
) {
    match state.pending_stores.get(&message) {
        Some(uow) => {
            uow.on_complete(callback);
            uow.complete_asap();
            if uow.state() != UowState::Flushing {
                let _ = flush_tx.send(uow.id);
            }
        }
        None => callback(true),
    }
}

fn drain_flush(state: &mut CoordinatorState, ids: Vec<u64>, batch_tx: &mpsc::UnboundedSender<FlushBatch>) {
    let mut uows = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(uow) = state.delayed_uows.get(&id) {
            if uow.state() != UowState::Flushing {
                uow.set_state(UowState::Flushing);
                uows.push(uow.clone());
            }
        }
    }
    if !uows.is_empty() {
        let _ = batch_tx.send(FlushBatch { uows });
    }
}

fn complete(state: &mut CoordinatorState, done: WorkerDone) {
    for id in done.uow_ids {
        let Some(uow) = state.delayed_uows.shift_remove(&id) else { continue };
        let (stores, enqueues) = uow.take_tracked();
        for key in stores {
            state.pending_stores.shift_remove(&key);
        }
        for key in enqueues {
            state.pending_enqueues.shift_remove(&key);
        }
        uow.set_state(if done.success { UowState::Flushed } else { UowState::Building });
        tracing::debug!(uow = id, success = done.success, "flush complete");
        uow.fire_complete(done.success);
    }
}
