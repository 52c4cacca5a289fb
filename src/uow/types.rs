//! Broker-facing value types: message/queue keys, the records a UOW
//! carries, and the UOW itself (spec §3 "UOW", §4.G).

use indexmap::IndexMap;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

macro_rules! sequence_key {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

sequence_key!(MessageKey);
sequence_key!(QueueKey);

/// Monotonic id generator, one per kind of key. Grounded on the teacher's
/// sequence-assignment pattern for page/transaction ids
/// (`engine/transaction_monitor.rs`'s slot counter), generalized to a
/// standalone atomic since keys here are not tied to a thread slot.
#[derive(Default)]
pub struct SequenceGenerator(AtomicU64);

impl SequenceGenerator {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// A persisted message body. The wire format of the payload itself is the
/// protocol codec layer's concern and out of scope here; this core only
/// needs something page-codec-able.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub key: MessageKey,
    pub payload: Vec<u8>,
}

/// One queue's reference to a stored message at a given sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueEntryRecord {
    pub queue: QueueKey,
    pub seq: u64,
    pub message: MessageKey,
}

/// Tracks which `(queue, seq)` pairs currently have a durably committed
/// entry, so `Store::list_queue_entries`/`list_queue_entry_ranges` don't
/// need to guess a range to scan against the hash-addressed page space.
/// Updated by the flush worker immediately after a successful commit —
/// never speculatively, so it never drifts ahead of what a reader can
/// actually load.
#[derive(Default)]
pub struct QueueIndex {
    seqs: Mutex<HashMap<QueueKey, BTreeSet<u64>>>,
}

impl QueueIndex {
    pub(crate) fn record_enqueue(&self, queue: QueueKey, seq: u64) {
        self.seqs.lock().unwrap().entry(queue).or_default().insert(seq);
    }

    pub(crate) fn record_dequeue(&self, queue: QueueKey, seq: u64) {
        if let Some(set) = self.seqs.lock().unwrap().get_mut(&queue) {
            set.remove(&seq);
        }
    }

    pub(crate) fn seqs_in_range(&self, queue: QueueKey, first_seq: u64, last_seq: u64) -> Vec<u64> {
        self.seqs
            .lock()
            .unwrap()
            .get(&queue)
            .map(|set| set.range(first_seq..=last_seq).copied().collect())
            .unwrap_or_default()
    }

    /// Contiguous runs of present sequence numbers, as `(first, last)`
    /// inclusive pairs, capped at `limit` ranges.
    pub(crate) fn ranges(&self, queue: QueueKey, limit: usize) -> Vec<(u64, u64)> {
        let seqs = self.seqs.lock().unwrap();
        let Some(set) = seqs.get(&queue) else {
            return Vec::new();
        };

        let mut ranges = Vec::new();
        let mut iter = set.iter().copied();
        if let Some(first) = iter.next() {
            let (mut start, mut end) = (first, first);
            for seq in iter {
                if seq == end + 1 {
                    end = seq;
                    continue;
                }
                ranges.push((start, end));
                if ranges.len() == limit {
                    return ranges;
                }
                start = seq;
                end = seq;
            }
            ranges.push((start, end));
        }
        ranges.truncate(limit);
        ranges
    }
}

/// Everything a UOW wants to happen to one message: at most one record
/// plus ordered enqueue/dequeue lists against queues.
#[derive(Debug, Default)]
pub struct MessageAction {
    pub record: Option<MessageRecord>,
    pub enqueues: Vec<QueueEntryRecord>,
    pub dequeues: Vec<QueueEntryRecord>,
}

impl MessageAction {
    /// An action counts as empty iff its record is absent and both lists
    /// are empty (spec §9, resolving the ambiguity over dequeue-only
    /// actions explicitly in the crate's favor rather than leaving it
    /// implicit).
    pub fn is_empty(&self) -> bool {
        self.record.is_none() && self.enqueues.is_empty() && self.dequeues.is_empty()
    }

    fn remove_enqueue(&mut self, queue: QueueKey, seq: u64) -> bool {
        if let Some(pos) = self.enqueues.iter().position(|e| e.queue == queue && e.seq == seq) {
            self.enqueues.remove(pos);
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UowState {
    Building,
    Submitted,
    Delayed,
    Flushing,
    Flushed,
    Canceled,
}

/// A broker-level batch of message/queue actions (spec §3 "UOW", §4.G
/// state machine). Construction happens on the submitting thread;
/// everything from `Submitted` onward is owned by the coordinator.
pub struct Uow {
    pub id: u64,
    /// Keyed by message, ordered by first touch — an `IndexMap` rather than
    /// a `HashMap` so the flush worker writes pages in the order the
    /// caller built them instead of hash order, which keeps commits
    /// reproducible across runs.
    pub actions: Mutex<IndexMap<MessageKey, MessageAction>>,
    pub complete_listeners: Mutex<Vec<Box<dyn FnOnce(bool) + Send>>>,
    pub disable_delay: AtomicBool,
    pub delayable_actions: AtomicI64,
    pub state: Mutex<UowState>,
    /// Keys this UOW is currently registered under in the coordinator's
    /// `pending_stores`/`pending_enqueues` maps. Recorded here because by
    /// the time the worker reports completion, `actions` has already been
    /// drained into a transaction and can no longer answer "what keys did
    /// I own".
    pub(super) tracked_stores: Mutex<Vec<MessageKey>>,
    pub(super) tracked_enqueues: Mutex<Vec<(QueueKey, u64)>>,
}

impl Uow {
    pub fn new(id: u64) -> Self {
        Uow {
            id,
            actions: Mutex::new(IndexMap::new()),
            complete_listeners: Mutex::new(Vec::new()),
            disable_delay: AtomicBool::new(false),
            delayable_actions: AtomicI64::new(0),
            state: Mutex::new(UowState::Building),
            tracked_stores: Mutex::new(Vec::new()),
            tracked_enqueues: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self, key: MessageKey, record: MessageRecord) {
        let mut actions = self.actions.lock().unwrap();
        actions.entry(key).or_default().record = Some(record);
        self.delayable_actions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn enqueue(&self, entry: QueueEntryRecord) {
        let mut actions = self.actions.lock().unwrap();
        actions.entry(entry.message).or_default().enqueues.push(entry);
        self.delayable_actions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dequeue(&self, entry: QueueEntryRecord) {
        let mut actions = self.actions.lock().unwrap();
        actions.entry(entry.message).or_default().dequeues.push(entry);
    }

    pub fn on_complete(&self, listener: impl FnOnce(bool) + Send + 'static) {
        self.complete_listeners.lock().unwrap().push(Box::new(listener));
    }

    /// Forces the coordinator to flush this UOW on its next drain instead
    /// of waiting out `flushDelay`.
    pub fn complete_asap(&self) {
        self.disable_delay.store(true, Ordering::Relaxed);
    }

    pub fn is_delayable(&self, flush_delay_ms: i64) -> bool {
        !self.disable_delay.load(Ordering::Relaxed)
            && self.delayable_actions.load(Ordering::Relaxed) > 0
            && flush_delay_ms >= 0
    }

    pub fn set_state(&self, state: UowState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn state(&self) -> UowState {
        *self.state.lock().unwrap()
    }

    /// Removes the matching enqueue from `self`, decrementing
    /// `delayable_actions`; if the owning message action becomes empty and
    /// carried a record, drops the record too (spec §4.G step 2).
    ///
    /// Returns `true` if the message action this enqueue lived in is now
    /// empty (caller must then decide whether to cancel the action/UOW).
    pub(super) fn cancel_enqueue(&self, message: MessageKey, queue: QueueKey, seq: u64) -> Option<bool> {
        let mut actions = self.actions.lock().unwrap();
        let action = actions.get_mut(&message)?;
        if !action.remove_enqueue(queue, seq) {
            return None;
        }
        self.delayable_actions.fetch_sub(1, Ordering::Relaxed);

        if action.enqueues.is_empty() && action.record.is_some() {
            action.record = None;
            self.delayable_actions.fetch_sub(1, Ordering::Relaxed);
        }
        Some(action.is_empty())
    }

    pub(super) fn remove_action_if_empty(&self, message: MessageKey) -> bool {
        let mut actions = self.actions.lock().unwrap();
        match actions.get(&message) {
            Some(action) if action.is_empty() => {
                actions.shift_remove(&message);
                true
            }
            _ => false,
        }
    }

    pub(super) fn is_empty(&self) -> bool {
        self.actions.lock().unwrap().is_empty()
    }

    pub(super) fn track_store(&self, key: MessageKey) {
        self.tracked_stores.lock().unwrap().push(key);
    }

    pub(super) fn track_enqueue(&self, queue: QueueKey, seq: u64) {
        self.tracked_enqueues.lock().unwrap().push((queue, seq));
    }

    pub(super) fn take_tracked(&self) -> (Vec<MessageKey>, Vec<(QueueKey, u64)>) {
        (
            std::mem::take(&mut *self.tracked_stores.lock().unwrap()),
            std::mem::take(&mut *self.tracked_enqueues.lock().unwrap()),
        )
    }

    pub(super) fn fire_complete(&self, success: bool) {
        for listener in self.complete_listeners.lock().unwrap().drain(..) {
            listener(success);
        }
    }
}
