//! Store façade (spec §6 "Store API"): the broker-facing operations
//! layered over the UOW pipeline and the paged engine/transaction core.
//!
//! Grounded on the teacher's top-level `LiteEngine` (`engine/lite_engine.rs`
//! in the source tree), which plays the same role of a public façade over
//! the transaction/snapshot machinery — this crate's façade is narrower,
//! scoped to the message/queue operations spec.md §6 enumerates.

use crate::codec::{Codec, CodecRegistry};
use crate::config::Config;
use crate::engine::PagedEngine;
use crate::error::Result;
use crate::page::PageId;
use crate::uow::pipeline::UowPipeline;
use crate::uow::types::{MessageKey, MessageRecord, QueueEntryRecord, QueueIndex, QueueKey, SequenceGenerator};
use itertools::Itertools;
use std::sync::Arc;

/// Deterministic (message, queue-entry) page addressing. Real index
/// structures (B-tree, hash index) are out of scope for this storage core
/// (spec.md §1 Non-goals implicitly — `indexFactory` is advisory and this
/// crate has no index subsystem to hand it to); this is the simplest
/// mapping that satisfies "each record lives at a stable page" without
/// pulling one in. Hashed rather than a direct truncating cast of the
/// 64-bit key, since `MessageKey`'s field is public and a caller-supplied
/// key outside the range this store's own sequence generator produces
/// would otherwise overflow (and collide) under a plain `as u32 * 2`.
pub(crate) fn message_page_of(key: MessageKey) -> PageId {
    let mut h = 0xcbf29ce484222325u64;
    for byte in key.0.to_le_bytes() {
        h ^= byte as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    PageId((h as u32) * 2)
}

pub(crate) fn queue_entry_page_of(queue: QueueKey, seq: u64) -> PageId {
    let mut h = 0xcbf29ce484222325u64;
    for byte in queue.0.to_le_bytes().into_iter().chain(seq.to_le_bytes()) {
        h ^= byte as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    PageId((h as u32) * 2 + 1)
}

pub struct MessageRecordCodec;

impl Codec<MessageRecord> for MessageRecordCodec {
    fn encode(&self, value: &MessageRecord) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + value.payload.len());
        out.extend_from_slice(&value.key.0.to_le_bytes());
        out.extend_from_slice(&value.payload);
        out
    }

    fn decode(&self, bytes: &[u8]) -> Result<MessageRecord> {
        let key = MessageKey(u64::from_le_bytes(bytes[..8].try_into().unwrap()));
        Ok(MessageRecord {
            key,
            payload: bytes[8..].to_vec(),
        })
    }
}

pub struct QueueEntryRecordCodec;

impl Codec<QueueEntryRecord> for QueueEntryRecordCodec {
    fn encode(&self, value: &QueueEntryRecord) -> Vec<u8> {
        let mut out = Vec::with_capacity(24);
        out.extend_from_slice(&value.queue.0.to_le_bytes());
        out.extend_from_slice(&value.seq.to_le_bytes());
        out.extend_from_slice(&value.message.0.to_le_bytes());
        out
    }

    fn decode(&self, bytes: &[u8]) -> Result<QueueEntryRecord> {
        Ok(QueueEntryRecord {
            queue: QueueKey(u64::from_le_bytes(bytes[0..8].try_into().unwrap())),
            seq: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            message: MessageKey(u64::from_le_bytes(bytes[16..24].try_into().unwrap())),
        })
    }
}

#[derive(Debug, Clone)]
pub struct QueueRecord {
    pub key: QueueKey,
    pub name: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStatus {
    pub enqueue_count: u64,
    pub dequeue_count: u64,
}

pub struct Store {
    engine: Arc<PagedEngine>,
    registry: Arc<CodecRegistry>,
    pipeline: UowPipeline,
    queue_index: Arc<QueueIndex>,
    message_keys: SequenceGenerator,
    queue_keys: SequenceGenerator,
    queues: std::sync::Mutex<std::collections::HashMap<QueueKey, QueueRecord>>,
}

impl Store {
    /// Opens or creates the backing page file under `config.directory`.
    /// Must be called from within a running `tokio` runtime — the UOW
    /// coordinator and flush worker are spawned as tasks on it.
    pub fn open(config: &Config) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.directory)?;
        let path = config.directory.join("pagestore.db");
        let engine = PagedEngine::open(path, config.page_size, config.page_limit)?;

        let mut registry = CodecRegistry::new();
        registry.register::<MessageRecord>(Arc::new(MessageRecordCodec));
        registry.register::<QueueEntryRecord>(Arc::new(QueueEntryRecordCodec));
        let registry = Arc::new(registry);

        let queue_index = Arc::new(QueueIndex::default());
        let pipeline =
            UowPipeline::spawn_with_index(engine.clone(), registry.clone(), config.flush_delay_ms, queue_index.clone());

        Ok(Arc::new(Store {
            engine,
            registry,
            pipeline,
            queue_index,
            message_keys: SequenceGenerator::default(),
            queue_keys: SequenceGenerator::default(),
            queues: std::sync::Mutex::new(std::collections::HashMap::new()),
        }))
    }

    pub fn add_queue(&self, name: impl Into<String>) -> QueueKey {
        let key = QueueKey(self.queue_keys.next());
        self.queues.lock().unwrap().insert(
            key,
            QueueRecord {
                key,
                name: name.into(),
            },
        );
        key
    }

    pub fn remove_queue(&self, key: QueueKey) -> bool {
        self.queues.lock().unwrap().remove(&key).is_some()
    }

    /// Lists queues in creation order rather than the backing map's hash
    /// order, since callers (management tooling, tests) expect a stable
    /// listing across calls.
    pub fn list_queues(&self) -> Vec<QueueRecord> {
        self.queues.lock().unwrap().values().cloned().sorted_by_key(|q| q.key.0).collect()
    }

    pub fn get_queue_status(&self, key: QueueKey) -> Option<QueueStatus> {
        self.queues
            .lock()
            .unwrap()
            .get(&key)
            .map(|_| QueueStatus::default())
    }

    pub fn next_message_key(&self) -> MessageKey {
        MessageKey(self.message_keys.next())
    }

    /// Loads a message record through a fresh read-only transaction.
    pub fn load_message(&self, key: MessageKey) -> Result<Option<MessageRecord>> {
        let mut tx = self.engine.begin(true);
        let codec = self.registry.get::<MessageRecord>().expect("message codec registered");
        match tx.get(&codec, message_page_of(key)) {
            Ok(record) => Ok(Some(record)),
            Err(crate::error::StorageError::Paging { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn load_queue_entry(&self, queue: QueueKey, seq: u64) -> Result<Option<QueueEntryRecord>> {
        let mut tx = self.engine.begin(true);
        let codec = self.registry.get::<QueueEntryRecord>().expect("queue-entry codec registered");
        match tx.get(&codec, queue_entry_page_of(queue, seq)) {
            Ok(entry) => Ok(Some(entry)),
            Err(crate::error::StorageError::Paging { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Contiguous runs of committed sequence numbers for `queue`, capped at
    /// `limit` ranges (spec §6 `listQueueEntryRanges`). Ranges come from the
    /// flush worker's durable-commit bookkeeping, not a scan of the page
    /// space, since queue-entry pages are hash-addressed and not otherwise
    /// enumerable.
    pub fn list_queue_entry_ranges(&self, queue: QueueKey, limit: usize) -> Vec<(u64, u64)> {
        self.queue_index.ranges(queue, limit)
    }

    /// Every committed queue entry for `queue` with `firstSeq <= seq <=
    /// lastSeq`, loaded through a single read-only transaction (spec §6
    /// `listQueueEntries`).
    pub fn list_queue_entries(&self, queue: QueueKey, first_seq: u64, last_seq: u64) -> Result<Vec<QueueEntryRecord>> {
        let codec = self.registry.get::<QueueEntryRecord>().expect("queue-entry codec registered");
        let mut tx = self.engine.begin(true);
        let mut entries = Vec::new();
        for seq in self.queue_index.seqs_in_range(queue, first_seq, last_seq) {
            match tx.get(&codec, queue_entry_page_of(queue, seq)) {
                Ok(entry) => entries.push(entry),
                Err(crate::error::StorageError::Paging { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(entries)
    }

    /// Forces `message`'s pending store (if any is still buffered in the
    /// UOW pipeline) to flush ahead of its delay window, then runs
    /// `callback` with whether it committed (spec §6 `flushMessage`). Fires
    /// immediately with `true` if nothing is pending — the message is
    /// already as durable as this store will make it.
    pub fn flush_message(&self, message: MessageKey, callback: impl FnOnce(bool) + Send + 'static) {
        self.pipeline.flush_message(message, callback);
    }

    pub fn create_store_uow(&self) -> crate::uow::pipeline::UowHandle {
        self.pipeline.create_uow()
    }

    /// Drops every queue definition and lets in-flight UOWs flush out
    /// normally; this core has no bulk page-range eraser (spec.md Non-goal:
    /// crash-recovery journal format / administrative CLIs cover the
    /// adjacent destructive operations this crate deliberately omits).
    pub fn purge(&self) {
        self.queues.lock().unwrap().clear();
    }
}
