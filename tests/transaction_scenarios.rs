//! End-to-end transaction/snapshot scenarios (spec §8 table, rows 1, 4, 5).

use pagestore::codec::Codec;
use pagestore::{Config, PagedEngine, Result, SliceMode};
use std::sync::Arc;
use tempfile::TempDir;

struct BytesCodec;

impl Codec<Vec<u8>> for BytesCodec {
    fn encode(&self, value: &Vec<u8>) -> Vec<u8> {
        value.clone()
    }
    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

/// Returns the engine alongside the `TempDir` backing it; the caller must
/// keep the `TempDir` alive for as long as the engine is in use.
fn open_engine() -> (Arc<PagedEngine>, TempDir) {
    let dir = TempDir::new().unwrap();
    let config = Config::new(dir.path()).with_page_size(16).with_page_limit(64);
    let engine = PagedEngine::open(dir.path().join("db"), config.page_size, config.page_limit).unwrap();
    (engine, dir)
}

#[tokio::test]
async fn commit_then_read_from_new_transaction() {
    let (engine, _dir) = open_engine();
    let codec: Arc<dyn Codec<Vec<u8>>> = Arc::new(BytesCodec);

    let mut tx1 = engine.begin(false);
    tx1.put(&codec, pagestore::PageId(5), vec![b'A'; 4]).unwrap();
    tx1.commit().await.unwrap();

    let mut tx2 = engine.begin(true);
    let value = tx2.get(&codec, pagestore::PageId(5)).unwrap();
    assert_eq!(value, vec![b'A'; 4]);
}

#[tokio::test]
async fn old_snapshot_keeps_pre_commit_bytes_until_closed() {
    let (engine, _dir) = open_engine();
    let codec: Arc<dyn Codec<Vec<u8>>> = Arc::new(BytesCodec);

    let mut seed = engine.begin(false);
    seed.put(&codec, pagestore::PageId(3), vec![1u8; 4]).unwrap();
    seed.commit().await.unwrap();

    let mut reader = engine.begin(true);
    let before = reader.get(&codec, pagestore::PageId(3)).unwrap();
    assert_eq!(before, vec![1u8; 4]);

    let mut writer = engine.begin(false);
    writer.put(&codec, pagestore::PageId(3), vec![2u8; 4]).unwrap();
    writer.commit().await.unwrap();

    // `reader`'s snapshot was opened before the second commit; it must
    // keep observing the pre-commit bytes until it is dropped.
    let still_old = reader.get(&codec, pagestore::PageId(3)).unwrap();
    assert_eq!(still_old, vec![1u8; 4]);
    drop(reader);

    let mut fresh = engine.begin(true);
    let after = fresh.get(&codec, pagestore::PageId(3)).unwrap();
    assert_eq!(after, vec![2u8; 4]);
}

#[tokio::test]
async fn rollback_frees_every_allocated_page() {
    let (engine, _dir) = open_engine();
    let codec: Arc<dyn Codec<Vec<u8>>> = Arc::new(BytesCodec);
    let limit = engine.allocator().limit();

    let mut tx = engine.begin(false);
    tx.put(&codec, pagestore::PageId(0), vec![9u8; 4]).unwrap();
    tx.put(&codec, pagestore::PageId(1), vec![9u8; 4]).unwrap();
    tx.rollback();

    for page in 0..limit {
        assert!(!engine.allocator().is_allocated(pagestore::PageId(page)));
    }
}

#[tokio::test]
async fn read_write_slice_copies_pre_commit_bytes_then_diverges() {
    let (engine, _dir) = open_engine();

    let mut seed = engine.begin(false);
    {
        let mut slice = seed.slice(SliceMode::Write, pagestore::PageId(2), 2).unwrap();
        slice.bytes_mut().copy_from_slice(&[7u8; 32]);
        seed.unslice(slice).unwrap();
    }
    seed.commit().await.unwrap();

    let mut tx = engine.begin(false);
    let mut rw = tx.slice(SliceMode::ReadWrite, pagestore::PageId(2), 2).unwrap();
    assert_eq!(rw.bytes(), &[7u8; 32], "ReadWrite slice must start with the snapshot's bytes");
    rw.bytes_mut()[..4].copy_from_slice(&[9u8; 4]);
    tx.unslice(rw).unwrap();
    tx.commit().await.unwrap();

    let mut reader = engine.begin(true);
    let mut confirm = reader.slice(SliceMode::Read, pagestore::PageId(2), 2).unwrap();
    assert_eq!(&confirm.bytes()[..4], &[9u8; 4]);
    assert_eq!(&confirm.bytes()[4..], &[7u8; 28]);
    reader.unslice(confirm).unwrap();
}

#[tokio::test]
async fn write_slice_starts_zeroed_even_over_existing_data() {
    let (engine, _dir) = open_engine();

    let mut seed = engine.begin(false);
    {
        let mut slice = seed.slice(SliceMode::Write, pagestore::PageId(4), 1).unwrap();
        slice.bytes_mut().copy_from_slice(&[5u8; 16]);
        seed.unslice(slice).unwrap();
    }
    seed.commit().await.unwrap();

    let mut tx = engine.begin(false);
    let write_only = tx.slice(SliceMode::Write, pagestore::PageId(4), 1).unwrap();
    assert_eq!(write_only.bytes(), &[0u8; 16], "Write mode must not copy in prior content");
    tx.unslice(write_only).unwrap();
    tx.rollback();
}

#[tokio::test]
async fn read_your_writes_before_commit() {
    let (engine, _dir) = open_engine();
    let codec: Arc<dyn Codec<Vec<u8>>> = Arc::new(BytesCodec);

    let mut tx = engine.begin(false);
    tx.put(&codec, pagestore::PageId(7), vec![42u8; 4]).unwrap();
    let seen = tx.get(&codec, pagestore::PageId(7)).unwrap();
    assert_eq!(seen, vec![42u8; 4]);
    tx.rollback();
}
