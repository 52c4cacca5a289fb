//! Property-based invariants (spec §8, invariants 1, 2, 6, 7).

use pagestore::codec::Codec;
use pagestore::page::{PageAllocator, PageId};
use pagestore::{Config, PagedEngine, Result};
use proptest::prelude::*;
use std::sync::Arc;
use tempfile::TempDir;

struct U64Codec;

impl Codec<u64> for U64Codec {
    fn encode(&self, value: &u64) -> Vec<u8> {
        value.to_le_bytes().to_vec()
    }
    fn decode(&self, bytes: &[u8]) -> Result<u64> {
        Ok(u64::from_le_bytes(bytes[..8].try_into().unwrap()))
    }
}

fn open_engine() -> (Arc<PagedEngine>, TempDir) {
    let dir = TempDir::new().unwrap();
    let engine = PagedEngine::open(dir.path().join("db"), 32, 512).unwrap();
    (engine, dir)
}

proptest! {
    /// Invariant 7: round-trip — decoding the encoding of any value under
    /// a codec returns that value.
    #[test]
    fn codec_round_trip(value: u64) {
        let codec = U64Codec;
        prop_assert_eq!(codec.decode(&codec.encode(&value)).unwrap(), value);
    }

    /// Invariant 2: a rolled-back transaction leaves the allocator's free
    /// set bitwise identical to the pre-transaction state.
    #[test]
    fn rollback_restores_allocator_state(pages in proptest::collection::vec(0u32..64, 0..8)) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            let (engine, _dir) = open_engine();
            let codec: Arc<dyn Codec<u64>> = Arc::new(U64Codec);

            let before: Vec<bool> = (0..engine.allocator().limit())
                .map(|p| engine.allocator().is_allocated(PageId(p)))
                .collect();

            let mut tx = engine.begin(false);
            for &p in &pages {
                let _ = tx.put(&codec, PageId(p), p as u64);
            }
            tx.rollback();

            let after: Vec<bool> = (0..engine.allocator().limit())
                .map(|p| engine.allocator().is_allocated(PageId(p)))
                .collect();
            prop_assert_eq!(before, after);
            Ok(())
        })?;
    }

    /// Invariant 6: read-your-writes — a put is visible to a get in the
    /// same (uncommitted) transaction.
    #[test]
    fn read_your_writes(page in 0u32..32, value: u64) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            let (engine, _dir) = open_engine();
            let codec: Arc<dyn Codec<u64>> = Arc::new(U64Codec);

            let mut tx = engine.begin(false);
            tx.put(&codec, PageId(page), value).unwrap();
            prop_assert_eq!(tx.get(&codec, PageId(page)).unwrap(), value);
            tx.rollback();
            Ok(())
        })?;
    }
}

#[test]
fn allocator_alloc_at_exact_limit_then_over_limit_fails() {
    let alloc = PageAllocator::new(8);
    assert!(alloc.alloc(8).is_ok());
    let over = PageAllocator::new(8);
    assert!(over.alloc(9).is_err());
}
