//! Object codec registry (component C): marshals typed values to and from
//! pages on behalf of the transaction.
//!
//! Codecs are pure with respect to a transaction: every side effect runs
//! through the transaction's own page operations (`read`/`write`/`free`), so
//! commit atomicity stays solely the transaction's concern (spec §4.C).

use crate::engine::Transaction;
use crate::error::Result;
use crate::page::PageId;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// A codec for type `T`. `encode`/`decode` are the pure byte-level
/// conversion used for deferred updates (buffered in memory, encoded only
/// at commit); `load`/`store`/`remove` are the transaction-facing
/// operations and have sensible defaults built from `encode`/`decode` for
/// codecs whose values fit in a single page.
pub trait Codec<T>: Send + Sync {
    fn encode(&self, value: &T) -> Vec<u8>;
    fn decode(&self, bytes: &[u8]) -> Result<T>;

    fn load(&self, tx: &mut Transaction, page: PageId) -> Result<T> {
        let mut buf = vec![0u8; tx.page_size() as usize];
        tx.read(page, &mut buf)?;
        self.decode(&buf)
    }

    /// Immediate encode-then-write. Bypasses the deferred-update cache
    /// (spec §4.E) since a plain `&self` codec has no owned `Arc` to hand
    /// the update map; callers that want deferred, encode-at-commit-only
    /// buffering should call [`Transaction::put`] directly with an
    /// `Arc<dyn Codec<T>>` (e.g. one fetched from a [`CodecRegistry`]).
    fn store(&self, tx: &mut Transaction, page: PageId, value: T) -> Result<()> {
        let bytes = self.encode(&value);
        tx.write(page, &bytes)
    }

    /// Frees `page` and any auxiliary pages this value owns. The default
    /// assumes a single-page value; composite codecs override this to walk
    /// and free their own chain of pages first.
    fn remove(&self, tx: &mut Transaction, page: PageId) -> Result<()> {
        tx.free_page(page)
    }
}

/// Holds one codec instance per registered type, looked up by `TypeId`.
///
/// Mirrors the teacher's `dyn Page` downcast trick (`engine/pages/mod.rs`)
/// but through the registry rather than a trait object method, since
/// codecs here are generic over the value type rather than over a page
/// struct.
#[derive(Default)]
pub struct CodecRegistry {
    codecs: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        CodecRegistry {
            codecs: HashMap::new(),
        }
    }

    pub fn register<T: 'static>(&mut self, codec: Arc<dyn Codec<T>>) {
        self.codecs.insert(TypeId::of::<T>(), Box::new(codec));
    }

    pub fn get<T: 'static>(&self) -> Option<Arc<dyn Codec<T>>> {
        self.codecs
            .get(&TypeId::of::<T>())
            .map(|b| b.downcast_ref::<Arc<dyn Codec<T>>>().unwrap().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct U32Codec;
    impl Codec<u32> for U32Codec {
        fn encode(&self, value: &u32) -> Vec<u8> {
            value.to_le_bytes().to_vec()
        }
        fn decode(&self, bytes: &[u8]) -> Result<u32> {
            Ok(u32::from_le_bytes(bytes[..4].try_into().unwrap()))
        }
    }

    #[test]
    fn round_trip_encode_decode() {
        let codec = U32Codec;
        let bytes = codec.encode(&42);
        assert_eq!(codec.decode(&bytes).unwrap(), 42);
    }

    #[test]
    fn registry_round_trips_by_type() {
        let mut registry = CodecRegistry::new();
        registry.register::<u32>(Arc::new(U32Codec));
        let codec = registry.get::<u32>().unwrap();
        assert_eq!(codec.decode(&codec.encode(&7)).unwrap(), 7);
        assert!(registry.get::<u64>().is_none());
    }
}
