//! Paged engine (component F): owns the backing file, the allocator, and
//! the snapshot manager, and is the sole writer of committed state.
//!
//! `commit` is the only place a transaction's update map becomes durable.
//! The ordering in spec §4.F matters: every deferred value is encoded and
//! written to its physical page *before* the new page table is published,
//! so a reader that observes the new generation can never see a remap
//! target that isn't fully written yet.

use crate::engine::snapshot::{Snapshot, SnapshotManager};
use crate::engine::transaction::{deferred_writes, freed_entries, remap_entries, Transaction, UpdateMap};
use crate::error::Result;
use crate::page::{PageAllocator, PageFile, PageId, PageSlice, SliceMode};
use std::path::Path;
use std::sync::{Arc, Weak};

pub struct PagedEngine {
    file: Arc<PageFile>,
    allocator: Arc<PageAllocator>,
    snapshots: Arc<SnapshotManager>,
    /// Lets `begin` hand transactions an owned `Arc<PagedEngine>` from a
    /// plain `&self` receiver, since `self: &Arc<Self>` isn't a legal
    /// receiver type — populated once at construction via `Arc::new_cyclic`.
    self_ref: Weak<PagedEngine>,
}

impl PagedEngine {
    pub fn open(path: impl AsRef<Path>, page_size: u32, page_limit: u32) -> Result<Arc<Self>> {
        let file = Arc::new(PageFile::open(path, page_size)?);
        let allocator = Arc::new(PageAllocator::new(page_limit));
        let snapshots = SnapshotManager::new(file.clone(), allocator.clone());
        Ok(Arc::new_cyclic(|weak| PagedEngine {
            file,
            allocator,
            snapshots,
            self_ref: weak.clone(),
        }))
    }

    pub fn page_size(&self) -> u32 {
        self.file.page_size()
    }

    pub fn pages(&self, byte_len: u64) -> u32 {
        self.file.pages(byte_len)
    }

    pub fn allocator(&self) -> &PageAllocator {
        &self.allocator
    }

    pub fn open_snapshot(&self) -> Snapshot {
        self.snapshots.open()
    }

    pub fn current_generation(&self) -> u64 {
        self.snapshots.current_generation()
    }

    pub fn begin(&self, read_only: bool) -> Transaction {
        let engine = self.self_ref.upgrade().expect("engine outlives its own transactions");
        Transaction::new(engine, read_only)
    }

    pub(crate) fn read_physical(&self, page: PageId, buffer: &mut [u8]) -> Result<()> {
        self.file.read(page, buffer)
    }

    pub(crate) fn write_physical(&self, page: PageId, buffer: &[u8]) -> Result<()> {
        self.file.write(page, buffer)
    }

    pub(crate) fn slice_physical(&self, mode: SliceMode, page: PageId, count: u32) -> Result<PageSlice> {
        self.file.slice(mode, page, count)
    }

    pub(crate) fn unslice_physical(&self, slice: PageSlice) -> Result<()> {
        self.file.unslice(slice)
    }

    /// Commits `update_map`: encode and write every deferred value to its
    /// physical page, then publish the new logical → physical table in one
    /// atomic step. Reclamation of superseded pages is scheduled as part of
    /// that publish (spec §4.D) and completes once no older snapshot is
    /// still open. Freed logical pages are published alongside remaps so a
    /// removed page stops resolving to its pre-commit content.
    pub(crate) async fn commit(&self, update_map: &UpdateMap) -> Result<()> {
        let page_size = self.file.page_size() as usize;
        for (page, mut bytes) in deferred_writes(update_map) {
            debug_assert!(bytes.len() <= page_size, "codec produced an oversized page for {page}");
            bytes.resize(page_size, 0);
            self.file.write(page, &bytes)?;
        }

        let remaps = remap_entries(update_map);
        let frees = freed_entries(update_map);
        self.snapshots.publish_commit(&remaps, &frees);

        tracing::debug!(
            remapped = remaps.len(),
            freed = frees.len(),
            generation = self.snapshots.current_generation(),
            "committed transaction"
        );
        Ok(())
    }
}
