//! Transaction (component E): a private update map over the paged engine,
//! with copy-on-write allocation on first write and deferred object
//! caching. A transaction is single-threaded by contract — nothing here
//! is `Sync`, and callers must not share one across threads.

use crate::codec::Codec;
use crate::engine::paged_engine::PagedEngine;
use crate::engine::snapshot::Snapshot;
use crate::error::{Result, StorageError};
use crate::page::{PageId, PageSlice, SliceMode};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// Per-transaction state of one logical page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpdateState {
    /// Freed within this transaction; durable release happens at commit.
    Freed,
    /// Allocated fresh within this transaction; no prior content to keep.
    Allocated,
    /// Pre-existing page whose new content lives at the wrapped physical id.
    Remapped(PageId),
}

struct DeferredEntry {
    value: Box<dyn Any + Send + Sync>,
    encode: Box<dyn Fn(&(dyn Any + Send + Sync)) -> Vec<u8> + Send + Sync>,
}

impl DeferredEntry {
    fn new<T: Send + Sync + 'static>(codec: Arc<dyn Codec<T>>, value: T) -> Self {
        DeferredEntry {
            value: Box::new(value),
            encode: Box::new(move |v| codec.encode(v.downcast_ref::<T>().unwrap())),
        }
    }

    fn downcast<T: Clone + 'static>(&self) -> T {
        self.value.downcast_ref::<T>().unwrap().clone()
    }

    fn encode(&self) -> Vec<u8> {
        (self.encode)(&*self.value)
    }
}

/// The per-transaction update map (entries) plus the deferred-update cache
/// (buffered typed values awaiting encode-on-commit).
pub(crate) struct UpdateMap {
    pub entries: HashMap<PageId, UpdateState>,
    deferred: HashMap<PageId, DeferredEntry>,
}

impl UpdateMap {
    fn new() -> Self {
        UpdateMap {
            entries: HashMap::new(),
            deferred: HashMap::new(),
        }
    }

    pub(crate) fn deferred_targets(&self) -> impl Iterator<Item = (PageId, Vec<u8>)> + '_ {
        self.deferred.iter().map(|(&page, entry)| (page, entry.encode()))
    }
}

pub struct Transaction {
    engine: Arc<PagedEngine>,
    snapshot: Option<Snapshot>,
    update_map: Option<UpdateMap>,
}

impl Transaction {
    pub(crate) fn new(engine: Arc<PagedEngine>, read_only: bool) -> Self {
        Transaction {
            engine,
            snapshot: None,
            update_map: if read_only { None } else { Some(UpdateMap::new()) },
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.update_map.is_none()
    }

    pub fn page_size(&self) -> u32 {
        self.engine.page_size()
    }

    pub fn pages(&self, byte_len: u64) -> u32 {
        self.engine.pages(byte_len)
    }

    fn ensure_snapshot(&mut self) -> &Snapshot {
        if self.snapshot.is_none() {
            self.snapshot = Some(self.engine.open_snapshot());
        }
        self.snapshot.as_ref().unwrap()
    }

    pub fn snapshot(&mut self) -> &Snapshot {
        self.ensure_snapshot()
    }

    fn local_state(&self, page: PageId) -> Option<UpdateState> {
        self.update_map.as_ref()?.entries.get(&page).copied()
    }

    /// Typed read: buffered value if present, else the snapshot's cached
    /// load. Fails with `Paging` if the page is locally `Freed`.
    pub fn get<T: Clone + Send + Sync + 'static>(
        &mut self,
        codec: &Arc<dyn Codec<T>>,
        page: PageId,
    ) -> Result<T> {
        match self.local_state(page) {
            Some(UpdateState::Freed) => return Err(StorageError::paging(page, "read of freed page")),
            Some(UpdateState::Remapped(new)) => {
                if let Some(entry) = self.update_map.as_ref().unwrap().deferred.get(&new) {
                    return Ok(entry.downcast());
                }
                let mut buf = vec![0u8; self.page_size() as usize];
                self.engine.read_physical(new, &mut buf)?;
                return codec.decode(&buf);
            }
            Some(UpdateState::Allocated) => {
                if let Some(entry) = self.update_map.as_ref().unwrap().deferred.get(&page) {
                    return Ok(entry.downcast());
                }
                let mut buf = vec![0u8; self.page_size() as usize];
                self.engine.read_physical(page, &mut buf)?;
                return codec.decode(&buf);
            }
            None => {}
        }

        let snap = self.ensure_snapshot();
        snap.cache_load(codec, page)
    }

    /// Typed upsert. See spec §4.E for the per-state rules.
    pub fn put<T: Send + Sync + 'static>(
        &mut self,
        codec: &Arc<dyn Codec<T>>,
        page: PageId,
        value: T,
    ) -> Result<()> {
        let state = self.local_state(page);
        let map = self.update_map.as_mut().expect("put on a read-only transaction");

        match state {
            Some(UpdateState::Freed) => Err(StorageError::paging(page, "put on freed page")),
            Some(UpdateState::Allocated) => {
                map.deferred.insert(page, DeferredEntry::new(codec.clone(), value));
                Ok(())
            }
            Some(UpdateState::Remapped(new)) => {
                if map.deferred.contains_key(&new) {
                    map.deferred.insert(new, DeferredEntry::new(codec.clone(), value));
                    Ok(())
                } else {
                    Err(StorageError::paging(
                        page,
                        "cannot mix cached and raw updates to the same page",
                    ))
                }
            }
            None => {
                let new = self.engine.allocator().alloc(1)?;
                map.entries.insert(page, UpdateState::Remapped(new));
                map.deferred.insert(new, DeferredEntry::new(codec.clone(), value));
                Ok(())
            }
        }
    }

    /// Delegates to the codec, which schedules the appropriate updates
    /// (including freeing any auxiliary pages it owns).
    pub fn remove<T: 'static>(&mut self, codec: &Arc<dyn Codec<T>>, page: PageId) -> Result<()> {
        codec.remove(self, page)
    }

    /// Frees `page` within this transaction's update map. Used by codecs
    /// (via the default `Codec::remove`) rather than called directly by
    /// most callers.
    pub(crate) fn free_page(&mut self, page: PageId) -> Result<()> {
        let state = self.local_state(page);
        let map = self.update_map.as_mut().expect("free on a read-only transaction");

        match state {
            Some(UpdateState::Allocated) => {
                self.engine.allocator().free(page, 1);
                map.entries.remove(&page);
                map.deferred.remove(&page);
            }
            Some(UpdateState::Remapped(new)) => {
                self.engine.allocator().free(new, 1);
                map.deferred.remove(&new);
                map.entries.insert(page, UpdateState::Freed);
            }
            Some(UpdateState::Freed) => {}
            None => {
                map.entries.insert(page, UpdateState::Freed);
            }
        }
        Ok(())
    }

    /// Not supported at the transaction-allocator layer: once a page is
    /// freed within this transaction there is no way back to `Remapped`
    /// short of a fresh `put`/`write`.
    pub fn unfree(&mut self, _page: PageId, _count: u32) -> Result<()> {
        Err(StorageError::Unsupported("unfree"))
    }

    /// Not supported at the transaction-allocator layer: a transaction has
    /// no bulk-reset primitive over its own update map.
    pub fn clear(&mut self) -> Result<()> {
        Err(StorageError::Unsupported("clear"))
    }

    pub fn read(&mut self, page: PageId, buffer: &mut [u8]) -> Result<()> {
        match self.local_state(page) {
            Some(UpdateState::Remapped(new)) => return self.engine.read_physical(new, buffer),
            Some(UpdateState::Freed) => return Err(StorageError::paging(page, "read of freed page")),
            Some(UpdateState::Allocated) => {
                return Err(StorageError::paging(page, "raw read of freshly allocated page"));
            }
            None => {}
        }
        self.ensure_snapshot().read(page, buffer)
    }

    pub fn write(&mut self, page: PageId, buffer: &[u8]) -> Result<()> {
        let state = self.local_state(page);
        let target = {
            let map = self.update_map.as_mut().expect("write on a read-only transaction");
            match state {
                Some(UpdateState::Freed) => return Err(StorageError::paging(page, "write of freed page")),
                Some(UpdateState::Allocated) => {
                    if map.deferred.contains_key(&page) {
                        return Err(StorageError::paging(
                            page,
                            "cannot mix cached and raw updates to the same page",
                        ));
                    }
                    page
                }
                Some(UpdateState::Remapped(new)) => {
                    if map.deferred.contains_key(&new) {
                        return Err(StorageError::paging(
                            page,
                            "cannot mix cached and raw updates to the same page",
                        ));
                    }
                    new
                }
                None => {
                    let new = self.engine.allocator().alloc(1)?;
                    map.entries.insert(page, UpdateState::Remapped(new));
                    new
                }
            }
        };
        self.engine.write_physical(target, buffer)
    }

    pub fn slice(&mut self, mode: SliceMode, page: PageId, count: u32) -> Result<PageSlice> {
        match mode {
            SliceMode::Read => {
                match self.local_state(page) {
                    Some(UpdateState::Remapped(new)) => return self.engine.slice_physical(SliceMode::Read, new, count),
                    Some(UpdateState::Freed) | Some(UpdateState::Allocated) => {
                        return Err(StorageError::paging(page, "read slice of freed/allocated page"));
                    }
                    None => {}
                }
                self.ensure_snapshot().slice(page, count)
            }
            SliceMode::ReadWrite | SliceMode::Write => {
                match self.local_state(page) {
                    Some(UpdateState::Freed) => Err(StorageError::paging(page, "slice of freed page")),
                    Some(UpdateState::Allocated) => self.engine.slice_physical(mode, page, count),
                    Some(UpdateState::Remapped(new)) => self.engine.slice_physical(mode, new, count),
                    None => {
                        let new = self.engine.allocator().alloc(count)?;
                        {
                            let map = self.update_map.as_mut().unwrap();
                            for i in 0..count {
                                map.entries.insert(page.offset(i), UpdateState::Allocated);
                            }
                            map.entries.insert(page, UpdateState::Remapped(new));
                        }
                        if mode == SliceMode::ReadWrite {
                            self.ensure_snapshot();
                            let src = self.snapshot.as_ref().unwrap().slice(page, count)?;
                            let mut dst = self.engine.slice_physical(SliceMode::Write, new, count)?;
                            dst.bytes_mut().copy_from_slice(src.bytes());
                            self.engine.unslice_physical(src)?;
                            self.engine.unslice_physical(dst)?;
                        }
                        self.engine.slice_physical(mode, new, count)
                    }
                }
            }
        }
    }

    pub fn unslice(&mut self, slice: PageSlice) -> Result<()> {
        self.engine.unslice_physical(slice)
    }

    /// Hands `(updates, deferredUpdates)` to the paged engine. On any
    /// failure, frees every page this transaction allocated before
    /// re-raising; always closes the snapshot and clears local state.
    pub async fn commit(mut self) -> Result<()> {
        let snapshot = self.snapshot.take();
        let result = match self.update_map.take() {
            None => Ok(()),
            Some(update_map) => match self.engine.commit(&update_map).await {
                Ok(()) => Ok(()),
                Err(err) => {
                    free_allocated_pages(&self.engine, &update_map);
                    Err(err)
                }
            },
        };
        drop(snapshot);
        result
    }

    /// Frees every locally allocated/remapped page; closes the snapshot;
    /// clears local state. No leak on the failure path.
    pub fn rollback(mut self) {
        if let Some(update_map) = self.update_map.take() {
            free_allocated_pages(&self.engine, &update_map);
        }
        self.snapshot.take();
    }
}

/// Walks the update map; `Freed` entries are skipped (they reference
/// durable pages whose release happens only at commit); every allocated or
/// remapped page returns its scratch physical page to the allocator.
fn free_allocated_pages(engine: &PagedEngine, map: &UpdateMap) {
    for (&key, state) in map.entries.iter() {
        match state {
            UpdateState::Freed => continue,
            UpdateState::Allocated => engine.allocator().free(key, 1),
            UpdateState::Remapped(new) => engine.allocator().free(*new, 1),
        }
    }
}

pub(crate) fn remap_entries(map: &UpdateMap) -> Vec<(PageId, PageId)> {
    map.entries
        .iter()
        .filter_map(|(&logical, state)| match state {
            UpdateState::Remapped(new) => Some((logical, *new)),
            _ => None,
        })
        .collect()
}

/// Logical pages durably removed by this transaction. `commit` must clear
/// these from the published page table and reclaim whatever physical page
/// they used to resolve to, the same way it installs `remap_entries`.
pub(crate) fn freed_entries(map: &UpdateMap) -> Vec<PageId> {
    map.entries
        .iter()
        .filter_map(|(&logical, state)| match state {
            UpdateState::Freed => Some(logical),
            _ => None,
        })
        .collect()
}

pub(crate) fn deferred_writes(map: &UpdateMap) -> impl Iterator<Item = (PageId, Vec<u8>)> + '_ {
    map.deferred_targets()
}
