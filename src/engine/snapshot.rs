//! Snapshot manager (component D): hands out immutable, reference-counted
//! read views of the paged state and gates reclamation of superseded
//! pages.
//!
//! A snapshot does not copy data. It freezes the *logical → physical page*
//! indirection table in effect at the moment it was opened; because commits
//! never overwrite a physical page a live snapshot can see (copy-on-write,
//! spec §4.E), the snapshot stays valid for as long as it's held just by
//! keeping that table alive.

use crate::codec::Codec;
use crate::error::Result;
use crate::page::{PageAllocator, PageFile, PageId, SliceMode};
use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Weak};

/// Logical → physical indirection in effect at one commit boundary.
type PageTable = Arc<HashMap<PageId, PageId>>;

struct Published {
    generation: u64,
    page_table: PageTable,
    /// Number of open snapshots per generation still referencing it.
    open_counts: BTreeMap<u64, u64>,
    /// Physical pages superseded by a commit, keyed by the generation that
    /// was current *before* that commit. Freed once no open snapshot has a
    /// generation at or below the key.
    pending_frees: BTreeMap<u64, Vec<PageId>>,
}

pub(crate) struct SnapshotManager {
    file: Arc<PageFile>,
    allocator: Arc<PageAllocator>,
    published: Mutex<Published>,
    /// Lets `open` hand a `Snapshot` an owned `Arc<SnapshotManager>` from a
    /// plain `&self` receiver — see `PagedEngine::self_ref` for why this
    /// can't just be `self: &Arc<Self>`.
    self_ref: Weak<SnapshotManager>,
}

impl SnapshotManager {
    pub fn new(file: Arc<PageFile>, allocator: Arc<PageAllocator>) -> Arc<Self> {
        Arc::new_cyclic(|weak| SnapshotManager {
            file,
            allocator,
            published: Mutex::new(Published {
                generation: 0,
                page_table: Arc::new(HashMap::new()),
                open_counts: BTreeMap::new(),
                pending_frees: BTreeMap::new(),
            }),
            self_ref: weak.clone(),
        })
    }

    /// Hands out the current published snapshot, incrementing its refcount.
    pub fn open(&self) -> Snapshot {
        let mut published = self.published.lock().unwrap();
        let generation = published.generation;
        let page_table = published.page_table.clone();
        *published.open_counts.entry(generation).or_insert(0) += 1;
        drop(published);

        tracing::trace!(generation, "opened snapshot");
        Snapshot {
            manager: self.self_ref.upgrade().expect("manager outlives its own snapshots"),
            generation,
            page_table,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn close(&self, generation: u64) {
        let mut published = self.published.lock().unwrap();
        if let Some(count) = published.open_counts.get_mut(&generation) {
            *count -= 1;
            if *count == 0 {
                published.open_counts.remove(&generation);
            }
        }

        let min_open = published.open_counts.keys().next().copied();
        let reclaimable: Vec<u64> = match min_open {
            None => published.pending_frees.keys().copied().collect(),
            Some(min) => published
                .pending_frees
                .range(..min)
                .map(|(&g, _)| g)
                .collect(),
        };

        for g in reclaimable {
            if let Some(pages) = published.pending_frees.remove(&g) {
                for page in pages {
                    self.allocator.free(page, 1);
                }
                tracing::debug!(reclaimed_as_of = g, "reclaimed superseded pages");
            }
        }
    }

    /// Publishes the result of a commit: for every `(logical, new_physical)`
    /// remap, install it in a fresh copy of the page table; for every freed
    /// logical page, drop its table entry so it stops resolving to
    /// pre-commit content. Either way the superseded physical page is
    /// scheduled for reclamation once quiescent.
    pub fn publish_commit(&self, remaps: &[(PageId, PageId)], frees: &[PageId]) {
        if remaps.is_empty() && frees.is_empty() {
            return;
        }

        let mut published = self.published.lock().unwrap();
        let old_generation = published.generation;
        let mut new_table = HashMap::clone(&published.page_table);
        let mut superseded = Vec::with_capacity(remaps.len() + frees.len());

        for &(logical, new_physical) in remaps {
            let old_physical = new_table.get(&logical).copied().unwrap_or(logical);
            superseded.push(old_physical);
            new_table.insert(logical, new_physical);
        }

        for &logical in frees {
            let old_physical = new_table.remove(&logical).unwrap_or(logical);
            superseded.push(old_physical);
        }

        published.page_table = Arc::new(new_table);
        published.generation += 1;
        published
            .pending_frees
            .entry(old_generation)
            .or_default()
            .extend(superseded);

        tracing::debug!(
            new_generation = published.generation,
            remapped = remaps.len(),
            freed = frees.len(),
            "published new snapshot"
        );
    }

    pub fn current_generation(&self) -> u64 {
        self.published.lock().unwrap().generation
    }
}

/// An immutable, reference-counted view of the paged state as of one commit
/// boundary.
pub struct Snapshot {
    manager: Arc<SnapshotManager>,
    generation: u64,
    page_table: PageTable,
    cache: Mutex<HashMap<(PageId, TypeId), Box<dyn Any + Send + Sync>>>,
}

impl Snapshot {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn resolve(&self, logical: PageId) -> PageId {
        self.page_table.get(&logical).copied().unwrap_or(logical)
    }

    pub fn read(&self, logical: PageId, buffer: &mut [u8]) -> Result<()> {
        self.manager.file.read(self.resolve(logical), buffer)
    }

    pub fn slice(&self, logical: PageId, count: u32) -> Result<crate::page::PageSlice> {
        self.manager
            .file
            .slice(SliceMode::Read, self.resolve(logical), count)
    }

    /// Returns the cached decoded value for `(codec type, page)`, decoding
    /// and caching on miss. Cache entries never outlive this snapshot.
    pub fn cache_load<T: Clone + Send + Sync + 'static>(
        &self,
        codec: &Arc<dyn Codec<T>>,
        logical: PageId,
    ) -> Result<T> {
        let key = (logical, TypeId::of::<T>());
        {
            let cache = self.cache.lock().unwrap();
            if let Some(cached) = cache.get(&key) {
                return Ok(cached.downcast_ref::<T>().unwrap().clone());
            }
        }

        let physical = self.resolve(logical);
        let mut buf = vec![0u8; self.manager.file.page_size() as usize];
        self.manager.file.read(physical, &mut buf)?;
        let value = codec.decode(&buf)?;

        self.cache
            .lock()
            .unwrap()
            .insert(key, Box::new(value.clone()));
        Ok(value)
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.manager.close(self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Arc<SnapshotManager> {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let file = Arc::new(PageFile::open(tmp.path(), 16).unwrap());
        let alloc = Arc::new(PageAllocator::new(64));
        SnapshotManager::new(file, alloc)
    }

    #[test]
    fn fresh_snapshot_reads_identity_mapped_pages() {
        let mgr = manager();
        mgr.file.write(PageId(3), &[9u8; 16]).unwrap();
        let snap = mgr.open();
        let mut buf = [0u8; 16];
        snap.read(PageId(3), &mut buf).unwrap();
        assert_eq!(buf, [9u8; 16]);
    }

    #[test]
    fn old_snapshot_unaffected_by_later_publish() {
        let mgr = manager();
        mgr.file.write(PageId(0), &[1u8; 16]).unwrap();
        let before = mgr.open();

        mgr.file.write(PageId(10), &[2u8; 16]).unwrap();
        mgr.publish_commit(&[(PageId(0), PageId(10))], &[]);

        let after = mgr.open();

        let mut buf = [0u8; 16];
        before.read(PageId(0), &mut buf).unwrap();
        assert_eq!(buf, [1u8; 16], "old snapshot must see pre-commit bytes");

        after.read(PageId(0), &mut buf).unwrap();
        assert_eq!(buf, [2u8; 16], "new snapshot must see post-commit bytes");
    }

    #[test]
    fn reclamation_waits_for_old_snapshot_to_close() {
        let mgr = manager();
        mgr.file.write(PageId(0), &[1u8; 16]).unwrap();
        let before = mgr.open();
        mgr.file.write(PageId(10), &[2u8; 16]).unwrap();
        mgr.publish_commit(&[(PageId(0), PageId(10))], &[]);

        assert!(
            mgr.published
                .lock()
                .unwrap()
                .pending_frees
                .values()
                .any(|v| v.contains(&PageId(0))),
            "page 0 should be pending reclamation while `before` is open"
        );

        drop(before);

        assert!(
            mgr.published
                .lock()
                .unwrap()
                .pending_frees
                .is_empty(),
            "page 0 should be reclaimed once the old snapshot closes"
        );
    }
}
