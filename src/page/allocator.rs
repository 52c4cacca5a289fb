use crate::error::{Result, StorageError};
use crate::page::PageId;
use std::sync::Mutex;

/// Assigns and frees fixed-size page ids from a backing-file extent.
///
/// The representation is deliberately the simplest thing that satisfies the
/// contract (spec leaves the bitmap representation free): a flat `Vec<bool>`
/// behind a mutex, scanned linearly for contiguous runs. Readers never touch
/// the allocator directly — only transactions and the paged engine do, and
/// both already serialize through other means — but the mutex lets
/// `is_allocated`/`limit` be queried from any thread without extra plumbing.
pub struct PageAllocator {
    inner: Mutex<AllocatorState>,
}

struct AllocatorState {
    allocated: Vec<bool>,
    limit: u32,
}

impl PageAllocator {
    /// Creates an allocator over `limit` pages, all initially free.
    pub fn new(limit: u32) -> Self {
        PageAllocator {
            inner: Mutex::new(AllocatorState {
                allocated: vec![false; limit as usize],
                limit,
            }),
        }
    }

    pub fn limit(&self) -> u32 {
        self.inner.lock().unwrap().limit
    }

    pub fn is_allocated(&self, page: PageId) -> bool {
        let state = self.inner.lock().unwrap();
        state
            .allocated
            .get(page.0 as usize)
            .copied()
            .unwrap_or(false)
    }

    /// Allocates `count` contiguous pages, returning the first id.
    ///
    /// Fails with `OutOfSpace` when no contiguous free extent of the
    /// requested length exists anywhere below `limit`.
    pub fn alloc(&self, count: u32) -> Result<PageId> {
        if count == 0 {
            return Ok(PageId(0));
        }

        let mut state = self.inner.lock().unwrap();
        let limit = state.limit;
        let run = find_free_run(&state.allocated, count);

        let Some(start) = run else {
            return Err(StorageError::OutOfSpace {
                requested: count,
                limit,
            });
        };

        for slot in state.allocated[start as usize..(start + count) as usize].iter_mut() {
            *slot = true;
        }

        tracing::trace!(start, count, "allocated page extent");
        Ok(PageId(start))
    }

    /// Frees `count` pages starting at `page`.
    ///
    /// Freeing a page that is not currently allocated is a contract
    /// violation; in debug builds this panics, in release builds it is
    /// undefined (the caller is trusted not to double-free).
    pub fn free(&self, page: PageId, count: u32) {
        if count == 0 {
            return;
        }
        let mut state = self.inner.lock().unwrap();
        let start = page.0 as usize;
        let end = start + count as usize;
        debug_assert!(
            state.allocated[start..end].iter().all(|&b| b),
            "double free of page extent starting at {page}"
        );
        for slot in state.allocated[start..end].iter_mut() {
            *slot = false;
        }
        tracing::trace!(page = %page, count, "freed page extent");
    }
}

fn find_free_run(allocated: &[bool], count: u32) -> Option<u32> {
    let count = count as usize;
    let mut run_start = 0usize;
    let mut run_len = 0usize;

    for (i, &used) in allocated.iter().enumerate() {
        if used {
            run_len = 0;
        } else {
            if run_len == 0 {
                run_start = i;
            }
            run_len += 1;
            if run_len == count {
                return Some(run_start as u32);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_full_capacity_succeeds_once() {
        let alloc = PageAllocator::new(4);
        let first = alloc.alloc(4).unwrap();
        assert_eq!(first, PageId(0));
        assert!(alloc.alloc(1).is_err());
    }

    #[test]
    fn alloc_beyond_limit_fails_out_of_space() {
        let alloc = PageAllocator::new(4);
        let err = alloc.alloc(5).unwrap_err();
        assert!(matches!(err, StorageError::OutOfSpace { requested: 5, limit: 4 }));
    }

    #[test]
    fn free_then_realloc_reuses_pages() {
        let alloc = PageAllocator::new(4);
        let a = alloc.alloc(2).unwrap();
        let b = alloc.alloc(2).unwrap();
        assert_eq!(a, PageId(0));
        assert_eq!(b, PageId(2));
        alloc.free(a, 2);
        let c = alloc.alloc(2).unwrap();
        assert_eq!(c, PageId(0));
    }

    #[test]
    fn is_allocated_reflects_state() {
        let alloc = PageAllocator::new(2);
        assert!(!alloc.is_allocated(PageId(0)));
        alloc.alloc(1).unwrap();
        assert!(alloc.is_allocated(PageId(0)));
        assert!(!alloc.is_allocated(PageId(1)));
    }
}
