//! Error taxonomy for the paged storage core.
//!
//! Kept deliberately small and matchable: callers branch on the kind of
//! failure (roll back vs. propagate vs. contract violation), not on a
//! message string.

use crate::page::PageId;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The allocator has no contiguous extent of the requested length.
    #[error("out of space: no extent of {requested} page(s) available (limit {limit})")]
    OutOfSpace { requested: u32, limit: u32 },

    /// A contract violation against a transaction's update map: reading or
    /// writing a page marked `Freed`, or mixing cached and raw updates to
    /// the same page. Non-recoverable within the transaction.
    #[error("paging error on page {page:?}: {reason}")]
    Paging { page: PageId, reason: &'static str },

    /// Underlying page-file I/O failure.
    #[error("page file I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Requested an operation the transaction-scoped allocator deliberately
    /// does not implement (`unfree`, `clear`).
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

impl StorageError {
    pub(crate) fn paging(page: PageId, reason: &'static str) -> Self {
        StorageError::Paging { page, reason }
    }
}
