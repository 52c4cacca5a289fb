//! Transactional paged storage core with copy-on-write snapshot isolation
//! and an asynchronous unit-of-work pipeline for broker-level message and
//! queue persistence.
//!
//! Three layers, bottom to top:
//! - [`page`]: fixed-size page allocation and raw file I/O.
//! - [`engine`]: snapshot isolation, the per-transaction update map, and
//!   atomic commit.
//! - [`uow`]: the single-writer coordinator and flush worker that batch
//!   and cancel broker actions before they reach a transaction.
//!
//! [`store::Store`] composes all three into the broker-facing API.

pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod page;
pub mod store;
pub mod uow;

pub use codec::{Codec, CodecRegistry};
pub use config::Config;
pub use engine::{PagedEngine, Snapshot, Transaction};
pub use error::{Result, StorageError};
pub use page::{PageAllocator, PageFile, PageId, PageSlice, SliceMode};
pub use store::Store;
