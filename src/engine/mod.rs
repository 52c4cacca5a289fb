//! The paged engine: snapshot isolation (component D), transactions
//! (component E), and the engine that ties file, allocator, and snapshot
//! manager together (component F).

mod paged_engine;
mod snapshot;
mod transaction;

pub use paged_engine::PagedEngine;
pub use snapshot::Snapshot;
pub use transaction::Transaction;
