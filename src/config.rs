//! Enumerated configuration options (spec §6 "Configuration").

use std::path::PathBuf;

/// Default page size used when a database is created fresh. Page size is
/// fixed for the lifetime of a database once chosen.
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// Default number of pages the allocator is willing to hand out. Kept small
/// so tests and examples don't pre-allocate a large sparse file.
pub const DEFAULT_PAGE_LIMIT: u32 = 1 << 20;

#[derive(Debug, Clone)]
pub struct Config {
    /// Filesystem path for the backing page file. Required.
    pub directory: PathBuf,

    /// Upper bound, in milliseconds, a UOW may wait before flushing so that
    /// enqueue/dequeue cancellation has a chance to happen. A negative value
    /// disables delay entirely (every UOW flushes immediately).
    pub flush_delay_ms: i64,

    /// Advisory: the index factory is named in the spec's interface list
    /// but this core has no index subsystem of its own to hand it to; kept
    /// as an opaque string so callers can pass one through without the
    /// crate needing to understand it.
    pub index_factory: Option<String>,

    /// Advisory: fixed once the first page is allocated.
    pub page_size: u32,

    /// Total number of pages the allocator may hand out.
    pub page_limit: u32,
}

impl Config {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Config {
            directory: directory.into(),
            flush_delay_ms: 0,
            index_factory: None,
            page_size: DEFAULT_PAGE_SIZE,
            page_limit: DEFAULT_PAGE_LIMIT,
        }
    }

    pub fn with_flush_delay_ms(mut self, delay: i64) -> Self {
        self.flush_delay_ms = delay;
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_page_limit(mut self, limit: u32) -> Self {
        self.page_limit = limit;
        self
    }

    pub fn with_index_factory(mut self, factory: impl Into<String>) -> Self {
        self.index_factory = Some(factory.into());
        self
    }

    /// `true` when delay is disabled outright (`flush_delay_ms < 0`).
    pub fn disables_delay(&self) -> bool {
        self.flush_delay_ms < 0
    }
}
