//! The UOW pipeline: broker-facing unit-of-work types (component types),
//! the single-writer coordinator (component G), and the flush worker
//! (component H).

pub mod pipeline;
pub mod types;
pub(crate) mod worker;

pub use pipeline::{UowHandle, UowPipeline};
pub use types::{MessageKey, MessageRecord, QueueEntryRecord, QueueIndex, QueueKey, UowState};
