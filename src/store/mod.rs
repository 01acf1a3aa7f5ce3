//! Dual storage layer for captured requests
//!
//! Both stores consume the same captured-request stream with different
//! tradeoffs:
//! - `PersistentStore`: durable SQLite log, pruned by age and row count
//! - `LiveStore`: ephemeral indexed ring buffer for the low-latency UI view

pub mod filter;
pub mod live;
pub mod persistent;

pub use filter::RecordFilter;
pub use live::LiveStore;
pub use persistent::{PersistentStore, RetentionPolicy};
