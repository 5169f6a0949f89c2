//! Read store for on-disk metadata artifacts.
//!
//! The metadata server persists its state as checkpoints plus transaction-log
//! segments, both immutable once written. This crate serves random-access
//! read requests against that file set: requests are partitioned across a
//! small pool of worker threads with sticky per-file affinity, descriptors
//! are closed after a period of inactivity, and a retention policy prunes
//! superseded checkpoints together with the log segments they obsolete.
//!
//! The store never writes the artifacts themselves; its only file-system
//! mutations are the deletions the retention policy calls for.

mod entry;
mod loader;
mod op;
mod store;

pub use loader::{load, read_log_segment_bounds};
pub use op::ReadMetaData;
pub use store::{MetaDataStore, StoreStats};
