//! sandgrid-state — the Task Store of a sandgrid server.
//!
//! Backed by [redb](https://docs.rs/redb): tasks with their assignment
//! bookkeeping, results, and content-addressed blobs. Dequeue runs the
//! shared bin-packing allocator inside a single write transaction.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async handlers.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{DEFAULT_DEQUEUE_WINDOW, StateStore, blob_reference};
pub use types::{QueueStats, TaskRecord, unix_now};
