//! redb table definitions for the task store.
//!
//! Task, result and blob tables use `&str` keys and JSON or raw byte values.
//! `QUEUE` indexes unassigned tasks by creation sequence, so the oldest
//! pending tasks are a prefix scan.

use redb::TableDefinition;

/// Task records keyed by task id.
pub const TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks");

/// Unassigned tasks: creation sequence → task id.
pub const QUEUE: TableDefinition<u64, &str> = TableDefinition::new("queue");

/// Results keyed by task id.
pub const RESULTS: TableDefinition<&str, &[u8]> = TableDefinition::new("results");

/// Raw file contents keyed by hex sha256.
pub const BLOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("blobs");

/// Counters.
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Key of the creation sequence counter in `META`.
pub const SEQUENCE_KEY: &str = "sequence";
