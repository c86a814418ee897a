//! Persisted records of the task store.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use sandgrid_core::{ResourceLimits, Task};
use sandgrid_placement::Schedulable;
use serde::{Deserialize, Serialize};

/// A submitted task together with its queue bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task: Task,
    /// Position in submission order.
    pub sequence: u64,
    /// Unix timestamp (seconds) of submission.
    pub created_at: u64,
    /// Principal the task was handed to by the last dequeue.
    pub assignee: Option<String>,
    /// Unix timestamp (seconds) of the last assignment.
    pub assigned_at: Option<u64>,
    /// A result has been pushed.
    pub resolved: bool,
}

impl TaskRecord {
    pub fn id(&self) -> &str {
        self.task.id.as_deref().unwrap_or_default()
    }

    pub fn is_assigned(&self) -> bool {
        self.assignee.is_some()
    }
}

impl Schedulable for TaskRecord {
    fn limits(&self) -> &ResourceLimits {
        &self.task.limits
    }

    fn requires(&self) -> &[String] {
        &self.task.requires
    }

    fn exclusive(&self) -> bool {
        self.task.exclusive
    }

    fn image(&self) -> Option<&str> {
        self.task.image.as_deref()
    }
}

/// Queue counters as reported by `/queue/stats/`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub unassigned: usize,
    pub assigned: usize,
    /// Unresolved assigned tasks per assignee.
    pub assignees: BTreeMap<String, usize>,
}

/// Current Unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
