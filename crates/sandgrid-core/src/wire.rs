//! Bodies of the Task Store HTTP API shared by server and foreman.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::limits::ResourceLimits;
use crate::task::Task;

fn default_concurrency() -> usize {
    1
}

/// `POST /queue/dequeue/`: the free capacity of the calling machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DequeueRequest {
    /// How many more tasks the caller may start.
    #[serde(alias = "concurency", default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

/// Tasks handed out by a dequeue, each carrying its granted limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DequeueResponse {
    #[serde(default)]
    pub tasks: Vec<Task>,
}

/// `POST /task/` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submitted {
    pub id: String,
}

/// `POST /blob/` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Uploaded {
    pub reference: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dequeue_request_accepts_suffixed_limits() {
        let req: DequeueRequest = serde_json::from_str(
            r#"{"concurrency":2,"limits":{"cpus":4,"memory":"8g"},"tags":["gpu"]}"#,
        )
        .unwrap();
        assert_eq!(req.concurrency, 2);
        assert_eq!(req.limits.memory, Some(8 << 30));
        assert!(req.tags.contains("gpu"));
    }

    #[test]
    fn legacy_concurrency_spelling() {
        let req: DequeueRequest = serde_json::from_str(r#"{"concurency":3}"#).unwrap();
        assert_eq!(req.concurrency, 3);
        assert!(req.tags.is_empty());
    }

    #[test]
    fn missing_concurrency_means_one() {
        let req: DequeueRequest = serde_json::from_str(r#"{"limits":{"cpus":2}}"#).unwrap();
        assert_eq!(req.concurrency, 1);
        let req: DequeueRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(req.concurrency, 1);
    }

    #[test]
    fn empty_dequeue_response_parses() {
        let resp: DequeueResponse = serde_json::from_str(r#"{"status":"OK"}"#).unwrap();
        assert!(resp.tasks.is_empty());
    }
}
