//! Wire format of the observer control socket.
//!
//! One JSON object per line in each direction:
//!
//! ```text
//!   → {"command":"limits","session_id":"…","secret":"…","limits":{"memory":"512m"}}
//!   ← {"status":"OK"}
//! ```

use sandgrid_core::{ResourceLimits, ResourceUsage};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Status,
    Open,
    Attach,
    Detach,
    Limits,
    Stats,
    Freeze,
    Thaw,
    Kill,
    Close,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub command: Command,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceLimits>,
    /// Process to attach or detach instead of the connecting peer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

impl Request {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            session_id: None,
            secret: None,
            limits: None,
            pid: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Ok,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// Live session count, for `status`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sessions: Option<usize>,
    /// The statistics document, inlined into the response object.
    #[serde(flatten)]
    pub stats: Option<ResourceUsage>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            status: Status::Ok,
            error: None,
            session_id: None,
            secret: None,
            sessions: None,
            stats: None,
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            status: Status::Fail,
            error: Some(error.into()),
            ..Self::ok()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_parses_with_defaults() {
        let req: Request = serde_json::from_str(r#"{"command":"open"}"#).unwrap();
        assert_eq!(req.command, Command::Open);
        assert!(req.session_id.is_none());

        let req: Request = serde_json::from_str(
            r#"{"command":"limits","session_id":"a","secret":"b","limits":{"memory":"1k"}}"#,
        )
        .unwrap();
        assert_eq!(req.limits.unwrap().memory, Some(1024));
    }

    #[test]
    fn stats_are_inlined() {
        let mut stats = ResourceUsage::default();
        stats.pids.usage = Some(3);
        let response = Response {
            stats: Some(stats),
            ..Response::ok()
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["status"], "OK");
        assert_eq!(value["pids"]["usage"], 3);

        let back: Response = serde_json::from_value(value).unwrap();
        assert_eq!(back.stats.unwrap().pids.usage, Some(3));
    }

    #[test]
    fn failure_shape() {
        let value = serde_json::to_value(Response::fail("nope")).unwrap();
        assert_eq!(value["status"], "FAIL");
        assert_eq!(value["error"], "nope");
    }

    #[test]
    fn unknown_command_is_rejected() {
        assert!(serde_json::from_str::<Request>(r#"{"command":"explode"}"#).is_err());
    }
}
