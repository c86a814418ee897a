//! Async client for the observer control socket.
//!
//! The client remembers the session id and secret handed out by `open`
//! (or by a session-less `attach`) and sends them with every later call.

use std::path::Path;

use sandgrid_core::{ResourceLimits, ResourceUsage};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::error::{ObserverError, ObserverResult};
use crate::protocol::{Command, Request, Response, Status};

/// Handoff to a process that attaches itself before running a task.
pub const SOCKET_ENV: &str = "SANDGRID_OBSERVER_SOCKET";
pub const SESSION_ENV: &str = "SANDGRID_SESSION_ID";
pub const SECRET_ENV: &str = "SANDGRID_SESSION_SECRET";

pub struct ObserverClient {
    stream: BufReader<UnixStream>,
    session_id: Option<String>,
    secret: Option<String>,
}

impl ObserverClient {
    pub async fn connect(socket: &Path) -> ObserverResult<Self> {
        let stream = UnixStream::connect(socket).await.map_err(|e| {
            ObserverError::Unavailable(format!("connect {}: {e}", socket.display()))
        })?;
        Ok(Self {
            stream: BufReader::new(stream),
            session_id: None,
            secret: None,
        })
    }

    /// Reuse a session opened by another connection.
    pub fn with_session(mut self, session_id: impl Into<String>, secret: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self.secret = Some(secret.into());
        self
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn secret(&self) -> Option<&str> {
        self.secret.as_deref()
    }

    async fn call(&mut self, mut request: Request) -> ObserverResult<Response> {
        if request.command != Command::Status && request.command != Command::Open {
            request.session_id = request.session_id.or_else(|| self.session_id.clone());
            request.secret = request.secret.or_else(|| self.secret.clone());
        }
        let mut line = serde_json::to_vec(&request)?;
        line.push(b'\n');
        self.stream.get_mut().write_all(&line).await?;

        let mut reply = String::new();
        if self.stream.read_line(&mut reply).await? == 0 {
            return Err(ObserverError::Protocol(
                "observer closed the connection".into(),
            ));
        }
        let response: Response = serde_json::from_str(&reply)?;
        if response.status == Status::Fail {
            return Err(ObserverError::Remote(
                response.error.unwrap_or_else(|| "unspecified failure".into()),
            ));
        }
        if let Some(id) = &response.session_id {
            self.session_id = Some(id.clone());
        }
        if let Some(secret) = &response.secret {
            self.secret = Some(secret.clone());
        }
        Ok(response)
    }

    /// Number of live sessions.
    pub async fn status(&mut self) -> ObserverResult<usize> {
        let response = self.call(Request::new(Command::Status)).await?;
        Ok(response.sessions.unwrap_or_default())
    }

    /// Open a session with this process as creator. Returns the session id.
    pub async fn open(&mut self) -> ObserverResult<String> {
        self.call(Request::new(Command::Open)).await?;
        self.session_id
            .clone()
            .ok_or_else(|| ObserverError::Protocol("open returned no session id".into()))
    }

    /// Attach `pid` (or this process) to the current session, creating
    /// one when none is held yet.
    pub async fn attach(&mut self, pid: Option<u32>) -> ObserverResult<String> {
        let mut request = Request::new(Command::Attach);
        request.pid = pid;
        self.call(request).await?;
        self.session_id
            .clone()
            .ok_or_else(|| ObserverError::Protocol("attach returned no session id".into()))
    }

    pub async fn detach(&mut self, pid: Option<u32>) -> ObserverResult<()> {
        let mut request = Request::new(Command::Detach);
        request.pid = pid;
        self.call(request).await.map(drop)
    }

    pub async fn limits(&mut self, limits: &ResourceLimits) -> ObserverResult<()> {
        let mut request = Request::new(Command::Limits);
        request.limits = Some(limits.clone());
        self.call(request).await.map(drop)
    }

    pub async fn stats(&mut self) -> ObserverResult<ResourceUsage> {
        let response = self.call(Request::new(Command::Stats)).await?;
        Ok(response.stats.unwrap_or_default())
    }

    pub async fn freeze(&mut self) -> ObserverResult<()> {
        self.call(Request::new(Command::Freeze)).await.map(drop)
    }

    pub async fn thaw(&mut self) -> ObserverResult<()> {
        self.call(Request::new(Command::Thaw)).await.map(drop)
    }

    pub async fn kill(&mut self) -> ObserverResult<()> {
        self.call(Request::new(Command::Kill)).await.map(drop)
    }

    pub async fn close(&mut self) -> ObserverResult<()> {
        self.call(Request::new(Command::Close)).await.map(drop)
    }
}
