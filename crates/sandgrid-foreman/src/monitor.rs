//! Resource monitoring of running tasks.
//!
//! A [`Monitor`] opens one [`MonitorSession`] per task. The production
//! monitor is the local observer daemon; sessions become observer sessions
//! holding the task's process in its own control groups.

use std::path::PathBuf;

use sandgrid_core::{ResourceLimits, ResourceUsage};
use sandgrid_observer::{ObserverClient, SECRET_ENV, SESSION_ENV, SOCKET_ENV};
use tracing::{debug, warn};

use crate::BoxFuture;
use crate::error::ForemanResult;

pub trait Monitor: Send + Sync + 'static {
    fn open(&self) -> BoxFuture<'_, ForemanResult<Box<dyn MonitorSession>>>;
}

pub trait MonitorSession: Send {
    /// Place `pid` under the session.
    fn attach(&mut self, pid: u32) -> BoxFuture<'_, ForemanResult<()>>;

    /// Environment letting a launched process join the session itself,
    /// before the task program starts. `None` when the session cannot be
    /// joined that way; the runner then attaches the spawned pid.
    fn handoff(&self) -> Option<Vec<(String, String)>> {
        None
    }

    fn limits<'a>(&'a mut self, limits: &'a ResourceLimits) -> BoxFuture<'a, ForemanResult<()>>;

    /// Final statistics; the session is closed afterwards.
    fn finish(&mut self) -> BoxFuture<'_, ForemanResult<ResourceUsage>>;
}

/// Sessions on the observer listening at `socket`.
pub struct ObserverMonitor {
    socket: PathBuf,
}

impl ObserverMonitor {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }
}

struct ObserverSession {
    client: ObserverClient,
    socket: PathBuf,
}

impl Monitor for ObserverMonitor {
    fn open(&self) -> BoxFuture<'_, ForemanResult<Box<dyn MonitorSession>>> {
        Box::pin(async move {
            let mut client = ObserverClient::connect(&self.socket).await?;
            let session_id = client.open().await?;
            debug!(%session_id, "observer session opened");
            Ok(Box::new(ObserverSession {
                client,
                socket: self.socket.clone(),
            }) as Box<dyn MonitorSession>)
        })
    }
}

impl MonitorSession for ObserverSession {
    fn attach(&mut self, pid: u32) -> BoxFuture<'_, ForemanResult<()>> {
        Box::pin(async move {
            self.client.attach(Some(pid)).await?;
            Ok(())
        })
    }

    fn handoff(&self) -> Option<Vec<(String, String)>> {
        let session_id = self.client.session_id()?;
        let secret = self.client.secret()?;
        Some(vec![
            (SOCKET_ENV.to_string(), self.socket.display().to_string()),
            (SESSION_ENV.to_string(), session_id.to_string()),
            (SECRET_ENV.to_string(), secret.to_string()),
        ])
    }

    fn limits<'a>(&'a mut self, limits: &'a ResourceLimits) -> BoxFuture<'a, ForemanResult<()>> {
        Box::pin(async move { Ok(self.client.limits(limits).await?) })
    }

    fn finish(&mut self) -> BoxFuture<'_, ForemanResult<ResourceUsage>> {
        Box::pin(async move {
            let stats = self.client.stats().await;
            if let Err(e) = self.client.close().await {
                warn!(
                    session_id = ?self.client.session_id(),
                    error = %e,
                    "observer session close failed"
                );
            }
            Ok(stats?)
        })
    }
}
