//! ObserverServer — the registry behind a local Unix stream socket.
//!
//! ```text
//!   client ──connect──▶ UnixListener ──spawn──▶ connection task
//!                                                  │ line → Request
//!                                                  ▼
//!                                   spawn_blocking(dispatch) ──▶ SessionRegistry
//!                                                  │
//!   client ◀──────────── line ◀── Response ────────┘
//! ```
//!
//! The caller's pid comes from `SO_PEERCRED`. Every request first runs the
//! registry sweeps; a background ticker sweeps as well so idle observers
//! still reclaim sessions. On shutdown every session is closed and the
//! socket file removed.

use std::path::Path;
use std::sync::Arc;

use sandgrid_core::ObserverConfig;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{ObserverError, ObserverResult};
use crate::protocol::{Command, Request, Response};
use crate::registry::SessionRegistry;

pub struct ObserverServer {
    registry: Arc<SessionRegistry>,
    config: ObserverConfig,
}

impl ObserverServer {
    pub fn new(registry: Arc<SessionRegistry>, config: ObserverConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Bind the control socket, replacing a stale socket file.
    pub fn bind(&self) -> ObserverResult<UnixListener> {
        let path = &self.config.socket;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        info!(socket = %path.display(), "observer listening");
        Ok(listener)
    }

    /// Serve until `shutdown` flips, then close every session.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> ObserverResult<()> {
        let listener = self.bind()?;

        let sweeper_registry = Arc::clone(&self.registry);
        let sweep_interval = self.config.sweep_interval;
        let mut sweeper_shutdown = shutdown.clone();
        let sweeper = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let registry = Arc::clone(&sweeper_registry);
                        if let Err(e) = tokio::task::spawn_blocking(move || registry.sweep()).await {
                            error!(error = %e, "session sweep panicked");
                        }
                    }
                    _ = sweeper_shutdown.changed() => break,
                }
            }
        });

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let registry = Arc::clone(&self.registry);
                        tokio::spawn(handle_connection(registry, stream));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                _ = shutdown.changed() => break,
            }
        }

        if let Err(e) = sweeper.await {
            warn!(error = %e, "observer sweeper failed");
        }
        let registry = Arc::clone(&self.registry);
        let open = registry.session_count();
        if let Err(e) = tokio::task::spawn_blocking(move || registry.close_all()).await {
            error!(error = %e, "closing sessions on shutdown panicked");
        }
        remove_socket(&self.config.socket);
        info!(closed = open, "observer stopped");
        Ok(())
    }
}

fn remove_socket(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        debug!(socket = %path.display(), error = %e, "socket file not removed");
    }
}

async fn handle_connection(registry: Arc<SessionRegistry>, stream: UnixStream) {
    let peer_pid = match stream.peer_cred() {
        Ok(cred) => cred.pid().and_then(|p| u32::try_from(p).ok()),
        Err(e) => {
            warn!(error = %e, "peer credentials unavailable");
            None
        }
    };
    debug!(?peer_pid, "observer connection");

    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "connection read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                let registry = Arc::clone(&registry);
                tokio::task::spawn_blocking(move || dispatch(&registry, peer_pid, request))
                    .await
                    .unwrap_or_else(|e| Response::fail(format!("request handler failed: {e}")))
            }
            Err(e) => Response::fail(ObserverError::Protocol(e.to_string()).to_string()),
        };
        let mut payload = match serde_json::to_vec(&response) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "response serialization failed");
                break;
            }
        };
        payload.push(b'\n');
        if let Err(e) = writer.write_all(&payload).await {
            debug!(error = %e, "connection write failed");
            break;
        }
    }
}

/// Run one request against the registry. Blocking.
pub fn dispatch(registry: &SessionRegistry, peer_pid: Option<u32>, request: Request) -> Response {
    registry.sweep();
    let command = request.command;
    match execute(registry, peer_pid, request) {
        Ok(response) => response,
        Err(e) => {
            warn!(?command, error = %e, "observer request failed");
            Response::fail(e.to_string())
        }
    }
}

fn authorize<'a>(registry: &SessionRegistry, request: &'a Request) -> ObserverResult<&'a str> {
    let session_id = request.session_id.as_deref().unwrap_or_default();
    let secret = request.secret.as_deref().unwrap_or_default();
    registry.check_secret(session_id, secret)?;
    Ok(session_id)
}

fn execute(
    registry: &SessionRegistry,
    peer_pid: Option<u32>,
    request: Request,
) -> ObserverResult<Response> {
    let target_pid = request
        .pid
        .or(peer_pid)
        .ok_or_else(|| ObserverError::Protocol("caller pid unknown".into()));

    match request.command {
        Command::Status => Ok(Response {
            sessions: Some(registry.session_count()),
            ..Response::ok()
        }),
        Command::Open => {
            let (session_id, secret) = registry.open(target_pid?)?;
            Ok(Response {
                session_id: Some(session_id),
                secret: Some(secret),
                ..Response::ok()
            })
        }
        Command::Attach if request.session_id.is_none() => {
            let session_id = registry.new_session_id();
            registry.attach(&session_id, target_pid?)?;
            let secret = registry.secret(&session_id);
            Ok(Response {
                session_id: Some(session_id),
                secret: Some(secret),
                ..Response::ok()
            })
        }
        Command::Attach => {
            let session_id = authorize(registry, &request)?;
            registry.attach(session_id, target_pid?)?;
            Ok(Response::ok())
        }
        Command::Detach => {
            let session_id = authorize(registry, &request)?;
            registry.detach(session_id, target_pid?)?;
            Ok(Response::ok())
        }
        Command::Limits => {
            let session_id = authorize(registry, &request)?;
            let mut limits = request.limits.clone().unwrap_or_default();
            limits.normalize();
            registry.limits(session_id, &limits)?;
            Ok(Response::ok())
        }
        Command::Stats => {
            let session_id = authorize(registry, &request)?;
            Ok(Response {
                stats: Some(registry.stats(session_id)?),
                ..Response::ok()
            })
        }
        Command::Freeze => {
            registry.freeze(authorize(registry, &request)?)?;
            Ok(Response::ok())
        }
        Command::Thaw => {
            registry.thaw(authorize(registry, &request)?)?;
            Ok(Response::ok())
        }
        Command::Kill => {
            registry.kill(authorize(registry, &request)?);
            Ok(Response::ok())
        }
        Command::Close => {
            registry.close(authorize(registry, &request)?);
            Ok(Response::ok())
        }
    }
}
