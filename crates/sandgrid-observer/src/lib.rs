//! sandgrid-observer — per-session control groups for sandboxed tasks.
//!
//! ```text
//!   foreman / sandbox ──▶ ObserverClient ══ unix socket ══▶ ObserverServer
//!                                                             │
//!                                                       SessionRegistry
//!                                                             │ one Session per id
//!                                                       ControlGroupSystem
//!                                                             │
//!                                                          Kernel (cgroupfs, procfs, signals)
//! ```
//!
//! A session owns one group per tracked controller, nested under the
//! creator's groups. Sessions end on `close`, when their time limit
//! passes, or when the creator has gone and no members remain.

pub mod cgroup;
pub mod client;
pub mod error;
pub mod kernel;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;

pub use cgroup::ControlGroupSystem;
pub use client::{ObserverClient, SECRET_ENV, SESSION_ENV, SOCKET_ENV};
pub use error::{ObserverError, ObserverResult};
pub use kernel::{HostKernel, Kernel};
pub use protocol::{Command, Request, Response, Status};
pub use registry::SessionRegistry;
pub use server::ObserverServer;
pub use session::{Session, SessionState};
