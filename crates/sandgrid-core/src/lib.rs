//! sandgrid-core — shared types for the sandgrid computational grid.
//!
//! - [`ResourceLimits`] and [`ResourceUsage`]: the declared and observed
//!   resource vectors, with tightening and accumulation
//! - [`Task`] and [`TaskResult`]: the manifests exchanged at the sandbox
//!   boundary and over the Task Store API
//! - [`DequeueRequest`] and friends: Task Store API bodies
//! - [`GridConfig`]: layered configuration (defaults, file, CLI)

pub mod config;
pub mod error;
pub mod limits;
pub mod parse;
pub mod task;
pub mod usage;
pub mod wire;

pub use config::{ForemanConfig, GridConfig, LauncherKind, ObserverConfig, PartialGridConfig, ServerConfig};
pub use error::{CoreError, CoreResult};
pub use limits::ResourceLimits;
pub use task::{CollectRule, FileEntry, RESULT_MANIFEST, TASK_MANIFEST, Task, TaskResult};
pub use usage::{CpuUsage, GpuUsage, MemoryUsage, PidsUsage, ResourceUsage};
pub use wire::{DequeueRequest, DequeueResponse, Submitted, Uploaded};
