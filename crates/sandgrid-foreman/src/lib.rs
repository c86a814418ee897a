//! sandgrid-foreman — runs Task Store tasks on one machine.
//!
//! - [`Foreman`]: the polling loop with its local queue and allocator
//! - [`TaskRunner`]: one task from workspace to pushed result
//! - [`TaskStore`] / [`HttpTaskStore`]: the server API
//! - [`ContainerLauncher`]: `docker run` or a plain host process
//! - [`Monitor`]: observer sessions holding each task's processes
//! - [`ImageCache`]: local images kept within the disk budget

pub mod client;
pub mod error;
pub mod foreman;
pub mod images;
pub mod inventory;
pub mod launcher;
pub mod monitor;
pub mod runner;

use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by the injectable foreman traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub use client::{HttpTaskStore, TaskStore};
pub use error::{ForemanError, ForemanResult};
pub use foreman::Foreman;
pub use images::{DockerImages, ImageCache, reconcile_images};
pub use inventory::{GpuInventory, NoGpus, NvidiaSmi, machine_capacity};
pub use launcher::{AttachWrapper, ContainerLauncher, DockerLauncher, ProcessLauncher, Workspace};
pub use monitor::{Monitor, MonitorSession, ObserverMonitor};
pub use runner::{GRACE_BASE, TaskRunner, grace_timeout};
