//! Layered configuration.
//!
//! Each process builds one [`GridConfig`] at start-up and passes the
//! relevant section into the component it runs. Values come from three
//! layers, highest precedence first:
//!
//! ```text
//!   CLI flags      ──┐
//!   TOML file      ──┼── first non-null wins ──▶ GridConfig
//!   built-in default ┘
//! ```
//!
//! Every layer is a `Partial*Config` with all-optional fields. The file
//! layer is read with [`PartialGridConfig::from_file`]; the CLI layer is
//! assembled by the daemon from its flags.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::error::CoreResult;
use crate::limits::ResourceLimits;
use crate::parse::serde_magnitude;

/// Return the first layer that sets a field.
fn first<P, T>(layers: &[&P], field: impl Fn(&P) -> Option<T>) -> Option<T> {
    layers.iter().find_map(|layer| field(layer))
}

/// Per-field overlay of capacity limits across layers.
fn merge_limits(layers: &[&PartialForemanConfig]) -> ResourceLimits {
    let mut merged = ResourceLimits::default();
    for layer in layers.iter().rev() {
        let Some(l) = &layer.limits else { continue };
        macro_rules! overlay {
            ($($field:ident),*) => { $( if l.$field.is_some() { merged.$field = l.$field; } )* };
        }
        overlay!(
            cpus, cpus_offset, memory, swap, pids, storage, image, workspace, time, network,
            gpus, gpus_offset, gpu_memory, perf_instructions, perf_cycles, cgroup_depth,
            cgroup_descendants
        );
    }
    merged.normalize();
    merged
}

// ── Server ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub listen: String,
    pub data_dir: PathBuf,
    /// Assigned tasks without a result are returned to the queue after this.
    pub assignment_timeout: Duration,
    pub reap_interval: Duration,
    /// How many of the oldest unassigned tasks one dequeue considers.
    pub dequeue_window: usize,
    /// Bearer token → principal. Empty means every caller is allowed.
    pub tokens: BTreeMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            data_dir: PathBuf::from("sandgrid-data"),
            assignment_timeout: Duration::from_secs(3600),
            reap_interval: Duration::from_secs(60),
            dequeue_window: 100,
            tokens: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialServerConfig {
    pub listen: Option<String>,
    pub data_dir: Option<PathBuf>,
    #[serde(default, with = "serde_magnitude::time")]
    pub assignment_timeout: Option<Duration>,
    #[serde(default, with = "serde_magnitude::time")]
    pub reap_interval: Option<Duration>,
    pub dequeue_window: Option<usize>,
    pub tokens: Option<BTreeMap<String, String>>,
}

impl ServerConfig {
    pub fn merge(layers: &[&PartialServerConfig]) -> Self {
        let d = ServerConfig::default();
        ServerConfig {
            listen: first(layers, |l| l.listen.clone()).unwrap_or(d.listen),
            data_dir: first(layers, |l| l.data_dir.clone()).unwrap_or(d.data_dir),
            assignment_timeout: first(layers, |l| l.assignment_timeout)
                .unwrap_or(d.assignment_timeout),
            reap_interval: first(layers, |l| l.reap_interval).unwrap_or(d.reap_interval),
            dequeue_window: first(layers, |l| l.dequeue_window).unwrap_or(d.dequeue_window),
            tokens: first(layers, |l| l.tokens.clone()).unwrap_or(d.tokens),
        }
    }
}

// ── Foreman ────────────────────────────────────────────────────────

/// How the foreman starts a task's container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LauncherKind {
    Docker,
    Process,
}

impl std::str::FromStr for LauncherKind {
    type Err = crate::CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "docker" => Ok(LauncherKind::Docker),
            "process" => Ok(LauncherKind::Process),
            other => Err(crate::CoreError::parse("launcher", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForemanConfig {
    pub server: String,
    pub token: Option<String>,
    pub temp_path: PathBuf,
    pub interval: Duration,
    pub concurrency: usize,
    /// Machine capacity offered to the allocator.
    pub limits: ResourceLimits,
    pub tags: Vec<String>,
    /// Always pull needed images, even when present.
    pub pull: bool,
    pub launcher: LauncherKind,
    pub docker: String,
    pub observer_socket: PathBuf,
}

impl Default for ForemanConfig {
    fn default() -> Self {
        Self {
            server: "http://127.0.0.1:8080".to_string(),
            token: None,
            temp_path: std::env::temp_dir().join("sandgrid"),
            interval: Duration::from_secs(10),
            concurrency: 1,
            limits: ResourceLimits::default(),
            tags: Vec::new(),
            pull: false,
            launcher: LauncherKind::Docker,
            docker: "docker".to_string(),
            observer_socket: PathBuf::from(DEFAULT_OBSERVER_SOCKET),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialForemanConfig {
    pub server: Option<String>,
    pub token: Option<String>,
    pub temp_path: Option<PathBuf>,
    #[serde(default, with = "serde_magnitude::time")]
    pub interval: Option<Duration>,
    pub concurrency: Option<usize>,
    pub limits: Option<ResourceLimits>,
    pub tags: Option<Vec<String>>,
    pub pull: Option<bool>,
    pub launcher: Option<LauncherKind>,
    pub docker: Option<String>,
    pub observer_socket: Option<PathBuf>,
}

impl ForemanConfig {
    pub fn merge(layers: &[&PartialForemanConfig]) -> Self {
        let d = ForemanConfig::default();
        ForemanConfig {
            server: first(layers, |l| l.server.clone()).unwrap_or(d.server),
            token: first(layers, |l| l.token.clone()).or(d.token),
            temp_path: first(layers, |l| l.temp_path.clone()).unwrap_or(d.temp_path),
            interval: first(layers, |l| l.interval).unwrap_or(d.interval),
            concurrency: first(layers, |l| l.concurrency).unwrap_or(d.concurrency),
            limits: merge_limits(layers),
            tags: first(layers, |l| l.tags.clone()).unwrap_or(d.tags),
            pull: first(layers, |l| l.pull).unwrap_or(d.pull),
            launcher: first(layers, |l| l.launcher).unwrap_or(d.launcher),
            docker: first(layers, |l| l.docker.clone()).unwrap_or(d.docker),
            observer_socket: first(layers, |l| l.observer_socket.clone())
                .unwrap_or(d.observer_socket),
        }
    }
}

// ── Observer ───────────────────────────────────────────────────────

pub const DEFAULT_OBSERVER_SOCKET: &str = "/run/sandgrid/observer.sock";

#[derive(Debug, Clone, PartialEq)]
pub struct ObserverConfig {
    pub socket: PathBuf,
    pub sweep_interval: Duration,
    /// How long stats of a closed session stay readable.
    pub stats_retention: Duration,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            socket: PathBuf::from(DEFAULT_OBSERVER_SOCKET),
            sweep_interval: Duration::from_secs(1),
            stats_retention: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialObserverConfig {
    pub socket: Option<PathBuf>,
    #[serde(default, with = "serde_magnitude::time")]
    pub sweep_interval: Option<Duration>,
    #[serde(default, with = "serde_magnitude::time")]
    pub stats_retention: Option<Duration>,
}

impl ObserverConfig {
    pub fn merge(layers: &[&PartialObserverConfig]) -> Self {
        let d = ObserverConfig::default();
        ObserverConfig {
            socket: first(layers, |l| l.socket.clone()).unwrap_or(d.socket),
            sweep_interval: first(layers, |l| l.sweep_interval).unwrap_or(d.sweep_interval),
            stats_retention: first(layers, |l| l.stats_retention).unwrap_or(d.stats_retention),
        }
    }
}

// ── Whole grid ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GridConfig {
    pub server: ServerConfig,
    pub foreman: ForemanConfig,
    pub observer: ObserverConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialGridConfig {
    #[serde(default)]
    pub server: PartialServerConfig,
    #[serde(default)]
    pub foreman: PartialForemanConfig,
    #[serde(default)]
    pub observer: PartialObserverConfig,
}

impl PartialGridConfig {
    pub fn from_toml_str(text: &str) -> CoreResult<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        debug!(path = %path.display(), "config file loaded");
        Ok(config)
    }
}

impl GridConfig {
    /// Merge the CLI layer over the file layer over built-in defaults.
    pub fn resolve(cli: &PartialGridConfig, file: Option<&PartialGridConfig>) -> Self {
        let empty = PartialGridConfig::default();
        let file = file.unwrap_or(&empty);
        GridConfig {
            server: ServerConfig::merge(&[&cli.server, &file.server]),
            foreman: ForemanConfig::merge(&[&cli.foreman, &file.foreman]),
            observer: ObserverConfig::merge(&[&cli.observer, &file.observer]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE: &str = r#"
        [server]
        listen = "0.0.0.0:9000"
        assignment_timeout = "30M"

        [server.tokens]
        secret-token = "worker-1"

        [foreman]
        concurrency = 4
        interval = "5s"
        tags = ["gpu"]
        launcher = "process"

        [foreman.limits]
        cpus = 8
        memory = "16g"

        [observer]
        sweep_interval = "500m"
    "#;

    #[test]
    fn defaults_without_layers() {
        let config = GridConfig::resolve(&PartialGridConfig::default(), None);
        assert_eq!(config, GridConfig::default());
        assert_eq!(config.server.dequeue_window, 100);
        assert_eq!(config.observer.stats_retention, Duration::from_secs(300));
    }

    #[test]
    fn file_overrides_defaults() {
        let file = PartialGridConfig::from_toml_str(FILE).unwrap();
        let config = GridConfig::resolve(&PartialGridConfig::default(), Some(&file));
        assert_eq!(config.server.listen, "0.0.0.0:9000");
        assert_eq!(config.server.assignment_timeout, Duration::from_secs(1800));
        assert_eq!(config.server.tokens["secret-token"], "worker-1");
        assert_eq!(config.server.dequeue_window, 100);
        assert_eq!(config.foreman.concurrency, 4);
        assert_eq!(config.foreman.launcher, LauncherKind::Process);
        assert_eq!(config.foreman.limits.cpus, Some(8));
        assert_eq!(config.observer.sweep_interval, Duration::from_millis(500));
    }

    #[test]
    fn cli_overrides_file() {
        let file = PartialGridConfig::from_toml_str(FILE).unwrap();
        let mut cli = PartialGridConfig::default();
        cli.foreman.concurrency = Some(2);
        cli.foreman.limits = Some(ResourceLimits {
            memory: Some(1024),
            ..Default::default()
        });
        let config = GridConfig::resolve(&cli, Some(&file));
        assert_eq!(config.foreman.concurrency, 2);
        // Limits overlay per field: memory from CLI, cpus from file.
        assert_eq!(config.foreman.limits.memory, Some(1024));
        assert_eq!(config.foreman.limits.cpus, Some(8));
        assert_eq!(config.foreman.interval, Duration::from_secs(5));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(PartialGridConfig::from_toml_str("[server]\nlisten_on = \"x\"").is_err());
    }

    #[test]
    fn launcher_from_str() {
        assert_eq!("docker".parse::<LauncherKind>().unwrap(), LauncherKind::Docker);
        assert!("podman".parse::<LauncherKind>().is_err());
    }
}
