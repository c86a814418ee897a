//! sandgridd — the sandgrid daemon.
//!
//! One binary, three roles:
//! - `server`: the Task Store (redb) behind the HTTP API, plus the
//!   assignment-timeout reaper
//! - `observer`: the control-group session manager on a Unix socket
//! - `foreman`: the machine-local loop that dequeues and runs tasks
//!
//! # Usage
//!
//! ```text
//! sandgridd server --listen 0.0.0.0:8080 --data-dir /var/lib/sandgrid
//! sandgridd observer --socket /run/sandgrid/observer.sock
//! sandgridd foreman --server http://10.0.0.1:8080 --concurrency 2 --cpus 4 --memory 8g
//! ```
//!
//! The foreman starts every task as `sandgridd run-attached -- <command>`,
//! which joins the task's observer session and then execs the command, so
//! nothing the task runs is ever outside the session.
//!
//! Every role reads the same optional TOML file (`--config`); flags given
//! on the command line override it.

mod attach_mode;
mod foreman_mode;
mod observer_mode;
mod server_mode;

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use sandgrid_core::parse::{parse_bool, parse_memory, parse_time};
use sandgrid_core::{GridConfig, LauncherKind, PartialGridConfig, ResourceLimits};

#[derive(Parser)]
#[command(name = "sandgridd", about = "sandgrid daemon")]
struct Cli {
    /// TOML configuration file with [server], [foreman] and [observer] sections.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the Task Store API.
    Server {
        /// Address to listen on.
        #[arg(long)]
        listen: Option<String>,

        /// Directory holding the task database.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Return assigned tasks to the queue after this long without a result.
        #[arg(long, value_parser = parse_time)]
        assignment_timeout: Option<Duration>,

        /// How many of the oldest unassigned tasks one dequeue considers.
        #[arg(long)]
        dequeue_window: Option<usize>,
    },

    /// Run the control-group observer.
    Observer {
        /// Control socket path.
        #[arg(long)]
        socket: Option<PathBuf>,

        /// Background sweep interval.
        #[arg(long, value_parser = parse_time)]
        sweep_interval: Option<Duration>,
    },

    /// Poll a Task Store and run tasks on this machine.
    Foreman(ForemanArgs),

    /// Join the observer session handed over in the environment, then
    /// exec the command.
    RunAttached {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<OsString>,
    },
}

#[derive(Args, Default)]
struct ForemanArgs {
    /// Task Store base URL.
    #[arg(long)]
    server: Option<String>,

    /// Bearer token presented to the Task Store.
    #[arg(long)]
    token: Option<String>,

    /// Scratch directory for task workspaces.
    #[arg(long)]
    temp: Option<PathBuf>,

    /// Idle polling interval.
    #[arg(long, value_parser = parse_time)]
    interval: Option<Duration>,

    /// Maximum tasks run at once.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Tag offered to tasks; repeatable.
    #[arg(long = "tag")]
    tags: Vec<String>,

    /// Pull needed images even when present.
    #[arg(long)]
    pull: bool,

    /// `docker` or `process`.
    #[arg(long)]
    launcher: Option<LauncherKind>,

    /// Observer control socket.
    #[arg(long)]
    observer_socket: Option<PathBuf>,

    // ── Capacity ──────────────────────────────────────────────────
    #[arg(long)]
    cpus: Option<u32>,
    #[arg(long, value_parser = parse_memory)]
    memory: Option<u64>,
    #[arg(long, value_parser = parse_memory)]
    swap: Option<u64>,
    #[arg(long)]
    pids: Option<u64>,
    #[arg(long, value_parser = parse_memory)]
    storage: Option<u64>,
    /// Image cache budget.
    #[arg(long, value_parser = parse_memory)]
    image: Option<u64>,
    #[arg(long, value_parser = parse_memory)]
    workspace: Option<u64>,
    #[arg(long, value_parser = parse_time)]
    time: Option<Duration>,
    #[arg(long, value_parser = parse_bool)]
    network: Option<bool>,
    #[arg(long)]
    gpus: Option<u32>,
    #[arg(long, value_parser = parse_memory)]
    gpu_memory: Option<u64>,
}

impl ForemanArgs {
    fn limits(&self) -> Option<ResourceLimits> {
        let limits = ResourceLimits {
            cpus: self.cpus,
            memory: self.memory,
            swap: self.swap,
            pids: self.pids,
            storage: self.storage,
            image: self.image,
            workspace: self.workspace,
            time: self.time,
            network: self.network,
            gpus: self.gpus,
            gpu_memory: self.gpu_memory,
            ..Default::default()
        };
        (limits != ResourceLimits::default()).then_some(limits)
    }
}

impl Command {
    /// The command-line layer of the configuration.
    fn cli_layer(&self) -> PartialGridConfig {
        let mut layer = PartialGridConfig::default();
        match self {
            Command::Server {
                listen,
                data_dir,
                assignment_timeout,
                dequeue_window,
            } => {
                layer.server.listen = listen.clone();
                layer.server.data_dir = data_dir.clone();
                layer.server.assignment_timeout = *assignment_timeout;
                layer.server.dequeue_window = *dequeue_window;
            }
            Command::Observer {
                socket,
                sweep_interval,
            } => {
                layer.observer.socket = socket.clone();
                layer.observer.sweep_interval = *sweep_interval;
            }
            Command::Foreman(args) => {
                let foreman = &mut layer.foreman;
                foreman.server = args.server.clone();
                foreman.token = args.token.clone();
                foreman.temp_path = args.temp.clone();
                foreman.interval = args.interval;
                foreman.concurrency = args.concurrency;
                foreman.limits = args.limits();
                foreman.tags = (!args.tags.is_empty()).then(|| args.tags.clone());
                foreman.pull = args.pull.then_some(true);
                foreman.launcher = args.launcher;
                foreman.observer_socket = args.observer_socket.clone();
            }
            Command::RunAttached { .. } => {}
        }
        layer
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,sandgridd=debug,sandgrid=debug"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config(path: Option<&Path>, command: &Command) -> anyhow::Result<GridConfig> {
    let file = path.map(PartialGridConfig::from_file).transpose()?;
    Ok(GridConfig::resolve(&command.cli_layer(), file.as_ref()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // The wrapped task owns stdout and stderr: no logging, no config.
    if let Command::RunAttached { command } = &cli.command {
        return attach_mode::run_attached(command).await;
    }

    init_tracing(cli.log_json);
    let config = load_config(cli.config.as_deref(), &cli.command)?;

    match cli.command {
        Command::Server { .. } => server_mode::run_server(&config.server).await,
        Command::Observer { .. } => observer_mode::run_observer(&config.observer).await,
        Command::Foreman(_) => foreman_mode::run_foreman(&config.foreman).await,
        Command::RunAttached { .. } => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(args: &[&str]) -> GridConfig {
        let cli = Cli::try_parse_from(args).unwrap();
        GridConfig::resolve(&cli.command.cli_layer(), None)
    }

    #[test]
    fn server_flags() {
        let config = resolve(&[
            "sandgridd",
            "server",
            "--listen",
            "0.0.0.0:9000",
            "--assignment-timeout",
            "10M",
        ]);
        assert_eq!(config.server.listen, "0.0.0.0:9000");
        assert_eq!(config.server.assignment_timeout, Duration::from_secs(600));
        assert_eq!(config.server.dequeue_window, 100);
    }

    #[test]
    fn foreman_capacity_flags() {
        let config = resolve(&[
            "sandgridd",
            "foreman",
            "--server",
            "http://grid:8080",
            "--concurrency",
            "2",
            "--cpus",
            "4",
            "--memory",
            "8g",
            "--tag",
            "gpu",
            "--tag",
            "linux",
            "--launcher",
            "process",
        ]);
        let foreman = config.foreman;
        assert_eq!(foreman.server, "http://grid:8080");
        assert_eq!(foreman.concurrency, 2);
        assert_eq!(foreman.limits.cpus, Some(4));
        assert_eq!(foreman.limits.memory, Some(8 << 30));
        assert_eq!(foreman.tags, vec!["gpu", "linux"]);
        assert_eq!(foreman.launcher, LauncherKind::Process);
        assert!(!foreman.pull);
    }

    #[test]
    fn cli_overrides_config_file() {
        let file = PartialGridConfig::from_toml_str(
            "[foreman]\nconcurrency = 8\n[foreman.limits]\ncpus = 16\nmemory = \"1g\"\n",
        )
        .unwrap();
        let cli = Cli::try_parse_from(["sandgridd", "foreman", "--cpus", "2"]).unwrap();
        let config = GridConfig::resolve(&cli.command.cli_layer(), Some(&file));
        assert_eq!(config.foreman.concurrency, 8);
        assert_eq!(config.foreman.limits.cpus, Some(2));
        assert_eq!(config.foreman.limits.memory, Some(1 << 30));
    }

    #[test]
    fn bad_magnitude_is_rejected() {
        assert!(Cli::try_parse_from(["sandgridd", "foreman", "--memory", "lots"]).is_err());
    }

    #[test]
    fn run_attached_takes_the_rest_verbatim() {
        let cli = Cli::try_parse_from(["sandgridd", "run-attached", "--", "sh", "-c", "echo --help"])
            .unwrap();
        match cli.command {
            Command::RunAttached { command } => {
                assert_eq!(command, ["sh", "-c", "echo --help"].map(OsString::from));
            }
            _ => panic!("expected run-attached"),
        }
        assert!(Cli::try_parse_from(["sandgridd", "run-attached"]).is_err());
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["sandgridd", "observer", "--log-json", "--config", "grid.toml"])
            .unwrap();
        assert!(cli.log_json);
        assert_eq!(cli.config, Some(PathBuf::from("grid.toml")));
    }
}
