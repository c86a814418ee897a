//! Container launchers: how a materialized task directory becomes a
//! running process.
//!
//! ```text
//!   <temp>/<task id>/
//!     ├── task/     kolejka_task.json + input files   (working directory)
//!     └── result/   stdout, stderr, collected outputs, kolejka_result.json
//! ```

use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use sandgrid_core::{FileEntry, Task};
use sandgrid_observer::cgroup::{format_cpuset, limited_cpuset};
use tokio::process::Command;
use tracing::debug;

use crate::error::{ForemanError, ForemanResult};

/// Environment variable naming the task directory inside the sandbox.
pub const TASK_DIR_ENV: &str = "SANDGRID_TASK_DIR";
/// Environment variable naming the result directory inside the sandbox.
pub const RESULT_DIR_ENV: &str = "SANDGRID_RESULT_DIR";

const CONTAINER_TASK_DIR: &str = "/sandgrid/task";
const CONTAINER_RESULT_DIR: &str = "/sandgrid/result";

/// Per-task scratch directories.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub root: PathBuf,
    pub task_dir: PathBuf,
    pub result_dir: PathBuf,
}

impl Workspace {
    pub async fn create(temp_path: &Path, task_id: &str) -> ForemanResult<Self> {
        let root = temp_path.join(task_id);
        let workspace = Self {
            task_dir: root.join("task"),
            result_dir: root.join("result"),
            root,
        };
        tokio::fs::create_dir_all(&workspace.task_dir).await?;
        tokio::fs::create_dir_all(&workspace.result_dir).await?;
        Ok(workspace)
    }

    /// Delete the workspace. Best-effort.
    pub async fn remove(&self) {
        if let Err(e) = tokio::fs::remove_dir_all(&self.root).await {
            debug!(path = %self.root.display(), error = %e, "workspace not removed");
        }
    }
}

/// Reject names that would leave their directory.
pub fn contained(name: &str) -> ForemanResult<&str> {
    if name.is_empty() || !FileEntry::local(name).is_contained() {
        return Err(ForemanError::Launch(format!(
            "path {name:?} escapes the workspace"
        )));
    }
    Ok(name)
}

fn wire_stdio(command: &mut Command, task: &Task, workspace: &Workspace) -> ForemanResult<()> {
    match &task.stdin {
        Some(name) => command.stdin(File::open(workspace.task_dir.join(contained(name)?))?),
        None => command.stdin(Stdio::null()),
    };
    match &task.stdout {
        Some(name) => command.stdout(File::create(workspace.result_dir.join(contained(name)?))?),
        None => command.stdout(Stdio::null()),
    };
    match &task.stderr {
        Some(name) => command.stderr(File::create(workspace.result_dir.join(contained(name)?))?),
        None => command.stderr(Stdio::null()),
    };
    Ok(())
}

/// A program that joins a monitor session and then execs the rest of its
/// command line, so the task starts inside the session.
#[derive(Debug, Clone)]
pub struct AttachWrapper {
    pub program: PathBuf,
    /// Arguments placed before the wrapped command line.
    pub args: Vec<OsString>,
    /// Session handoff for the wrapper, filled in per task.
    pub env: Vec<(String, String)>,
}

impl AttachWrapper {
    /// `sandgridd run-attached -- <command>`.
    pub fn run_attached(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec!["run-attached".into(), "--".into()],
            env: Vec::new(),
        }
    }
}

/// `program`, behind `attach` when given.
fn launch(program: impl AsRef<OsStr>, attach: Option<&AttachWrapper>) -> Command {
    match attach {
        Some(wrapper) => {
            let mut command = Command::new(&wrapper.program);
            command
                .args(&wrapper.args)
                .arg(program)
                .envs(wrapper.env.iter().map(|(k, v)| (k, v)));
            command
        }
        None => Command::new(program),
    }
}

pub trait ContainerLauncher: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// The command running `task` inside `workspace`. With `attach`, the
    /// command is started through the wrapper.
    fn command(
        &self,
        task: &Task,
        workspace: &Workspace,
        attach: Option<&AttachWrapper>,
    ) -> ForemanResult<Command>;

    /// Extra cleanup after the launched process was killed.
    fn stop_command(&self, _task: &Task) -> Option<Command> {
        None
    }
}

// ── Docker ─────────────────────────────────────────────────────────

/// Runs tasks with `docker run`, translating limits into docker flags.
pub struct DockerLauncher {
    docker: String,
}

impl DockerLauncher {
    pub fn new(docker: impl Into<String>) -> Self {
        Self {
            docker: docker.into(),
        }
    }

    fn container_name(task: &Task) -> String {
        format!("sandgrid-{}", task.id.as_deref().unwrap_or("task"))
    }
}

fn host_cpus() -> Vec<u32> {
    let count = std::thread::available_parallelism().map_or(1, |n| n.get());
    (0..count as u32).collect()
}

impl ContainerLauncher for DockerLauncher {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn command(
        &self,
        task: &Task,
        workspace: &Workspace,
        attach: Option<&AttachWrapper>,
    ) -> ForemanResult<Command> {
        let image = task
            .image
            .as_deref()
            .ok_or_else(|| ForemanError::Launch("docker tasks need an image".into()))?;
        let limits = &task.limits;

        let mut command = launch(&self.docker, attach);
        command
            .arg("run")
            .arg("--rm")
            .arg("--name")
            .arg(Self::container_name(task))
            .arg("--volume")
            .arg(format!("{}:{CONTAINER_TASK_DIR}", workspace.task_dir.display()))
            .arg("--volume")
            .arg(format!("{}:{CONTAINER_RESULT_DIR}", workspace.result_dir.display()))
            .args(["--workdir", CONTAINER_TASK_DIR])
            .arg("--env")
            .arg(format!("{TASK_DIR_ENV}={CONTAINER_TASK_DIR}"))
            .arg("--env")
            .arg(format!("{RESULT_DIR_ENV}={CONTAINER_RESULT_DIR}"));

        if let Some(cpus) = limits.cpus {
            let selected = limited_cpuset(&host_cpus(), cpus, limits.cpus_offset.unwrap_or(0));
            command.arg("--cpuset-cpus").arg(format_cpuset(&selected));
        }
        if let Some(memory) = limits.memory {
            command.arg("--memory").arg(format!("{memory}b"));
            let swap = limits.swap.unwrap_or(0);
            command
                .arg("--memory-swap")
                .arg(format!("{}b", memory.saturating_add(swap)));
        }
        if let Some(pids) = limits.pids {
            command.arg("--pids-limit").arg(pids.to_string());
        }
        if limits.network != Some(true) {
            command.args(["--network", "none"]);
        }
        if let Some(gpus) = limits.gpus.filter(|&n| n > 0) {
            let offset = limits.gpus_offset.unwrap_or(0);
            let devices: Vec<String> = (offset..offset + gpus).map(|i| i.to_string()).collect();
            command
                .arg("--gpus")
                .arg(format!("\"device={}\"", devices.join(",")));
        }
        if task.stdin.is_some() {
            command.arg("--interactive");
        }
        for (key, value) in &task.environment {
            command.arg("--env").arg(format!("{key}={value}"));
        }
        command.arg(image).args(&task.args);
        wire_stdio(&mut command, task, workspace)?;
        Ok(command)
    }

    fn stop_command(&self, task: &Task) -> Option<Command> {
        let mut command = Command::new(&self.docker);
        command
            .args(["rm", "--force"])
            .arg(Self::container_name(task))
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        Some(command)
    }
}

// ── Plain process ──────────────────────────────────────────────────

/// Runs the argument vector directly on the host, in the task directory.
///
/// Isolation comes from the observer session alone.
pub struct ProcessLauncher;

impl ContainerLauncher for ProcessLauncher {
    fn name(&self) -> &'static str {
        "process"
    }

    fn command(
        &self,
        task: &Task,
        workspace: &Workspace,
        attach: Option<&AttachWrapper>,
    ) -> ForemanResult<Command> {
        let (program, args) = task
            .args
            .split_first()
            .ok_or_else(|| ForemanError::Launch("task has no command".into()))?;
        let mut command = launch(program, attach);
        command
            .args(args)
            .current_dir(&workspace.task_dir)
            .envs(&task.environment)
            .env(TASK_DIR_ENV, &workspace.task_dir)
            .env(RESULT_DIR_ENV, &workspace.result_dir);
        wire_stdio(&mut command, task, workspace)?;
        Ok(command)
    }
}
