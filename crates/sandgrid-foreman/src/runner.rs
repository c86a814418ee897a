//! TaskRunner — executes one admitted task end to end.
//!
//! ```text
//!   workspace ─▶ fetch blobs ─▶ kolejka_task.json ─▶ monitor session
//!       ─▶ limits ─▶ launch (joins the session first) ─▶ wait (grace timeout)
//!       ─▶ final stats ─▶ collect + upload ─▶ kolejka_result.json ─▶ push
//! ```
//!
//! Errors end the task and are reported to the caller; the server's
//! assignment timeout eventually requeues a task whose result never
//! arrives.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use sandgrid_core::{FileEntry, RESULT_MANIFEST, ResourceLimits, ResourceUsage, Task, TaskResult};
use tracing::{debug, info, warn};

use crate::client::TaskStore;
use crate::error::{ForemanError, ForemanResult};
use crate::inventory::GpuInventory;
use crate::launcher::{AttachWrapper, ContainerLauncher, Workspace, contained};
use crate::monitor::{Monitor, MonitorSession};

/// Slack added to twice the time limit before a task is killed.
pub const GRACE_BASE: Duration = Duration::from_secs(10);

/// How long a task may run before the runner kills it.
pub fn grace_timeout(limits: &ResourceLimits) -> Option<Duration> {
    grace_after(GRACE_BASE, limits)
}

fn grace_after(base: Duration, limits: &ResourceLimits) -> Option<Duration> {
    limits.time.map(|time| base + time * 2)
}

#[derive(Clone)]
pub struct TaskRunner {
    store: Arc<dyn TaskStore>,
    launcher: Arc<dyn ContainerLauncher>,
    monitor: Arc<dyn Monitor>,
    gpus: Arc<dyn GpuInventory>,
    temp_path: PathBuf,
    tags: Vec<String>,
    grace_base: Duration,
    /// Starts tasks already inside their monitor session.
    attacher: Option<AttachWrapper>,
}

impl TaskRunner {
    pub fn new(
        store: Arc<dyn TaskStore>,
        launcher: Arc<dyn ContainerLauncher>,
        monitor: Arc<dyn Monitor>,
        gpus: Arc<dyn GpuInventory>,
        temp_path: PathBuf,
        tags: Vec<String>,
    ) -> Self {
        Self {
            store,
            launcher,
            monitor,
            gpus,
            temp_path,
            tags,
            grace_base: GRACE_BASE,
            attacher: None,
        }
    }

    pub fn with_grace_base(mut self, grace_base: Duration) -> Self {
        self.grace_base = grace_base;
        self
    }

    /// Launch every task through `wrapper` when the monitor session
    /// offers a handoff.
    pub fn with_attacher(mut self, wrapper: AttachWrapper) -> Self {
        self.attacher = Some(wrapper);
        self
    }

    /// Run `task` and push its result. The workspace is removed afterwards.
    pub async fn run(&self, task: Task) -> ForemanResult<TaskResult> {
        let id = task
            .id
            .clone()
            .ok_or_else(|| ForemanError::Launch("task without id".into()))?;
        contained(&id)?;
        let workspace = Workspace::create(&self.temp_path, &id).await?;
        let outcome = self.run_in(&id, task, &workspace).await;
        workspace.remove().await;
        outcome
    }

    async fn run_in(&self, id: &str, mut task: Task, workspace: &Workspace) -> ForemanResult<TaskResult> {
        self.fetch_files(&mut task, &workspace.task_dir).await?;
        task.commit(&workspace.task_dir)?;

        let mut session = self.monitor.open().await?;
        let exit = self.supervise(&task, workspace, session.as_mut()).await;
        let mut stats = match session.finish().await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(task_id = %id, error = %e, "final stats unavailable");
                ResourceUsage::default()
            }
        };
        let exit = exit?;
        self.sample_gpus(&task.limits, &mut stats).await;

        let files = self.upload_outputs(&task, &workspace.result_dir).await?;
        let result = TaskResult {
            id: Some(id.to_string()),
            tags: self.tags.clone(),
            limits: task.limits.clone(),
            stats,
            result: exit,
            stdout: task.stdout.clone(),
            stderr: task.stderr.clone(),
            files,
        };
        result.commit(&workspace.result_dir)?;
        self.store.put_result(id, &result).await?;
        info!(task_id = %id, exit = ?exit, "task finished");
        Ok(result)
    }

    async fn fetch_files(&self, task: &mut Task, task_dir: &Path) -> ForemanResult<()> {
        for (name, entry) in task.files.iter_mut() {
            let target = task_dir.join(contained(name)?);
            let reference = entry.reference.as_deref().ok_or_else(|| {
                ForemanError::Launch(format!("file {name:?} has no blob reference"))
            })?;
            let bytes = self.store.get_blob(reference).await?;
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, &bytes).await?;
            entry.path = Some(name.clone());
            debug!(file = %name, size = bytes.len(), "task file fetched");
        }
        Ok(())
    }

    /// Limit the session, launch inside it, wait. Returns the exit code,
    /// or `None` when the process was killed or ended by a signal.
    async fn supervise(
        &self,
        task: &Task,
        workspace: &Workspace,
        session: &mut dyn MonitorSession,
    ) -> ForemanResult<Option<i32>> {
        session.limits(&task.limits).await?;
        let wrapper = match (&self.attacher, session.handoff()) {
            (Some(template), Some(env)) => {
                let mut wrapper = template.clone();
                wrapper.env.extend(env);
                Some(wrapper)
            }
            _ => None,
        };

        let mut command = self.launcher.command(task, workspace, wrapper.as_ref())?;
        command.kill_on_drop(true);
        let mut child = command
            .spawn()
            .map_err(|e| ForemanError::Launch(format!("{}: {e}", self.launcher.name())))?;

        // Without a wrapper the process is placed after it started.
        if wrapper.is_none() {
            if let Some(pid) = child.id() {
                if let Err(e) = session.attach(pid).await {
                    let _ = child.kill().await;
                    self.stop(task).await;
                    return Err(e);
                }
            }
        }

        let status = match grace_after(self.grace_base, &task.limits) {
            Some(grace) => match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    warn!(task_id = ?task.id, ?grace, "task exceeded its grace timeout, killing");
                    let _ = child.kill().await;
                    self.stop(task).await;
                    return Ok(None);
                }
            },
            None => child.wait().await?,
        };
        Ok(status.code())
    }

    async fn stop(&self, task: &Task) {
        if let Some(mut command) = self.launcher.stop_command(task) {
            if let Err(e) = command.status().await {
                warn!(task_id = ?task.id, error = %e, "stop command failed");
            }
        }
    }

    async fn sample_gpus(&self, limits: &ResourceLimits, stats: &mut ResourceUsage) {
        let Some(count) = limits.gpus.filter(|&n| n > 0) else {
            return;
        };
        let offset = limits.gpus_offset.unwrap_or(0);
        let granted: Vec<String> = (offset..offset + count).map(|i| i.to_string()).collect();
        for (index, gpu) in self.gpus.gpus().await {
            if granted.contains(&index) {
                stats.gpus.insert(index, gpu);
            }
        }
    }

    /// Upload stdout, stderr and collected files as blobs.
    async fn upload_outputs(
        &self,
        task: &Task,
        result_dir: &Path,
    ) -> ForemanResult<BTreeMap<String, FileEntry>> {
        let mut outputs = task.collect_files(result_dir)?;
        for name in [&task.stdout, &task.stderr].into_iter().flatten() {
            let path = result_dir.join(contained(name)?);
            if path.is_file() {
                outputs.insert(name.clone(), path);
            }
        }
        outputs.remove(RESULT_MANIFEST);

        let mut files = BTreeMap::new();
        for (name, path) in outputs {
            let bytes = tokio::fs::read(&path).await?;
            let reference = self.store.put_blob(Bytes::from(bytes)).await?;
            files.insert(
                name.clone(),
                FileEntry {
                    path: Some(name),
                    reference: Some(reference),
                },
            );
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grace_is_ten_plus_twice_the_limit() {
        let limits = ResourceLimits {
            time: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        assert_eq!(grace_timeout(&limits), Some(Duration::from_secs(70)));
        assert_eq!(grace_timeout(&ResourceLimits::default()), None);
        assert_eq!(
            grace_after(Duration::ZERO, &limits),
            Some(Duration::from_secs(60))
        );
    }
}
