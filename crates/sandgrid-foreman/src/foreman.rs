//! Foreman — the machine-local polling loop.
//!
//! ```text
//!   ┌──────────────── round ────────────────────────────────────┐
//!   │ local queue empty? ── dequeue from Task Store             │
//!   │ allocate(queue, capacity) ── admitted │ rest stays queued │
//!   │ reconcile image cache (needed, queued)                    │
//!   │ JoinSet: TaskRunner::run per admitted task                │
//!   │ await the whole batch                                     │
//!   └───────────────────────────────────────────────────────────┘
//!        empty round or error ──▶ sleep `interval` (or shutdown)
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use sandgrid_core::{DequeueRequest, ForemanConfig, ResourceLimits, Task};
use sandgrid_placement::allocate;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::client::TaskStore;
use crate::error::ForemanResult;
use crate::images::{ImageCache, reconcile_images};
use crate::runner::TaskRunner;

pub struct Foreman {
    config: ForemanConfig,
    capacity: ResourceLimits,
    tags: BTreeSet<String>,
    store: Arc<dyn TaskStore>,
    runner: TaskRunner,
    images: Option<Arc<dyn ImageCache>>,
    /// Tasks dequeued but not yet admitted locally, oldest first.
    queue: Vec<Task>,
    round: u64,
    /// Last round in which each image was needed.
    image_rounds: HashMap<String, u64>,
}

impl Foreman {
    pub fn new(
        config: ForemanConfig,
        capacity: ResourceLimits,
        store: Arc<dyn TaskStore>,
        runner: TaskRunner,
    ) -> Self {
        let tags = config.tags.iter().cloned().collect();
        Self {
            config,
            capacity,
            tags,
            store,
            runner,
            images: None,
            queue: Vec::new(),
            round: 0,
            image_rounds: HashMap::new(),
        }
    }

    /// Manage the local image cache within the capacity's image budget.
    pub fn with_images(mut self, images: Arc<dyn ImageCache>) -> Self {
        self.images = Some(images);
        self
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Poll until `shutdown` flips. A running batch is always finished.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            concurrency = self.config.concurrency,
            tags = ?self.tags,
            "foreman started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            let idle = match self.round().await {
                Ok(0) => true,
                Ok(ran) => {
                    debug!(ran, queued = self.queue.len(), "round finished");
                    false
                }
                Err(e) => {
                    warn!(error = %e, "foreman round failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.interval) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
        info!("foreman stopped");
    }

    /// One poll-allocate-run cycle. Returns how many tasks ran.
    pub async fn round(&mut self) -> ForemanResult<usize> {
        if self.queue.is_empty() {
            let request = DequeueRequest {
                concurrency: self.config.concurrency,
                limits: self.capacity.clone(),
                tags: self.tags.clone(),
            };
            self.queue = self.store.dequeue(&request).await?;
            if !self.queue.is_empty() {
                info!(count = self.queue.len(), "tasks dequeued");
            }
        }
        if self.queue.is_empty() {
            return Ok(0);
        }

        let allocation = allocate(&self.queue, &self.capacity, &self.tags, self.config.concurrency);
        if allocation.admitted.is_empty() {
            warn!(
                dropped = self.queue.len(),
                "no dequeued task fits local capacity, leaving them to the assignment timeout"
            );
            self.queue.clear();
            return Ok(0);
        }

        let mut granted: BTreeMap<usize, ResourceLimits> = allocation
            .admitted
            .into_iter()
            .map(|admission| (admission.index, admission.granted))
            .collect();
        let mut batch = Vec::with_capacity(granted.len());
        let mut rest = Vec::new();
        for (index, mut task) in std::mem::take(&mut self.queue).into_iter().enumerate() {
            match granted.remove(&index) {
                Some(limits) => {
                    task.limits = limits;
                    batch.push(task);
                }
                None => rest.push(task),
            }
        }
        self.queue = rest;
        self.round += 1;

        self.prepare_images(&batch).await;

        let ran = batch.len();
        let mut running = JoinSet::new();
        for task in batch {
            let runner = self.runner.clone();
            running.spawn(async move {
                let id = task.id.clone().unwrap_or_default();
                (id, runner.run(task).await)
            });
        }
        while let Some(joined) = running.join_next().await {
            match joined {
                Ok((_, Ok(_))) => {}
                Ok((task_id, Err(e))) => warn!(%task_id, error = %e, "task failed"),
                Err(e) => error!(error = %e, "task runner panicked"),
            }
        }
        Ok(ran)
    }

    async fn prepare_images(&mut self, batch: &[Task]) {
        let (Some(images), Some(budget)) = (&self.images, self.capacity.image) else {
            return;
        };
        let mut needed: BTreeMap<String, u64> = BTreeMap::new();
        for task in batch {
            if let Some(image) = &task.image {
                let size = needed.entry(image.clone()).or_default();
                *size = (*size).max(task.limits.image.unwrap_or(0));
                self.image_rounds.insert(image.clone(), self.round);
            }
        }
        let queued: Vec<String> = self.queue.iter().filter_map(|t| t.image.clone()).collect();
        if let Err(e) = reconcile_images(
            images.as_ref(),
            budget,
            self.config.pull,
            &needed,
            &queued,
            &self.image_rounds,
        )
        .await
        {
            warn!(error = %e, "image cache reconciliation failed");
        }
    }
}
