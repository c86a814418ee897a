//! StateStore — the redb-backed Task Store.
//!
//! Tasks, results and blobs are JSON or raw bytes in `&[u8]` value
//! columns. Unassigned tasks are additionally indexed in `QUEUE` by
//! creation sequence; dequeue reads the oldest window of that index,
//! runs the allocator and marks the admitted tasks assigned, all inside
//! one write transaction, so concurrent dequeues never hand out the same
//! task twice.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use redb::{Database, ReadableDatabase, ReadableTable};
use sandgrid_core::{ResourceLimits, Task, TaskResult};
use sandgrid_placement::allocate;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// How many of the oldest unassigned tasks one dequeue considers.
pub const DEFAULT_DEQUEUE_WINDOW: usize = 100;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

/// Hex sha256 of `bytes`, the reference under which a blob is stored.
pub fn blob_reference(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Thread-safe task store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    window: usize,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(db),
            window: DEFAULT_DEQUEUE_WINDOW,
        };
        store.ensure_tables()?;
        debug!(?path, "task store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(db),
            window: DEFAULT_DEQUEUE_WINDOW,
        };
        store.ensure_tables()?;
        debug!("in-memory task store opened");
        Ok(store)
    }

    pub fn with_dequeue_window(mut self, window: usize) -> Self {
        self.window = window.max(1);
        self
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(TASKS).map_err(map_err!(Table))?;
        txn.open_table(QUEUE).map_err(map_err!(Table))?;
        txn.open_table(RESULTS).map_err(map_err!(Table))?;
        txn.open_table(BLOBS).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Tasks ──────────────────────────────────────────────────────

    /// Validate and enqueue a task; returns the id assigned to it.
    ///
    /// Every file must reference a blob already in the store.
    pub fn put_task(&self, mut task: Task) -> StateResult<String> {
        task.validate().map_err(map_err!(Invalid))?;
        for (name, entry) in &task.files {
            if entry.reference.is_none() {
                return Err(StateError::Invalid(format!(
                    "file {name:?} must reference an uploaded blob"
                )));
            }
        }
        task.limits.normalize();
        let id = uuid::Uuid::new_v4().simple().to_string();
        task.id = Some(id.clone());

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let sequence;
        {
            let blobs = txn.open_table(BLOBS).map_err(map_err!(Table))?;
            for (name, entry) in &task.files {
                let Some(reference) = entry.reference.as_deref() else {
                    continue;
                };
                if blobs.get(reference).map_err(map_err!(Read))?.is_none() {
                    return Err(StateError::NotFound(format!(
                        "blob {reference} for file {name:?}"
                    )));
                }
            }

            let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
            sequence = meta
                .get(SEQUENCE_KEY)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(0);
            meta.insert(SEQUENCE_KEY, sequence + 1)
                .map_err(map_err!(Write))?;

            let record = TaskRecord {
                task,
                sequence,
                created_at: unix_now(),
                assignee: None,
                assigned_at: None,
                resolved: false,
            };
            let value = encode(&record)?;
            let mut tasks = txn.open_table(TASKS).map_err(map_err!(Table))?;
            tasks
                .insert(id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            let mut queue = txn.open_table(QUEUE).map_err(map_err!(Table))?;
            queue
                .insert(sequence, id.as_str())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        info!(task_id = %id, sequence, "task submitted");
        Ok(id)
    }

    /// Get a task together with its queue bookkeeping.
    pub fn get_record(&self, id: &str) -> StateResult<Option<TaskRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TASKS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    pub fn get_task(&self, id: &str) -> StateResult<Option<Task>> {
        Ok(self.get_record(id)?.map(|record| record.task))
    }

    /// Delete a task and its result. Returns true if the task existed.
    pub fn delete_task(&self, id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut tasks = txn.open_table(TASKS).map_err(map_err!(Table))?;
            let removed: Option<TaskRecord> = match tasks.remove(id).map_err(map_err!(Write))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            if let Some(record) = &removed {
                let mut queue = txn.open_table(QUEUE).map_err(map_err!(Table))?;
                queue.remove(record.sequence).map_err(map_err!(Write))?;
                let mut results = txn.open_table(RESULTS).map_err(map_err!(Table))?;
                results.remove(id).map_err(map_err!(Write))?;
            }
            existed = removed.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(task_id = %id, existed, "task deleted");
        Ok(existed)
    }

    // ── Dequeue ────────────────────────────────────────────────────

    /// Hand `assignee` a batch of tasks that fits `capacity`.
    ///
    /// Returned tasks carry their granted limits, including CPU and GPU
    /// offsets.
    pub fn dequeue(
        &self,
        assignee: &str,
        concurrency: usize,
        capacity: &ResourceLimits,
        tags: &BTreeSet<String>,
    ) -> StateResult<Vec<Task>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut assigned = Vec::new();
        {
            let mut queue = txn.open_table(QUEUE).map_err(map_err!(Table))?;
            let mut tasks = txn.open_table(TASKS).map_err(map_err!(Table))?;

            let mut window: Vec<(u64, String)> = Vec::new();
            for entry in queue.iter().map_err(map_err!(Read))?.take(self.window) {
                let (sequence, id) = entry.map_err(map_err!(Read))?;
                window.push((sequence.value(), id.value().to_string()));
            }

            let mut candidates: Vec<TaskRecord> = Vec::with_capacity(window.len());
            let mut dangling = Vec::new();
            for (sequence, id) in &window {
                match tasks.get(id.as_str()).map_err(map_err!(Read))? {
                    Some(guard) => candidates.push(decode(guard.value())?),
                    None => dangling.push(*sequence),
                }
            }
            for sequence in dangling {
                warn!(sequence, "dropping queue entry without task");
                queue.remove(sequence).map_err(map_err!(Write))?;
            }

            let allocation = allocate(&candidates, capacity, tags, concurrency);
            let now = unix_now();
            for admission in &allocation.admitted {
                let mut record = candidates[admission.index].clone();
                record.assignee = Some(assignee.to_string());
                record.assigned_at = Some(now);
                queue.remove(record.sequence).map_err(map_err!(Write))?;
                let value = encode(&record)?;
                tasks
                    .insert(record.id(), value.as_slice())
                    .map_err(map_err!(Write))?;
                let mut task = record.task;
                task.limits = admission.granted.clone();
                assigned.push(task);
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if !assigned.is_empty() {
            info!(%assignee, count = assigned.len(), "tasks assigned");
        }
        Ok(assigned)
    }

    /// Return tasks assigned at least `older_than` ago without a result
    /// to the queue. Returns their ids.
    pub fn unassign_stale(&self, older_than: Duration) -> StateResult<Vec<String>> {
        let cutoff = unix_now().saturating_sub(older_than.as_secs());
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut reaped = Vec::new();
        {
            let mut tasks = txn.open_table(TASKS).map_err(map_err!(Table))?;
            let mut stale: Vec<TaskRecord> = Vec::new();
            for entry in tasks.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let record: TaskRecord = decode(value.value())?;
                if !record.resolved && record.assigned_at.is_some_and(|at| at <= cutoff) {
                    stale.push(record);
                }
            }
            let mut queue = txn.open_table(QUEUE).map_err(map_err!(Table))?;
            for mut record in stale {
                info!(
                    task_id = %record.id(),
                    assignee = ?record.assignee,
                    "assignment timed out, task requeued"
                );
                record.assignee = None;
                record.assigned_at = None;
                queue
                    .insert(record.sequence, record.id())
                    .map_err(map_err!(Write))?;
                let value = encode(&record)?;
                tasks
                    .insert(record.id(), value.as_slice())
                    .map_err(map_err!(Write))?;
                reaped.push(record.id().to_string());
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(reaped)
    }

    pub fn queue_stats(&self) -> StateResult<QueueStats> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TASKS).map_err(map_err!(Table))?;
        let mut stats = QueueStats::default();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: TaskRecord = decode(value.value())?;
            stats.total += 1;
            if record.resolved {
                stats.resolved += 1;
                continue;
            }
            stats.unresolved += 1;
            match record.assignee {
                Some(assignee) => {
                    stats.assigned += 1;
                    *stats.assignees.entry(assignee).or_default() += 1;
                }
                None => stats.unassigned += 1,
            }
        }
        Ok(stats)
    }

    // ── Results ────────────────────────────────────────────────────

    /// Store the result of task `id`, pushed by principal `by`.
    ///
    /// A task still assigned to another principal refuses the result.
    pub fn put_result(&self, id: &str, result: &TaskResult, by: &str) -> StateResult<()> {
        for (name, entry) in &result.files {
            if entry.reference.is_none() {
                return Err(StateError::Invalid(format!(
                    "result file {name:?} must reference an uploaded blob"
                )));
            }
        }
        let mut result = result.clone();
        result.id = Some(id.to_string());
        result.limits.normalize();
        let value = encode(&result)?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut tasks = txn.open_table(TASKS).map_err(map_err!(Table))?;
            let mut record: TaskRecord = match tasks.get(id).map_err(map_err!(Read))? {
                Some(guard) => decode(guard.value())?,
                None => return Err(StateError::NotFound(format!("task {id}"))),
            };
            if let Some(assignee) = &record.assignee {
                if assignee != by {
                    return Err(StateError::Forbidden(format!(
                        "task {id} is assigned to {assignee}"
                    )));
                }
            }
            if !record.is_assigned() {
                let mut queue = txn.open_table(QUEUE).map_err(map_err!(Table))?;
                queue.remove(record.sequence).map_err(map_err!(Write))?;
            }
            record.resolved = true;
            let encoded = encode(&record)?;
            tasks
                .insert(id, encoded.as_slice())
                .map_err(map_err!(Write))?;

            let mut results = txn.open_table(RESULTS).map_err(map_err!(Table))?;
            results
                .insert(id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        info!(task_id = %id, %by, "result stored");
        Ok(())
    }

    pub fn get_result(&self, id: &str) -> StateResult<Option<TaskResult>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RESULTS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    // ── Blobs ──────────────────────────────────────────────────────

    /// Store `bytes` under their sha256; returns the reference.
    pub fn put_blob(&self, bytes: &[u8]) -> StateResult<String> {
        let reference = blob_reference(bytes);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(BLOBS).map_err(map_err!(Table))?;
            let present = table
                .get(reference.as_str())
                .map_err(map_err!(Read))?
                .is_some();
            if !present {
                table
                    .insert(reference.as_str(), bytes)
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%reference, size = bytes.len(), "blob stored");
        Ok(reference)
    }

    pub fn get_blob(&self, reference: &str) -> StateResult<Option<Vec<u8>>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(BLOBS).map_err(map_err!(Table))?;
        Ok(table
            .get(reference)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandgrid_core::FileEntry;

    fn task(cpus: u32, memory: u64) -> Task {
        Task {
            image: Some("alpine".into()),
            args: vec!["true".into()],
            limits: ResourceLimits {
                cpus: Some(cpus),
                memory: Some(memory),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn capacity(cpus: u32, memory: u64) -> ResourceLimits {
        ResourceLimits {
            cpus: Some(cpus),
            memory: Some(memory),
            ..Default::default()
        }
    }

    fn no_tags() -> BTreeSet<String> {
        BTreeSet::new()
    }

    #[test]
    fn put_and_get_task() {
        let store = StateStore::open_in_memory().unwrap();
        let id = store.put_task(task(1, 1024)).unwrap();
        let stored = store.get_task(&id).unwrap().unwrap();
        assert_eq!(stored.id.as_deref(), Some(id.as_str()));
        assert_eq!(stored.limits.cpus, Some(1));
        assert!(store.get_task("missing").unwrap().is_none());
    }

    #[test]
    fn submission_order_is_kept() {
        let store = StateStore::open_in_memory().unwrap();
        let first = store.put_task(task(1, 1)).unwrap();
        let second = store.put_task(task(1, 1)).unwrap();
        let a = store.get_record(&first).unwrap().unwrap();
        let b = store.get_record(&second).unwrap().unwrap();
        assert!(a.sequence < b.sequence);
    }

    #[test]
    fn task_files_must_reference_stored_blobs() {
        let store = StateStore::open_in_memory().unwrap();

        let mut local = task(1, 1);
        local.files.insert("input".into(), FileEntry::local("input.txt"));
        assert!(matches!(store.put_task(local), Err(StateError::Invalid(_))));

        let mut missing = task(1, 1);
        missing.files.insert(
            "input".into(),
            FileEntry {
                path: None,
                reference: Some(blob_reference(b"nope")),
            },
        );
        assert!(matches!(store.put_task(missing), Err(StateError::NotFound(_))));

        let reference = store.put_blob(b"hello").unwrap();
        let mut ok = task(1, 1);
        ok.files.insert(
            "input".into(),
            FileEntry {
                path: None,
                reference: Some(reference),
            },
        );
        store.put_task(ok).unwrap();
    }

    #[test]
    fn dequeue_assigns_in_order_within_capacity() {
        let store = StateStore::open_in_memory().unwrap();
        let a = store.put_task(task(2, 1024)).unwrap();
        let b = store.put_task(task(2, 1024)).unwrap();
        let c = store.put_task(task(2, 1024)).unwrap();

        let batch = store
            .dequeue("worker-1", 10, &capacity(4, 4096), &no_tags())
            .unwrap();
        let ids: Vec<_> = batch.iter().filter_map(|t| t.id.clone()).collect();
        assert_eq!(ids, vec![a.clone(), b.clone()]);
        assert_eq!(batch[0].limits.cpus_offset, Some(0));
        assert_eq!(batch[1].limits.cpus_offset, Some(2));

        let record = store.get_record(&a).unwrap().unwrap();
        assert_eq!(record.assignee.as_deref(), Some("worker-1"));

        let next = store
            .dequeue("worker-2", 10, &capacity(4, 4096), &no_tags())
            .unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].id.as_deref(), Some(c.as_str()));

        let empty = store
            .dequeue("worker-3", 10, &capacity(4, 4096), &no_tags())
            .unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn dequeue_window_limits_the_scan() {
        let store = StateStore::open_in_memory().unwrap().with_dequeue_window(2);
        store.put_task(task(8, 1)).unwrap();
        store.put_task(task(8, 1)).unwrap();
        let small = store.put_task(task(1, 1)).unwrap();

        let batch = store
            .dequeue("w", 10, &capacity(2, 4096), &no_tags())
            .unwrap();
        assert!(batch.is_empty());

        let wide = store.clone().with_dequeue_window(DEFAULT_DEQUEUE_WINDOW);
        let batch = wide.dequeue("w", 10, &capacity(2, 4096), &no_tags()).unwrap();
        assert_eq!(batch[0].id.as_deref(), Some(small.as_str()));
    }

    #[test]
    fn result_resolves_task() {
        let store = StateStore::open_in_memory().unwrap();
        let id = store.put_task(task(1, 1)).unwrap();
        store.dequeue("w", 1, &capacity(1, 1), &no_tags()).unwrap();

        let result = TaskResult {
            result: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            store.put_result(&id, &result, "intruder"),
            Err(StateError::Forbidden(_))
        ));
        store.put_result(&id, &result, "w").unwrap();

        let stored = store.get_result(&id).unwrap().unwrap();
        assert_eq!(stored.id.as_deref(), Some(id.as_str()));
        assert_eq!(stored.result, Some(0));

        let stats = store.queue_stats().unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.resolved, 1);
        assert_eq!(stats.assigned, 0);
    }

    #[test]
    fn result_for_unknown_task_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store
            .put_result("missing", &TaskResult::default(), "w")
            .unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[test]
    fn stale_assignments_return_to_the_queue() {
        let store = StateStore::open_in_memory().unwrap();
        let id = store.put_task(task(1, 1)).unwrap();
        store.dequeue("w", 1, &capacity(1, 1), &no_tags()).unwrap();

        assert!(store.unassign_stale(Duration::from_secs(3600)).unwrap().is_empty());
        assert_eq!(store.unassign_stale(Duration::ZERO).unwrap(), vec![id.clone()]);

        let record = store.get_record(&id).unwrap().unwrap();
        assert!(record.assignee.is_none());
        let batch = store.dequeue("v", 1, &capacity(1, 1), &no_tags()).unwrap();
        assert_eq!(batch[0].id.as_deref(), Some(id.as_str()));
    }

    #[test]
    fn queue_stats_counts_per_assignee() {
        let store = StateStore::open_in_memory().unwrap();
        for _ in 0..3 {
            store.put_task(task(1, 1)).unwrap();
        }
        store.dequeue("w", 2, &capacity(4, 4), &no_tags()).unwrap();
        let stats = store.queue_stats().unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.unresolved, 3);
        assert_eq!(stats.assigned, 2);
        assert_eq!(stats.unassigned, 1);
        assert_eq!(stats.assignees.get("w"), Some(&2));
    }

    #[test]
    fn delete_removes_task_and_result() {
        let store = StateStore::open_in_memory().unwrap();
        let id = store.put_task(task(1, 1)).unwrap();
        store.put_result(&id, &TaskResult::default(), "w").unwrap();
        assert!(store.delete_task(&id).unwrap());
        assert!(!store.delete_task(&id).unwrap());
        assert!(store.get_result(&id).unwrap().is_none());
        assert!(store.dequeue("w", 1, &capacity(1, 1), &no_tags()).unwrap().is_empty());
    }

    #[test]
    fn blobs_are_content_addressed() {
        let store = StateStore::open_in_memory().unwrap();
        let a = store.put_blob(b"payload").unwrap();
        let b = store.put_blob(b"payload").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_eq!(store.get_blob(&a).unwrap().unwrap(), b"payload");
        assert!(store.get_blob("0000").unwrap().is_none());
    }
}
