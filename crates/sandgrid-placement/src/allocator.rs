//! Greedy FIFO admission over a multi-dimensional capacity vector.
//!
//! ```text
//!   candidates (oldest first)
//!        │
//!        ▼
//!   exclusive & batch non-empty? ──yes──▶ stop
//!        │ no
//!   tags ⊆ available? ─────────────no───▶ skip
//!        │ yes
//!   every dimension fits remaining? ─no─▶ skip
//!        │ yes
//!   admit: assign offsets, consume remaining
//!        │
//!   ceiling reached or exclusive? ──yes─▶ stop
//! ```
//!
//! A dimension constrained by the capacity but left undeclared by the task
//! fails the check, except `network` and the perf/cgroup extension
//! dimensions, which pass when undeclared.

use std::collections::{BTreeSet, HashMap};

use sandgrid_core::ResourceLimits;
use tracing::debug;

use crate::schedulable::Schedulable;

/// One admitted candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// Position in the candidate slice.
    pub index: usize,
    pub cpus_offset: u32,
    pub gpus_offset: Option<u32>,
    /// Declared limits tightened with the capacity, offsets merged.
    pub granted: ResourceLimits,
}

/// The outcome of one allocation round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    /// Admitted candidates in original order.
    pub admitted: Vec<Admission>,
    /// Capacity left after the round.
    pub remaining: ResourceLimits,
}

impl Allocation {
    pub fn indices(&self) -> Vec<usize> {
        self.admitted.iter().map(|a| a.index).collect()
    }
}

/// Undeclared on the task fails against a constrained capacity.
fn fits<T: Ord>(remaining: Option<T>, declared: Option<T>) -> bool {
    match remaining {
        None => true,
        Some(cap) => matches!(declared, Some(d) if d <= cap),
    }
}

/// Undeclared on the task passes.
fn fits_if_declared<T: Ord>(remaining: Option<T>, declared: Option<T>) -> bool {
    match (remaining, declared) {
        (Some(cap), Some(d)) => d <= cap,
        _ => true,
    }
}

fn consume<T>(remaining: &mut Option<T>, declared: Option<T>)
where
    T: Copy + std::ops::Sub<Output = T> + Ord,
{
    if let (Some(cap), Some(d)) = (*remaining, declared) {
        if d <= cap {
            *remaining = Some(cap - d);
        }
    }
}

/// Check every dimension in order, returning the first that does not fit.
fn check(
    remaining: &ResourceLimits,
    declared: &ResourceLimits,
    image_cost: Option<u64>,
) -> Result<(), &'static str> {
    if !fits(remaining.cpus, declared.cpus) {
        return Err("cpus");
    }
    if declared.gpus.unwrap_or(0) > 0 {
        if !matches!((remaining.gpus, declared.gpus), (Some(cap), Some(d)) if d <= cap) {
            return Err("gpus");
        }
        if !fits(remaining.gpu_memory, declared.gpu_memory) {
            return Err("gpu_memory");
        }
    }
    if !fits(remaining.memory, declared.memory) {
        return Err("memory");
    }
    if !fits(remaining.swap, declared.swap) {
        return Err("swap");
    }
    if !fits(remaining.pids, declared.pids) {
        return Err("pids");
    }
    if !fits(remaining.storage, declared.storage) {
        return Err("storage");
    }
    if !fits(remaining.image, image_cost) {
        return Err("image");
    }
    if !fits(remaining.workspace, declared.workspace) {
        return Err("workspace");
    }
    if remaining.network == Some(false) && declared.network == Some(true) {
        return Err("network");
    }
    if !fits(remaining.time, declared.time) {
        return Err("time");
    }
    if !fits_if_declared(remaining.perf_instructions, declared.perf_instructions) {
        return Err("perf_instructions");
    }
    if !fits_if_declared(remaining.perf_cycles, declared.perf_cycles) {
        return Err("perf_cycles");
    }
    if !fits_if_declared(remaining.cgroup_depth, declared.cgroup_depth) {
        return Err("cgroup_depth");
    }
    if !fits_if_declared(remaining.cgroup_descendants, declared.cgroup_descendants) {
        return Err("cgroup_descendants");
    }
    Ok(())
}

/// Select the next round of tasks to run on `capacity`.
///
/// Candidates are walked oldest first and never reordered: a candidate
/// that does not fit is skipped, and later ones are still considered. At
/// most `concurrency` candidates are admitted.
pub fn allocate<T: Schedulable>(
    candidates: &[T],
    capacity: &ResourceLimits,
    tags: &BTreeSet<String>,
    concurrency: usize,
) -> Allocation {
    let mut remaining = capacity.clone();
    let mut image_usage: HashMap<&str, u64> = HashMap::new();
    let mut admitted: Vec<Admission> = Vec::new();
    let mut cpus_committed: u32 = 0;
    let mut gpus_committed: u32 = 0;

    if concurrency == 0 {
        return Allocation {
            admitted,
            remaining,
        };
    }

    for (index, candidate) in candidates.iter().enumerate() {
        if !admitted.is_empty() && candidate.exclusive() {
            debug!(index, "exclusive candidate ends the round");
            break;
        }
        if !candidate.requires().iter().all(|tag| tags.contains(tag)) {
            debug!(index, "candidate skipped: missing tags");
            continue;
        }

        let declared = candidate.limits();
        let image_key = candidate.image().unwrap_or_default();
        let already = image_usage.get(image_key).copied().unwrap_or(0);
        let image_cost = declared.image.map(|size| size.max(already) - already);

        if let Err(dimension) = check(&remaining, declared, image_cost) {
            debug!(index, dimension, "candidate skipped: does not fit");
            continue;
        }

        let gpus = declared.gpus.unwrap_or(0);
        let (Some(next_cpus), Some(next_gpus)) = (
            cpus_committed.checked_add(declared.cpus.unwrap_or(0)),
            gpus_committed.checked_add(gpus),
        ) else {
            debug!(index, "candidate skipped: offsets out of range");
            continue;
        };
        let gpus_offset = (gpus > 0).then_some(gpus_committed);
        let mut granted = declared.tighten(capacity);
        granted.merge_offsets(Some(cpus_committed), gpus_offset);

        consume(&mut remaining.cpus, declared.cpus);
        if gpus > 0 {
            consume(&mut remaining.gpus, declared.gpus);
        }
        consume(&mut remaining.memory, declared.memory);
        consume(&mut remaining.swap, declared.swap);
        consume(&mut remaining.pids, declared.pids);
        consume(&mut remaining.storage, declared.storage);
        if remaining.image.is_some() {
            consume(&mut remaining.image, image_cost);
            if let Some(size) = declared.image {
                image_usage.insert(image_key, size.max(already));
            }
        }
        consume(&mut remaining.workspace, declared.workspace);
        consume(&mut remaining.perf_instructions, declared.perf_instructions);
        consume(&mut remaining.perf_cycles, declared.perf_cycles);
        consume(&mut remaining.cgroup_descendants, declared.cgroup_descendants);

        debug!(index, cpus_offset = cpus_committed, ?gpus_offset, "candidate admitted");
        admitted.push(Admission {
            index,
            cpus_offset: cpus_committed,
            gpus_offset,
            granted,
        });
        cpus_committed = next_cpus;
        gpus_committed = next_gpus;

        if admitted.len() >= concurrency || candidate.exclusive() {
            break;
        }
    }

    Allocation {
        admitted,
        remaining,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandgrid_core::Task;

    fn task(json: &str) -> Task {
        Task::from_json_str(json).unwrap()
    }

    fn caps(json: &str) -> ResourceLimits {
        ResourceLimits::from_json_str(json).unwrap()
    }

    fn no_tags() -> BTreeSet<String> {
        BTreeSet::new()
    }

    #[test]
    fn undeclared_core_dimension_fails() {
        let tasks = vec![task(r#"{"limits": {"cpus": 1}}"#)];
        let alloc = allocate(&tasks, &caps(r#"{"cpus": 4, "memory": "1g"}"#), &no_tags(), 4);
        assert!(alloc.admitted.is_empty());
    }

    #[test]
    fn undeclared_extension_dimensions_pass() {
        let tasks = vec![task(r#"{"limits": {"cpus": 1}}"#)];
        let capacity = caps(
            r#"{"cpus": 4, "network": false, "perf_cycles": 100, "cgroup_depth": 2, "cgroup_descendants": 5}"#,
        );
        let alloc = allocate(&tasks, &capacity, &no_tags(), 4);
        assert_eq!(alloc.indices(), vec![0]);
    }

    #[test]
    fn network_request_needs_network() {
        let tasks = vec![task(r#"{"limits": {"network": true}}"#)];
        let alloc = allocate(&tasks, &caps(r#"{"network": false}"#), &no_tags(), 1);
        assert!(alloc.admitted.is_empty());
        let alloc = allocate(&tasks, &caps(r#"{"network": true}"#), &no_tags(), 1);
        assert_eq!(alloc.indices(), vec![0]);
    }

    #[test]
    fn gpus_need_gpu_capacity() {
        let tasks = vec![
            task(r#"{"limits": {"gpus": 1, "gpu_memory": "2g"}}"#),
            task(r#"{"limits": {"gpus": 1, "gpu_memory": "1g"}}"#),
            task(r#"{"limits": {"gpus": 1, "gpu_memory": "1g"}}"#),
        ];
        let capacity = caps(r#"{"gpus": 2, "gpu_memory": "1g"}"#);
        let alloc = allocate(&tasks, &capacity, &no_tags(), 4);
        assert_eq!(alloc.indices(), vec![1, 2]);
        assert_eq!(alloc.admitted[0].gpus_offset, Some(0));
        assert_eq!(alloc.admitted[1].gpus_offset, Some(1));
        assert_eq!(alloc.remaining.gpus, Some(0));
        // gpu_memory is a per-device bound and is not consumed.
        assert_eq!(alloc.remaining.gpu_memory, Some(1024 * 1024 * 1024));

        let alloc = allocate(&tasks[1..2], &caps(r#"{"cpus": 4}"#), &no_tags(), 1);
        assert!(alloc.admitted.is_empty());
    }

    #[test]
    fn zero_concurrency_admits_nothing() {
        let tasks = vec![task(r#"{}"#)];
        let alloc = allocate(&tasks, &ResourceLimits::default(), &no_tags(), 0);
        assert!(alloc.admitted.is_empty());
    }

    #[test]
    fn concurrency_ceiling_stops_round() {
        let tasks = vec![task("{}"), task("{}"), task("{}")];
        let alloc = allocate(&tasks, &ResourceLimits::default(), &no_tags(), 2);
        assert_eq!(alloc.indices(), vec![0, 1]);
    }

    #[test]
    fn offsets_past_u32_skip_the_candidate() {
        let tasks = vec![
            task(&format!(r#"{{"limits": {{"cpus": {}}}}}"#, u32::MAX)),
            task(r#"{"limits": {"cpus": 1}}"#),
            task(r#"{"limits": {"cpus": 0}}"#),
        ];
        let alloc = allocate(&tasks, &ResourceLimits::default(), &no_tags(), 4);
        assert_eq!(alloc.indices(), vec![0, 2]);
        assert_eq!(alloc.admitted[0].cpus_offset, 0);
        assert_eq!(alloc.admitted[1].cpus_offset, u32::MAX);
    }

    #[test]
    fn granted_limits_are_tightened_with_offsets() {
        let tasks = vec![
            task(r#"{"limits": {"cpus": 1, "memory": "1g", "time": "30s"}}"#),
            task(r#"{"limits": {"cpus": 1, "memory": "1g", "time": "1h"}}"#),
            task(r#"{"limits": {"cpus": 2, "memory": "1g", "time": "10s"}}"#),
        ];
        let capacity = caps(r#"{"cpus": 4, "memory": "4g", "time": "1M"}"#);
        let alloc = allocate(&tasks, &capacity, &no_tags(), 4);
        assert_eq!(alloc.indices(), vec![0, 2]);
        let second = &alloc.admitted[1].granted;
        assert_eq!(second.cpus_offset, Some(1));
        assert_eq!(second.time, Some(std::time::Duration::from_secs(10)));
        // Time is checked, never consumed.
        assert_eq!(alloc.remaining.time, Some(std::time::Duration::from_secs(60)));
    }
}
