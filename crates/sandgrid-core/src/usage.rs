//! ResourceUsage — observed statistics for a session or task.
//!
//! Samples are folded into a running snapshot with [`ResourceUsage::accumulate`]:
//! current readings take the latest value, peaks and failure counters only
//! ever grow.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::parse::serde_magnitude;

fn max_present<T: Ord + Copy>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

fn latest<T: Copy>(old: Option<T>, new: Option<T>) -> Option<T> {
    new.or(old)
}

/// CPU time split into user and system components.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuUsage {
    #[serde(
        default,
        with = "serde_magnitude::time",
        skip_serializing_if = "Option::is_none"
    )]
    pub usage: Option<Duration>,
    #[serde(
        default,
        with = "serde_magnitude::time",
        skip_serializing_if = "Option::is_none"
    )]
    pub user: Option<Duration>,
    #[serde(
        default,
        with = "serde_magnitude::time",
        skip_serializing_if = "Option::is_none"
    )]
    pub system: Option<Duration>,
}

impl CpuUsage {
    // CPU times are cumulative counters, so a sample never lowers them.
    fn accumulate(&mut self, sample: &CpuUsage) {
        self.usage = max_present(self.usage, sample.usage);
        self.user = max_present(self.user, sample.user);
        self.system = max_present(self.system, sample.system);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryUsage {
    #[serde(
        default,
        with = "serde_magnitude::memory",
        skip_serializing_if = "Option::is_none"
    )]
    pub usage: Option<u64>,
    #[serde(
        default,
        with = "serde_magnitude::memory",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_usage: Option<u64>,
    #[serde(
        default,
        with = "serde_magnitude::memory",
        skip_serializing_if = "Option::is_none"
    )]
    pub swap: Option<u64>,
    #[serde(
        default,
        with = "serde_magnitude::memory",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_swap: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failures: Option<u64>,
}

impl MemoryUsage {
    fn accumulate(&mut self, sample: &MemoryUsage) {
        self.usage = latest(self.usage, sample.usage);
        self.max_usage = max_present(max_present(self.max_usage, sample.max_usage), sample.usage);
        self.swap = latest(self.swap, sample.swap);
        self.max_swap = max_present(max_present(self.max_swap, sample.max_swap), sample.swap);
        self.failures = max_present(self.failures, sample.failures);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidsUsage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_usage: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failures: Option<u64>,
}

impl PidsUsage {
    fn accumulate(&mut self, sample: &PidsUsage) {
        self.usage = latest(self.usage, sample.usage);
        self.max_usage = max_present(max_present(self.max_usage, sample.max_usage), sample.usage);
        self.failures = max_present(self.failures, sample.failures);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuUsage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(
        default,
        with = "serde_magnitude::memory",
        skip_serializing_if = "Option::is_none"
    )]
    pub memory_total: Option<u64>,
    #[serde(
        default,
        with = "serde_magnitude::memory",
        skip_serializing_if = "Option::is_none"
    )]
    pub memory_usage: Option<u64>,
    #[serde(
        default,
        with = "serde_magnitude::memory",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_memory_usage: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_temperature: Option<u32>,
    /// Percent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utilization: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_utilization: Option<u32>,
}

impl GpuUsage {
    fn accumulate(&mut self, sample: &GpuUsage) {
        if sample.name.is_some() {
            self.name.clone_from(&sample.name);
        }
        if sample.id.is_some() {
            self.id.clone_from(&sample.id);
        }
        self.memory_total = latest(self.memory_total, sample.memory_total);
        self.memory_usage = latest(self.memory_usage, sample.memory_usage);
        self.max_memory_usage = max_present(
            max_present(self.max_memory_usage, sample.max_memory_usage),
            sample.memory_usage,
        );
        self.temperature = latest(self.temperature, sample.temperature);
        self.max_temperature = max_present(
            max_present(self.max_temperature, sample.max_temperature),
            sample.temperature,
        );
        self.utilization = latest(self.utilization, sample.utilization);
        self.max_utilization = max_present(
            max_present(self.max_utilization, sample.max_utilization),
            sample.utilization,
        );
    }
}

/// Running statistics snapshot for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Per-CPU usage keyed by CPU index.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cpus: BTreeMap<String, CpuUsage>,
    #[serde(default)]
    pub cpu: CpuUsage,
    #[serde(default)]
    pub memory: MemoryUsage,
    #[serde(default)]
    pub pids: PidsUsage,
    /// Wall time since the session started.
    #[serde(
        default,
        with = "serde_magnitude::time",
        skip_serializing_if = "Option::is_none"
    )]
    pub time: Option<Duration>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub gpus: BTreeMap<String, GpuUsage>,
}

impl ResourceUsage {
    /// Fold a fresh sample into this snapshot.
    pub fn accumulate(&mut self, sample: &ResourceUsage) {
        for (index, cpu) in &sample.cpus {
            self.cpus.entry(index.clone()).or_default().accumulate(cpu);
        }
        self.cpu.accumulate(&sample.cpu);
        self.memory.accumulate(&sample.memory);
        self.pids.accumulate(&sample.pids);
        self.time = max_present(self.time, sample.time);
        for (index, gpu) in &sample.gpus {
            self.gpus.entry(index.clone()).or_default().accumulate(gpu);
        }
    }
}
