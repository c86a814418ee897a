//! GPU inventory of the machine.

use std::collections::BTreeMap;
use std::process::Stdio;

use sandgrid_core::{GpuUsage, ResourceLimits};
use tokio::process::Command;
use tracing::debug;

use crate::BoxFuture;

const NVIDIA_QUERY: &str =
    "--query-gpu=index,uuid,name,memory.total,memory.used,temperature.gpu,utilization.gpu";

pub trait GpuInventory: Send + Sync + 'static {
    /// Current state of every GPU, keyed by device index.
    fn gpus(&self) -> BoxFuture<'_, BTreeMap<String, GpuUsage>>;
}

/// Machines without GPUs.
pub struct NoGpus;

impl GpuInventory for NoGpus {
    fn gpus(&self) -> BoxFuture<'_, BTreeMap<String, GpuUsage>> {
        Box::pin(async { BTreeMap::new() })
    }
}

/// Queries `nvidia-smi`. A missing or failing tool means no GPUs.
pub struct NvidiaSmi;

impl GpuInventory for NvidiaSmi {
    fn gpus(&self) -> BoxFuture<'_, BTreeMap<String, GpuUsage>> {
        Box::pin(async {
            let output = Command::new("nvidia-smi")
                .args([NVIDIA_QUERY, "--format=csv,noheader,nounits"])
                .stdin(Stdio::null())
                .output()
                .await;
            match output {
                Ok(output) if output.status.success() => {
                    parse_nvidia_csv(&String::from_utf8_lossy(&output.stdout))
                }
                Ok(output) => {
                    debug!(status = %output.status, "nvidia-smi failed");
                    BTreeMap::new()
                }
                Err(e) => {
                    debug!(error = %e, "nvidia-smi unavailable");
                    BTreeMap::new()
                }
            }
        })
    }
}

fn field<T: std::str::FromStr>(value: Option<&str>) -> Option<T> {
    value.map(str::trim).and_then(|v| v.parse().ok())
}

/// Parse `nvidia-smi --format=csv,noheader,nounits` rows; memory is in MiB.
fn parse_nvidia_csv(text: &str) -> BTreeMap<String, GpuUsage> {
    let mut gpus = BTreeMap::new();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let mut columns = line.split(',');
        let Some(index) = columns.next().map(str::trim) else {
            continue;
        };
        let id = columns.next().map(|s| s.trim().to_string());
        let name = columns.next().map(|s| s.trim().to_string());
        let mib = |v: Option<u64>| v.map(|m| m << 20);
        let memory_total = mib(field(columns.next()));
        let memory_usage = mib(field(columns.next()));
        let temperature = field(columns.next());
        let utilization = field(columns.next());
        gpus.insert(
            index.to_string(),
            GpuUsage {
                name,
                id,
                memory_total,
                memory_usage,
                max_memory_usage: memory_usage,
                temperature,
                max_temperature: temperature,
                utilization,
                max_utilization: utilization,
            },
        );
    }
    gpus
}

/// Capacity offered by this machine: the configured limits, with the GPU
/// count defaulting to the inventory and GPU memory bounded by the
/// smallest device.
pub fn machine_capacity(
    configured: &ResourceLimits,
    gpus: &BTreeMap<String, GpuUsage>,
) -> ResourceLimits {
    let mut capacity = configured.clone();
    if capacity.gpus.is_none() {
        capacity.gpus = Some(gpus.len() as u32);
    }
    for gpu in gpus.values() {
        capacity.gpu_memory = match (capacity.gpu_memory, gpu.memory_total) {
            (Some(current), Some(total)) => Some(current.min(total)),
            (None, total) => total,
            (current, None) => current,
        };
    }
    capacity.normalize();
    capacity
}
