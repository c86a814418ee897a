//! ResourceLimits — a partially specified resource vector.
//!
//! Every field is optional; an absent field means "no constraint" in that
//! dimension. The same type describes what a task declares, what a
//! machine offers and what a session is finally granted.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::parse::serde_magnitude;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus_offset: Option<u32>,
    #[serde(
        default,
        with = "serde_magnitude::memory",
        skip_serializing_if = "Option::is_none"
    )]
    pub memory: Option<u64>,
    #[serde(
        default,
        with = "serde_magnitude::memory",
        skip_serializing_if = "Option::is_none"
    )]
    pub swap: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pids: Option<u64>,
    #[serde(
        default,
        with = "serde_magnitude::memory",
        skip_serializing_if = "Option::is_none"
    )]
    pub storage: Option<u64>,
    #[serde(
        default,
        with = "serde_magnitude::memory",
        skip_serializing_if = "Option::is_none"
    )]
    pub image: Option<u64>,
    #[serde(
        default,
        with = "serde_magnitude::memory",
        skip_serializing_if = "Option::is_none"
    )]
    pub workspace: Option<u64>,
    #[serde(
        default,
        with = "serde_magnitude::time",
        skip_serializing_if = "Option::is_none"
    )]
    pub time: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpus: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpus_offset: Option<u32>,
    #[serde(
        default,
        with = "serde_magnitude::memory",
        skip_serializing_if = "Option::is_none"
    )]
    pub gpu_memory: Option<u64>,

    // ── Extension dimensions ───────────────────────────────────────
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perf_instructions: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perf_cycles: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cgroup_depth: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cgroup_descendants: Option<u32>,
}

/// Minimum of two optional values where `None` means unbounded.
fn min_present<T: Ord + Copy>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

impl ResourceLimits {
    /// Parse and normalize limits from a JSON document.
    pub fn from_json_str(json: &str) -> crate::CoreResult<Self> {
        let mut limits: ResourceLimits = serde_json::from_str(json)?;
        limits.normalize();
        Ok(limits)
    }

    /// Intersect two limit vectors, field by field.
    ///
    /// A present value always beats an absent one; two present values
    /// yield their minimum. For `network`, the minimum is logical AND.
    pub fn tighten(&self, other: &ResourceLimits) -> ResourceLimits {
        let mut out = ResourceLimits {
            cpus: min_present(self.cpus, other.cpus),
            cpus_offset: min_present(self.cpus_offset, other.cpus_offset),
            memory: min_present(self.memory, other.memory),
            swap: min_present(self.swap, other.swap),
            pids: min_present(self.pids, other.pids),
            storage: min_present(self.storage, other.storage),
            image: min_present(self.image, other.image),
            workspace: min_present(self.workspace, other.workspace),
            time: min_present(self.time, other.time),
            network: min_present(self.network, other.network),
            gpus: min_present(self.gpus, other.gpus),
            gpus_offset: min_present(self.gpus_offset, other.gpus_offset),
            gpu_memory: min_present(self.gpu_memory, other.gpu_memory),
            perf_instructions: min_present(self.perf_instructions, other.perf_instructions),
            perf_cycles: min_present(self.perf_cycles, other.perf_cycles),
            cgroup_depth: min_present(self.cgroup_depth, other.cgroup_depth),
            cgroup_descendants: min_present(self.cgroup_descendants, other.cgroup_descendants),
        };
        out.normalize();
        out
    }

    /// Clear GPU placement fields when no GPU is requested.
    pub fn normalize(&mut self) {
        if self.gpus.unwrap_or(0) == 0 {
            self.gpus_offset = None;
            self.gpu_memory = None;
        }
    }

    /// Merge allocator-assigned offsets.
    pub fn merge_offsets(&mut self, cpus_offset: Option<u32>, gpus_offset: Option<u32>) {
        if cpus_offset.is_some() {
            self.cpus_offset = cpus_offset;
        }
        if gpus_offset.is_some() {
            self.gpus_offset = gpus_offset;
        }
        self.normalize();
    }

    /// True when no dimension is constrained.
    pub fn is_unbounded(&self) -> bool {
        *self == ResourceLimits::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(json: &str) -> ResourceLimits {
        ResourceLimits::from_json_str(json).unwrap()
    }

    #[test]
    fn parses_suffixed_magnitudes() {
        let l = limits(r#"{"cpus": 2, "memory": "512m", "time": "10M", "storage": 4096}"#);
        assert_eq!(l.cpus, Some(2));
        assert_eq!(l.memory, Some(512 * 1024 * 1024));
        assert_eq!(l.time, Some(Duration::from_secs(600)));
        assert_eq!(l.storage, Some(4096));
        assert_eq!(l.swap, None);
    }

    #[test]
    fn serializes_canonical_form() {
        let l = limits(r#"{"memory": "1k", "time": "1M"}"#);
        let v = serde_json::to_value(&l).unwrap();
        assert_eq!(v["memory"], "1024b");
        assert_eq!(v["time"], "60s");
        assert!(v.get("cpus").is_none());
    }

    #[test]
    fn tighten_takes_present_minimum() {
        let a = limits(r#"{"cpus": 4, "memory": "1g", "network": true}"#);
        let b = limits(r#"{"cpus": 2, "pids": 100, "network": false}"#);
        let t = a.tighten(&b);
        assert_eq!(t.cpus, Some(2));
        assert_eq!(t.memory, Some(1024 * 1024 * 1024));
        assert_eq!(t.pids, Some(100));
        assert_eq!(t.network, Some(false));
        assert_eq!(t.swap, None);
    }

    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self, bound: u64) -> u64 {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (self.0 >> 33) % bound
        }

        /// Absent about a third of the time, otherwise in `0..bound`.
        fn maybe(&mut self, bound: u64) -> Option<u64> {
            (self.next(3) != 0).then(|| self.next(bound))
        }
    }

    fn generated(rng: &mut Lcg) -> ResourceLimits {
        let small = |rng: &mut Lcg| rng.maybe(8).map(|n| n as u32);
        let mut l = ResourceLimits {
            cpus: small(rng),
            cpus_offset: small(rng),
            memory: rng.maybe(4).map(|n| n << 30),
            swap: rng.maybe(4).map(|n| n << 20),
            pids: rng.maybe(200),
            storage: rng.maybe(1 << 20),
            image: rng.maybe(1 << 20),
            workspace: rng.maybe(1 << 20),
            time: rng.maybe(120).map(Duration::from_secs),
            network: rng.maybe(2).map(|n| n == 1),
            gpus: small(rng),
            gpus_offset: small(rng),
            gpu_memory: rng.maybe(4).map(|n| n << 30),
            perf_instructions: rng.maybe(1000),
            perf_cycles: rng.maybe(1000),
            cgroup_depth: small(rng),
            cgroup_descendants: small(rng),
        };
        l.normalize();
        l
    }

    #[test]
    fn tighten_is_associative_and_commutative() {
        let mut rng = Lcg(11);
        for _ in 0..500 {
            let (a, b, c) = (generated(&mut rng), generated(&mut rng), generated(&mut rng));
            assert_eq!(a.tighten(&b).tighten(&c), a.tighten(&b.tighten(&c)), "{a:?} {b:?} {c:?}");
            assert_eq!(a.tighten(&b), b.tighten(&a), "{a:?} {b:?}");
            assert_eq!(a.tighten(&a), a);
        }
    }

    #[test]
    fn normalize_clears_gpu_fields_without_gpus() {
        let l = limits(r#"{"gpus": 0, "gpus_offset": 1, "gpu_memory": "1g"}"#);
        assert_eq!(l.gpus_offset, None);
        assert_eq!(l.gpu_memory, None);

        let l = limits(r#"{"gpus": 1, "gpus_offset": 1, "gpu_memory": "1g"}"#);
        assert_eq!(l.gpus_offset, Some(1));
    }

    #[test]
    fn merge_offsets_respects_normalization() {
        let mut l = limits(r#"{"cpus": 2}"#);
        l.merge_offsets(Some(2), Some(1));
        assert_eq!(l.cpus_offset, Some(2));
        assert_eq!(l.gpus_offset, None);
    }

    #[test]
    fn default_is_unbounded() {
        assert!(ResourceLimits::default().is_unbounded());
        assert!(!limits(r#"{"pids": 1}"#).is_unbounded());
    }
}
