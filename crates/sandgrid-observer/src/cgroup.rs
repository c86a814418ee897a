//! Control group (v1) discovery, cpuset arithmetic, statistics and teardown.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sandgrid_core::{CpuUsage, ResourceUsage};
use tracing::{debug, warn};

use crate::error::{ObserverError, ObserverResult};
use crate::kernel::Kernel;

/// Controllers every session gets a group in.
pub const TRACKED_CONTROLLERS: [&str; 5] = ["memory", "cpuacct", "pids", "freezer", "cpuset"];

/// The mounted control group hierarchies of this machine.
pub struct ControlGroupSystem {
    kernel: Arc<dyn Kernel>,
    mounts: BTreeMap<String, PathBuf>,
}

impl ControlGroupSystem {
    /// Find the mount point of every enabled controller.
    ///
    /// Fails unless all tracked controllers are mounted.
    pub fn discover(kernel: Arc<dyn Kernel>) -> ObserverResult<Self> {
        let cgroups = kernel.read(Path::new("/proc/cgroups"))?;
        let available: BTreeSet<&str> = cgroups
            .lines()
            .filter(|l| !l.starts_with('#'))
            .filter_map(|l| l.split_whitespace().next())
            .collect();

        let mut mounts = BTreeMap::new();
        let mount_table = kernel.read(Path::new("/proc/mounts"))?;
        for line in mount_table.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let [_, path, fs, opts, ..] = fields.as_slice() else {
                continue;
            };
            if *fs != "cgroup" {
                continue;
            }
            let options: Vec<&str> = opts.split(',').collect();
            let named: Vec<&str> = options
                .iter()
                .filter_map(|o| o.strip_prefix("name="))
                .collect();
            if named.is_empty() {
                for option in &options {
                    if available.contains(option) {
                        debug!(controller = option, mount = path, "found control group");
                        mounts.insert(option.to_string(), PathBuf::from(path));
                    }
                }
            } else {
                for name in named {
                    debug!(controller = name, mount = path, "found named control group");
                    mounts.insert(name.to_string(), PathBuf::from(path));
                }
            }
        }

        for controller in TRACKED_CONTROLLERS {
            if !mounts.contains_key(controller) {
                return Err(ObserverError::Unavailable(format!(
                    "{controller} controller is not mounted"
                )));
            }
        }
        Ok(Self { kernel, mounts })
    }

    pub fn kernel(&self) -> &dyn Kernel {
        self.kernel.as_ref()
    }

    pub fn mount_point(&self, controller: &str) -> ObserverResult<&Path> {
        self.mounts
            .get(controller)
            .map(PathBuf::as_path)
            .ok_or_else(|| ObserverError::Unavailable(format!("{controller} controller")))
    }

    /// Absolute group directory of `pid` in every controller it belongs to.
    pub fn pid_groups(&self, pid: u32) -> ObserverResult<BTreeMap<String, PathBuf>> {
        let text = self.kernel.read(&Path::new("/proc").join(pid.to_string()).join("cgroup"))?;
        let mut groups = BTreeMap::new();
        for line in text.lines() {
            let mut parts = line.splitn(3, ':');
            let (Some(_), Some(controllers), Some(path)) = (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            for controller in controllers.split(',') {
                let controller = controller.strip_prefix("name=").unwrap_or(controller);
                let Some(mount) = self.mounts.get(controller) else {
                    continue;
                };
                let relative = path.trim().trim_start_matches('/');
                let group = if relative.is_empty() {
                    mount.clone()
                } else {
                    mount.join(relative)
                };
                groups.insert(controller.to_string(), group);
            }
        }
        Ok(groups)
    }

    /// Start time of `pid` in clock ticks since boot, if it is alive.
    ///
    /// Together with the pid this fingerprints a process: a reused pid
    /// has a different start time.
    pub fn process_start_time(&self, pid: u32) -> Option<u64> {
        let stat = self
            .kernel
            .read(&Path::new("/proc").join(pid.to_string()).join("stat"))
            .ok()?;
        // The command name may contain spaces; fields restart after ") ".
        let (_, rest) = stat.rsplit_once(") ")?;
        rest.split_whitespace().nth(19)?.parse().ok()
    }

    /// Every pid in `group` and its descendants.
    pub fn list_procs(&self, group: &Path) -> Vec<u32> {
        let mut pids = BTreeSet::new();
        for dir in self.walk_bottom_up(group) {
            if let Ok(text) = self.kernel.read(&dir.join("cgroup.procs")) {
                pids.extend(text.lines().filter_map(|l| l.trim().parse::<u32>().ok()));
            }
        }
        pids.into_iter().collect()
    }

    /// Descendants of `group` followed by `group` itself, children first.
    fn walk_bottom_up(&self, group: &Path) -> Vec<PathBuf> {
        let mut order = Vec::new();
        if let Ok(children) = self.kernel.subdirs(group) {
            for child in children {
                order.extend(self.walk_bottom_up(&child));
            }
        }
        if self.kernel.exists(group) {
            order.push(group.to_path_buf());
        }
        order
    }

    /// The effective cpuset of `group`: its own, or the nearest ancestor's.
    pub fn effective_cpus(&self, group: &Path, controller_root: &Path) -> Vec<u32> {
        let mut current = Some(group);
        while let Some(dir) = current {
            if !dir.starts_with(controller_root) {
                break;
            }
            if let Ok(text) = self.kernel.read(&dir.join("cpuset.cpus")) {
                let text = text.trim();
                if !text.is_empty() {
                    if let Ok(cpus) = parse_cpuset(text) {
                        return cpus.into_iter().collect();
                    }
                }
            }
            current = dir.parent();
        }
        Vec::new()
    }

    fn read_u64(&self, path: &Path) -> Option<u64> {
        self.kernel.read(path).ok()?.trim().parse().ok()
    }

    fn read_table(&self, path: &Path) -> BTreeMap<String, u64> {
        let Ok(text) = self.kernel.read(path) else {
            return BTreeMap::new();
        };
        text.lines()
            .filter_map(|l| {
                let (key, value) = l.split_once(char::is_whitespace)?;
                Some((key.to_string(), value.trim().parse().ok()?))
            })
            .collect()
    }

    /// Sample kernel counters for a session's groups. Missing files are skipped.
    pub fn stats(&self, groups: &BTreeMap<String, PathBuf>) -> ResourceUsage {
        let mut usage = ResourceUsage::default();

        if let Some(cpuacct) = groups.get("cpuacct") {
            let ticks = self.kernel.clock_ticks().max(1);
            let from_ticks = |t: u64| Duration::from_secs_f64(t as f64 / ticks as f64);
            let table = self.read_table(&cpuacct.join("cpuacct.stat"));
            usage.cpu = CpuUsage {
                usage: self.read_u64(&cpuacct.join("cpuacct.usage")).map(Duration::from_nanos),
                user: table.get("user").copied().map(from_ticks),
                system: table.get("system").copied().map(from_ticks),
            };
            if let Ok(text) = self.kernel.read(&cpuacct.join("cpuacct.usage_percpu")) {
                for (index, value) in text.split_whitespace().enumerate() {
                    if let Ok(ns) = value.parse::<u64>() {
                        usage.cpus.insert(
                            index.to_string(),
                            CpuUsage {
                                usage: Some(Duration::from_nanos(ns)),
                                ..Default::default()
                            },
                        );
                    }
                }
            }
        }

        if let Some(memory) = groups.get("memory") {
            let current = self.read_u64(&memory.join("memory.usage_in_bytes"));
            let peak = self
                .read_u64(&memory.join("memory.max_usage_in_bytes"))
                .map(|p| p.max(current.unwrap_or(0)));
            let memsw = self.read_u64(&memory.join("memory.memsw.usage_in_bytes"));
            let memsw_peak = self.read_u64(&memory.join("memory.memsw.max_usage_in_bytes"));
            usage.memory.usage = current;
            usage.memory.max_usage = peak;
            usage.memory.swap = memsw.map(|m| m.saturating_sub(current.unwrap_or(0)));
            usage.memory.max_swap = memsw_peak.map(|m| {
                m.saturating_sub(peak.unwrap_or(0))
                    .max(usage.memory.swap.unwrap_or(0))
            });
            usage.memory.failures = self.read_u64(&memory.join("memory.failcnt"));
        }

        if let Some(pids) = groups.get("pids") {
            usage.pids.usage = self.read_u64(&pids.join("pids.current"));
            usage.pids.failures = self.read_table(&pids.join("pids.events")).get("max").copied();
        }

        usage
    }

    /// Remove `group` and everything below it, children first.
    ///
    /// Remaining members are moved to `parent` before each removal. Every
    /// step is best-effort; a group that is already gone is not an error.
    pub fn close_group(&self, group: &Path, parent: &Path) {
        let destination = parent.join("tasks");
        for dir in self.walk_bottom_up(group) {
            if let Ok(text) = self.kernel.read(&dir.join("cgroup.procs")) {
                for pid in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
                    if let Err(e) = self.kernel.write(&destination, pid) {
                        debug!(pid, error = %e, "failed to migrate process out of group");
                    }
                }
            }
            if let Err(e) = self.kernel.remove_dir(&dir) {
                warn!(group = %dir.display(), error = %e, "failed to remove control group");
            }
        }
    }
}

/// Parse a kernel cpuset list such as `"0-3,5"`.
pub fn parse_cpuset(text: &str) -> ObserverResult<BTreeSet<u32>> {
    let invalid = || ObserverError::Protocol(format!("invalid cpuset: {text:?}"));
    let mut cpus = BTreeSet::new();
    for part in text.trim().split(',').filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: u32 = lo.trim().parse().map_err(|_| invalid())?;
                let hi: u32 = hi.trim().parse().map_err(|_| invalid())?;
                cpus.extend(lo..=hi);
            }
            None => {
                cpus.insert(part.trim().parse().map_err(|_| invalid())?);
            }
        }
    }
    Ok(cpus)
}

/// Pick `count` CPUs from `available`, starting at `offset` and wrapping.
///
/// The sorted CPU list is doubled and sliced, so an offset near the end
/// continues from the beginning.
pub fn limited_cpuset(available: &[u32], count: u32, offset: u32) -> Vec<u32> {
    if available.is_empty() {
        return Vec::new();
    }
    let mut sorted = available.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    let len = sorted.len();
    let count = (count as usize).min(len);
    let start = offset as usize % len;
    let doubled: Vec<u32> = sorted.iter().chain(sorted.iter()).copied().collect();
    doubled[start..start + count].to_vec()
}

pub fn format_cpuset(cpus: &[u32]) -> String {
    cpus.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::fake::{CGROUP_ROOT, FakeKernel};

    fn system() -> (Arc<FakeKernel>, ControlGroupSystem) {
        let kernel = Arc::new(FakeKernel::new());
        let system = ControlGroupSystem::discover(kernel.clone()).unwrap();
        (kernel, system)
    }

    #[test]
    fn discovers_every_tracked_controller() {
        let (_, system) = system();
        for controller in TRACKED_CONTROLLERS {
            assert_eq!(
                system.mount_point(controller).unwrap(),
                Path::new(CGROUP_ROOT).join(controller)
            );
        }
    }

    #[test]
    fn missing_controller_is_unavailable() {
        let kernel = Arc::new(FakeKernel::new());
        kernel.set_file("/proc/mounts", "cgroup /sys/fs/cgroup/memory cgroup rw,memory 0 0\n");
        let err = ControlGroupSystem::discover(kernel).err().unwrap();
        assert!(matches!(err, ObserverError::Unavailable(_)));
    }

    #[test]
    fn named_hierarchies_and_comounts() {
        let kernel = Arc::new(FakeKernel::new());
        kernel.set_file(
            "/proc/mounts",
            "cgroup /cg/systemd cgroup rw,xattr,name=systemd 0 0\n\
             cgroup /cg/cpu,cpuacct cgroup rw,cpu,cpuacct 0 0\n\
             cgroup /cg/memory cgroup rw,memory 0 0\n\
             cgroup /cg/pids cgroup rw,pids 0 0\n\
             cgroup /cg/freezer cgroup rw,freezer 0 0\n\
             cgroup /cg/cpuset cgroup rw,cpuset 0 0\n",
        );
        let system = ControlGroupSystem::discover(kernel).unwrap();
        assert_eq!(system.mount_point("systemd").unwrap(), Path::new("/cg/systemd"));
        assert_eq!(system.mount_point("cpuacct").unwrap(), Path::new("/cg/cpu,cpuacct"));
    }

    #[test]
    fn pid_groups_and_start_time() {
        let (kernel, system) = system();
        kernel.spawn(42, 12345);
        let groups = system.pid_groups(42).unwrap();
        assert_eq!(groups["memory"], Path::new(CGROUP_ROOT).join("memory"));
        assert_eq!(system.process_start_time(42), Some(12345));
        assert_eq!(system.process_start_time(43), None);
    }

    #[test]
    fn cpuset_parsing() {
        let cpus = parse_cpuset("0-3,5\n").unwrap();
        assert_eq!(cpus.into_iter().collect::<Vec<_>>(), vec![0, 1, 2, 3, 5]);
        assert!(parse_cpuset("a-b").is_err());
    }

    #[test]
    fn cpuset_rotation_wraps() {
        let available = [0, 1, 2, 3];
        assert_eq!(limited_cpuset(&available, 2, 0), vec![0, 1]);
        assert_eq!(limited_cpuset(&available, 2, 2), vec![2, 3]);
        assert_eq!(limited_cpuset(&available, 2, 3), vec![3, 0]);
        assert_eq!(limited_cpuset(&available, 9, 1), vec![1, 2, 3, 0]);
        assert_eq!(limited_cpuset(&available, 1, 6), vec![2]);
        assert!(limited_cpuset(&[], 2, 0).is_empty());
        assert_eq!(format_cpuset(&[3, 0]), "3,0");
    }

    #[test]
    fn stats_read_counters() {
        let (kernel, system) = system();
        let memory = Path::new(CGROUP_ROOT).join("memory/s");
        let cpuacct = Path::new(CGROUP_ROOT).join("cpuacct/s");
        kernel.create_dir(&memory).unwrap();
        kernel.create_dir(&cpuacct).unwrap();
        kernel.set_file(memory.join("memory.usage_in_bytes"), "100\n");
        kernel.set_file(memory.join("memory.max_usage_in_bytes"), "300\n");
        kernel.set_file(memory.join("memory.memsw.usage_in_bytes"), "150\n");
        kernel.set_file(memory.join("memory.failcnt"), "2\n");
        kernel.set_file(cpuacct.join("cpuacct.usage"), "2000000000\n");
        kernel.set_file(cpuacct.join("cpuacct.stat"), "user 150\nsystem 50\n");
        kernel.set_file(cpuacct.join("cpuacct.usage_percpu"), "1000000000 1000000000\n");

        let groups = BTreeMap::from([
            ("memory".to_string(), memory),
            ("cpuacct".to_string(), cpuacct),
        ]);
        let stats = system.stats(&groups);
        assert_eq!(stats.memory.usage, Some(100));
        assert_eq!(stats.memory.max_usage, Some(300));
        assert_eq!(stats.memory.swap, Some(50));
        assert_eq!(stats.memory.max_swap, None);
        assert_eq!(stats.memory.failures, Some(2));
        assert_eq!(stats.cpu.usage, Some(Duration::from_secs(2)));
        assert_eq!(stats.cpu.user, Some(Duration::from_millis(1500)));
        assert_eq!(stats.cpus.len(), 2);
    }

    #[test]
    fn close_group_migrates_and_removes_subtree() {
        let (kernel, system) = system();
        let root = Path::new(CGROUP_ROOT).join("pids");
        let group = root.join("s");
        kernel.create_dir(&group.join("inner")).unwrap();
        kernel.spawn(7, 1);
        kernel.write(&group.join("inner/tasks"), "7").unwrap();

        system.close_group(&group, &root);
        assert!(!kernel.exists(&group));
        assert_eq!(kernel.group_of(7, "pids").unwrap(), root);

        // Already gone: nothing to do, nothing to report.
        system.close_group(&group, &root);
    }
}
