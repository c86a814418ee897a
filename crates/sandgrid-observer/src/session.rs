//! A single observer session: one group per tracked controller.
//!
//! ```text
//!   OPEN ──limits──▶ LIMITED ──freeze──▶ FROZEN ⇄ THAWED
//!     │                 │                  │        │
//!     └─────────────────┴──────close───────┴────────┴──▶ CLOSED
//! ```
//!
//! Groups are created as `sandgrid_<id>` directly under the creator's
//! current group in every controller. Callers serialize access to a
//! session; the registry wraps each one in its own mutex.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use sandgrid_core::{ResourceLimits, ResourceUsage};
use tracing::{debug, info};

use crate::cgroup::{ControlGroupSystem, TRACKED_CONTROLLERS, format_cpuset, limited_cpuset};
use crate::error::{ObserverError, ObserverResult};

pub const GROUP_PREFIX: &str = "sandgrid_";

/// Time for killed processes to leave the group after a thaw.
const CLOSE_GRACE: Duration = Duration::from_millis(100);
const FREEZE_POLL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Limited,
    Frozen,
    Thawed,
    Closed,
}

pub struct Session {
    id: String,
    creator_pid: u32,
    creator_start: Option<u64>,
    groups: BTreeMap<String, PathBuf>,
    parents: BTreeMap<String, PathBuf>,
    started: Instant,
    close_time: Option<Instant>,
    stats: ResourceUsage,
    state: SessionState,
}

impl Session {
    /// Create the session's groups under the current groups of `pid`.
    pub fn open(system: &ControlGroupSystem, id: &str, pid: u32) -> ObserverResult<Self> {
        let pid_groups = system.pid_groups(pid)?;
        let name = format!("{GROUP_PREFIX}{id}");
        let mut groups = BTreeMap::new();
        let mut parents = BTreeMap::new();
        for controller in TRACKED_CONTROLLERS {
            let parent = pid_groups.get(controller).ok_or_else(|| {
                ObserverError::Unavailable(format!("pid {pid} has no {controller} group"))
            })?;
            groups.insert(controller.to_string(), parent.join(&name));
            parents.insert(controller.to_string(), parent.clone());
        }

        let mut session = Session {
            id: id.to_string(),
            creator_pid: pid,
            creator_start: system.process_start_time(pid),
            groups,
            parents,
            started: Instant::now(),
            close_time: None,
            stats: ResourceUsage::default(),
            state: SessionState::Open,
        };
        if let Err(e) = session.create_groups(system) {
            session.remove_groups(system);
            session.state = SessionState::Closed;
            return Err(e);
        }
        debug!(session_id = %id, creator = pid, "session opened");
        Ok(session)
    }

    fn create_groups(&self, system: &ControlGroupSystem) -> ObserverResult<()> {
        let kernel = system.kernel();
        for controller in TRACKED_CONTROLLERS {
            let group = self.group(controller)?;
            kernel.create_dir(group)?;
            if controller == "cpuset" {
                let parent = self.parent(controller)?;
                for inherited in ["cpuset.cpus", "cpuset.mems"] {
                    let value = kernel.read(&parent.join(inherited))?;
                    kernel.write(&group.join(inherited), value.trim())?;
                }
            }
        }
        Ok(())
    }

    /// Freezer last: a frozen group blocks removal elsewhere.
    fn remove_groups(&self, system: &ControlGroupSystem) {
        let order = TRACKED_CONTROLLERS
            .iter()
            .filter(|c| **c != "freezer")
            .chain(std::iter::once(&"freezer"));
        for controller in order {
            if let (Some(group), Some(parent)) =
                (self.groups.get(*controller), self.parents.get(*controller))
            {
                system.close_group(group, parent);
            }
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn creator_pid(&self) -> u32 {
        self.creator_pid
    }

    pub fn close_time(&self) -> Option<Instant> {
        self.close_time
    }

    pub fn group(&self, controller: &str) -> ObserverResult<&Path> {
        self.groups
            .get(controller)
            .map(PathBuf::as_path)
            .ok_or_else(|| ObserverError::Unavailable(format!("{controller} group")))
    }

    fn parent(&self, controller: &str) -> ObserverResult<&Path> {
        self.parents
            .get(controller)
            .map(PathBuf::as_path)
            .ok_or_else(|| ObserverError::Unavailable(format!("{controller} parent group")))
    }

    fn ensure_open(&self) -> ObserverResult<()> {
        if self.state == SessionState::Closed {
            return Err(ObserverError::Closed(self.id.clone()));
        }
        Ok(())
    }

    /// Move `pid` into the session.
    ///
    /// The pid must sit in the session's parent group (or already in the
    /// session); anything else means it belongs to someone else.
    pub fn attach(&mut self, system: &ControlGroupSystem, pid: u32) -> ObserverResult<()> {
        self.ensure_open()?;
        let current = system.pid_groups(pid)?;
        for controller in TRACKED_CONTROLLERS {
            let at = current.get(controller).map(PathBuf::as_path);
            if at != Some(self.parent(controller)?) && at != Some(self.group(controller)?) {
                return Err(ObserverError::Invariant(format!(
                    "pid {pid} is outside the parent of session {} in {controller}",
                    self.id
                )));
            }
        }
        for controller in TRACKED_CONTROLLERS {
            system
                .kernel()
                .write(&self.group(controller)?.join("tasks"), &pid.to_string())?;
        }
        debug!(session_id = %self.id, pid, "process attached");
        Ok(())
    }

    /// Move `pid` back to the session's parent group.
    pub fn detach(&mut self, system: &ControlGroupSystem, pid: u32) -> ObserverResult<()> {
        self.ensure_open()?;
        let current = system.pid_groups(pid)?;
        for controller in TRACKED_CONTROLLERS {
            let own = self.group(controller)?;
            let inside = current.get(controller).is_some_and(|g| g.starts_with(own));
            if !inside {
                return Err(ObserverError::Invariant(format!(
                    "pid {pid} is not in session {}",
                    self.id
                )));
            }
        }
        for controller in TRACKED_CONTROLLERS {
            system
                .kernel()
                .write(&self.parent(controller)?.join("tasks"), &pid.to_string())?;
        }
        debug!(session_id = %self.id, pid, "process detached");
        Ok(())
    }

    /// Apply every present limit. Absent fields leave earlier settings alone.
    pub fn limits(
        &mut self,
        system: &ControlGroupSystem,
        limits: &ResourceLimits,
    ) -> ObserverResult<()> {
        self.ensure_open()?;
        let kernel = system.kernel();

        if let Some(memory) = limits.memory {
            let group = self.group("memory")?;
            kernel.write(&group.join("memory.limit_in_bytes"), &memory.to_string())?;
            if let Some(swap) = limits.swap {
                kernel.write(
                    &group.join("memory.memsw.limit_in_bytes"),
                    &memory.saturating_add(swap).to_string(),
                )?;
            }
            debug!(session_id = %self.id, memory, swap = ?limits.swap, "memory limited");
        }

        if let Some(cpus) = limits.cpus {
            let root = system.mount_point("cpuset")?;
            let available = system.effective_cpus(self.parent("cpuset")?, root);
            let selected = limited_cpuset(&available, cpus, limits.cpus_offset.unwrap_or(0));
            let cpuset = format_cpuset(&selected);
            kernel.write(&self.group("cpuset")?.join("cpuset.cpus"), &cpuset)?;
            debug!(session_id = %self.id, %cpuset, "cpus limited");
        }

        if let Some(pids) = limits.pids {
            kernel.write(&self.group("pids")?.join("pids.max"), &pids.to_string())?;
            debug!(session_id = %self.id, pids, "pids limited");
        }

        if let Some(time) = limits.time {
            self.close_time = Some(self.started + time);
            debug!(session_id = %self.id, ?time, "time limited");
        }

        if self.state == SessionState::Open {
            self.state = SessionState::Limited;
        }
        Ok(())
    }

    /// Freeze every member and wait until the kernel reports FROZEN.
    pub fn freeze(&mut self, system: &ControlGroupSystem) -> ObserverResult<()> {
        self.ensure_open()?;
        let state_file = self.group("freezer")?.join("freezer.state");
        system.kernel().write(&state_file, "FROZEN")?;
        loop {
            let state = system.kernel().read(&state_file)?;
            if state.trim().eq_ignore_ascii_case("frozen") {
                break;
            }
            thread::sleep(FREEZE_POLL);
        }
        self.state = SessionState::Frozen;
        debug!(session_id = %self.id, "session frozen");
        Ok(())
    }

    pub fn thaw(&mut self, system: &ControlGroupSystem) -> ObserverResult<()> {
        self.ensure_open()?;
        let state_file = self.group("freezer")?.join("freezer.state");
        system.kernel().write(&state_file, "THAWED")?;
        self.state = SessionState::Thawed;
        debug!(session_id = %self.id, "session thawed");
        Ok(())
    }

    fn self_freezing(&self, system: &ControlGroupSystem) -> ObserverResult<bool> {
        let path = self.group("freezer")?.join("freezer.self_freezing");
        Ok(system.kernel().read(&path)?.trim() == "1")
    }

    /// Members of the session, including nested groups.
    pub fn members(&self, system: &ControlGroupSystem) -> Vec<u32> {
        match self.group("pids") {
            Ok(group) => system.list_procs(group),
            Err(_) => Vec::new(),
        }
    }

    /// SIGKILL every member while frozen, then restore the freezer state.
    ///
    /// Best-effort: a session with no members or missing groups is fine.
    pub fn kill(&mut self, system: &ControlGroupSystem) {
        if self.state == SessionState::Closed {
            return;
        }
        let was_frozen = self.self_freezing(system).unwrap_or(false);
        let previous = self.state;
        if let Err(e) = self.freeze(system) {
            debug!(session_id = %self.id, error = %e, "freeze before kill failed");
        }
        for pid in self.members(system) {
            if let Err(e) = system.kernel().kill(pid) {
                debug!(session_id = %self.id, pid, error = %e, "kill failed");
            }
        }
        if !was_frozen {
            if let Err(e) = self.thaw(system) {
                debug!(session_id = %self.id, error = %e, "thaw after kill failed");
            }
        }
        self.state = previous;
        debug!(session_id = %self.id, "session killed");
    }

    /// Kill, thaw, and remove every group. Never fails; closing twice is a no-op.
    pub fn close(&mut self, system: &ControlGroupSystem) {
        if self.state == SessionState::Closed {
            return;
        }
        self.kill(system);
        if let Err(e) = self.thaw(system) {
            debug!(session_id = %self.id, error = %e, "thaw before close failed");
        }
        thread::sleep(CLOSE_GRACE);
        self.remove_groups(system);
        self.state = SessionState::Closed;
        info!(session_id = %self.id, "session closed");
    }

    /// Sample the kernel counters and fold them into the running snapshot.
    pub fn stats(&mut self, system: &ControlGroupSystem) -> ResourceUsage {
        if self.state != SessionState::Closed {
            let mut sample = system.stats(&self.groups);
            sample.time = Some(self.started.elapsed());
            self.stats.accumulate(&sample);
        }
        self.stats.clone()
    }

    /// The creator is gone (or its pid reused) and nothing is left inside.
    pub fn finished(&self, system: &ControlGroupSystem) -> bool {
        let creator_alive = match (self.creator_start, system.process_start_time(self.creator_pid))
        {
            (Some(recorded), Some(current)) => recorded == current,
            _ => false,
        };
        !creator_alive && self.members(system).is_empty()
    }

    pub fn expired(&self, now: Instant) -> bool {
        self.close_time.is_some_and(|deadline| deadline <= now)
    }
}
