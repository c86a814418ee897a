//! SessionRegistry — the observer's concurrent map of live sessions.
//!
//! The map lock only guards insert/lookup/remove; every session carries
//! its own mutex, so operations on different sessions run in parallel
//! while operations on one session are serialized.
//!
//! Two sweeps reclaim sessions nobody will close:
//! - **expiry**: the session's `time` limit has elapsed
//! - **orphan**: the creator is gone (pid dead or reused) and the session
//!   has no members left
//!
//! The final statistics of a closed session stay readable for a retention
//! window, so a `stats` racing a `close` still gets an answer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, TryLockError};
use std::time::{Duration, Instant};

use sandgrid_core::{ResourceLimits, ResourceUsage};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use crate::cgroup::ControlGroupSystem;
use crate::error::{ObserverError, ObserverResult};
use crate::session::{Session, SessionState};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Retained {
    stats: ResourceUsage,
    closed_at: Instant,
}

pub struct SessionRegistry {
    system: ControlGroupSystem,
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
    /// One gate per id being opened; cgroups are created under the gate,
    /// never under the map lock.
    opening: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    retained: Mutex<HashMap<String, Retained>>,
    salt: String,
    retention: Duration,
}

impl SessionRegistry {
    pub fn new(system: ControlGroupSystem, retention: Duration) -> Self {
        Self {
            system,
            sessions: RwLock::new(HashMap::new()),
            opening: Mutex::new(HashMap::new()),
            retained: Mutex::new(HashMap::new()),
            salt: Uuid::new_v4().simple().to_string(),
            retention,
        }
    }

    // ── Capabilities ───────────────────────────────────────────────

    pub fn new_session_id(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }

    /// The secret for `session_id`, derived from a per-process salt.
    pub fn secret(&self, session_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.salt.as_bytes());
        hasher.update(session_id.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn check_secret(&self, session_id: &str, secret: &str) -> ObserverResult<()> {
        if session_id.is_empty() || secret.is_empty() || self.secret(session_id) != secret {
            return Err(ObserverError::Unauthorized);
        }
        Ok(())
    }

    // ── Lookup ─────────────────────────────────────────────────────

    fn get(&self, session_id: &str) -> Option<Arc<Mutex<Session>>> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions.get(session_id).cloned()
    }

    fn session(&self, session_id: &str) -> ObserverResult<Arc<Mutex<Session>>> {
        if let Some(session) = self.get(session_id) {
            return Ok(session);
        }
        if lock(&self.retained).contains_key(session_id) {
            return Err(ObserverError::Closed(session_id.to_string()));
        }
        Err(ObserverError::UnknownSession(session_id.to_string()))
    }

    pub fn session_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    // ── Operations ─────────────────────────────────────────────────

    /// Open a fresh session bound to `pid`; returns its id and secret.
    pub fn open(&self, pid: u32) -> ObserverResult<(String, String)> {
        let session_id = self.new_session_id();
        self.open_with_id(&session_id, pid)?;
        let secret = self.secret(&session_id);
        Ok((session_id, secret))
    }

    /// Open `session_id`, or return it if it is already live.
    ///
    /// A closed id is never reopened.
    pub fn open_with_id(&self, session_id: &str, pid: u32) -> ObserverResult<Arc<Mutex<Session>>> {
        if let Some(existing) = self.get(session_id) {
            return Ok(existing);
        }
        let gate = lock(&self.opening)
            .entry(session_id.to_string())
            .or_default()
            .clone();
        let opened = {
            let _gate = lock(&gate);
            self.create(session_id, pid)
        };
        let mut opening = lock(&self.opening);
        if opening.get(session_id).is_some_and(|g| Arc::ptr_eq(g, &gate)) {
            opening.remove(session_id);
        }
        opened
    }

    fn create(&self, session_id: &str, pid: u32) -> ObserverResult<Arc<Mutex<Session>>> {
        if let Some(existing) = self.get(session_id) {
            return Ok(existing);
        }
        if lock(&self.retained).contains_key(session_id) {
            return Err(ObserverError::Closed(session_id.to_string()));
        }
        let session = Arc::new(Mutex::new(Session::open(&self.system, session_id, pid)?));
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id.to_string(), session.clone());
        Ok(session)
    }

    /// Attach `pid`, opening the session with `pid` as creator if needed.
    pub fn attach(&self, session_id: &str, pid: u32) -> ObserverResult<()> {
        let session = self.open_with_id(session_id, pid)?;
        let mut session = lock(&session);
        session.attach(&self.system, pid)
    }

    pub fn detach(&self, session_id: &str, pid: u32) -> ObserverResult<()> {
        let session = self.session(session_id)?;
        let mut session = lock(&session);
        session.detach(&self.system, pid)
    }

    pub fn limits(&self, session_id: &str, limits: &ResourceLimits) -> ObserverResult<()> {
        let session = self.session(session_id)?;
        let mut session = lock(&session);
        session.limits(&self.system, limits)
    }

    /// Live statistics, or the retained final snapshot of a closed session.
    pub fn stats(&self, session_id: &str) -> ObserverResult<ResourceUsage> {
        if let Some(session) = self.get(session_id) {
            let mut session = lock(&session);
            return Ok(session.stats(&self.system));
        }
        match lock(&self.retained).get(session_id) {
            Some(retained) => Ok(retained.stats.clone()),
            None => Err(ObserverError::UnknownSession(session_id.to_string())),
        }
    }

    pub fn freeze(&self, session_id: &str) -> ObserverResult<()> {
        let session = self.session(session_id)?;
        let mut session = lock(&session);
        session.freeze(&self.system)
    }

    pub fn thaw(&self, session_id: &str) -> ObserverResult<()> {
        let session = self.session(session_id)?;
        let mut session = lock(&session);
        session.thaw(&self.system)
    }

    /// Kill every member. Unknown sessions are a no-op.
    pub fn kill(&self, session_id: &str) {
        if let Some(session) = self.get(session_id) {
            lock(&session).kill(&self.system);
        }
    }

    /// Close and forget a session. Unknown or closed sessions are a no-op.
    pub fn close(&self, session_id: &str) {
        let Some(session) = self.get(session_id) else {
            return;
        };
        {
            let mut session = lock(&session);
            if session.state() != SessionState::Closed {
                let stats = session.stats(&self.system);
                session.close(&self.system);
                lock(&self.retained).insert(
                    session_id.to_string(),
                    Retained {
                        stats,
                        closed_at: Instant::now(),
                    },
                );
            }
        }
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
    }

    /// Close every session; used on shutdown.
    pub fn close_all(&self) {
        let ids: Vec<String> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        for id in ids {
            self.close(&id);
        }
    }

    // ── Sweeps ─────────────────────────────────────────────────────

    /// Close expired and orphaned sessions, drop stale retained stats.
    ///
    /// Sessions busy with another request are skipped until the next sweep.
    pub fn sweep(&self) {
        let now = Instant::now();
        let live: Vec<(String, Arc<Mutex<Session>>)> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, s)| (id.clone(), s.clone()))
            .collect();

        for (id, session) in live {
            let reason = {
                let session = match session.try_lock() {
                    Ok(guard) => guard,
                    Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                    Err(TryLockError::WouldBlock) => continue,
                };
                if session.expired(now) {
                    Some("time limit elapsed")
                } else if session.finished(&self.system) {
                    Some("creator gone and no members left")
                } else {
                    None
                }
            };
            if let Some(reason) = reason {
                info!(session_id = %id, reason, "reclaiming session");
                self.close(&id);
            }
        }

        let retention = self.retention;
        lock(&self.retained).retain(|id, r| {
            let keep = now.saturating_duration_since(r.closed_at) < retention;
            if !keep {
                debug!(session_id = %id, "dropping retained stats");
            }
            keep
        });
    }
}
