/// Process registry: the single shared map from job name to live process.
///
/// All mutation goes through these methods. Critical sections only clone,
/// insert or remove; nothing under the lock touches I/O. Once closed, the
/// registry refuses new jobs.
use crate::category::ToolCategory;
use crate::error::JobError;
use crate::job::{
    CommandLine, JobHandle, JobId, JobOutcome, StopReason, TerminalState, TrackedProcess,
};
use chrono::{DateTime, Utc};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Snapshot row for one active job.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveJob {
    pub name: String,
    pub category: ToolCategory,
    pub pid: u32,
    pub command: CommandLine,
    pub challenge: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(rename = "elapsed_secs", serialize_with = "serialize_secs_f64")]
    pub elapsed: Duration,
    #[serde(rename = "timeout_secs", serialize_with = "serialize_opt_secs")]
    pub timeout: Option<Duration>,
}

fn serialize_secs_f64<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

fn serialize_opt_secs<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.serialize_some(&d.as_secs()),
        None => s.serialize_none(),
    }
}

/// How many jobs ended in each kind of terminal state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobTallies {
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub shutdown: u64,
}

impl JobTallies {
    fn record(&mut self, state: &TerminalState) {
        match state {
            s if s.is_success() => self.completed += 1,
            TerminalState::Killed { reason } => match reason {
                StopReason::Timeout { .. } => self.timed_out += 1,
                StopReason::Cancelled => self.cancelled += 1,
                StopReason::Shutdown => self.shutdown += 1,
            },
            _ => self.failed += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.completed + self.failed + self.timed_out + self.cancelled + self.shutdown
    }
}

/// Copy of the registry state at one instant.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    pub active: Vec<ActiveJob>,
    pub tallies: JobTallies,
}

#[derive(Default)]
struct Inner {
    active: HashMap<String, Arc<TrackedProcess>>,
    /// Unregistered while still running: nameless, but still swept.
    detached: HashMap<JobId, Arc<TrackedProcess>>,
    tallies: JobTallies,
    closed: bool,
}

impl Inner {
    fn admit(&self, name: &str) -> Result<(), JobError> {
        if self.closed {
            return Err(JobError::ShuttingDown {
                name: name.to_string(),
            });
        }
        if self.active.contains_key(name) {
            return Err(JobError::DuplicateName {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn live(&self) -> Vec<Arc<TrackedProcess>> {
        self.active
            .values()
            .chain(self.detached.values())
            .cloned()
            .collect()
    }
}

#[derive(Default)]
pub struct ProcessRegistry {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn next_id(&self) -> JobId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Fails fast with `DuplicateName` or `ShuttingDown` before anything is
    /// spawned.
    pub fn ensure_available(&self, name: &str) -> Result<(), JobError> {
        self.lock().admit(name)
    }

    /// Track a freshly spawned process under its name.
    pub fn register(&self, process: Arc<TrackedProcess>) -> Result<JobHandle, JobError> {
        let mut inner = self.lock();
        inner.admit(process.name())?;
        inner
            .active
            .insert(process.name().to_string(), Arc::clone(&process));
        debug!(job = %process.name(), id = process.id(), pid = process.pid(), "registered");
        Ok(JobHandle::new(process))
    }

    /// Refuse new jobs from now on. Returns false if already closed.
    pub fn close(&self) -> bool {
        let mut inner = self.lock();
        !std::mem::replace(&mut inner.closed, true)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Release `name`. Unknown names are `NotFound`, same as `get`.
    ///
    /// A job that is still running stays tracked without a name until it
    /// finishes: timeouts, `terminate_all` and `kill_all_now` still reach it.
    /// Use `JobHandle::cancel` to stop a job.
    pub fn unregister(&self, name: &str) -> Result<JobHandle, JobError> {
        let mut inner = self.lock();
        match inner.active.remove(name) {
            Some(process) => {
                let running = !process.is_finished();
                if running {
                    inner.detached.insert(process.id(), Arc::clone(&process));
                }
                debug!(job = %name, id = process.id(), running, "unregistered");
                Ok(JobHandle::new(process))
            }
            None => Err(JobError::NotFound {
                name: name.to_string(),
            }),
        }
    }

    pub fn get(&self, name: &str) -> Result<JobHandle, JobError> {
        self.lock()
            .active
            .get(name)
            .map(|p| JobHandle::new(Arc::clone(p)))
            .ok_or_else(|| JobError::NotFound {
                name: name.to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.lock().active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Owned copy of every active job, sorted by start time.
    pub fn list_active(&self) -> Vec<ActiveJob> {
        let processes: Vec<Arc<TrackedProcess>> = self.lock().active.values().cloned().collect();
        Self::describe(processes)
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let (processes, tallies) = {
            let inner = self.lock();
            let processes: Vec<Arc<TrackedProcess>> = inner.active.values().cloned().collect();
            (processes, inner.tallies)
        };
        RegistrySnapshot {
            active: Self::describe(processes),
            tallies,
        }
    }

    fn describe(processes: Vec<Arc<TrackedProcess>>) -> Vec<ActiveJob> {
        let mut jobs: Vec<ActiveJob> = processes
            .iter()
            .map(|p| ActiveJob {
                name: p.name().to_string(),
                category: p.category().clone(),
                pid: p.pid(),
                command: p.command().clone(),
                challenge: p.challenge().map(str::to_string),
                started_at: p.started_at(),
                elapsed: p.elapsed(),
                timeout: p.timeout(),
            })
            .collect();
        jobs.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.name.cmp(&b.name)));
        jobs
    }

    /// Every live job, named or detached.
    pub(crate) fn handles(&self) -> Vec<JobHandle> {
        self.handles_where(|_| true)
    }

    pub(crate) fn handles_where(&self, keep: impl Fn(&TrackedProcess) -> bool) -> Vec<JobHandle> {
        let processes = self.lock().live();
        processes
            .into_iter()
            .filter(|p| keep(p))
            .map(JobHandle::new)
            .collect()
    }

    /// Live jobs past their deadline that have not been asked to stop yet.
    pub(crate) fn expired(&self, now: Instant) -> Vec<Arc<TrackedProcess>> {
        let processes = self.lock().live();
        processes
            .into_iter()
            .filter(|p| p.stop_requested().is_none() && p.is_expired(now))
            .collect()
    }

    /// Record the single terminal transition for `process` and drop it from
    /// the active map if the entry under its name is still this job.
    pub(crate) fn retire(&self, process: &TrackedProcess, outcome: JobOutcome) -> bool {
        let mut inner = self.lock();
        let state = outcome.state.clone();
        if !process.finish(outcome) {
            warn!(job = %process.name(), id = process.id(), "terminal state already recorded");
            return false;
        }
        inner.tallies.record(&state);
        let current = inner
            .active
            .get(process.name())
            .is_some_and(|p| p.id() == process.id());
        if current {
            inner.active.remove(process.name());
        }
        inner.detached.remove(&process.id());
        true
    }

    /// SIGKILL every tracked process group right now, without waiting.
    ///
    /// Used from `Drop`, where nothing can be awaited.
    pub fn kill_all_now(&self) -> usize {
        let processes = self.lock().live();
        let mut killed = 0;
        for process in processes.iter().filter(|p| p.pid() != 0) {
            let pgid = Pid::from_raw(process.pid() as i32);
            match killpg(pgid, Signal::SIGKILL) {
                Ok(()) => killed += 1,
                Err(nix::errno::Errno::ESRCH) => {}
                Err(e) => warn!(job = %process.name(), pid = process.pid(), error = %e, "SIGKILL failed"),
            }
        }
        if killed > 0 {
            info!(killed, "force-killed remaining job process groups");
        }
        killed
    }
}
