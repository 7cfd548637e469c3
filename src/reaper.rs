/// Reaper / timeout enforcer.
///
/// A fixed-interval scan asks expired jobs to stop. The stop itself is done
/// by the job's supervisor through [`terminate`], which is also what user
/// cancel and application shutdown end up calling: one kill path.
use crate::job::{StopReason, StopRequest};
use crate::registry::ProcessRegistry;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Child;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Send `signal` to the whole process group led by `pid`.
///
/// The group may already be gone between our check and the signal; that race
/// is expected and is not an error.
pub(crate) fn signal_group(pid: u32, signal: Signal) -> bool {
    if pid == 0 {
        return false;
    }
    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) => {
            debug!(pid, ?signal, "signalled process group");
            true
        }
        Err(nix::errno::Errno::ESRCH) => {
            debug!(pid, ?signal, "process group already exited");
            false
        }
        Err(e) => {
            warn!(pid, ?signal, error = %e, "failed to signal process group");
            false
        }
    }
}

/// Resolves once the job's stop request is (or becomes) forced.
pub(crate) async fn forced(stop: &mut watch::Receiver<Option<StopRequest>>) {
    loop {
        if stop.borrow_and_update().is_some_and(|request| request.force) {
            return;
        }
        if stop.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Graceful-then-forced termination of a job's process group.
///
/// SIGTERM, wait up to `grace`, SIGKILL if still alive, reap the leader, then
/// one more SIGKILL to the group for anything the tool forked that is still
/// hanging around. A forced request on `stop` skips straight to SIGKILL, even
/// when it arrives in the middle of the grace period.
pub(crate) async fn terminate(
    child: &mut Child,
    pid: u32,
    grace: Duration,
    stop: &mut watch::Receiver<Option<StopRequest>>,
) -> std::io::Result<ExitStatus> {
    let force_now = stop.borrow_and_update().is_some_and(|request| request.force);
    if !force_now {
        signal_group(pid, Signal::SIGTERM);
        let exited = tokio::select! {
            status = tokio::time::timeout(grace, child.wait()) => match status {
                Ok(status) => Some(status),
                Err(_) => {
                    warn!(
                        pid,
                        grace_ms = grace.as_millis() as u64,
                        "process did not exit after SIGTERM, sending SIGKILL"
                    );
                    None
                }
            },
            _ = forced(stop) => {
                debug!(pid, "stop was forced during the grace period");
                None
            }
        };
        if let Some(status) = exited {
            signal_group(pid, Signal::SIGKILL);
            return status;
        }
    }

    signal_group(pid, Signal::SIGKILL);
    if let Err(e) = child.start_kill() {
        debug!(pid, error = %e, "direct kill failed, child likely already exited");
    }
    let status = child.wait().await;

    signal_group(pid, Signal::SIGKILL);
    status
}

/// Periodic timeout scan over the registry.
pub struct Reaper {
    registry: Arc<ProcessRegistry>,
    poll_interval: Duration,
}

impl Reaper {
    pub fn new(registry: Arc<ProcessRegistry>, poll_interval: Duration) -> Self {
        Self {
            registry,
            poll_interval,
        }
    }

    /// Request a timeout stop for every job past its deadline at `now`.
    /// Returns how many stops were newly requested.
    pub fn scan(&self, now: Instant) -> usize {
        let mut requested = 0;
        for process in self.registry.expired(now) {
            let Some(limit) = process.timeout() else {
                continue;
            };
            if process.request_stop(StopReason::Timeout { limit }, false) {
                info!(
                    job = %process.name(),
                    pid = process.pid(),
                    limit_secs = limit.as_secs(),
                    "job exceeded its timeout, terminating"
                );
                requested += 1;
            }
        }
        requested
    }

    /// Run the scan loop until `shutdown` flips (or its sender is dropped).
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            debug!(
                interval_ms = self.poll_interval.as_millis() as u64,
                "reaper started"
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.scan(Instant::now());
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("reaper stopped");
        })
    }
}

/// Stop every tracked job with `reason` and wait until each has recorded its
/// terminal state. With `force` the groups get SIGKILL without a grace
/// period. Returns how many jobs were stopped.
pub async fn terminate_all(registry: &ProcessRegistry, reason: StopReason, force: bool) -> usize {
    let handles = registry.handles();
    if handles.is_empty() {
        debug!("no jobs to terminate");
        return 0;
    }

    info!(count = handles.len(), ?reason, force, "terminating all jobs");
    for handle in &handles {
        if !handle.request_stop(reason, force) {
            debug!(
                job = %handle.name(),
                already = ?handle.stop_requested(),
                "stop already in progress"
            );
        }
    }
    for handle in &handles {
        let outcome = handle.wait().await;
        debug!(job = %handle.name(), state = %outcome.state, "job terminated");
    }
    handles.len()
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::time::Duration;

    /// Non-zombie processes in group `pgid`, read from /proc. Orphaned
    /// zombies are ignored: reaping them is init's job, not ours.
    pub(crate) fn live_group_members(pgid: u32) -> Vec<u32> {
        let Ok(entries) = std::fs::read_dir("/proc") else {
            return Vec::new();
        };
        entries
            .filter_map(|entry| {
                let pid: u32 = entry.ok()?.file_name().to_str()?.parse().ok()?;
                let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
                // "<pid> (<comm>) <state> <ppid> <pgrp> ..."
                let rest = &stat[stat.rfind(')')? + 1..];
                let mut fields = rest.split_whitespace();
                let state = fields.next()?;
                let _ppid = fields.next()?;
                let pgrp: u32 = fields.next()?.parse().ok()?;
                (pgrp == pgid && state != "Z").then_some(pid)
            })
            .collect()
    }

    /// Poll until group `pgid` has no live members or `within` runs out.
    pub(crate) async fn group_is_gone(pgid: u32, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            if live_group_members(pgid).is_empty() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobSpec, TrackedProcess};
    use std::os::unix::process::CommandExt;

    #[test]
    fn test_scan_requests_timeout_stop_once() {
        let registry = Arc::new(ProcessRegistry::new());
        let spec = JobSpec::new("crack", "crypto", "john", ["hashes.txt"])
            .timeout(Duration::from_millis(10));
        let process = Arc::new(TrackedProcess::new(registry.next_id(), &spec, 0));
        registry.register(Arc::clone(&process)).unwrap();

        let reaper = Reaper::new(Arc::clone(&registry), Duration::from_millis(50));
        assert_eq!(reaper.scan(Instant::now()), 0);

        let later = Instant::now() + Duration::from_secs(1);
        assert_eq!(reaper.scan(later), 1);
        assert_eq!(
            process.stop_requested(),
            Some(StopReason::Timeout {
                limit: Duration::from_millis(10)
            })
        );
        // Already stopping: the next tick does nothing.
        assert_eq!(reaper.scan(later), 0);
    }

    #[test]
    fn test_signal_group_on_missing_group_is_benign() {
        // Spawn and reap a child so its pid is known to be free.
        let mut child = std::process::Command::new("true")
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!signal_group(pid, Signal::SIGTERM));
        assert!(!signal_group(0, Signal::SIGKILL));
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_sigkill() {
        // The shell ignores SIGTERM, so only the SIGKILL after the grace
        // period can end it.
        let mut child = tokio::process::Command::new("sh")
            .args(["-c", "trap '' TERM; sleep 30"])
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (_tx, mut stop) = watch::channel(Some(StopRequest {
            reason: StopReason::Cancelled,
            force: false,
        }));
        let started = Instant::now();
        let status = terminate(&mut child, pid, Duration::from_millis(300), &mut stop)
            .await
            .unwrap();
        assert!(status.code().is_none());
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(test_support::group_is_gone(pid, Duration::from_secs(2)).await);
    }

    fn stubborn_group() -> (tokio::process::Child, u32) {
        let child = tokio::process::Command::new("sh")
            .args(["-c", "trap '' TERM; sleep 30 & sleep 30; wait"])
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        (child, pid)
    }

    #[tokio::test]
    async fn test_forced_terminate_skips_grace() {
        let (mut child, pid) = stubborn_group();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (_tx, mut stop) = watch::channel(Some(StopRequest {
            reason: StopReason::Shutdown,
            force: true,
        }));
        let started = Instant::now();
        terminate(&mut child, pid, Duration::from_secs(10), &mut stop)
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(test_support::group_is_gone(pid, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_force_during_grace_cuts_it_short() {
        let (mut child, pid) = stubborn_group();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (tx, mut stop) = watch::channel(Some(StopRequest {
            reason: StopReason::Cancelled,
            force: false,
        }));
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            tx.send_modify(|request| {
                if let Some(request) = request {
                    request.force = true;
                }
            });
            // Keep the sender alive until the test is done with it.
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let started = Instant::now();
        terminate(&mut child, pid, Duration::from_secs(10), &mut stop)
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(test_support::group_is_gone(pid, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_reaper_loop_stops_on_shutdown() {
        let registry = Arc::new(ProcessRegistry::new());
        let (tx, rx) = watch::channel(false);
        let task = Reaper::new(registry, Duration::from_millis(10)).spawn(rx);
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}
