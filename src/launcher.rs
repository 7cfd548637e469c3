/// Launcher: spawn a tool in its own process group, wire its output into
/// bounded buffers, register it, and hand the child to a supervisor task
/// that records how it ends.
use crate::capture::{self, SharedBuffer};
use crate::error::JobError;
use crate::events::{EventBus, JobEvent, OutputStream};
use crate::job::{JobHandle, JobOutcome, JobSpec, StopRequest, TerminalState, TrackedProcess};
use crate::reaper;
use crate::registry::ProcessRegistry;
use nix::sys::signal::Signal;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long to keep reading a job's pipes after it exited. A tool that
/// forked a daemon can hold them open forever.
const PIPE_DRAIN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct LaunchSettings {
    /// Per-stream cap on captured stdout/stderr.
    pub capture_limit: usize,
    /// Time between SIGTERM and SIGKILL when a job is stopped.
    pub grace_period: Duration,
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            capture_limit: 1024 * 1024,
            grace_period: Duration::from_secs(2),
        }
    }
}

pub struct Launcher {
    registry: Arc<ProcessRegistry>,
    events: EventBus,
    settings: LaunchSettings,
}

impl Launcher {
    pub fn new(registry: Arc<ProcessRegistry>, events: EventBus, settings: LaunchSettings) -> Self {
        Self {
            registry,
            events,
            settings,
        }
    }

    /// Start `spec` and return once it is spawned and registered.
    ///
    /// Must be called from within a tokio runtime context. Does not wait for
    /// the job; use [`JobHandle::wait`] or poll [`JobHandle::outcome`].
    pub fn start(&self, spec: JobSpec) -> Result<JobHandle, JobError> {
        self.registry.ensure_available(&spec.name)?;

        let mut cmd = Command::new(&spec.command.program);
        cmd.args(&spec.command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0) // New process group for clean kill
            .kill_on_drop(true);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        info!(
            job = %spec.name,
            category = %spec.category,
            command = %spec.command,
            timeout_secs = spec.timeout.map(|t| t.as_secs()),
            "spawning job"
        );

        let mut child = cmd.spawn().map_err(|e| JobError::Spawn {
            program: spec.command.program.clone(),
            source: e,
        })?;
        let pid = child.id().unwrap_or(0);

        let process = Arc::new(TrackedProcess::new(self.registry.next_id(), &spec, pid));
        let handle = match self.registry.register(Arc::clone(&process)) {
            Ok(handle) => handle,
            Err(e) => {
                // Another start with the same name won, or shutdown began,
                // between our check and the insert. Nothing may run untracked.
                warn!(job = %spec.name, pid, error = %e, "registration refused, killing fresh child");
                reaper::signal_group(pid, Signal::SIGKILL);
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });
                return Err(e);
            }
        };

        let stdout = capture::shared_buffer(self.settings.capture_limit);
        let stderr = capture::shared_buffer(self.settings.capture_limit);
        let mut pumps = Vec::with_capacity(2);
        if let Some(pipe) = child.stdout.take() {
            pumps.push(capture::pump(
                pipe,
                spec.name.clone(),
                OutputStream::Stdout,
                Arc::clone(&stdout),
                self.events.clone(),
            ));
        }
        if let Some(pipe) = child.stderr.take() {
            pumps.push(capture::pump(
                pipe,
                spec.name.clone(),
                OutputStream::Stderr,
                Arc::clone(&stderr),
                self.events.clone(),
            ));
        }

        info!(job = %spec.name, pid, "job started");
        self.events.publish(JobEvent::Started {
            name: spec.name.clone(),
            pid,
            category: spec.category.clone(),
        });

        tokio::spawn(supervise(Supervision {
            child,
            process,
            registry: Arc::clone(&self.registry),
            events: self.events.clone(),
            stdout,
            stderr,
            pumps,
            grace: self.settings.grace_period,
        }));

        Ok(handle)
    }
}

struct Supervision {
    child: Child,
    process: Arc<TrackedProcess>,
    registry: Arc<ProcessRegistry>,
    events: EventBus,
    stdout: SharedBuffer,
    stderr: SharedBuffer,
    pumps: Vec<JoinHandle<()>>,
    grace: Duration,
}

enum Wake {
    Exited(std::io::Result<ExitStatus>),
    Stop(StopRequest),
}

async fn stop_requested(rx: &mut watch::Receiver<Option<StopRequest>>) -> StopRequest {
    loop {
        let current = *rx.borrow_and_update();
        if let Some(request) = current {
            return request;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Owns the child until it ends, then records the one terminal state.
async fn supervise(job: Supervision) {
    let Supervision {
        mut child,
        process,
        registry,
        events,
        stdout,
        stderr,
        pumps,
        grace,
    } = job;
    let pid = process.pid();
    let mut stop_rx = process.stop_receiver();

    let wake = tokio::select! {
        status = child.wait() => Wake::Exited(status),
        request = stop_requested(&mut stop_rx) => Wake::Stop(request),
    };

    let state = match wake {
        Wake::Exited(Ok(status)) => TerminalState::from_exit_status(status),
        Wake::Exited(Err(e)) => {
            warn!(job = %process.name(), pid, error = %e, "failed to wait on job");
            reaper::signal_group(pid, Signal::SIGKILL);
            TerminalState::Crashed { signal: None }
        }
        Wake::Stop(StopRequest { reason, force }) => match child.try_wait() {
            // Exited on its own between the stop request and now.
            Ok(Some(status)) => TerminalState::from_exit_status(status),
            _ => {
                info!(job = %process.name(), pid, ?reason, force, "stopping job");
                if let Err(e) = reaper::terminate(&mut child, pid, grace, &mut stop_rx).await {
                    warn!(job = %process.name(), pid, error = %e, "error while terminating job");
                }
                TerminalState::Killed { reason }
            }
        },
    };

    for mut pump in pumps {
        if tokio::time::timeout(PIPE_DRAIN, &mut pump).await.is_err() {
            debug!(job = %process.name(), "output pipe still open after exit, abandoning it");
            pump.abort();
        }
    }

    let outcome = JobOutcome {
        name: process.name().to_string(),
        category: process.category().clone(),
        command: process.command().clone(),
        challenge: process.challenge().map(str::to_string),
        started_at: process.started_at(),
        state: state.clone(),
        stdout: capture::snapshot(&stdout),
        stderr: capture::snapshot(&stderr),
        duration: process.elapsed(),
    };

    info!(
        job = %process.name(),
        pid,
        state = %state,
        duration_ms = outcome.duration.as_millis() as u64,
        stdout_bytes = outcome.stdout.total_bytes,
        stderr_bytes = outcome.stderr.total_bytes,
        "job finished"
    );

    if registry.retire(&process, outcome) {
        events.publish(JobEvent::Finished {
            name: process.name().to_string(),
            state,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::StopReason;

    fn launcher(limit: usize) -> (Launcher, Arc<ProcessRegistry>, EventBus) {
        let registry = Arc::new(ProcessRegistry::new());
        let events = EventBus::new(64);
        let settings = LaunchSettings {
            capture_limit: limit,
            grace_period: Duration::from_millis(500),
        };
        (
            Launcher::new(Arc::clone(&registry), events.clone(), settings),
            registry,
            events,
        )
    }

    #[tokio::test]
    async fn test_start_echo_captures_stdout() {
        let (launcher, registry, _) = launcher(1024);
        let handle = launcher
            .start(JobSpec::new("echo", "misc", "echo", ["flag{hello}"]))
            .unwrap();
        assert!(handle.pid() > 0);

        let outcome = handle.wait().await;
        assert_eq!(outcome.state, TerminalState::Completed { exit_code: 0 });
        assert_eq!(outcome.stdout.text().trim(), "flag{hello}");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_stderr_and_exit_code() {
        let (launcher, _, _) = launcher(1024);
        let handle = launcher
            .start(JobSpec::new(
                "fail",
                "misc",
                "sh",
                ["-c", "echo stdout-line; echo stderr-line >&2; exit 42"],
            ))
            .unwrap();
        let outcome = handle.wait().await;
        assert_eq!(outcome.state, TerminalState::Completed { exit_code: 42 });
        assert!(outcome.state.is_failure());
        assert!(outcome.stdout.text().contains("stdout-line"));
        assert!(outcome.stderr.text().contains("stderr-line"));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_synchronous_and_untracked() {
        let (launcher, registry, _) = launcher(1024);
        let err = launcher
            .start(JobSpec::new(
                "ghost",
                "misc",
                "/nonexistent/ctf-tool-xyz",
                Vec::<String>::new(),
            ))
            .unwrap_err();
        assert!(matches!(err, JobError::Spawn { .. }));
        assert!(err.to_string().contains("failed to spawn"));
        assert!(registry.list_active().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_active_name_is_rejected() {
        let (launcher, registry, _) = launcher(1024);
        let first = launcher
            .start(JobSpec::new("scan", "misc", "sleep", ["5"]))
            .unwrap();
        let err = launcher
            .start(JobSpec::new("scan", "misc", "sleep", ["5"]))
            .unwrap_err();
        assert!(matches!(err, JobError::DuplicateName { .. }));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("scan").unwrap().id(), first.id());

        first.cancel();
        first.wait().await;
        // Name is free again once the first job is gone.
        let second = launcher
            .start(JobSpec::new("scan", "misc", "true", Vec::<String>::new()))
            .unwrap();
        second.wait().await;
    }

    #[tokio::test]
    async fn test_output_is_bounded() {
        let (launcher, _, _) = launcher(16);
        let handle = launcher
            .start(JobSpec::new(
                "spam",
                "misc",
                "sh",
                ["-c", "i=0; while [ $i -lt 200 ]; do echo 0123456789; i=$((i+1)); done"],
            ))
            .unwrap();
        let outcome = handle.wait().await;
        assert_eq!(outcome.stdout.bytes.len(), 16);
        assert_eq!(outcome.stdout.total_bytes, 2200);
        assert!(outcome.stdout.truncated);
    }

    #[tokio::test]
    async fn test_cancel_kills_process_group() {
        let (launcher, registry, _) = launcher(1024);
        // A child of the tool must die with it.
        let handle = launcher
            .start(JobSpec::new(
                "tree",
                "misc",
                "sh",
                ["-c", "sleep 30 & sleep 30; wait"],
            ))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.cancel());
        assert!(!handle.cancel());

        let outcome = handle.wait().await;
        assert_eq!(
            outcome.state,
            TerminalState::Killed {
                reason: StopReason::Cancelled
            }
        );
        assert!(reaper::test_support::group_is_gone(handle.pid(), Duration::from_secs(2)).await);
        assert_eq!(registry.snapshot().tallies.cancelled, 1);
    }

    #[tokio::test]
    async fn test_kill_skips_grace_period() {
        let registry = Arc::new(ProcessRegistry::new());
        let settings = LaunchSettings {
            capture_limit: 1024,
            grace_period: Duration::from_secs(10),
        };
        let launcher = Launcher::new(Arc::clone(&registry), EventBus::new(8), settings);
        let handle = launcher
            .start(JobSpec::new("stubborn", "misc", "sh", ["-c", "trap '' TERM; sleep 30"]))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        assert!(handle.kill());
        let outcome = tokio::time::timeout(Duration::from_secs(3), handle.wait())
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(
            outcome.state,
            TerminalState::Killed {
                reason: StopReason::Cancelled
            }
        );
    }

    #[tokio::test]
    async fn test_events_cover_the_lifecycle() {
        let (launcher, _, events) = launcher(1024);
        let mut rx = events.subscribe();
        let handle = launcher
            .start(JobSpec::new("hi", "misc", "echo", ["hi"]))
            .unwrap();
        handle.wait().await;

        let mut saw_started = false;
        let mut saw_output = false;
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            match event {
                JobEvent::Started { name, .. } => saw_started = name == "hi",
                JobEvent::Output { text, .. } => saw_output |= text.contains("hi"),
                JobEvent::Finished { state, .. } => {
                    assert!(state.is_success());
                    break;
                }
            }
        }
        assert!(saw_started && saw_output);
    }

    #[tokio::test]
    async fn test_cwd_and_env_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let (launcher, _, _) = launcher(1024);
        let spec = JobSpec::new("pwd", "misc", "sh", ["-c", "pwd; echo $CTF_FLAG"])
            .current_dir(dir.path())
            .env("CTF_FLAG", "flag{env}");
        let outcome = launcher.start(spec).unwrap().wait().await;
        let text = outcome.stdout.text();
        let canonical = dir.path().canonicalize().unwrap();
        assert!(text.contains(canonical.to_str().unwrap()));
        assert!(text.contains("flag{env}"));
    }
}
