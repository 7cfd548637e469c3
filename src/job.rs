/// Job data model: what a caller asks for (`JobSpec`), what the registry
/// tracks (`TrackedProcess`), and how a job ends (`TerminalState`,
/// `JobOutcome`).
use crate::capture::CapturedOutput;
use crate::category::ToolCategory;
use crate::error::JobError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Internal identity of one tracked process; never reused within a registry.
pub type JobId = u64;

/// Program plus argument vector. Never a shell string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandLine {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for CommandLine {
    /// Display only; quoting is for humans, nothing is ever re-parsed.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " {:?}", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Everything needed to start a job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: String,
    pub category: ToolCategory,
    pub command: CommandLine,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
    /// Challenge this job works on, for bulk stop and per-challenge counts.
    pub challenge: Option<String>,
}

impl JobSpec {
    pub fn new<I, S>(
        name: impl Into<String>,
        category: impl Into<ToolCategory>,
        program: impl Into<String>,
        args: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            category: category.into(),
            command: CommandLine::new(program, args),
            cwd: None,
            env: Vec::new(),
            timeout: None,
            challenge: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn challenge(mut self, id: impl Into<String>) -> Self {
        self.challenge = Some(id.into());
        self
    }
}

fn serialize_secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}

/// Why we asked a job to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopReason {
    Timeout {
        #[serde(rename = "limit_secs", serialize_with = "serialize_secs")]
        limit: Duration,
    },
    Cancelled,
    Shutdown,
}

/// A stop request as the supervisor sees it. `force` skips SIGTERM and the
/// grace period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopRequest {
    pub reason: StopReason,
    pub force: bool,
}

/// Final outcome of a job. Exactly one is recorded per job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TerminalState {
    /// Exited on its own, with any exit code.
    Completed { exit_code: i32 },
    /// Stopped by us: timeout, user cancel or application shutdown.
    Killed { reason: StopReason },
    /// Died from a signal we did not send, or could not be waited on.
    Crashed { signal: Option<i32> },
}

impl TerminalState {
    pub(crate) fn from_exit_status(status: ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        match status.code() {
            Some(exit_code) => TerminalState::Completed { exit_code },
            None => TerminalState::Crashed {
                signal: status.signal(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TerminalState::Completed { exit_code: 0 })
    }

    pub fn is_failure(&self) -> bool {
        match self {
            TerminalState::Completed { exit_code } => *exit_code != 0,
            TerminalState::Crashed { .. } => true,
            TerminalState::Killed { .. } => false,
        }
    }

    pub fn timed_out(&self) -> bool {
        matches!(
            self,
            TerminalState::Killed {
                reason: StopReason::Timeout { .. }
            }
        )
    }
}

impl fmt::Display for TerminalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalState::Completed { exit_code: 0 } => write!(f, "completed"),
            TerminalState::Completed { exit_code } => {
                write!(f, "exited with code {}", exit_code)
            }
            TerminalState::Killed {
                reason: StopReason::Timeout { limit },
            } => write!(f, "timed out after {}s", limit.as_secs()),
            TerminalState::Killed {
                reason: StopReason::Cancelled,
            } => write!(f, "cancelled"),
            TerminalState::Killed {
                reason: StopReason::Shutdown,
            } => write!(f, "terminated on shutdown"),
            TerminalState::Crashed { signal: Some(sig) } => {
                write!(f, "crashed (signal {})", sig)
            }
            TerminalState::Crashed { signal: None } => write!(f, "crashed"),
        }
    }
}

/// What a finished job leaves behind for the caller.
#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub name: String,
    pub category: ToolCategory,
    pub command: CommandLine,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge: Option<String>,
    pub started_at: DateTime<Utc>,
    pub state: TerminalState,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
}

fn serialize_millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl JobOutcome {
    /// Turn a timed-out outcome into `JobError::TimeoutExceeded`, keeping
    /// the partial stdout. Other outcomes pass through untouched.
    pub fn into_result(self) -> Result<JobOutcome, JobError> {
        match self.state {
            TerminalState::Killed {
                reason: StopReason::Timeout { limit },
            } => Err(JobError::TimeoutExceeded {
                partial_stdout: self.stdout.text(),
                name: self.name,
                limit,
            }),
            _ => Ok(self),
        }
    }
}

/// Lifecycle of a tracked process: running, then finished exactly once.
#[derive(Debug, Clone)]
pub enum JobState {
    Running,
    Finished(Arc<JobOutcome>),
}

impl JobState {
    pub fn outcome(&self) -> Option<Arc<JobOutcome>> {
        match self {
            JobState::Running => None,
            JobState::Finished(outcome) => Some(Arc::clone(outcome)),
        }
    }
}

/// A live job as the registry tracks it.
///
/// Metadata is fixed at registration. The only things that change afterwards
/// are the stop request (first reason wins, a later forced request may only
/// upgrade it to forced) and the state (one transition).
#[derive(Debug)]
pub struct TrackedProcess {
    id: JobId,
    name: String,
    category: ToolCategory,
    command: CommandLine,
    challenge: Option<String>,
    pid: u32,
    started_at: DateTime<Utc>,
    started: Instant,
    timeout: Option<Duration>,
    stop: watch::Sender<Option<StopRequest>>,
    state: watch::Sender<JobState>,
}

impl TrackedProcess {
    pub(crate) fn new(id: JobId, spec: &JobSpec, pid: u32) -> Self {
        Self {
            id,
            name: spec.name.clone(),
            category: spec.category.clone(),
            command: spec.command.clone(),
            challenge: spec.challenge.clone(),
            pid,
            started_at: Utc::now(),
            started: Instant::now(),
            timeout: spec.timeout,
            stop: watch::Sender::new(None),
            state: watch::Sender::new(JobState::Running),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> &ToolCategory {
        &self.category
    }

    pub fn command(&self) -> &CommandLine {
        &self.command
    }

    pub fn challenge(&self) -> Option<&str> {
        self.challenge.as_deref()
    }

    /// Process id of the tool, which is also its process-group id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// True once the job has run past its timeout at `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        match self.timeout {
            Some(limit) => now.saturating_duration_since(self.started) > limit,
            None => false,
        }
    }

    /// Ask the supervisor to terminate the job. Returns false if nothing
    /// changed: a stop was already requested and this one does not upgrade
    /// it to forced. The first reason always sticks.
    pub fn request_stop(&self, reason: StopReason, force: bool) -> bool {
        self.stop.send_if_modified(|current| match current {
            None => {
                *current = Some(StopRequest { reason, force });
                true
            }
            Some(pending) if force && !pending.force => {
                pending.force = true;
                true
            }
            Some(_) => false,
        })
    }

    pub fn stop_requested(&self) -> Option<StopReason> {
        self.stop.borrow().map(|request| request.reason)
    }

    pub(crate) fn stop_receiver(&self) -> watch::Receiver<Option<StopRequest>> {
        self.stop.subscribe()
    }

    pub fn outcome(&self) -> Option<Arc<JobOutcome>> {
        self.state.borrow().outcome()
    }

    pub fn is_finished(&self) -> bool {
        self.outcome().is_some()
    }

    /// Record the terminal state. Returns false if one was already recorded.
    pub(crate) fn finish(&self, outcome: JobOutcome) -> bool {
        let outcome = Arc::new(outcome);
        self.state.send_if_modified(|state| match state {
            JobState::Running => {
                *state = JobState::Finished(outcome);
                true
            }
            JobState::Finished(_) => false,
        })
    }

    pub(crate) fn state_receiver(&self) -> watch::Receiver<JobState> {
        self.state.subscribe()
    }
}

/// Caller-side view of a job: observe it, wait for it, or stop it.
#[derive(Debug, Clone)]
pub struct JobHandle {
    process: Arc<TrackedProcess>,
}

impl JobHandle {
    pub(crate) fn new(process: Arc<TrackedProcess>) -> Self {
        Self { process }
    }

    pub fn id(&self) -> JobId {
        self.process.id()
    }

    pub fn name(&self) -> &str {
        self.process.name()
    }

    pub fn category(&self) -> &ToolCategory {
        self.process.category()
    }

    pub fn command(&self) -> &CommandLine {
        self.process.command()
    }

    pub fn challenge(&self) -> Option<&str> {
        self.process.challenge()
    }

    pub fn pid(&self) -> u32 {
        self.process.pid()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.process.started_at()
    }

    pub fn elapsed(&self) -> Duration {
        self.process.elapsed()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.process.timeout()
    }

    /// Non-blocking poll for the terminal outcome.
    pub fn outcome(&self) -> Option<Arc<JobOutcome>> {
        self.process.outcome()
    }

    pub fn is_finished(&self) -> bool {
        self.process.is_finished()
    }

    /// User-initiated stop; goes through the same path as a timeout.
    pub fn cancel(&self) -> bool {
        self.request_stop(StopReason::Cancelled, false)
    }

    /// Cancel without the grace period: the group gets SIGKILL right away.
    pub fn kill(&self) -> bool {
        self.request_stop(StopReason::Cancelled, true)
    }

    pub fn request_stop(&self, reason: StopReason, force: bool) -> bool {
        self.process.request_stop(reason, force)
    }

    pub fn stop_requested(&self) -> Option<StopReason> {
        self.process.stop_requested()
    }

    /// Wait until the job reaches its terminal state.
    pub async fn wait(&self) -> Arc<JobOutcome> {
        let mut rx = self.process.state_receiver();
        loop {
            let current = rx.borrow_and_update().outcome();
            if let Some(outcome) = current {
                return outcome;
            }
            if rx.changed().await.is_err() {
                // Sender is owned by `self.process`; unreachable while we hold it.
                std::future::pending::<()>().await;
            }
        }
    }
}
