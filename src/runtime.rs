/// The job runtime: one owned object bundling the registry, launcher, reaper
/// and event bus. Construct it explicitly and pass it around; there is no
/// global instance.
use crate::catalog::ToolCatalog;
use crate::category::ToolCategory;
use crate::config::AppConfig;
use crate::error::{DispatchError, JobError};
use crate::events::{EventBus, JobEvent};
use crate::job::{JobHandle, JobSpec, StopReason};
use crate::launcher::{LaunchSettings, Launcher};
use crate::metrics::MetricsReport;
use crate::reaper::{self, Reaper};
use crate::registry::{ActiveJob, ProcessRegistry};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy)]
pub struct RuntimeSettings {
    pub launch: LaunchSettings,
    pub poll_interval: Duration,
    /// Applied to jobs started without a timeout of their own.
    pub default_timeout: Option<Duration>,
    pub long_running_after: Duration,
    pub event_buffer: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            launch: LaunchSettings::default(),
            poll_interval: Duration::from_secs(1),
            default_timeout: None,
            long_running_after: Duration::from_secs(60),
            event_buffer: 1024,
        }
    }
}

impl RuntimeSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            launch: LaunchSettings {
                capture_limit: config.capture.max_output_bytes,
                grace_period: config.reaper.grace_period(),
            },
            poll_interval: config.reaper.poll_interval(),
            default_timeout: config.jobs.default_timeout(),
            long_running_after: config.jobs.long_running(),
            event_buffer: config.capture.event_buffer.max(1),
        }
    }
}

pub struct JobRuntime {
    handle: Handle,
    registry: Arc<ProcessRegistry>,
    launcher: Launcher,
    events: EventBus,
    settings: RuntimeSettings,
    /// Flips to true once shutdown starts; stops the reaper and ends event
    /// streams.
    closing: watch::Sender<bool>,
    reaper_task: Mutex<Option<JoinHandle<()>>>,
}

impl JobRuntime {
    /// Build a runtime on `handle` and start its reaper loop.
    pub fn new(handle: Handle, settings: RuntimeSettings) -> Self {
        let registry = Arc::new(ProcessRegistry::new());
        let events = EventBus::new(settings.event_buffer);
        let launcher = Launcher::new(Arc::clone(&registry), events.clone(), settings.launch);

        let closing = watch::Sender::new(false);
        let reaper_task = {
            let _guard = handle.enter();
            Reaper::new(Arc::clone(&registry), settings.poll_interval).spawn(closing.subscribe())
        };

        info!(
            poll_interval_ms = settings.poll_interval.as_millis() as u64,
            grace_ms = settings.launch.grace_period.as_millis() as u64,
            capture_limit = settings.launch.capture_limit,
            "job runtime ready"
        );

        Self {
            handle,
            registry,
            launcher,
            events,
            settings,
            closing,
            reaper_task: Mutex::new(Some(reaper_task)),
        }
    }

    pub fn from_config(handle: Handle, config: &AppConfig) -> Self {
        Self::new(handle, RuntimeSettings::from_config(config))
    }

    /// Spawn and register a job. Returns as soon as the process is running;
    /// safe to call from a thread outside the tokio runtime. Fails with
    /// `ShuttingDown` once [`shutdown`](Self::shutdown) has begun.
    pub fn start(&self, mut spec: JobSpec) -> Result<JobHandle, JobError> {
        if spec.timeout.is_none() {
            spec.timeout = self.settings.default_timeout;
        }
        let _guard = self.handle.enter();
        self.launcher.start(spec)
    }

    /// Resolve `tool` in `catalog`, fill its template from `params` and start
    /// it under `job_name`, optionally tagged with a challenge.
    pub fn run_tool(
        &self,
        catalog: &ToolCatalog,
        tool: &str,
        job_name: &str,
        params: &HashMap<String, String>,
        timeout: Option<Duration>,
        challenge: Option<&str>,
    ) -> Result<JobHandle, DispatchError> {
        let mut spec = catalog.find(tool)?.job(job_name, params, timeout)?;
        spec.challenge = challenge.map(str::to_string);
        Ok(self.start(spec)?)
    }

    pub fn get(&self, name: &str) -> Result<JobHandle, JobError> {
        self.registry.get(name)
    }

    /// Ask the named job to stop. `Ok(false)` means a stop was already in
    /// progress.
    pub fn cancel(&self, name: &str) -> Result<bool, JobError> {
        self.stop(name, false)
    }

    /// Cancel the named job; `force` sends SIGKILL without a grace period.
    pub fn stop(&self, name: &str, force: bool) -> Result<bool, JobError> {
        let handle = self.registry.get(name)?;
        let requested = handle.request_stop(StopReason::Cancelled, force);
        info!(job = %name, pid = handle.pid(), requested, force, "cancel requested");
        Ok(requested)
    }

    /// Cancel every job in `category`. Returns how many stops were newly
    /// requested.
    pub fn cancel_category(&self, category: &ToolCategory) -> usize {
        let handles = self.registry.handles_where(|p| p.category() == category);
        let requested = Self::cancel_all(&handles);
        info!(%category, requested, "category cancel requested");
        requested
    }

    /// Cancel every job tagged with `challenge`.
    pub fn cancel_challenge(&self, challenge: &str) -> usize {
        let handles = self.registry.handles_where(|p| p.challenge() == Some(challenge));
        let requested = Self::cancel_all(&handles);
        info!(challenge, requested, "challenge cancel requested");
        requested
    }

    fn cancel_all(handles: &[JobHandle]) -> usize {
        handles.iter().filter(|handle| handle.cancel()).count()
    }

    pub fn list_active(&self) -> Vec<ActiveJob> {
        self.registry.list_active()
    }

    pub fn metrics(&self) -> MetricsReport {
        MetricsReport::from_snapshot(&self.registry.snapshot(), self.settings.long_running_after)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    /// Watch that flips to true when shutdown begins.
    pub fn closing(&self) -> watch::Receiver<bool> {
        self.closing.subscribe()
    }

    /// Refuse new jobs, SIGKILL every job group (reason `Shutdown`), wait for
    /// their terminal states and stop the reaper. Returns how many jobs were
    /// stopped.
    pub async fn shutdown(&self) -> usize {
        if self.registry.close() {
            info!("job runtime closing, no new jobs accepted");
        }
        self.closing.send_replace(true);
        let stopped = reaper::terminate_all(&self.registry, StopReason::Shutdown, true).await;
        let task = self
            .reaper_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!(stopped, "job runtime shut down");
        stopped
    }
}

impl Drop for JobRuntime {
    fn drop(&mut self) {
        self.registry.close();
        self.closing.send_replace(true);
        let killed = self.registry.kill_all_now();
        if killed > 0 {
            debug!(killed, "runtime dropped with jobs still running");
        }
    }
}
