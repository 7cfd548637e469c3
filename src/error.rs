/// Errors surfaced by the job registry, launcher and runtime.
///
/// Spawn-time failures come back synchronously from `start`. Everything that
/// happens after the process is running is reported through the job's
/// terminal state instead; `TimeoutExceeded` only appears when a caller asks
/// a finished outcome to be turned into a `Result`.
use crate::catalog::CatalogError;
use std::time::Duration;

#[derive(Debug)]
pub enum JobError {
    /// A job with this name is still active.
    DuplicateName { name: String },
    /// No active job with this name.
    NotFound { name: String },
    /// The runtime has shut down and accepts no new jobs.
    ShuttingDown { name: String },
    /// The OS could not start the program (missing binary, permission denied, ...).
    Spawn {
        program: String,
        source: std::io::Error,
    },
    /// The job was killed by the reaper after running past its limit.
    TimeoutExceeded {
        name: String,
        limit: Duration,
        partial_stdout: String,
    },
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobError::DuplicateName { name } => {
                write!(f, "a job named '{}' is already running", name)
            }
            JobError::NotFound { name } => write!(f, "no active job named '{}'", name),
            JobError::ShuttingDown { name } => {
                write!(f, "not starting '{}': the job runtime is shutting down", name)
            }
            JobError::Spawn { program, source } => {
                write!(f, "failed to spawn '{}': {}", program, source)
            }
            JobError::TimeoutExceeded { name, limit, .. } => {
                write!(f, "job '{}' timed out after {}s", name, limit.as_secs())
            }
        }
    }
}

impl std::error::Error for JobError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            JobError::Spawn { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Failure to start a catalog tool: either the invocation could not be
/// resolved or the job itself could not be started.
#[derive(Debug)]
pub enum DispatchError {
    Catalog(CatalogError),
    Job(JobError),
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::Catalog(e) => write!(f, "{}", e),
            DispatchError::Job(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DispatchError::Catalog(e) => Some(e),
            DispatchError::Job(e) => Some(e),
        }
    }
}

impl From<CatalogError> for DispatchError {
    fn from(e: CatalogError) -> Self {
        DispatchError::Catalog(e)
    }
}

impl From<JobError> for DispatchError {
    fn from(e: JobError) -> Self {
        DispatchError::Job(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_spawn_error_keeps_io_source() {
        let err = JobError::Spawn {
            program: "hashcat".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        };
        assert!(err.to_string().contains("failed to spawn 'hashcat'"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_timeout_message_uses_whole_seconds() {
        let err = JobError::TimeoutExceeded {
            name: "crack".to_string(),
            limit: Duration::from_millis(3500),
            partial_stdout: String::new(),
        };
        assert_eq!(err.to_string(), "job 'crack' timed out after 3s");
        assert!(err.source().is_none());
    }

    #[test]
    fn test_dispatch_error_wraps_both_sides() {
        let err: DispatchError = CatalogError::UnknownTool {
            name: "nope".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "unknown tool 'nope'");
        assert!(err.source().is_some());

        let err: DispatchError = JobError::NotFound {
            name: "scan".to_string(),
        }
        .into();
        assert!(matches!(err, DispatchError::Job(JobError::NotFound { .. })));
    }
}
