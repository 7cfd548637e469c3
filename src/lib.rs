//! Background job runner for CTF tooling.
//!
//! Every external tool runs as the leader of its own process group and is
//! tracked by name in a [`ProcessRegistry`]. All stops go through one
//! termination routine in [`reaper`].

pub mod capture;
pub mod catalog;
pub mod category;
pub mod config;
pub mod error;
pub mod events;
pub mod history;
pub mod job;
pub mod launcher;
pub mod metrics;
pub mod reaper;
pub mod registry;
pub mod runtime;
#[cfg(feature = "serve")]
pub mod serve;
pub mod signals;

pub use catalog::{ToolCatalog, ToolSpec};
pub use category::ToolCategory;
pub use error::{DispatchError, JobError};
pub use job::{CommandLine, JobHandle, JobOutcome, JobSpec, StopReason, StopRequest, TerminalState};
pub use registry::ProcessRegistry;
pub use runtime::{JobRuntime, RuntimeSettings};
