/// Signal handling for graceful shutdown.
///
/// SIGINT (Ctrl-C) and SIGTERM both ask the runtime to stop every job with
/// reason `Shutdown`. A second signal while that is still in progress skips
/// the grace period and SIGKILLs whatever is left.
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::info;

pub struct SignalListener {
    sigint: Signal,
    sigterm: Signal,
}

impl SignalListener {
    /// Register the handlers. From here on SIGINT/SIGTERM no longer kill the
    /// process directly; they are delivered through [`recv`](Self::recv).
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for the next SIGINT or SIGTERM and return its name.
    pub async fn recv(&mut self) -> &'static str {
        let name = tokio::select! {
            _ = self.sigint.recv() => "SIGINT",
            _ = self.sigterm.recv() => "SIGTERM",
        };
        info!(signal = name, "received shutdown signal");
        name
    }
}
