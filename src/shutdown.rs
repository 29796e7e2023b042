//! Shutdown signal plumbing: SIGTERM/SIGINT flip a shared `watch` flag
//! that the scheduler and worker pools poll between tasks. There is no
//! inbound request surface to drain, so this is simpler than the
//! connection-draining coordinator it's adapted from: stop scheduling,
//! let in-flight acquisitions finish, exit.

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::info;

/// Returns a receiver that flips to `true` once SIGTERM or SIGINT is
/// observed, and spawns the task that watches for them.
pub fn install() -> anyhow::Result<watch::Receiver<bool>> {
    let (tx, rx) = watch::channel(false);

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("received SIGINT, shutting down"),
        }
        let _ = tx.send(true);
    });

    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn receiver_starts_false() {
        let rx = install().expect("signal handlers should install in a test process");
        assert!(!*rx.borrow());
    }
}
