//! Lightweight counters for the staple lifecycle, logged periodically.
//! No scrape endpoint: a daemon with no inbound request surface has
//! nothing to expose one on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tracing::info;

#[derive(Debug, Default)]
pub struct Metrics {
    acquisitions_succeeded: AtomicU64,
    acquisitions_failed: AtomicU64,
    certificates_revoked: AtomicU64,
    worker_restarts: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct Snapshot {
    pub acquisitions_succeeded: u64,
    pub acquisitions_failed: u64,
    pub certificates_revoked: u64,
    pub worker_restarts: u64,
    pub parse_queue_depth: u64,
    pub renew_queue_depth: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_acquisition_succeeded(&self) {
        self.acquisitions_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acquisition_failed(&self) {
        self.acquisitions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_revoked(&self) {
        self.certificates_revoked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_worker_restart(&self) {
        self.worker_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, parse_queue_depth: u64, renew_queue_depth: u64) -> Snapshot {
        Snapshot {
            acquisitions_succeeded: self.acquisitions_succeeded.load(Ordering::Relaxed),
            acquisitions_failed: self.acquisitions_failed.load(Ordering::Relaxed),
            certificates_revoked: self.certificates_revoked.load(Ordering::Relaxed),
            worker_restarts: self.worker_restarts.load(Ordering::Relaxed),
            parse_queue_depth,
            renew_queue_depth,
        }
    }
}

/// Logs a snapshot at the given cadence until `shutdown` reports true.
/// `queue_depths` is called fresh on each tick so the snapshot reflects
/// live backlog rather than a value captured at startup.
pub async fn run(
    metrics: std::sync::Arc<Metrics>,
    queue_depths: impl Fn() -> (u64, u64),
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let started = Instant::now();
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let (parse_depth, renew_depth) = queue_depths();
                let snapshot = metrics.snapshot(parse_depth, renew_depth);
                info!(
                    uptime_seconds = started.elapsed().as_secs(),
                    succeeded = snapshot.acquisitions_succeeded,
                    failed = snapshot.acquisitions_failed,
                    revoked = snapshot.certificates_revoked,
                    worker_restarts = snapshot.worker_restarts,
                    parse_queue_depth = snapshot.parse_queue_depth,
                    renew_queue_depth = snapshot.renew_queue_depth,
                    "staple daemon metrics"
                );
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
