//! Pipeline Orchestrator: owns the certificate record table, the
//! parser and renewer worker pools, and the glue between filesystem
//! events and the scheduler.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::watcher::WatchEvent;
use crate::config::Config;
use crate::error::{AcquireError, SchedulerError};
use crate::metrics::Metrics;
use crate::ocsp::acquirer;
use crate::record::{CertRecord, RecordId};
use crate::scheduler::{Payload, Scheduler, DEFAULT_QUEUE_CAPACITY};

const PARSE_QUEUE: &str = "parse";
const RENEW_QUEUE: &str = "renew";
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(500);

/// `Scheduler::get_task` blocks its calling thread; running it via
/// `spawn_blocking` keeps that block off the async worker threads.
async fn dequeue(
    scheduler: Arc<Scheduler>,
    queue: &'static str,
) -> Result<crate::scheduler::Context, SchedulerError> {
    tokio::task::spawn_blocking(move || scheduler.get_task(queue, true, DEQUEUE_TIMEOUT))
        .await
        .unwrap_or(Err(SchedulerError::QueueEmpty(queue.to_string())))
}

pub struct Orchestrator {
    config: Config,
    scheduler: Arc<Scheduler>,
    records: Mutex<HashMap<PathBuf, CertRecord>>,
    client: Client,
    trust_store: rustls::RootCertStore,
    parser_restarts: AtomicU32,
    renewer_restarts: AtomicU32,
    pub metrics: Arc<Metrics>,
}

impl Orchestrator {
    pub fn new(config: Config, trust_store: rustls::RootCertStore) -> anyhow::Result<Arc<Self>> {
        let scheduler = Scheduler::new();
        scheduler.add_queue(PARSE_QUEUE, DEFAULT_QUEUE_CAPACITY)?;
        scheduler.add_queue(RENEW_QUEUE, DEFAULT_QUEUE_CAPACITY)?;

        let client = Client::builder().build()?;

        Ok(Arc::new(Self {
            config,
            scheduler,
            records: Mutex::new(HashMap::new()),
            client,
            trust_store,
            parser_restarts: AtomicU32::new(0),
            renewer_restarts: AtomicU32::new(0),
            metrics: Arc::new(Metrics::new()),
        }))
    }

    pub fn queue_depths(&self) -> (u64, u64) {
        (self.scheduler.queue_len(PARSE_QUEUE) as u64, self.scheduler.queue_len(RENEW_QUEUE) as u64)
    }

    /// Feeds a set of paths discovered at startup into the pipeline, as
    /// if each had just been reported by the watcher.
    pub async fn bootstrap(self: &Arc<Self>, paths: Vec<PathBuf>) {
        for path in paths {
            self.upsert(path).await;
        }
    }

    pub async fn handle_event(self: &Arc<Self>, event: WatchEvent) {
        match event {
            WatchEvent::Upserted(path) => self.upsert(path).await,
            WatchEvent::Removed(path) => self.remove(path).await,
        }
    }

    async fn upsert(self: &Arc<Self>, path: PathBuf) {
        let content_hash = match CertRecord::hash_file(&path) {
            Ok(h) => h,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not hash changed certificate file");
                return;
            }
        };

        let mut records = self.records.lock().await;
        if let Some(existing) = records.get(&path) {
            if existing.id.content_hash == content_hash {
                return;
            }
        }

        let modtime = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .unwrap_or_else(|_| std::time::SystemTime::now());
        let record = CertRecord::new(path.clone(), content_hash, modtime);
        let identity = record.id.identity();
        records.insert(path.clone(), record);
        drop(records);

        if let Err(e) = self.scheduler.add_task(
            PARSE_QUEUE.to_string(),
            Utc::now(),
            identity,
            Payload::Parse { record: RecordId { path, content_hash } },
        ) {
            warn!(error = %e, "failed to schedule initial parse");
        }
    }

    async fn remove(&self, path: PathBuf) {
        let mut records = self.records.lock().await;
        if let Some(record) = records.remove(&path) {
            self.scheduler.cancel_task(&record.id.identity());
        }
        drop(records);
        acquirer::delete_stale_staple(&path);
        info!(path = %path.display(), "certificate removed, cleared pending work and stale staple");
    }

    /// Runs the scheduler tick loop alongside the parser and renewer
    /// worker pools until `shutdown` reports true, restarting a
    /// panicked worker up to `max_thread_restarts` times before giving
    /// up on its pool.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let scheduler_task = tokio::spawn(self.scheduler.clone().run(shutdown.clone()));

        let mut parser_set = JoinSet::new();
        let mut renewer_set = JoinSet::new();

        for _ in 0..self.config.parser_workers {
            parser_set.spawn(Self::parser_worker(self.clone(), shutdown.clone()));
        }
        for _ in 0..self.config.renewer_workers {
            renewer_set.spawn(Self::renewer_worker(self.clone(), shutdown.clone()));
        }

        loop {
            tokio::select! {
                Some(result) = parser_set.join_next() => {
                    if let Err(e) = result {
                        if e.is_panic() {
                            self.handle_worker_panic("parser", &self.parser_restarts)?;
                            parser_set.spawn(Self::parser_worker(self.clone(), shutdown.clone()));
                        }
                    }
                }
                Some(result) = renewer_set.join_next() => {
                    if let Err(e) = result {
                        if e.is_panic() {
                            self.handle_worker_panic("renewer", &self.renewer_restarts)?;
                            renewer_set.spawn(Self::renewer_worker(self.clone(), shutdown.clone()));
                        }
                    }
                }
                else => break,
            }
        }

        scheduler_task.abort();
        Ok(())
    }

    fn handle_worker_panic(&self, pool: &str, counter: &AtomicU32) -> anyhow::Result<()> {
        let restarts = counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.metrics.record_worker_restart();
        if restarts > self.config.max_thread_restarts {
            anyhow::bail!("{pool} worker pool exceeded {} restarts", self.config.max_thread_restarts);
        }
        error!(pool, restarts, "worker panicked, restarting");
        Ok(())
    }

    async fn parser_worker(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            let ctx = match dequeue(self.scheduler.clone(), PARSE_QUEUE).await {
                Ok(ctx) => ctx,
                Err(SchedulerError::QueueEmpty(_)) => continue,
                Err(e) => {
                    warn!(error = %e, "parser worker failed to dequeue");
                    continue;
                }
            };

            let Payload::Parse { record: record_id } = &ctx.payload else {
                warn!("renew payload arrived on the parse queue, dropping");
                self.scheduler.task_done();
                continue;
            };

            self.process_parse(record_id.path.clone()).await;
            self.scheduler.task_done();
        }
    }

    async fn process_parse(self: &Arc<Self>, path: PathBuf) {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(&path) else {
            return;
        };

        match record.parse_chain(&self.trust_store) {
            Ok(()) => {
                let identity = record.id.identity();
                let record_id = record.id.clone();
                drop(records);
                if let Err(e) = self.scheduler.add_task(
                    RENEW_QUEUE.to_string(),
                    Utc::now(),
                    identity,
                    Payload::Renew { record: record_id, attempt: 0 },
                ) {
                    warn!(error = %e, "failed to schedule staple acquisition after parse");
                }
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "certificate chain failed validation");
                drop(records);
                acquirer::delete_stale_staple(&path);
            }
        }
    }

    async fn renewer_worker(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            let ctx = match dequeue(self.scheduler.clone(), RENEW_QUEUE).await {
                Ok(ctx) => ctx,
                Err(SchedulerError::QueueEmpty(_)) => continue,
                Err(e) => {
                    warn!(error = %e, "renewer worker failed to dequeue");
                    continue;
                }
            };

            let Payload::Renew { record: record_id, attempt } = ctx.payload.clone() else {
                warn!("parse payload arrived on the renew queue, dropping");
                self.scheduler.task_done();
                continue;
            };

            self.process_renew(&ctx, record_id, attempt).await;
            self.scheduler.task_done();
        }
    }

    async fn process_renew(self: &Arc<Self>, ctx: &crate::scheduler::Context, record_id: RecordId, attempt: u32) {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(&record_id.path) else {
            return;
        };

        match acquirer::acquire(record, &self.config.acquirer, &self.client, &self.trust_store).await {
            Ok(()) => {
                self.metrics.record_acquisition_succeeded();
                let valid_until = record.staple_valid_until;
                drop(records);
                let next = valid_until
                    .map(|v| v - chrono::Duration::seconds(self.config.refresh_margin_seconds))
                    .filter(|t| *t > Utc::now())
                    .unwrap_or_else(Utc::now);
                if let Err(e) = ctx.reschedule_with(next, Payload::Renew { record: record_id, attempt: 0 }) {
                    warn!(error = %e, "failed to schedule next renewal");
                }
            }
            Err(e) => {
                drop(records);
                self.handle_acquire_failure(ctx, record_id, attempt, e);
            }
        }
    }

    fn handle_acquire_failure(&self, ctx: &crate::scheduler::Context, record_id: RecordId, attempt: u32, err: AcquireError) {
        self.metrics.record_acquisition_failed();
        let next_attempt = attempt + 1;
        if matches!(err, AcquireError::Revoked) {
            self.metrics.record_revoked();
            error!(path = %record_id.path.display(), "certificate revoked, dropping until re-parsed");
            return;
        }
        if next_attempt >= self.config.max_acquire_failures {
            error!(
                path = %record_id.path.display(),
                attempts = next_attempt,
                error = %err,
                "giving up on staple acquisition until the certificate is re-parsed"
            );
            return;
        }

        let backoff = self.config.acquirer.retry_backoff_step_seconds * u64::from(next_attempt);
        let when = Utc::now() + chrono::Duration::seconds(backoff as i64);
        warn!(path = %record_id.path.display(), attempt = next_attempt, error = %err, "staple acquisition failed, rescheduling");
        if let Err(e) = ctx.reschedule_with(when, Payload::Renew { record: record_id, attempt: next_attempt }) {
            warn!(error = %e, "failed to reschedule after acquisition failure");
        }
    }
}
