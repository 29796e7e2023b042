//! A scheduler of time-ordered tasks, dispatched onto named queues for
//! worker pools to consume.
//!
//! Two maps are kept under one lock: `forward` orders contexts by the
//! time they become due, `reverse` maps a task's identity to its
//! current due time so a re-add of the same identity can replace
//! rather than duplicate it. `tick` moves anything due onto its
//! queue's channel; workers call `get_task`/`task_done` against a named
//! queue without ever touching the time-ordered maps directly.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{info, warn};

use super::context::{Context, Payload};
use crate::error::SchedulerError;

/// Capacity a caller can pass to `add_queue` when it has no specific
/// backlog bound in mind.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

#[derive(Default)]
struct TimeIndex {
    forward: BTreeMap<DateTime<Utc>, Vec<Context>>,
    reverse: HashMap<String, DateTime<Utc>>,
}

impl TimeIndex {
    fn remove_identity(&mut self, identity: &str) -> bool {
        let Some(when) = self.reverse.remove(identity) else {
            return false;
        };
        if let Some(bucket) = self.forward.get_mut(&when) {
            bucket.retain(|ctx| ctx.identity != identity);
            if bucket.is_empty() {
                self.forward.remove(&when);
            }
        }
        true
    }

    fn insert(&mut self, ctx: Context) {
        self.reverse.insert(ctx.identity.clone(), ctx.sched_time);
        self.forward.entry(ctx.sched_time).or_default().push(ctx);
    }

    fn drain_due(&mut self, now: DateTime<Utc>) -> Vec<Context> {
        let due_keys: Vec<DateTime<Utc>> = self.forward.range(..=now).map(|(k, _)| *k).collect();
        let mut out = Vec::new();
        for key in due_keys {
            if let Some(bucket) = self.forward.remove(&key) {
                for ctx in &bucket {
                    self.reverse.remove(&ctx.identity);
                }
                out.extend(bucket);
            }
        }
        out
    }

    fn drain_all(&mut self) -> Vec<Context> {
        let mut out = Vec::new();
        for (_, bucket) in std::mem::take(&mut self.forward) {
            out.extend(bucket);
        }
        self.reverse.clear();
        out
    }
}

pub struct Scheduler {
    index: Mutex<TimeIndex>,
    queues: Mutex<HashMap<String, (Sender<Context>, Receiver<Context>)>>,
    outstanding: AtomicU64,
}

impl Scheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            index: Mutex::new(TimeIndex::default()),
            queues: Mutex::new(HashMap::new()),
            outstanding: AtomicU64::new(0),
        })
    }

    /// Registers a named bounded task queue holding at most `capacity`
    /// contexts before producers block.
    pub fn add_queue(&self, name: impl Into<String>, capacity: usize) -> Result<(), SchedulerError> {
        let name = name.into();
        let mut queues = self.queues.lock();
        if queues.contains_key(&name) {
            return Err(SchedulerError::DuplicateQueue(name));
        }
        queues.insert(name, bounded(capacity));
        Ok(())
    }

    /// Number of contexts currently sitting on `queue_name`, or 0 for
    /// an unknown queue — used for metrics, not control flow.
    pub fn queue_len(&self, queue_name: &str) -> usize {
        self.queues.lock().get(queue_name).map(|(_, rx)| rx.len()).unwrap_or(0)
    }

    /// Schedules `payload` under `identity` at `sched_time` onto
    /// `queue_name`. A pending task already registered under the same
    /// identity is cancelled first and the replacement is logged at
    /// warn level — duplicate scheduling under one identity is unusual
    /// enough to be worth a human's attention, not silent.
    pub fn add_task(
        self: &Arc<Self>,
        queue_name: String,
        sched_time: DateTime<Utc>,
        identity: String,
        payload: Payload,
    ) -> Result<(), SchedulerError> {
        if !self.queues.lock().contains_key(&queue_name) {
            return Err(SchedulerError::UnknownQueue(queue_name));
        }

        let ctx = Context::new(queue_name, sched_time, identity.clone(), payload, Arc::downgrade(self));

        let mut index = self.index.lock();
        if index.remove_identity(&identity) {
            warn!(identity = %identity, sched_time = %sched_time, "replacing already-scheduled task");
        }
        index.insert(ctx);
        Ok(())
    }

    pub fn cancel_task(&self, identity: &str) -> bool {
        self.index.lock().remove_identity(identity)
    }

    /// Worker-facing dequeue from `queue_name`. When `blocking` is
    /// true, waits up to `timeout` for the next context; when false,
    /// polls once and returns immediately either way. `QueueEmpty` on
    /// timeout (or on an empty non-blocking poll); `UnknownQueueError`
    /// on a bad name.
    pub fn get_task(&self, queue_name: &str, blocking: bool, timeout: StdDuration) -> Result<Context, SchedulerError> {
        let receiver = {
            let queues = self.queues.lock();
            let (_, receiver) = queues
                .get(queue_name)
                .ok_or_else(|| SchedulerError::UnknownQueue(queue_name.to_string()))?;
            receiver.clone()
        };
        let ctx = if blocking {
            receiver.recv_timeout(timeout)
        } else {
            receiver.try_recv()
        }
        .map_err(|_| SchedulerError::QueueEmpty(queue_name.to_string()))?;
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        Ok(ctx)
    }

    /// Acknowledges completion of one task previously returned by
    /// `get_task`, for outstanding-work bookkeeping during shutdown.
    pub fn task_done(&self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn outstanding(&self) -> u64 {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Moves every context whose `sched_time` has passed onto its
    /// queue. Lateness is logged only past one second, bucketed into
    /// seconds below a minute and `hh:mm:ss` at or above it — sub-second
    /// jitter from the 1-second tick cadence is expected and not worth
    /// a log line.
    pub fn tick(&self, now: DateTime<Utc>) {
        let due = self.index.lock().drain_due(now);
        for ctx in due {
            self.log_lateness(&ctx, now);
            self.dispatch(ctx);
        }
    }

    /// Dispatches every pending context immediately, regardless of its
    /// scheduled time. Used to drain the scheduler on shutdown.
    pub fn run_all(&self) {
        let all = self.index.lock().drain_all();
        for ctx in all {
            self.dispatch(ctx);
        }
    }

    fn dispatch(&self, ctx: Context) {
        let queues = self.queues.lock();
        match queues.get(&ctx.queue_name) {
            Some((sender, _)) => {
                if sender.try_send(ctx).is_err() {
                    warn!("queue full or disconnected, dropping a scheduled task");
                }
            }
            None => warn!(queue = %ctx.queue_name, "scheduled task for unknown queue"),
        }
    }

    fn log_lateness(&self, ctx: &Context, now: DateTime<Utc>) {
        let lateness = now - ctx.sched_time;
        let secs = lateness.num_seconds();
        if secs < 1 {
            return;
        }
        if secs < 60 {
            info!(identity = %ctx.identity, lateness_seconds = secs, "dispatching task");
        } else {
            let h = secs / 3600;
            let m = (secs % 3600) / 60;
            let s = secs % 60;
            info!(identity = %ctx.identity, lateness = format!("{h:02}:{m:02}:{s:02}"), "dispatching late task");
        }
    }

    /// Runs the tick loop at a 1-second cadence until `shutdown` reports
    /// true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(StdDuration::from_secs(1));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(Utc::now());
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler observed shutdown signal, running remaining tasks");
                        self.run_all();
                        return;
                    }
                }
            }
        }
    }
}
