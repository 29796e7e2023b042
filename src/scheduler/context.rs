//! A single scheduled unit of work.

use std::sync::Weak;

use chrono::{DateTime, Utc};

use super::core::Scheduler;
use crate::error::SchedulerError;
use crate::record::RecordId;

/// What a scheduled context asks a worker to do. A discriminated enum
/// in place of a free-form attribute bag: every payload a worker can
/// receive is enumerable at compile time.
#[derive(Debug, Clone)]
pub enum Payload {
    Parse { record: RecordId },
    Renew { record: RecordId, attempt: u32 },
}

/// A task sitting in the scheduler's forward map or in flight on a
/// queue. `scheduler` is a non-owning handle back to the scheduler that
/// produced this context, set once at `add_task` time, so a worker
/// holding a `Context` can reschedule itself without the scheduler and
/// its contexts owning each other.
#[derive(Debug, Clone)]
pub struct Context {
    pub queue_name: String,
    pub sched_time: DateTime<Utc>,
    pub identity: String,
    pub payload: Payload,
    pub(super) scheduler: Weak<Scheduler>,
}

impl Context {
    pub(super) fn new(
        queue_name: String,
        sched_time: DateTime<Utc>,
        identity: String,
        payload: Payload,
        scheduler: Weak<Scheduler>,
    ) -> Self {
        Self {
            queue_name,
            sched_time,
            identity,
            payload,
            scheduler,
        }
    }

    /// Re-adds this context to its owning scheduler at a new time,
    /// replacing any pending entry under the same identity.
    pub fn reschedule(&self, when: DateTime<Utc>) -> Result<(), SchedulerError> {
        self.reschedule_with(when, self.payload.clone())
    }

    /// Like `reschedule`, but replaces the payload too — used when a
    /// retried task needs an incremented attempt count.
    pub fn reschedule_with(&self, when: DateTime<Utc>, payload: Payload) -> Result<(), SchedulerError> {
        let scheduler = self.scheduler.upgrade().ok_or(SchedulerError::NotAttached)?;
        scheduler.add_task(self.queue_name.clone(), when, self.identity.clone(), payload)
    }
}
