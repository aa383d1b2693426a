//! The broker seam: a durable FIFO queue with delayed and repeating job
//! support and at-least-once delivery.
//!
//! The production broker is an external service; this crate consumes it
//! through [`JobBroker`] and ships [`MemoryBroker`](crate::MemoryBroker)
//! as an in-process implementation for tests and single-process
//! deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use std::time::Duration;

use crate::entity::{Job, JobId, NewJob, QueueName, RepeatSchedule};

#[derive(Clone, Copy, Eq, Hash, PartialEq, Debug)]
/// Opaque token identifying one delivery of a job to one consumer.
pub struct LeaseId(uuid::Uuid);

impl LeaseId {
    pub(crate) fn new() -> Self {
        Self(uuid::Uuid::now_v7())
    }
}

impl std::fmt::Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
/// A job handed to a dispatcher, together with its delivery lease.
pub struct Delivery {
    pub job: Job,
    /// Attempt number of this delivery, counted from 1.
    pub attempt: u32,
    pub lease: LeaseId,
}

#[derive(Debug)]
/// Result of asking the broker for the next ready job on a queue.
pub enum PollOutcome {
    Delivery(Delivery),
    /// Nothing ready; poll again after `retry_in` (or sooner, if
    /// [`JobBroker::ready`] wakes first).
    Empty { retry_in: Duration },
}

#[derive(Debug)]
/// What the broker decided after a failed delivery was reported.
pub enum FailOutcome {
    Retrying {
        attempt: u32,
        retry_at: DateTime<Utc>,
    },
    /// Attempts exhausted; the job moved to the terminal failed state
    /// and will not run again.
    Terminal,
}

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("BrokerError - Unavailable: {0}")]
    Unavailable(String),
    #[error("BrokerError - UnknownLease: lease {0} is not held")]
    UnknownLease(LeaseId),
    #[error("BrokerError - Serde: {0}")]
    Serde(#[from] serde_json::Error),
}

#[async_trait]
/// Durable queue operations the worker depends on. At-least-once
/// semantics: a delivered job whose lease is neither acked nor failed
/// becomes deliverable again once the broker's processing timeout lapses.
pub trait JobBroker: Send + Sync + 'static {
    /// Durably accept a job. Returns the job's identity, or the existing
    /// one when a pending or active job with the same explicit id
    /// already exists (dedup collapse).
    async fn enqueue(&self, new_job: NewJob) -> Result<JobId, BrokerError>;

    /// Lease the next ready job on the queue, if any.
    async fn next_ready(&self, queue: QueueName) -> Result<PollOutcome, BrokerError>;

    /// Acknowledge a delivery as successfully processed.
    async fn ack(&self, queue: QueueName, lease: LeaseId) -> Result<(), BrokerError>;

    /// Report a delivery as failed. The broker applies the job's backoff
    /// policy or moves it to the terminal failed state.
    async fn fail(
        &self,
        queue: QueueName,
        lease: LeaseId,
        error: String,
    ) -> Result<FailOutcome, BrokerError>;

    /// Idempotently register a fixed-interval repeating job. Re-arming
    /// an identical schedule must not create a second concurrent
    /// repeater.
    async fn ensure_repeating(&self, schedule: RepeatSchedule) -> Result<(), BrokerError>;

    /// Resolves when a job may have become ready on the queue. Used by
    /// dispatchers to cut poll latency; spurious wakeups are fine.
    async fn ready(&self, queue: QueueName);
}
