//! Core job types exchanged with the broker.

use chrono::{DateTime, Utc};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use std::borrow::Cow;
use std::time::Duration;

use crate::error::WorkerError;

/// Longest delay the exponential backoff will grow to.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

#[derive(Clone, Eq, Hash, PartialEq, Debug, Serialize, Deserialize)]
#[serde(transparent)]
/// Identifier describing a job type or class of work within a queue.
///
/// Use `JobType::new` for static name registration.
///
/// # Examples
///
/// ```ignore
/// use subscription_worker::JobType;
///
/// const PROVISION_SUBSCRIPTION: JobType = JobType::new("provision_subscription");
/// ```
pub struct JobType(Cow<'static, str>);

impl JobType {
    pub const fn new(job_type: &'static str) -> Self {
        JobType(Cow::Borrowed(job_type))
    }

    pub fn from_owned(job_type: String) -> Self {
        JobType(Cow::Owned(job_type))
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Eq, Hash, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// The named queues served by this worker. Each queue is bound to at most
/// one dispatcher per process.
pub enum QueueName {
    Notify,
    PaymentWatch,
    Provision,
    RetentionCleanup,
}

impl QueueName {
    pub const ALL: [QueueName; 4] = [
        QueueName::Notify,
        QueueName::PaymentWatch,
        QueueName::Provision,
        QueueName::RetentionCleanup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Notify => "notify",
            QueueName::PaymentWatch => "payment_watch",
            QueueName::Provision => "provision",
            QueueName::RetentionCleanup => "retention_cleanup",
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Eq, Hash, PartialEq, Debug, Serialize, Deserialize)]
#[serde(transparent)]
/// Identity of a job within the broker. Generated identifiers are UUIDv7.
/// Explicit identifiers double as dedup keys: the broker collapses
/// duplicate enqueues of the same id while one is pending or active.
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[serde_with::serde_as]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
/// Delay applied by the broker between a failed attempt and the next one.
pub enum BackoffPolicy {
    /// Failed attempts are retried immediately.
    None,
    /// `base * 2^(attempt - 1)`, capped at [`MAX_BACKOFF`].
    Exponential {
        #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
        base: Duration,
    },
}

impl BackoffPolicy {
    pub const fn exponential(base: Duration) -> Self {
        BackoffPolicy::Exponential { base }
    }

    /// Delay before the retry that follows the given failed attempt.
    /// Attempts are counted from 1.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self {
            BackoffPolicy::None => Duration::ZERO,
            BackoffPolicy::Exponential { base } => {
                let exponent = attempt.saturating_sub(1).min(31);
                let delay = base.saturating_mul(1u32 << exponent);
                delay.min(MAX_BACKOFF)
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
/// How many terminal job records the broker keeps per queue before purging.
pub struct RetentionPolicy {
    pub completed: usize,
    pub failed: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
/// Per-type execution policy submitted alongside every enqueue.
pub struct JobOptions {
    /// Number of attempts before the job is failed for good.
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub retention: RetentionPolicy,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
/// A job as delivered by the broker.
pub struct Job {
    pub id: JobId,
    pub queue: QueueName,
    pub job_type: JobType,
    pub(crate) payload: serde_json::Value,
    pub options: JobOptions,
}

impl Job {
    /// Decode the opaque payload into a typed struct.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

#[derive(Debug, Builder)]
/// A job submission, built by the producer and accepted by the broker.
pub struct NewJob {
    pub queue: QueueName,
    pub job_type: JobType,
    #[builder(setter(custom))]
    pub payload: serde_json::Value,
    pub options: JobOptions,
    #[builder(setter(into, strip_option), default)]
    /// Explicit job identity; used by the broker for deduplication.
    pub job_id: Option<JobId>,
    #[builder(setter(strip_option), default)]
    /// Hold the job back for this long before it becomes ready.
    pub delay: Option<Duration>,
}

impl NewJob {
    pub fn builder() -> NewJobBuilder {
        NewJobBuilder::default()
    }
}

impl NewJobBuilder {
    pub fn payload<P: Serialize>(&mut self, payload: P) -> Result<&mut Self, WorkerError> {
        self.payload =
            Some(serde_json::to_value(payload).map_err(WorkerError::CouldNotSerializePayload)?);
        Ok(self)
    }
}

#[derive(Clone, Debug)]
/// A fixed-interval repeating job registration. The broker re-arms the
/// next occurrence after each firing reaches a terminal state.
pub struct RepeatSchedule {
    pub queue: QueueName,
    pub job_type: JobType,
    pub every: Duration,
    pub options: JobOptions,
}

impl RepeatSchedule {
    /// Dedup identity shared by all pending occurrences of this schedule.
    /// Re-registering an identical schedule collapses onto the already
    /// armed occurrence instead of creating a second repeater.
    pub fn occurrence_id(&self) -> JobId {
        JobId::from(format!("repeat_{}_{}", self.queue, self.job_type))
    }
}

pub(crate) fn due_at(delay: Option<Duration>, now: DateTime<Utc>) -> DateTime<Utc> {
    match delay {
        Some(delay) => now + chrono::Duration::milliseconds(delay.as_millis() as i64),
        None => now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_per_attempt() {
        let policy = BackoffPolicy::exponential(Duration::from_secs(2));
        assert_eq!(policy.delay_after(1), Duration::from_secs(2));
        assert_eq!(policy.delay_after(2), Duration::from_secs(4));
        assert_eq!(policy.delay_after(3), Duration::from_secs(8));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = BackoffPolicy::exponential(Duration::from_secs(5));
        assert_eq!(policy.delay_after(30), MAX_BACKOFF);
    }

    #[test]
    fn no_backoff_retries_immediately() {
        assert_eq!(BackoffPolicy::None.delay_after(1), Duration::ZERO);
    }

    #[test]
    fn repeat_occurrence_id_is_stable() {
        let schedule = RepeatSchedule {
            queue: QueueName::PaymentWatch,
            job_type: JobType::new("payment_watch_tick"),
            every: Duration::from_secs(30),
            options: JobOptions {
                max_attempts: 3,
                backoff: BackoffPolicy::exponential(Duration::from_secs(5)),
                retention: RetentionPolicy {
                    completed: 1000,
                    failed: 3000,
                },
            },
        };
        assert_eq!(
            schedule.occurrence_id(),
            JobId::from("repeat_payment_watch_payment_watch_tick")
        );
    }
}
