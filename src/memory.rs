//! In-process [`JobBroker`] implementation.
//!
//! Backs the test suite and single-process deployments. Durability is
//! process-lifetime only; everything else follows the broker contract:
//! ready jobs are delivered oldest-due-first, explicit job ids collapse
//! duplicate enqueues, failed deliveries are re-armed with the job's
//! backoff policy, and leases held past the visibility timeout are
//! reclaimed and redelivered.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use crate::broker::{BrokerError, Delivery, FailOutcome, JobBroker, LeaseId, PollOutcome};
use crate::entity::{due_at, Job, JobId, JobType, NewJob, QueueName, RepeatSchedule};

const MAX_WAIT: Duration = Duration::from_secs(60);
const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(60 * 5);

pub struct MemoryBroker {
    visibility_timeout: Duration,
    inner: Mutex<Inner>,
    wakeups: HashMap<QueueName, Notify>,
}

#[derive(Default)]
struct Inner {
    queues: HashMap<QueueName, QueueState>,
}

#[derive(Default)]
struct QueueState {
    seq: u64,
    pending: Vec<PendingJob>,
    active: HashMap<LeaseId, ActiveJob>,
    schedules: HashMap<JobType, RepeatSchedule>,
    completed: VecDeque<Job>,
    failed: VecDeque<FailedJob>,
}

struct PendingJob {
    job: Job,
    attempt: u32,
    execute_at: DateTime<Utc>,
    seq: u64,
}

struct ActiveJob {
    job: Job,
    attempt: u32,
    leased_at: DateTime<Utc>,
}

struct FailedJob {
    job: Job,
    error: String,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_visibility_timeout(DEFAULT_VISIBILITY_TIMEOUT)
    }

    /// A broker whose unacked deliveries are reclaimed after `timeout`.
    pub fn with_visibility_timeout(timeout: Duration) -> Self {
        let mut inner = Inner::default();
        let mut wakeups = HashMap::new();
        for queue in QueueName::ALL {
            inner.queues.insert(queue, QueueState::default());
            wakeups.insert(queue, Notify::new());
        }
        Self {
            visibility_timeout: timeout,
            inner: Mutex::new(inner),
            wakeups,
        }
    }

    pub fn pending_count(&self, queue: QueueName) -> usize {
        self.lock(|inner| inner.queue(queue).pending.len())
    }

    pub fn active_count(&self, queue: QueueName) -> usize {
        self.lock(|inner| inner.queue(queue).active.len())
    }

    pub fn completed_count(&self, queue: QueueName) -> usize {
        self.lock(|inner| inner.queue(queue).completed.len())
    }

    pub fn failed_count(&self, queue: QueueName) -> usize {
        self.lock(|inner| inner.queue(queue).failed.len())
    }

    /// Error strings of terminally failed jobs, oldest first.
    pub fn failed_errors(&self, queue: QueueName) -> Vec<String> {
        self.lock(|inner| {
            inner
                .queue(queue)
                .failed
                .iter()
                .map(|f| f.error.clone())
                .collect()
        })
    }

    /// Job types of completed jobs, oldest first.
    pub fn completed_job_types(&self, queue: QueueName) -> Vec<JobType> {
        self.lock(|inner| {
            inner
                .queue(queue)
                .completed
                .iter()
                .map(|j| j.job_type.clone())
                .collect()
        })
    }

    fn lock<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        let mut inner = self.inner.lock().expect("Couldn't lock MemoryBroker state");
        f(&mut inner)
    }

    fn wake(&self, queue: QueueName) {
        self.wakeups
            .get(&queue)
            .expect("wakeup for queue")
            .notify_one();
    }
}

impl Inner {
    fn queue(&mut self, queue: QueueName) -> &mut QueueState {
        self.queues.get_mut(&queue).expect("queue state")
    }
}

impl QueueState {
    fn holds_job_id(&self, id: &JobId) -> bool {
        self.pending.iter().any(|p| &p.job.id == id)
            || self.active.values().any(|a| &a.job.id == id)
    }

    fn push_pending(&mut self, job: Job, attempt: u32, execute_at: DateTime<Utc>) {
        let seq = self.seq;
        self.seq += 1;
        self.pending.push(PendingJob {
            job,
            attempt,
            execute_at,
            seq,
        });
    }

    /// Move leases held past the visibility timeout back to pending.
    fn reclaim_stale(&mut self, now: DateTime<Utc>, visibility_timeout: Duration) {
        let cutoff = now - chrono::Duration::milliseconds(visibility_timeout.as_millis() as i64);
        let stale: Vec<LeaseId> = self
            .active
            .iter()
            .filter(|(_, a)| a.leased_at < cutoff)
            .map(|(lease, _)| *lease)
            .collect();
        for lease in stale {
            let active = self.active.remove(&lease).expect("stale lease present");
            tracing::error!(job_id = %active.job.id, job_type = %active.job.job_type, "lost job");
            self.push_pending(active.job, active.attempt + 1, now);
        }
    }

    fn take_next_ready(&mut self, now: DateTime<Utc>) -> Option<PendingJob> {
        let idx = self
            .pending
            .iter()
            .enumerate()
            .filter(|(_, p)| p.execute_at <= now)
            .min_by_key(|(_, p)| (p.execute_at, p.seq))
            .map(|(idx, _)| idx)?;
        Some(self.pending.swap_remove(idx))
    }

    fn next_due_in(&self, now: DateTime<Utc>) -> Duration {
        self.pending
            .iter()
            .map(|p| p.execute_at)
            .min()
            .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(MAX_WAIT)
            .min(MAX_WAIT)
    }

    /// Arm the next occurrence of a repeating job type, unless one is
    /// already pending or active.
    fn maybe_rearm(&mut self, job_type: &JobType, now: DateTime<Utc>) -> bool {
        let Some(schedule) = self.schedules.get(job_type) else {
            return false;
        };
        let occurrence_id = schedule.occurrence_id();
        if self.holds_job_id(&occurrence_id) {
            return false;
        }
        let job = Job {
            id: occurrence_id,
            queue: schedule.queue,
            job_type: schedule.job_type.clone(),
            payload: serde_json::json!({}),
            options: schedule.options,
        };
        let execute_at = due_at(Some(schedule.every), now);
        self.push_pending(job, 1, execute_at);
        true
    }
}

#[async_trait]
impl JobBroker for MemoryBroker {
    async fn enqueue(&self, new_job: NewJob) -> Result<JobId, BrokerError> {
        let now = Utc::now();
        let queue = new_job.queue;
        let id = self.lock(|inner| {
            let state = inner.queue(new_job.queue);
            if let Some(id) = &new_job.job_id {
                if state.holds_job_id(id) {
                    return id.clone();
                }
            }
            let id = new_job.job_id.unwrap_or_default();
            let job = Job {
                id: id.clone(),
                queue: new_job.queue,
                job_type: new_job.job_type,
                payload: new_job.payload,
                options: new_job.options,
            };
            state.push_pending(job, 1, due_at(new_job.delay, now));
            id
        });
        self.wake(queue);
        Ok(id)
    }

    async fn next_ready(&self, queue: QueueName) -> Result<PollOutcome, BrokerError> {
        let now = Utc::now();
        let visibility_timeout = self.visibility_timeout;
        Ok(self.lock(|inner| {
            let state = inner.queue(queue);
            state.reclaim_stale(now, visibility_timeout);
            match state.take_next_ready(now) {
                Some(pending) => {
                    let lease = LeaseId::new();
                    let delivery = Delivery {
                        job: pending.job.clone(),
                        attempt: pending.attempt,
                        lease,
                    };
                    state.active.insert(
                        lease,
                        ActiveJob {
                            job: pending.job,
                            attempt: pending.attempt,
                            leased_at: now,
                        },
                    );
                    PollOutcome::Delivery(delivery)
                }
                None => PollOutcome::Empty {
                    retry_in: state.next_due_in(now),
                },
            }
        }))
    }

    async fn ack(&self, queue: QueueName, lease: LeaseId) -> Result<(), BrokerError> {
        let now = Utc::now();
        let rearmed = self.lock(|inner| {
            let state = inner.queue(queue);
            let active = state
                .active
                .remove(&lease)
                .ok_or(BrokerError::UnknownLease(lease))?;
            let job_type = active.job.job_type.clone();
            let retention = active.job.options.retention.completed;
            state.completed.push_back(active.job);
            while state.completed.len() > retention {
                state.completed.pop_front();
            }
            Ok::<_, BrokerError>(state.maybe_rearm(&job_type, now))
        })?;
        if rearmed {
            self.wake(queue);
        }
        Ok(())
    }

    async fn fail(
        &self,
        queue: QueueName,
        lease: LeaseId,
        error: String,
    ) -> Result<FailOutcome, BrokerError> {
        let now = Utc::now();
        let outcome = self.lock(|inner| {
            let state = inner.queue(queue);
            let active = state
                .active
                .remove(&lease)
                .ok_or(BrokerError::UnknownLease(lease))?;
            if active.attempt < active.job.options.max_attempts {
                let next_attempt = active.attempt + 1;
                let delay = active.job.options.backoff.delay_after(active.attempt);
                let retry_at = due_at(Some(delay), now);
                state.push_pending(active.job, next_attempt, retry_at);
                Ok::<_, BrokerError>(FailOutcome::Retrying {
                    attempt: next_attempt,
                    retry_at,
                })
            } else {
                let job_type = active.job.job_type.clone();
                let retention = active.job.options.retention.failed;
                state.failed.push_back(FailedJob {
                    job: active.job,
                    error,
                });
                while state.failed.len() > retention {
                    state.failed.pop_front();
                }
                state.maybe_rearm(&job_type, now);
                Ok(FailOutcome::Terminal)
            }
        })?;
        self.wake(queue);
        Ok(outcome)
    }

    async fn ensure_repeating(&self, schedule: RepeatSchedule) -> Result<(), BrokerError> {
        let now = Utc::now();
        let queue = schedule.queue;
        self.lock(|inner| {
            let state = inner.queue(queue);
            state
                .schedules
                .insert(schedule.job_type.clone(), schedule.clone());
            state.maybe_rearm(&schedule.job_type, now);
        });
        self.wake(queue);
        Ok(())
    }

    async fn ready(&self, queue: QueueName) {
        self.wakeups
            .get(&queue)
            .expect("wakeup for queue")
            .notified()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{BackoffPolicy, JobOptions, RetentionPolicy};

    fn options(max_attempts: u32) -> JobOptions {
        JobOptions {
            max_attempts,
            backoff: BackoffPolicy::None,
            retention: RetentionPolicy {
                completed: 100,
                failed: 100,
            },
        }
    }

    fn new_job(job_id: Option<&str>, max_attempts: u32) -> NewJob {
        let mut builder = NewJob::builder();
        builder
            .queue(QueueName::Provision)
            .job_type(JobType::new("provision_subscription"))
            .payload(serde_json::json!({"invoice_id": "inv_1"}))
            .expect("payload")
            .options(options(max_attempts));
        if let Some(id) = job_id {
            builder.job_id(id);
        }
        builder.build().expect("new job")
    }

    async fn poll_job(broker: &MemoryBroker, queue: QueueName) -> Delivery {
        match broker.next_ready(queue).await.expect("poll") {
            PollOutcome::Delivery(delivery) => delivery,
            PollOutcome::Empty { .. } => panic!("expected a ready job"),
        }
    }

    #[tokio::test]
    async fn delivers_ready_jobs_in_enqueue_order() {
        let broker = MemoryBroker::new();
        broker.enqueue(new_job(Some("first"), 1)).await.unwrap();
        broker.enqueue(new_job(Some("second"), 1)).await.unwrap();

        let delivery = poll_job(&broker, QueueName::Provision).await;
        assert_eq!(delivery.job.id, JobId::from("first"));
        let delivery = poll_job(&broker, QueueName::Provision).await;
        assert_eq!(delivery.job.id, JobId::from("second"));
    }

    #[tokio::test]
    async fn duplicate_job_ids_collapse_while_pending() {
        let broker = MemoryBroker::new();
        let first = broker.enqueue(new_job(Some("inv_1"), 5)).await.unwrap();
        let second = broker.enqueue(new_job(Some("inv_1"), 5)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(broker.pending_count(QueueName::Provision), 1);
    }

    #[tokio::test]
    async fn delayed_jobs_are_not_ready_until_due() {
        let broker = MemoryBroker::new();
        let mut builder = NewJob::builder();
        builder
            .queue(QueueName::Provision)
            .job_type(JobType::new("provision_subscription"))
            .payload(serde_json::json!({}))
            .expect("payload")
            .options(options(1))
            .delay(Duration::from_millis(200));
        broker.enqueue(builder.build().unwrap()).await.unwrap();

        match broker.next_ready(QueueName::Provision).await.unwrap() {
            PollOutcome::Empty { retry_in } => assert!(retry_in <= Duration::from_millis(200)),
            PollOutcome::Delivery(_) => panic!("job should still be delayed"),
        }
        tokio::time::sleep(Duration::from_millis(220)).await;
        poll_job(&broker, QueueName::Provision).await;
    }

    #[tokio::test]
    async fn failed_jobs_retry_until_attempts_exhaust() {
        let broker = MemoryBroker::new();
        broker.enqueue(new_job(Some("inv_1"), 2)).await.unwrap();

        let delivery = poll_job(&broker, QueueName::Provision).await;
        assert_eq!(delivery.attempt, 1);
        let outcome = broker
            .fail(QueueName::Provision, delivery.lease, "boom".to_string())
            .await
            .unwrap();
        assert!(matches!(outcome, FailOutcome::Retrying { attempt: 2, .. }));

        let delivery = poll_job(&broker, QueueName::Provision).await;
        assert_eq!(delivery.attempt, 2);
        let outcome = broker
            .fail(QueueName::Provision, delivery.lease, "boom".to_string())
            .await
            .unwrap();
        assert!(matches!(outcome, FailOutcome::Terminal));
        assert_eq!(broker.failed_count(QueueName::Provision), 1);
        assert_eq!(broker.pending_count(QueueName::Provision), 0);
    }

    #[tokio::test]
    async fn terminal_records_are_trimmed_to_retention() {
        let broker = MemoryBroker::new();
        for i in 0..3 {
            let mut builder = NewJob::builder();
            builder
                .queue(QueueName::Notify)
                .job_type(JobType::new("notify_user"))
                .payload(serde_json::json!({}))
                .expect("payload")
                .options(JobOptions {
                    max_attempts: 1,
                    backoff: BackoffPolicy::None,
                    retention: RetentionPolicy {
                        completed: 2,
                        failed: 2,
                    },
                })
                .job_id(format!("job_{i}"));
            broker.enqueue(builder.build().unwrap()).await.unwrap();
            let delivery = poll_job(&broker, QueueName::Notify).await;
            broker.ack(QueueName::Notify, delivery.lease).await.unwrap();
        }
        assert_eq!(broker.completed_count(QueueName::Notify), 2);
    }

    #[tokio::test]
    async fn repeating_schedule_rearms_after_each_occurrence() {
        let broker = MemoryBroker::new();
        let schedule = RepeatSchedule {
            queue: QueueName::PaymentWatch,
            job_type: JobType::new("payment_watch_tick"),
            every: Duration::from_millis(10),
            options: options(1),
        };
        broker.ensure_repeating(schedule.clone()).await.unwrap();
        assert_eq!(broker.pending_count(QueueName::PaymentWatch), 1);

        // re-registration on restart must not create a second repeater
        broker.ensure_repeating(schedule).await.unwrap();
        assert_eq!(broker.pending_count(QueueName::PaymentWatch), 1);

        tokio::time::sleep(Duration::from_millis(15)).await;
        let delivery = poll_job(&broker, QueueName::PaymentWatch).await;
        broker
            .ack(QueueName::PaymentWatch, delivery.lease)
            .await
            .unwrap();
        assert_eq!(broker.pending_count(QueueName::PaymentWatch), 1);
    }

    #[tokio::test]
    async fn stale_leases_are_reclaimed_and_redelivered() {
        let broker = MemoryBroker::with_visibility_timeout(Duration::from_millis(30));
        broker.enqueue(new_job(Some("inv_1"), 5)).await.unwrap();

        let delivery = poll_job(&broker, QueueName::Provision).await;
        assert_eq!(delivery.attempt, 1);
        // never acked; lease lapses
        tokio::time::sleep(Duration::from_millis(40)).await;

        let delivery = poll_job(&broker, QueueName::Provision).await;
        assert_eq!(delivery.attempt, 2);
    }
}
