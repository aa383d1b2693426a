//! Typed enqueue API consumed by the HTTP layer and by handlers that
//! chain follow-up work.
//!
//! Every job type carries its own retry, backoff, and retention policy,
//! submitted alongside the payload. Enqueue is fire-and-forget: it
//! returns once the broker has durably accepted the job. An enqueue
//! failure propagates to the caller and is never retried internally.

use serde::{Deserialize, Serialize};
use tracing::instrument;

use std::sync::Arc;
use std::time::Duration;

use crate::broker::JobBroker;
use crate::entity::{
    BackoffPolicy, JobId, JobOptions, JobType, NewJob, QueueName, RetentionPolicy,
};
use crate::error::WorkerError;
use crate::store::{InvoiceId, TicketId, UserId};

pub const NOTIFY_SUPPORT: JobType = JobType::new("notify_support");
pub const NOTIFY_USER: JobType = JobType::new("notify_user");
pub const PAYMENT_WATCH_TICK: JobType = JobType::new("payment_watch_tick");
pub const PROVISION_SUBSCRIPTION: JobType = JobType::new("provision_subscription");
pub const RETENTION_CLEANUP_TICK: JobType = JobType::new("retention_cleanup_tick");

#[derive(Clone, Copy, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SupportNotificationKind {
    NewTicket,
    NewMessage,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NotifySupportPayload {
    pub ticket_id: TicketId,
    pub kind: SupportNotificationKind,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NotifyUserPayload {
    pub user_id: UserId,
    pub kind: String,
    pub message: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PaymentWatchPayload {
    /// Restrict the sweep to a single invoice.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice_id: Option<InvoiceId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProvisionPayload {
    pub invoice_id: InvoiceId,
}

pub(crate) fn notify_support_options() -> JobOptions {
    JobOptions {
        max_attempts: 5,
        backoff: BackoffPolicy::exponential(Duration::from_secs(2)),
        retention: RetentionPolicy {
            completed: 2000,
            failed: 5000,
        },
    }
}

pub(crate) fn notify_user_options() -> JobOptions {
    JobOptions {
        max_attempts: 3,
        backoff: BackoffPolicy::exponential(Duration::from_secs(2)),
        retention: RetentionPolicy {
            completed: 2000,
            failed: 5000,
        },
    }
}

pub(crate) fn payment_watch_options() -> JobOptions {
    JobOptions {
        max_attempts: 3,
        backoff: BackoffPolicy::exponential(Duration::from_secs(5)),
        retention: RetentionPolicy {
            completed: 1000,
            failed: 3000,
        },
    }
}

pub(crate) fn provision_options() -> JobOptions {
    JobOptions {
        max_attempts: 5,
        backoff: BackoffPolicy::exponential(Duration::from_secs(3)),
        retention: RetentionPolicy {
            completed: 5000,
            failed: 10000,
        },
    }
}

pub(crate) fn retention_cleanup_options() -> JobOptions {
    JobOptions {
        max_attempts: 1,
        backoff: BackoffPolicy::None,
        retention: RetentionPolicy {
            completed: 100,
            failed: 500,
        },
    }
}

/// Dedup identity of a provisioning job: two enqueues for the same
/// invoice collapse into at most one pending/active job.
pub fn provision_job_id(invoice_id: &InvoiceId) -> JobId {
    JobId::from(format!("provision_{invoice_id}"))
}

#[derive(Clone)]
/// A handle for submitting jobs to the broker.
///
/// Cheap to clone; constructed from [`Workers::producer`](crate::Workers::producer)
/// or directly from a broker handle.
pub struct JobProducer {
    broker: Arc<dyn JobBroker>,
}

impl JobProducer {
    pub fn new(broker: Arc<dyn JobBroker>) -> Self {
        Self { broker }
    }

    /// Enqueue a support notification for a ticket event.
    #[instrument(name = "producer.notify_support", skip(self), err)]
    pub async fn notify_support(
        &self,
        payload: NotifySupportPayload,
    ) -> Result<JobId, WorkerError> {
        self.enqueue(
            QueueName::Notify,
            NOTIFY_SUPPORT,
            payload,
            notify_support_options(),
            None,
        )
        .await
    }

    /// Enqueue a user-facing notification.
    #[instrument(name = "producer.notify_user", skip(self, payload), fields(user_id = %payload.user_id), err)]
    pub async fn notify_user(&self, payload: NotifyUserPayload) -> Result<JobId, WorkerError> {
        self.enqueue(
            QueueName::Notify,
            NOTIFY_USER,
            payload,
            notify_user_options(),
            None,
        )
        .await
    }

    /// Enqueue a payment-watch sweep, optionally scoped to one invoice.
    #[instrument(name = "producer.payment_watch", skip(self), err)]
    pub async fn payment_watch(
        &self,
        payload: PaymentWatchPayload,
    ) -> Result<JobId, WorkerError> {
        self.enqueue(
            QueueName::PaymentWatch,
            PAYMENT_WATCH_TICK,
            payload,
            payment_watch_options(),
            None,
        )
        .await
    }

    /// Enqueue a provisioning job for an invoice. Deduplicated on the
    /// invoice id while a provisioning job is pending or active.
    #[instrument(name = "producer.provision", skip(self), err)]
    pub async fn provision(&self, invoice_id: &InvoiceId) -> Result<JobId, WorkerError> {
        self.enqueue(
            QueueName::Provision,
            PROVISION_SUBSCRIPTION,
            ProvisionPayload {
                invoice_id: invoice_id.clone(),
            },
            provision_options(),
            Some(provision_job_id(invoice_id)),
        )
        .await
    }

    /// Enqueue a one-off retention cleanup sweep.
    #[instrument(name = "producer.retention_cleanup", skip(self), err)]
    pub async fn retention_cleanup(&self) -> Result<JobId, WorkerError> {
        self.enqueue(
            QueueName::RetentionCleanup,
            RETENTION_CLEANUP_TICK,
            serde_json::json!({}),
            retention_cleanup_options(),
            None,
        )
        .await
    }

    async fn enqueue<P: Serialize>(
        &self,
        queue: QueueName,
        job_type: JobType,
        payload: P,
        options: JobOptions,
        job_id: Option<JobId>,
    ) -> Result<JobId, WorkerError> {
        let mut builder = NewJob::builder();
        builder
            .queue(queue)
            .job_type(job_type)
            .payload(payload)?
            .options(options);
        if let Some(job_id) = job_id {
            builder.job_id(job_id);
        }
        let new_job = builder
            .build()
            .map_err(|e| WorkerError::Config(e.to_string()))?;
        Ok(self.broker.enqueue(new_job).await?)
    }
}
