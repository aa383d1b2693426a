//! Startup registration of the fixed-interval repeating jobs.
//!
//! Runs once at process start; re-arming each subsequent occurrence is
//! the broker's responsibility. Registration is idempotent across
//! process restarts.

use tracing::instrument;

use crate::broker::{BrokerError, JobBroker};
use crate::config::ScheduleConfig;
use crate::entity::{QueueName, RepeatSchedule};
use crate::producer::{
    payment_watch_options, retention_cleanup_options, PAYMENT_WATCH_TICK, RETENTION_CLEANUP_TICK,
};

#[instrument(name = "scheduler.register_tick_schedules", skip_all, err)]
pub async fn register_tick_schedules(
    broker: &dyn JobBroker,
    config: &ScheduleConfig,
) -> Result<(), BrokerError> {
    broker
        .ensure_repeating(RepeatSchedule {
            queue: QueueName::PaymentWatch,
            job_type: PAYMENT_WATCH_TICK,
            every: config.payment_watch_interval,
            options: payment_watch_options(),
        })
        .await?;

    broker
        .ensure_repeating(RepeatSchedule {
            queue: QueueName::RetentionCleanup,
            job_type: RETENTION_CLEANUP_TICK,
            every: config.retention_cleanup_interval,
            options: retention_cleanup_options(),
        })
        .await?;

    tracing::info!(
        payment_watch_every = ?config.payment_watch_interval,
        retention_cleanup_every = ?config.retention_cleanup_interval,
        "registered repeating tick schedules"
    );
    Ok(())
}
