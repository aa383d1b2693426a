//! Hourly retention sweeps.
//!
//! Four independent, order-insensitive bulk operations. A failing sweep
//! is logged and skipped; the tick only fails when every sweep failed,
//! since the next hourly run will catch up.

use async_trait::async_trait;
use chrono::Utc;
use tracing::instrument;

use std::sync::Arc;

use crate::current::CurrentJob;
use crate::entity::JobType;
use crate::producer::RETENTION_CLEANUP_TICK;
use crate::runner::{HandlerError, JobHandler};
use crate::store::Store;

pub const IDEMPOTENCY_KEY_RETENTION_DAYS: i64 = 90;

pub struct RetentionCleanupHandler {
    store: Arc<dyn Store>,
}

impl RetentionCleanupHandler {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    #[instrument(name = "retention.sweep", skip(self), err)]
    pub async fn sweep(&self) -> Result<(), HandlerError> {
        let now = Utc::now();
        let mut failed_sweeps = 0usize;

        match self.store.delete_expired_sessions(now).await {
            Ok(deleted) => tracing::info!(deleted, "removed expired sessions"),
            Err(e) => {
                failed_sweeps += 1;
                tracing::warn!(error = %e, "session sweep failed");
            }
        }

        let cutoff = now - chrono::Duration::days(IDEMPOTENCY_KEY_RETENTION_DAYS);
        match self.store.delete_idempotency_keys_before(cutoff).await {
            Ok(deleted) => tracing::info!(deleted, "removed old idempotency keys"),
            Err(e) => {
                failed_sweeps += 1;
                tracing::warn!(error = %e, "idempotency key sweep failed");
            }
        }

        match self.store.expire_overdue_subscriptions(now).await {
            Ok(expired) => tracing::info!(expired, "marked subscriptions expired"),
            Err(e) => {
                failed_sweeps += 1;
                tracing::warn!(error = %e, "subscription sweep failed");
            }
        }

        match self.store.expire_stale_invoices(now).await {
            Ok(expired) => tracing::info!(expired, "marked invoices expired"),
            Err(e) => {
                failed_sweeps += 1;
                tracing::warn!(error = %e, "invoice sweep failed");
            }
        }

        if failed_sweeps == 4 {
            return Err("every retention sweep failed".into());
        }
        Ok(())
    }
}

#[async_trait]
impl JobHandler for RetentionCleanupHandler {
    fn job_type(&self) -> JobType {
        RETENTION_CLEANUP_TICK
    }

    async fn run(&self, _current_job: CurrentJob) -> Result<(), HandlerError> {
        self.sweep().await
    }
}
