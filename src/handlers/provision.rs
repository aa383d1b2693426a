//! Subscription provisioning after payment settlement.
//!
//! The most consequential handler in the set: it must never double-
//! charge or double-extend. Deliveries are deduplicated on the invoice
//! id at enqueue time, but the authoritative idempotence guard is the
//! conditional PENDING to PAID claim on the invoice: the subscription is
//! only touched by the invocation that wins the claim.

use async_trait::async_trait;
use chrono::Utc;
use tracing::instrument;

use std::sync::Arc;

use crate::current::CurrentJob;
use crate::entity::JobType;
use crate::producer::{JobProducer, NotifyUserPayload, ProvisionPayload, PROVISION_SUBSCRIPTION};
use crate::runner::{HandlerError, JobHandler};
use crate::store::{
    InvoiceId, InvoiceStatus, NewSubscription, PaymentStatus, Store, SubscriptionStatus,
};

pub struct ProvisionHandler {
    store: Arc<dyn Store>,
    producer: JobProducer,
}

impl ProvisionHandler {
    pub fn new(store: Arc<dyn Store>, producer: JobProducer) -> Self {
        Self { store, producer }
    }

    #[instrument(name = "provision.subscription", skip(self), err)]
    pub async fn provision(&self, invoice_id: &InvoiceId) -> Result<(), HandlerError> {
        let Some(invoice) = self.store.find_invoice(invoice_id).await? else {
            tracing::info!("invoice not found, nothing to provision");
            return Ok(());
        };

        let payments = self.store.payments_for_invoice(invoice_id).await?;
        if !payments.iter().any(|p| p.status == PaymentStatus::Settled) {
            tracing::info!("no settled payment, leaving invoice untouched");
            return Ok(());
        }

        if invoice.status == InvoiceStatus::Paid {
            tracing::info!("invoice already paid");
            return Ok(());
        }

        let plan = self
            .store
            .find_plan(&invoice.plan_id)
            .await?
            .ok_or_else(|| format!("plan {} missing for invoice {}", invoice.plan_id, invoice.id))?;

        // Claim the invoice before touching the subscription. A lost
        // claim means a concurrent invocation already provisioned it.
        if !self.store.mark_invoice_paid(invoice_id).await? {
            tracing::info!("invoice claimed by a concurrent provisioner");
            return Ok(());
        }

        let now = Utc::now();
        let duration = chrono::Duration::days(i64::from(plan.duration_days));
        match self
            .store
            .find_active_subscription(&invoice.user_id, &invoice.plan_id)
            .await?
        {
            Some(mut subscription) if subscription.expires_at > now => {
                // stack onto the current expiry
                subscription.expires_at = subscription.expires_at + duration;
                self.store.update_subscription(&subscription).await?;
                tracing::info!(
                    subscription_id = %subscription.id,
                    expires_at = %subscription.expires_at,
                    "extended subscription"
                );
            }
            Some(mut subscription) => {
                subscription.status = SubscriptionStatus::Active;
                subscription.started_at = now;
                subscription.expires_at = now + duration;
                self.store.update_subscription(&subscription).await?;
                tracing::info!(subscription_id = %subscription.id, "reactivated subscription");
            }
            None => {
                let subscription = self
                    .store
                    .create_subscription(NewSubscription {
                        user_id: invoice.user_id.clone(),
                        plan_id: invoice.plan_id.clone(),
                        started_at: now,
                        expires_at: now + duration,
                    })
                    .await?;
                tracing::info!(subscription_id = %subscription.id, "created subscription");
            }
        }

        self.producer
            .notify_user(NotifyUserPayload {
                user_id: invoice.user_id.clone(),
                kind: "SUBSCRIPTION_ACTIVATED".to_string(),
                message: format!("Your {} subscription has been activated!", plan.name),
            })
            .await?;

        tracing::info!("provision complete");
        Ok(())
    }
}

#[async_trait]
impl JobHandler for ProvisionHandler {
    fn job_type(&self) -> JobType {
        PROVISION_SUBSCRIPTION
    }

    async fn run(&self, current_job: CurrentJob) -> Result<(), HandlerError> {
        let payload: ProvisionPayload = current_job.payload()?;
        self.provision(&payload.invoice_id).await
    }
}
