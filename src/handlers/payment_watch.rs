//! Periodic settlement sweep over pending invoices.
//!
//! Each tick checks every PENDING invoice still inside its rate lock
//! against the payment detector. Detection never mutates the invoice;
//! a settled payment is recorded on the payment record and handed off
//! to the provisioning queue, where the dedup id collapses repeated
//! detections. Per-invoice failures are isolated: one bad check must
//! not abort the rest of the batch.

use async_trait::async_trait;
use chrono::Utc;
use tracing::instrument;

use std::sync::Arc;

use crate::current::CurrentJob;
use crate::entity::JobType;
use crate::payment::{PaymentDetector, Settlement};
use crate::producer::{JobProducer, PaymentWatchPayload, PAYMENT_WATCH_TICK};
use crate::runner::{HandlerError, JobHandler};
use crate::store::{Invoice, InvoiceId, InvoiceStatus, Store};

pub struct PaymentWatchHandler {
    store: Arc<dyn Store>,
    detector: Arc<dyn PaymentDetector>,
    producer: JobProducer,
}

impl PaymentWatchHandler {
    pub fn new(
        store: Arc<dyn Store>,
        detector: Arc<dyn PaymentDetector>,
        producer: JobProducer,
    ) -> Self {
        Self {
            store,
            detector,
            producer,
        }
    }

    #[instrument(name = "payment_watch.sweep", skip(self), fields(n_invoices), err)]
    pub async fn sweep(&self, target: Option<&InvoiceId>) -> Result<(), HandlerError> {
        let now = Utc::now();
        let invoices: Vec<Invoice> = match target {
            Some(id) => self
                .store
                .find_invoice(id)
                .await?
                .into_iter()
                .filter(|i| i.status == InvoiceStatus::Pending && i.rate_locked_until >= now)
                .collect(),
            None => self.store.pending_invoices_within_rate_lock(now).await?,
        };
        tracing::Span::current().record("n_invoices", invoices.len());

        let mut failures = 0usize;
        for invoice in &invoices {
            if let Err(e) = self.check_invoice(invoice).await {
                failures += 1;
                tracing::warn!(invoice_id = %invoice.id, error = %e, "payment check failed");
            }
        }

        if failures > 0 && failures == invoices.len() {
            return Err(format!("all {failures} payment checks failed").into());
        }
        Ok(())
    }

    async fn check_invoice(&self, invoice: &Invoice) -> Result<(), HandlerError> {
        match self.detector.check_settlement(invoice).await? {
            Settlement::Settled { payment_id } => {
                if self.store.settle_payment(&payment_id).await? {
                    tracing::info!(
                        invoice_id = %invoice.id,
                        payment_id = %payment_id,
                        "payment settled, handing off to provisioning"
                    );
                }
                self.producer.provision(&invoice.id).await?;
            }
            Settlement::Unsettled => {
                tracing::debug!(invoice_id = %invoice.id, "no settlement detected");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl JobHandler for PaymentWatchHandler {
    fn job_type(&self) -> JobType {
        PAYMENT_WATCH_TICK
    }

    async fn run(&self, current_job: CurrentJob) -> Result<(), HandlerError> {
        let payload: PaymentWatchPayload = current_job.payload()?;
        self.sweep(payload.invoice_id.as_ref()).await
    }
}
