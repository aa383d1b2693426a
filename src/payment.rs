//! The payment-detection collaborator.

use async_trait::async_trait;
use thiserror::Error;

use crate::store::{Invoice, PaymentId};

#[derive(Clone, Eq, PartialEq, Debug)]
/// Outcome of one settlement check for an invoice.
pub enum Settlement {
    /// A payment reached the required confirmations.
    Settled { payment_id: PaymentId },
    Unsettled,
}

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("DetectorError - Unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
/// External settlement detection (chain explorers, payment processors).
/// Checks must be idempotent and side-effect-free on the invoice record;
/// settlement transitions belong to the provisioning path.
pub trait PaymentDetector: Send + Sync + 'static {
    async fn check_settlement(&self, invoice: &Invoice) -> Result<Settlement, DetectorError>;
}
