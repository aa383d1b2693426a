//! Crate-level error type.

use thiserror::Error;

use crate::broker::BrokerError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("WorkerError - Broker: {0}")]
    Broker(#[from] BrokerError),
    #[error("WorkerError - Store: {0}")]
    Store(#[from] StoreError),
    #[error("WorkerError - CouldNotSerializePayload: {0}")]
    CouldNotSerializePayload(serde_json::Error),
    #[error("WorkerError - JobExecutionError: {0}")]
    JobExecutionError(String),
    #[error("WorkerError - Config: {0}")]
    Config(String),
}
