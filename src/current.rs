//! Execution-time context available to running handlers.

use crate::entity::{Job, JobId, JobType, QueueName};

/// Context provided to a [`JobHandler`](crate::JobHandler) while a job is
/// executing.
pub struct CurrentJob {
    job: Job,
    attempt: u32,
}

impl CurrentJob {
    pub(crate) fn new(job: Job, attempt: u32) -> Self {
        Self { job, attempt }
    }

    pub fn id(&self) -> &JobId {
        &self.job.id
    }

    pub fn queue(&self) -> QueueName {
        self.job.queue
    }

    pub fn job_type(&self) -> &JobType {
        &self.job.job_type
    }

    /// Attempt number of this delivery, counted from 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Decode the job payload into a typed struct.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        self.job.payload()
    }
}
