//! Traits and types used when defining job handlers.

use async_trait::async_trait;

use crate::current::CurrentJob;
use crate::entity::JobType;

/// Errors a handler may surface. The dispatcher reports them to the
/// broker as job failure, which applies the job's retry policy; business
/// no-ops must return `Ok` instead.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[async_trait]
/// Implemented by job handlers that perform the actual work.
///
/// A handler is registered for one `(queue, job_type)` pair and invoked
/// with the delivered job. Deliveries are at-least-once: handlers must
/// tolerate re-delivery of work that already committed.
pub trait JobHandler: Send + Sync + 'static {
    /// The job type this handler consumes.
    fn job_type(&self) -> JobType;

    /// Execute the job. `Err` triggers the job's retry policy.
    async fn run(&self, current_job: CurrentJob) -> Result<(), HandlerError>;
}
