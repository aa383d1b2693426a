//! Registry mapping `(queue, job_type)` to handlers.
//!
//! Explicitly constructed and injected, with no module-level queue
//! singletons, so tests can assemble a registry against fake
//! collaborators.

use std::collections::HashMap;
use std::sync::Arc;

use crate::entity::{JobType, QueueName};
use crate::runner::JobHandler;

/// Keeps track of the handlers bound to each queue.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(QueueName, JobType), Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a queue. The job type is taken from the
    /// handler itself.
    pub fn add_handler<H: JobHandler>(&mut self, queue: QueueName, handler: H) {
        self.handlers
            .insert((queue, handler.job_type()), Arc::new(handler));
    }

    pub(crate) fn resolve(
        &self,
        queue: QueueName,
        job_type: &JobType,
    ) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&(queue, job_type.clone())).cloned()
    }

    /// The queues that have at least one registered handler.
    pub(crate) fn queues(&self) -> Vec<QueueName> {
        QueueName::ALL
            .into_iter()
            .filter(|queue| self.handlers.keys().any(|(q, _)| q == queue))
            .collect()
    }
}
