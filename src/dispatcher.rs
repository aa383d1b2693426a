//! Per-queue consumer loops.
//!
//! Each queue gets one dispatcher task: pull the next ready job, resolve
//! a handler by `(queue, job_type)`, run it, and report the outcome back
//! to the broker. The dispatcher is the sole layer deciding how a
//! handler result is reported; the broker owns retry accounting.

use futures::FutureExt;
use tokio::sync::broadcast;
use tracing::{instrument, Span};

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::broker::{Delivery, FailOutcome, JobBroker, PollOutcome};
use crate::current::CurrentJob;
use crate::entity::QueueName;
use crate::error::WorkerError;
use crate::handle::OwnedTaskHandle;
use crate::registry::HandlerRegistry;
use crate::runner::JobHandler;

pub(crate) struct QueueDispatcher {
    queue: QueueName,
    broker: Arc<dyn JobBroker>,
    registry: Arc<HandlerRegistry>,
    shutdown_tx: broadcast::Sender<()>,
}

impl QueueDispatcher {
    async fn main_loop(self: Arc<Self>) {
        let mut failures: u32 = 0;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            let wait = match self.poll_and_run().await {
                Ok(duration) => {
                    failures = 0;
                    duration
                }
                Err(e) => {
                    failures += 1;
                    tracing::error!(queue = %self.queue, error = %e, failures, "dispatcher loop error");
                    Duration::from_millis(50 << failures.min(10))
                }
            };

            if wait.is_zero() {
                // more work may already be ready; only yield to shutdown
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }
                continue;
            }

            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    break;
                }
                _ = tokio::time::timeout(wait, self.broker.ready(self.queue)) => {}
            }
        }
    }

    #[instrument(
        name = "worker.poll_and_run",
        level = "debug",
        skip(self),
        fields(queue = %self.queue),
        err
    )]
    async fn poll_and_run(&self) -> Result<Duration, WorkerError> {
        match self.broker.next_ready(self.queue).await? {
            PollOutcome::Empty { retry_in } => Ok(retry_in),
            PollOutcome::Delivery(delivery) => {
                self.execute_job(delivery).await?;
                Ok(Duration::ZERO)
            }
        }
    }

    #[instrument(
        name = "worker.execute_job",
        skip_all,
        fields(queue = %self.queue, job_id, job_type, attempt, conclusion),
        err
    )]
    async fn execute_job(&self, delivery: Delivery) -> Result<(), WorkerError> {
        let span = Span::current();
        span.record("job_id", tracing::field::display(&delivery.job.id));
        span.record("job_type", tracing::field::display(&delivery.job.job_type));
        span.record("attempt", delivery.attempt);

        let Some(handler) = self.registry.resolve(self.queue, &delivery.job.job_type) else {
            // permissive routing: unknown job types within a known queue
            // are acknowledged, not failed
            span.record("conclusion", "UnknownJobType");
            tracing::warn!(
                queue = %self.queue,
                job_type = %delivery.job.job_type,
                job_id = %delivery.job.id,
                "no handler registered for job type, acknowledging as no-op"
            );
            self.broker.ack(self.queue, delivery.lease).await?;
            return Ok(());
        };

        let current_job = CurrentJob::new(delivery.job.clone(), delivery.attempt);
        match Self::run_handler(handler, current_job).await {
            Ok(()) => {
                span.record("conclusion", "Complete");
                self.broker.ack(self.queue, delivery.lease).await?;
            }
            Err(error) => {
                span.record("conclusion", "Error");
                match self
                    .broker
                    .fail(self.queue, delivery.lease, error.clone())
                    .await?
                {
                    FailOutcome::Retrying { attempt, retry_at } => {
                        tracing::warn!(
                            job_id = %delivery.job.id,
                            job_type = %delivery.job.job_type,
                            error = %error,
                            next_attempt = attempt,
                            retry_at = %retry_at,
                            "job failed, will retry"
                        );
                    }
                    FailOutcome::Terminal => {
                        tracing::error!(
                            job_id = %delivery.job.id,
                            job_type = %delivery.job.job_type,
                            attempt = delivery.attempt,
                            error = %error,
                            "job failed permanently"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    async fn run_handler(
        handler: Arc<dyn JobHandler>,
        current_job: CurrentJob,
    ) -> Result<(), String> {
        match AssertUnwindSafe(handler.run(current_job)).catch_unwind().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(panic) => {
                let message = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic payload".to_string()
                };

                tracing::error!(
                    target: "worker.panic",
                    panic_message = %message,
                    "handler panicked during execution"
                );

                Err(format!("handler panicked: {message}"))
            }
        }
    }
}

/// Owns the dispatcher tasks for every queue with a registered handler.
pub(crate) struct DispatcherSet {
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<OwnedTaskHandle>>,
    shutdown_called: AtomicBool,
    shutdown_timeout: Duration,
}

impl DispatcherSet {
    pub fn spawn(
        broker: Arc<dyn JobBroker>,
        registry: HandlerRegistry,
        shutdown_timeout: Duration,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let registry = Arc::new(registry);
        let handles = registry
            .queues()
            .into_iter()
            .map(|queue| {
                let dispatcher = Arc::new(QueueDispatcher {
                    queue,
                    broker: Arc::clone(&broker),
                    registry: Arc::clone(&registry),
                    shutdown_tx: shutdown_tx.clone(),
                });
                tracing::info!(queue = %queue, "dispatcher started");
                OwnedTaskHandle::new(tokio::task::spawn(dispatcher.main_loop()))
            })
            .collect();
        Self {
            shutdown_tx,
            handles: Mutex::new(handles),
            shutdown_called: AtomicBool::new(false),
            shutdown_timeout,
        }
    }

    /// Stop pulling new jobs, let in-flight handlers finish within the
    /// grace period, then abort whatever remains. Idempotent.
    pub async fn shutdown(&self) {
        if self
            .shutdown_called
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let _ = self.shutdown_tx.send(());
        let handles: Vec<OwnedTaskHandle> = {
            let mut guard = self
                .handles
                .lock()
                .expect("Couldn't lock dispatcher handles");
            guard.drain(..).collect()
        };
        for handle in handles {
            handle.stop_with_grace(self.shutdown_timeout).await;
        }
    }
}
