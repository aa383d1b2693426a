//! `subscription-worker` is the background job layer of a subscription
//! service: durable, retryable, idempotent task queues driving payment
//! watching, subscription provisioning, support notification, and
//! retention cleanup. Business logic stays in familiar Rust async
//! functions while a broker owns persistence, delayed delivery, and
//! retry accounting. The crate forbids `unsafe`.
//!
//! ## Highlights
//! - Four named queues (`notify`, `payment_watch`, `provision`,
//!   `retention_cleanup`), each served by its own dispatcher task.
//! - Per-type retry budgets with exponential backoff, submitted with
//!   every enqueue.
//! - Dedup-id enqueue collapse plus a data-layer conditional update so
//!   re-delivered provisioning jobs never double-extend a subscription.
//! - Repeating tick schedules that survive process restarts without
//!   creating duplicate repeaters.
//! - Broker and data store consumed through traits; an in-process
//!   [`MemoryBroker`] and [`MemoryStore`] back the test suite.
//!
//! ## Core Concepts
//! - **Service** – [`Workers`] owns registration, dispatch, and
//!   shutdown.
//! - **Producer** – [`JobProducer`] submits typed jobs with each type's
//!   retry/backoff/dedup policy.
//! - **Handler** – [`JobHandler`] performs the work for one
//!   `(queue, job type)` pair using the provided [`CurrentJob`] context.
//! - **Broker** – [`JobBroker`] is the durable queue seam: at-least-once
//!   delivery, delayed jobs, repeating schedules.
//! - **Store** – [`Store`] is the persistence seam handlers read and
//!   conditionally mutate.
//!
//! ## Lifecycle
//!
//! 1. Build a [`WorkerConfig`] and initialize with [`Workers::init`]
//! 2. Register handlers with [`Workers::add_handler`] (or
//!    [`Workers::add_default_handlers`])
//! 3. Start dispatching with [`Workers::start`], which also registers
//!    the repeating tick schedules
//! 4. Enqueue work through [`Workers::producer`] from anywhere in the
//!    application
//! 5. Shut down gracefully with [`Workers::shutdown`]
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use subscription_worker::{
//!     MemoryBroker, MemoryStore, PaymentDetector, Settlement, WorkerConfig, Workers,
//! };
//!
//! struct ChainDetector;
//!
//! #[async_trait::async_trait]
//! impl PaymentDetector for ChainDetector {
//!     async fn check_settlement(
//!         &self,
//!         invoice: &subscription_worker::Invoice,
//!     ) -> Result<Settlement, subscription_worker::DetectorError> {
//!         Ok(Settlement::Unsettled)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = WorkerConfig::builder().build()?;
//!     let broker = Arc::new(MemoryBroker::new());
//!     let store = Arc::new(MemoryStore::new());
//!
//!     let mut workers = Workers::init(config, broker);
//!     workers.add_default_handlers(store, Arc::new(ChainDetector), None);
//!     workers.start().await?;
//!
//!     // e.g. from the HTTP layer after an invoice gains a payment
//!     workers.producer().provision(&"inv_1".into()).await?;
//!
//!     workers.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Retries
//!
//! A handler returning `Err` fails the delivery; the broker reschedules
//! it per the job's [`BackoffPolicy`] until `max_attempts` is exhausted,
//! after which the job lands in the terminal failed state and is
//! surfaced through the logs. Business no-ops (record absent, already
//! processed) complete successfully and are never retried.

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![cfg_attr(feature = "fail-on-warnings", deny(clippy::all))]
#![forbid(unsafe_code)]

mod broker;
mod config;
mod current;
mod dispatcher;
mod entity;
mod handle;
mod handlers;
mod memory;
mod messenger;
mod payment;
mod producer;
mod registry;
mod runner;
mod scheduler;
mod store;

pub mod error;

use tracing::instrument;

use std::sync::Arc;

pub use broker::*;
pub use config::*;
pub use current::*;
pub use entity::*;
pub use handlers::*;
pub use memory::MemoryBroker;
pub use messenger::*;
pub use payment::*;
pub use producer::*;
pub use registry::*;
pub use runner::*;
pub use scheduler::register_tick_schedules;
pub use store::*;

use dispatcher::DispatcherSet;
use error::WorkerError;

/// Primary entry point for the worker subsystem. Owns handler
/// registration, the per-queue dispatcher set, and graceful shutdown.
pub struct Workers {
    config: WorkerConfig,
    broker: Arc<dyn JobBroker>,
    registry: Option<HandlerRegistry>,
    dispatchers: Option<Arc<DispatcherSet>>,
}

impl Workers {
    /// Initialize the service against a broker handle.
    pub fn init(config: WorkerConfig, broker: Arc<dyn JobBroker>) -> Self {
        Self {
            config,
            broker,
            registry: Some(HandlerRegistry::new()),
            dispatchers: None,
        }
    }

    /// A producer submitting jobs to this service's broker. Cheap to
    /// clone and hand to the HTTP layer.
    pub fn producer(&self) -> JobProducer {
        JobProducer::new(Arc::clone(&self.broker))
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Register a handler under a queue.
    ///
    /// # Panics
    ///
    /// Panics if called after [`start`](Self::start).
    pub fn add_handler<H: JobHandler>(&mut self, queue: QueueName, handler: H) {
        self.registry
            .as_mut()
            .expect("Registry has been consumed by the dispatchers")
            .add_handler(queue, handler);
    }

    /// Wire the built-in handler set against the given collaborators.
    /// The support messenger comes from the configured Telegram
    /// credentials; with none configured, support notifications complete
    /// as no-ops.
    pub fn add_default_handlers(
        &mut self,
        store: Arc<dyn Store>,
        detector: Arc<dyn PaymentDetector>,
        user_notifier: Option<Arc<dyn UserNotifier>>,
    ) {
        let producer = self.producer();
        let messenger: Option<Arc<dyn SupportMessenger>> = self
            .config
            .telegram
            .clone()
            .map(|telegram| Arc::new(TelegramMessenger::new(telegram)) as Arc<dyn SupportMessenger>);

        self.add_handler(
            QueueName::Notify,
            NotifySupportHandler::new(Arc::clone(&store), messenger),
        );
        self.add_handler(QueueName::Notify, NotifyUserHandler::new(user_notifier));
        self.add_handler(
            QueueName::PaymentWatch,
            PaymentWatchHandler::new(Arc::clone(&store), detector, producer.clone()),
        );
        self.add_handler(
            QueueName::Provision,
            ProvisionHandler::new(Arc::clone(&store), producer),
        );
        self.add_handler(
            QueueName::RetentionCleanup,
            RetentionCleanupHandler::new(store),
        );
    }

    /// Register the repeating tick schedules and start one dispatcher
    /// per queue with registered handlers.
    ///
    /// # Panics
    ///
    /// Panics if invoked more than once, or if
    /// [`Workers::add_handler`] is called after the dispatchers started.
    #[instrument(name = "workers.start", skip(self), err)]
    pub async fn start(&mut self) -> Result<(), WorkerError> {
        let registry = self
            .registry
            .take()
            .expect("Registry has been consumed by the dispatchers");
        scheduler::register_tick_schedules(self.broker.as_ref(), &self.config.schedules).await?;
        self.dispatchers = Some(Arc::new(DispatcherSet::spawn(
            Arc::clone(&self.broker),
            registry,
            self.config.dispatcher.shutdown_timeout,
        )));
        Ok(())
    }

    /// Gracefully shut down the dispatcher set.
    ///
    /// Idempotent. Stops pulling new jobs, waits for in-flight handlers
    /// up to the configured grace period, then aborts whatever remains;
    /// aborted deliveries are redelivered once the broker's visibility
    /// timeout lapses.
    #[instrument(name = "workers.shutdown", skip(self))]
    pub async fn shutdown(&self) {
        if let Some(dispatchers) = &self.dispatchers {
            dispatchers.shutdown().await;
        }
    }
}
