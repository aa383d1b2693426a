//! The business handlers behind each queue.

mod notify;
mod payment_watch;
mod provision;
mod retention;

pub use notify::{NotifySupportHandler, NotifyUserHandler};
pub use payment_watch::PaymentWatchHandler;
pub use provision::ProvisionHandler;
pub use retention::{RetentionCleanupHandler, IDEMPOTENCY_KEY_RETENTION_DAYS};
