//! Service configuration types.

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use std::time::Duration;

#[serde_with::serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
/// Controls dispatcher lifecycle behaviour.
pub struct DispatcherConfig {
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_shutdown_timeout")]
    /// How long to wait for an in-flight handler to finish during
    /// shutdown before aborting it.
    pub shutdown_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

#[serde_with::serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
/// Fixed intervals for the repeating ticks.
pub struct ScheduleConfig {
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_payment_watch_interval")]
    pub payment_watch_interval: Duration,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_retention_cleanup_interval")]
    pub retention_cleanup_interval: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            payment_watch_interval: default_payment_watch_interval(),
            retention_cleanup_interval: default_retention_cleanup_interval(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
/// Credentials for the Telegram support channel. Absent means support
/// notifications complete as no-ops.
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
}

#[derive(Builder, Clone, Debug, Default, Serialize, Deserialize)]
/// Configuration consumed by [`Workers::init`](crate::Workers::init).
/// Build with [`WorkerConfig::builder`](Self::builder).
///
/// # Examples
///
/// ```ignore
/// use subscription_worker::WorkerConfig;
///
/// let config = WorkerConfig::builder().build().unwrap();
/// ```
pub struct WorkerConfig {
    #[builder(default)]
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[builder(default)]
    #[serde(default)]
    pub schedules: ScheduleConfig,
    #[builder(setter(into, strip_option), default)]
    #[serde(default)]
    pub telegram: Option<TelegramConfig>,
}

impl WorkerConfig {
    /// Create a [`WorkerConfigBuilder`] with defaults for all settings.
    pub fn builder() -> WorkerConfigBuilder {
        WorkerConfigBuilder::default()
    }
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_payment_watch_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_retention_cleanup_interval() -> Duration {
    Duration::from_secs(60 * 60)
}
