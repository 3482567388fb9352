use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Number of deliveries allowed in flight at once in pooled mode.
pub const WORKER_COUNT: usize = 4;

/// Log entries retained per subscription.
pub const RETENTION_LIMIT: usize = 10;

/// How delivery tasks are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Background tasks, bounded by [`WORKER_COUNT`].
    #[default]
    Pooled,
    /// Run to completion before the trigger returns.
    Inline,
}

/// Runtime configuration, read from the `initialize` params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub mode: DispatchMode,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Where the delivery log is persisted; memory only when absent.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub sign_payloads: bool,
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

fn default_enabled() -> bool {
    true
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_drain_timeout_secs() -> u64 {
    5
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            mode: DispatchMode::default(),
            request_timeout_secs: default_request_timeout_secs(),
            data_dir: None,
            sign_payloads: false,
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

impl WebhookConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}
