//! # Controller Configuration
//!
//! Controller-level settings loaded from environment variables.

use std::time::Duration;
use tracing::warn;

/// Controller-level configuration
///
/// All settings have sensible defaults and can be overridden via environment variables.
/// Environment variables are populated from a ConfigMap using `envFrom` in the deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Namespace the reconciler-manager runs in
    /// Reconciler Deployments and ServiceAccounts are provisioned here
    pub controller_namespace: String,
    /// Image of the reconciler container
    pub reconciler_image: String,
    /// Image of the git-sync container
    pub git_sync_image: String,
    /// Number of reconcile workers
    /// Distinct RootSyncs are reconciled in parallel up to this limit
    pub max_concurrent_reconciles: usize,
    /// Exponential backoff starting value (milliseconds)
    /// Initial delay before retrying after a transient error
    pub backoff_start_ms: u64,
    /// Exponential backoff maximum value (milliseconds)
    /// Maximum delay between retries
    pub backoff_max_ms: u64,
    /// Delay before retrying a key whose writes kept conflicting (milliseconds)
    pub conflict_requeue_ms: u64,
    /// Requeue interval for configuration errors (seconds)
    pub configuration_error_requeue_secs: u64,
    /// Consecutive transient failures before status reports degraded
    pub degraded_after_retries: u32,
    /// Watch stream restart delay after an error or end of stream (seconds)
    pub watch_restart_delay_secs: u64,
    /// Global log level (ERROR, WARN, INFO, DEBUG, TRACE)
    pub log_level: String,
    /// Log format (json, text)
    pub log_format: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        use crate::constants::*;
        Self {
            controller_namespace: DEFAULT_CONTROLLER_NAMESPACE.to_string(),
            reconciler_image: DEFAULT_RECONCILER_IMAGE.to_string(),
            git_sync_image: DEFAULT_GIT_SYNC_IMAGE.to_string(),
            max_concurrent_reconciles: DEFAULT_MAX_CONCURRENT_RECONCILES,
            backoff_start_ms: DEFAULT_BACKOFF_START_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            conflict_requeue_ms: DEFAULT_CONFLICT_REQUEUE_MS,
            configuration_error_requeue_secs: DEFAULT_CONFIGURATION_ERROR_REQUEUE_SECS,
            degraded_after_retries: DEFAULT_DEGRADED_AFTER_RETRIES,
            watch_restart_delay_secs: DEFAULT_WATCH_RESTART_DELAY_SECS,
            log_level: "INFO".to_string(),
            log_format: "text".to_string(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        use crate::constants::*;
        Self {
            controller_namespace: env_var_or_default_str(
                "POD_NAMESPACE",
                DEFAULT_CONTROLLER_NAMESPACE,
            ),
            reconciler_image: env_var_or_default_str("RECONCILER_IMAGE", DEFAULT_RECONCILER_IMAGE),
            git_sync_image: env_var_or_default_str("GIT_SYNC_IMAGE", DEFAULT_GIT_SYNC_IMAGE),
            max_concurrent_reconciles: env_var_or_default(
                "MAX_CONCURRENT_RECONCILES",
                DEFAULT_MAX_CONCURRENT_RECONCILES,
            )
            .max(1),
            backoff_start_ms: env_var_or_default("BACKOFF_START_MS", DEFAULT_BACKOFF_START_MS),
            backoff_max_ms: env_var_or_default("BACKOFF_MAX_MS", DEFAULT_BACKOFF_MAX_MS),
            conflict_requeue_ms: env_var_or_default(
                "CONFLICT_REQUEUE_MS",
                DEFAULT_CONFLICT_REQUEUE_MS,
            ),
            configuration_error_requeue_secs: env_var_or_default(
                "CONFIGURATION_ERROR_REQUEUE_SECS",
                DEFAULT_CONFIGURATION_ERROR_REQUEUE_SECS,
            ),
            degraded_after_retries: env_var_or_default(
                "DEGRADED_AFTER_RETRIES",
                DEFAULT_DEGRADED_AFTER_RETRIES,
            ),
            watch_restart_delay_secs: env_var_or_default(
                "WATCH_RESTART_DELAY_SECS",
                DEFAULT_WATCH_RESTART_DELAY_SECS,
            ),
            log_level: env_var_or_default_str("LOG_LEVEL", "INFO"),
            log_format: env_var_or_default_str("LOG_FORMAT", "text"),
        }
    }

    /// Get backoff start duration
    pub fn backoff_start_duration(&self) -> Duration {
        Duration::from_millis(self.backoff_start_ms)
    }

    /// Get backoff max duration
    pub fn backoff_max_duration(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    /// Get conflict requeue duration
    pub fn conflict_requeue_duration(&self) -> Duration {
        Duration::from_millis(self.conflict_requeue_ms)
    }

    /// Get configuration error requeue duration
    pub fn configuration_error_requeue_duration(&self) -> Duration {
        Duration::from_secs(self.configuration_error_requeue_secs)
    }

    /// Get watch restart delay duration
    pub fn watch_restart_delay_duration(&self) -> Duration {
        Duration::from_secs(self.watch_restart_delay_secs)
    }
}

/// Read environment variable or return default value
pub(crate) fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T
where
    <T as std::str::FromStr>::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) => value.parse().unwrap_or_else(|e| {
            warn!("Invalid value {:?} for {}: {}, using default", value, key, e);
            default
        }),
        Err(_) => default,
    }
}

/// Read environment variable as string or return default
pub(crate) fn env_var_or_default_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
