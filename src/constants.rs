//! # Constants
//!
//! Shared constants used throughout the controller.
//!
//! These values represent reasonable defaults and can be overridden via
//! configuration or environment variables where applicable.

/// Default HTTP server port for metrics and health checks
pub const DEFAULT_METRICS_PORT: u16 = 5000;

/// Default namespace the reconciler-manager runs in and provisions reconcilers into
pub const DEFAULT_CONTROLLER_NAMESPACE: &str = "config-management-system";

/// Default image for the reconciler container
pub const DEFAULT_RECONCILER_IMAGE: &str = "gcr.io/config-management-release/reconciler:latest";

/// Default image for the git-sync container
pub const DEFAULT_GIT_SYNC_IMAGE: &str = "registry.k8s.io/git-sync/git-sync:v4.2.3";

/// Default number of reconcile workers
pub const DEFAULT_MAX_CONCURRENT_RECONCILES: usize = 4;

/// Default exponential backoff starting value (milliseconds)
pub const DEFAULT_BACKOFF_START_MS: u64 = 500;

/// Default exponential backoff maximum value (milliseconds)
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 60_000;

/// Delay before a key whose writes kept conflicting is retried (milliseconds)
pub const DEFAULT_CONFLICT_REQUEUE_MS: u64 = 250;

/// Requeue interval for configuration errors (seconds)
/// Configuration errors are mostly fixed by a spec change, which retriggers on its own
pub const DEFAULT_CONFIGURATION_ERROR_REQUEUE_SECS: u64 = 300;

/// Consecutive transient failures before the RootSync status reports degraded
pub const DEFAULT_DEGRADED_AFTER_RETRIES: u32 = 5;

/// Default delay before restarting a watch stream after it errors or ends (seconds)
pub const DEFAULT_WATCH_RESTART_DELAY_SECS: u64 = 5;

/// Immediate refetch-and-retry attempts after a version conflict
pub const MAX_CONFLICT_RETRIES: u32 = 3;

/// Field manager name used for status patches
pub const FIELD_MANAGER: &str = "reconciler-manager";

/// Prefix of reconcilers for RootSyncs in the controller namespace
pub const RECONCILER_PREFIX: &str = "reconciler";

/// Prefix of reconcilers for RootSyncs outside the controller namespace (multi-tenant mode)
pub const NS_RECONCILER_PREFIX: &str = "ns-reconciler";

/// Prefix of the reconciler ClusterRoleBinding name
pub const BINDING_PREFIX: &str = "configsync.gke.io:";

/// Suffix of the default ClusterRole bound to a reconciler
pub const PERMISSIONS_SUFFIX: &str = "permissions";

/// Label marking objects managed by this controller
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`]
pub const MANAGED_BY_VALUE: &str = "reconciler-manager";

/// Label holding the kind of the owning sync resource
pub const SYNC_KIND_LABEL: &str = "configsync.gke.io/sync-kind";

/// Label holding the name of the owning sync resource
pub const SYNC_NAME_LABEL: &str = "configsync.gke.io/sync-name";

/// Label holding the namespace of the owning sync resource
pub const SYNC_NAMESPACE_LABEL: &str = "configsync.gke.io/sync-namespace";

/// Pod label selecting a single reconciler's pods
pub const RECONCILER_LABEL: &str = "configsync.gke.io/reconciler";

/// Pod label shared by every reconciler
pub const APP_LABEL: &str = "app";

/// Value of [`APP_LABEL`]
pub const APP_LABEL_VALUE: &str = "reconciler";

/// ServiceAccount annotation binding a Kubernetes SA to a GCP service account
pub const GCP_SA_ANNOTATION: &str = "iam.gke.io/gcp-service-account";

/// Labels owned on every dependent object
pub const OWNED_LABELS: [&str; 4] = [
    MANAGED_BY_LABEL,
    SYNC_KIND_LABEL,
    SYNC_NAME_LABEL,
    SYNC_NAMESPACE_LABEL,
];

/// Pod template labels owned on the reconciler Deployment
pub const OWNED_TEMPLATE_LABELS: [&str; 2] = [APP_LABEL, RECONCILER_LABEL];
