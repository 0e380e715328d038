//! # Types
//!
//! Core types for the reconciler.

use crate::cluster::{ClusterClient, ClusterError, SecretMaterialProvider, SyncKey};
use crate::config::ControllerConfig;
use crate::controller::builder::{BuildError, DesiredStateBuilder, ReconcilerTemplateBuilder};
use crate::controller::merge::MergeError;
use crate::controller::namer::ObjectNamer;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Reconcile failures, classified by how they are retried
///
/// Version conflicts never appear here: they are retried inside the apply
/// loop and, if they persist, turn into a delayed requeue.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The RootSync (or its Secret) cannot be turned into dependents as written
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The cluster failed a call; retried with exponential backoff
    #[error("failed to {operation} {kind} {key}: {source}")]
    Transient {
        operation: &'static str,
        kind: &'static str,
        key: String,
        #[source]
        source: ClusterError,
    },
    /// An internal guarantee broke; the key is not retried
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

impl ReconcileError {
    pub(crate) fn transient(
        operation: &'static str,
        kind: &'static str,
        key: impl std::fmt::Display,
        source: ClusterError,
    ) -> Self {
        ReconcileError::Transient {
            operation,
            kind,
            key: key.to_string(),
            source,
        }
    }

    /// Metric and condition reason for this error
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            ReconcileError::Configuration(_) => "ConfigurationError",
            ReconcileError::Transient { .. } => "TransientError",
            ReconcileError::InvariantViolation(_) => "InvariantViolation",
        }
    }
}

impl From<BuildError> for ReconcileError {
    fn from(err: BuildError) -> Self {
        ReconcileError::Configuration(err.to_string())
    }
}

impl From<MergeError> for ReconcileError {
    fn from(err: MergeError) -> Self {
        ReconcileError::InvariantViolation(err.to_string())
    }
}

/// One unit of work for the reconciler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileRequest {
    pub key: SyncKey,
    /// Consecutive transient failures of this key so far
    pub retries: u32,
}

impl ReconcileRequest {
    #[must_use]
    pub fn new(key: SyncKey) -> Self {
        Self { key, retries: 0 }
    }
}

/// Result of one reconcile pass
#[derive(Debug)]
pub enum ReconcileOutcome {
    /// Every dependent matches its desired state
    Converged,
    /// Progress is blocked on something that resolves by itself; look again after the delay
    Pending { after: Duration },
    /// The RootSync is gone and its dependents were deleted
    TornDown,
    Failed(ReconcileError),
}

impl ReconcileOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileOutcome::Converged => "converged",
            ReconcileOutcome::Pending { .. } => "pending",
            ReconcileOutcome::TornDown => "torn_down",
            ReconcileOutcome::Failed(_) => "failed",
        }
    }
}

/// Reconciles RootSyncs into their reconciler Deployment, ServiceAccount and ClusterRoleBinding
#[derive(Clone)]
pub struct Reconciler {
    pub(crate) client: Arc<dyn ClusterClient>,
    pub(crate) secrets: Arc<dyn SecretMaterialProvider>,
    pub(crate) builder: Arc<dyn DesiredStateBuilder>,
    pub(crate) namer: ObjectNamer,
    pub(crate) config: ControllerConfig,
    pub(crate) multi_tenant: bool,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("namer", &self.namer)
            .field("multi_tenant", &self.multi_tenant)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Create a reconciler using the standard reconciler template
    pub fn new(
        client: Arc<dyn ClusterClient>,
        secrets: Arc<dyn SecretMaterialProvider>,
        config: ControllerConfig,
    ) -> Self {
        let builder = Arc::new(ReconcilerTemplateBuilder::from_config(&config));
        Self::with_builder(client, secrets, builder, config)
    }

    /// Create a reconciler with a custom desired-state builder
    pub fn with_builder(
        client: Arc<dyn ClusterClient>,
        secrets: Arc<dyn SecretMaterialProvider>,
        builder: Arc<dyn DesiredStateBuilder>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            client,
            secrets,
            builder,
            namer: ObjectNamer::new(config.controller_namespace.clone()),
            config,
            multi_tenant: false,
        }
    }

    /// Accept RootSyncs outside the controller namespace
    #[must_use]
    pub fn multi_tenant(mut self, enabled: bool) -> Self {
        self.multi_tenant = enabled;
        self
    }

    #[must_use]
    pub fn namer(&self) -> &ObjectNamer {
        &self.namer
    }

    #[must_use]
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }
}
