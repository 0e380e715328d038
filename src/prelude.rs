//! # Prelude
//!
//! Re-exports commonly used types and traits for convenience.
//!
//! ```rust
//! use reconciler_manager::prelude::*;
//! ```

// CRD types
pub use crate::crd::*;

// Cluster boundary
pub use crate::cluster::{
    ClusterClient, ClusterError, InMemoryCluster, KubeClusterClient, ObjectKey, SecretMaterial,
    SecretMaterialProvider, SyncKey,
};

// Reconciler types - core controller functionality
pub use crate::controller::dependent::{DependentKind, DependentObject};
pub use crate::controller::manager::{ControllerManager, ManagerHandle};
pub use crate::controller::reconciler::{
    ReconcileError, ReconcileOutcome, ReconcileRequest, Reconciler,
};

// Config types
pub use crate::config::{ControllerConfig, ServerConfig};
