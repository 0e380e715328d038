//! # Cluster Boundary
//!
//! Everything the reconciler needs from the Kubernetes API, behind traits.
//!
//! - `kube.rs` - [`KubeClusterClient`], backed by `kube::Api` and `kube_runtime::watcher`
//! - `memory.rs` - [`InMemoryCluster`], an in-process object store used by tests and dry runs
//!
//! Writes are guarded by the object's `resourceVersion`: `update` fails with
//! [`ClusterError::Conflict`] when the stored version moved on, and `create`
//! fails with [`ClusterError::AlreadyExists`] when another writer got there first.

mod kube;
mod memory;

pub use self::kube::KubeClusterClient;
pub use self::memory::{Fault, InMemoryCluster, Operation};

use crate::controller::dependent::{DependentKind, DependentObject};
use crate::crd::{RootSync, RootSyncStatus};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::BTreeMap;
use std::fmt;

/// Identity of a RootSync: namespace and name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SyncKey {
    pub namespace: String,
    pub name: String,
}

impl SyncKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl From<&RootSync> for SyncKey {
    fn from(rs: &RootSync) -> Self {
        SyncKey::new(
            rs.metadata.namespace.clone().unwrap_or_default(),
            rs.metadata.name.clone().unwrap_or_default(),
        )
    }
}

impl fmt::Display for SyncKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Identity of any cluster object; `namespace` is `None` for cluster-scoped kinds
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl From<&SyncKey> for ObjectKey {
    fn from(key: &SyncKey) -> Self {
        ObjectKey::namespaced(key.namespace.clone(), key.name.clone())
    }
}

/// Kinds the dispatcher can watch
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WatchedKind {
    /// RootSync resources, optionally restricted to one namespace
    Sync { namespace: Option<String> },
    Dependent(DependentKind),
}

/// Kind of change carried by a [`WatchEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
}

/// Object carried by a [`WatchEvent`]
#[derive(Debug, Clone)]
pub enum ClusterObject {
    Sync(Box<RootSync>),
    Dependent(DependentObject),
}

impl ClusterObject {
    #[must_use]
    pub fn key(&self) -> ObjectKey {
        match self {
            ClusterObject::Sync(rs) => ObjectKey {
                namespace: rs.metadata.namespace.clone(),
                name: rs.metadata.name.clone().unwrap_or_default(),
            },
            ClusterObject::Dependent(obj) => obj.key(),
        }
    }

    #[must_use]
    pub fn resource_version(&self) -> Option<&str> {
        match self {
            ClusterObject::Sync(rs) => rs.metadata.resource_version.as_deref(),
            ClusterObject::Dependent(obj) => obj.resource_version(),
        }
    }

    #[must_use]
    pub fn dependent_kind(&self) -> Option<DependentKind> {
        match self {
            ClusterObject::Sync(_) => None,
            ClusterObject::Dependent(obj) => Some(obj.kind()),
        }
    }
}

/// A change notification delivered by a watch stream
///
/// Delivery is at-least-once and unordered across kinds. Initial listing
/// arrives as `Added` events.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub change: ChangeType,
    pub object: ClusterObject,
}

/// Errors returned by the cluster boundary
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("version conflict writing {0}")]
    Conflict(String),
    #[error("Kubernetes API error: {0}")]
    Api(#[from] ::kube::Error),
    #[error("watch stream error: {0}")]
    Watch(String),
    #[error("cluster unavailable: {0}")]
    Unavailable(String),
}

impl ClusterError {
    /// Whether the write raced another writer and should be retried after a refetch
    #[must_use]
    pub fn is_write_race(&self) -> bool {
        matches!(
            self,
            ClusterError::Conflict(_) | ClusterError::AlreadyExists(_) | ClusterError::NotFound(_)
        )
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }
}

/// Read/write access to RootSyncs and their dependents
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch a RootSync, `None` if it does not exist
    async fn get_sync(&self, key: &SyncKey) -> Result<Option<RootSync>, ClusterError>;

    /// Replace the status subresource of a RootSync
    async fn patch_sync_status(
        &self,
        key: &SyncKey,
        status: &RootSyncStatus,
    ) -> Result<(), ClusterError>;

    /// Fetch a dependent object, `None` if it does not exist
    async fn get(
        &self,
        kind: DependentKind,
        key: &ObjectKey,
    ) -> Result<Option<DependentObject>, ClusterError>;

    /// Create an object; fails with `AlreadyExists` if the name is taken
    async fn create(&self, object: &DependentObject) -> Result<DependentObject, ClusterError>;

    /// Replace an object, using its `resourceVersion` as the precondition
    async fn update(&self, object: &DependentObject) -> Result<DependentObject, ClusterError>;

    /// Delete an object; fails with `NotFound` if it is already gone
    async fn delete(&self, kind: DependentKind, key: &ObjectKey) -> Result<(), ClusterError>;

    /// List and watch a kind
    ///
    /// The subscription is established before this returns, so changes made
    /// after the call are never missed.
    fn watch(&self, kind: WatchedKind) -> BoxStream<'static, Result<WatchEvent, ClusterError>>;
}

/// Credentials read from a Secret; values are opaque bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretMaterial {
    pub name: String,
    pub data: BTreeMap<String, Vec<u8>>,
}

impl SecretMaterial {
    #[must_use]
    pub fn has_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("secret {0} not found")]
    NotFound(String),
    #[error("secret {name} is invalid: {reason}")]
    Validation { name: String, reason: String },
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// Resolves git credentials referenced by a RootSync
#[async_trait]
pub trait SecretMaterialProvider: Send + Sync {
    async fn resolve(&self, namespace: &str, name: &str) -> Result<SecretMaterial, SecretError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display() {
        assert_eq!(SyncKey::new("ns", "rs1").to_string(), "ns/rs1");
        assert_eq!(ObjectKey::cluster("crb").to_string(), "crb");
        assert_eq!(
            ObjectKey::from(&SyncKey::new("ns", "rs1")),
            ObjectKey::namespaced("ns", "rs1")
        );
    }

    #[test]
    fn test_write_race_classification() {
        assert!(ClusterError::Conflict("x".into()).is_write_race());
        assert!(ClusterError::AlreadyExists("x".into()).is_write_race());
        assert!(ClusterError::NotFound("x".into()).is_write_race());
        assert!(!ClusterError::Unavailable("x".into()).is_write_race());
    }
}
