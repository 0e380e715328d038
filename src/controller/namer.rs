//! # Object Namer
//!
//! Deterministic, injective naming of the objects provisioned for a RootSync.
//!
//! | RootSync                         | Reconciler name                          |
//! |----------------------------------|------------------------------------------|
//! | `<controller-ns>/<name>`         | `reconciler-<name>`                      |
//! | `<ns>/<name>` (multi-tenant)     | `ns-reconciler-<ns>-<name>-<len(name)>`  |
//!
//! The Deployment and ServiceAccount are named after the reconciler in the
//! controller namespace; the ClusterRoleBinding is `configsync.gke.io:<reconciler>`.
//! The trailing length keeps the namespaced form unambiguous when namespace or
//! name contain dashes, which lets [`ObjectNamer::owner_of`] invert the mapping.

use crate::cluster::{ObjectKey, SyncKey};
use crate::constants::{
    BINDING_PREFIX, MANAGED_BY_LABEL, MANAGED_BY_VALUE, NS_RECONCILER_PREFIX, PERMISSIONS_SUFFIX,
    RECONCILER_PREFIX, SYNC_KIND_LABEL, SYNC_NAMESPACE_LABEL, SYNC_NAME_LABEL,
};
use crate::controller::dependent::DependentKind;
use crate::controller::reconciler::validation::validate_dns1123_label;
use anyhow::Result;
use std::collections::BTreeMap;

/// Names of the three objects provisioned for one RootSync
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependentNames {
    pub sync: SyncKey,
    /// Reconciler name, shared by the Deployment and the ServiceAccount
    pub reconciler: String,
    /// Namespace holding the Deployment and the ServiceAccount
    pub namespace: String,
    /// ClusterRoleBinding name
    pub binding: String,
}

impl DependentNames {
    #[must_use]
    pub fn key(&self, kind: DependentKind) -> ObjectKey {
        match kind {
            DependentKind::WorkerDeployment | DependentKind::ServiceIdentity => {
                ObjectKey::namespaced(self.namespace.clone(), self.reconciler.clone())
            }
            DependentKind::AccessBinding => ObjectKey::cluster(self.binding.clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ObjectNamer {
    controller_namespace: String,
}

impl ObjectNamer {
    pub fn new(controller_namespace: impl Into<String>) -> Self {
        Self {
            controller_namespace: controller_namespace.into(),
        }
    }

    #[must_use]
    pub fn controller_namespace(&self) -> &str {
        &self.controller_namespace
    }

    /// Reconciler name for a RootSync
    #[must_use]
    pub fn reconciler_name(&self, key: &SyncKey) -> String {
        if key.namespace == self.controller_namespace {
            format!("{RECONCILER_PREFIX}-{}", key.name)
        } else {
            format!(
                "{NS_RECONCILER_PREFIX}-{}-{}-{}",
                key.namespace,
                key.name,
                key.name.len()
            )
        }
    }

    /// Names of every dependent object, validated as Kubernetes names
    pub fn names_for(&self, key: &SyncKey) -> Result<DependentNames> {
        let reconciler = self.reconciler_name(key);
        validate_dns1123_label(&reconciler, "reconciler name")?;
        Ok(DependentNames {
            sync: key.clone(),
            binding: binding_name(&reconciler),
            namespace: self.controller_namespace.clone(),
            reconciler,
        })
    }

    /// RootSync owning a reconciler name, `None` if the name is not one we produce
    #[must_use]
    pub fn sync_of_reconciler(&self, reconciler: &str) -> Option<SyncKey> {
        let candidate = if let Some(rest) = reconciler.strip_prefix(&format!("{NS_RECONCILER_PREFIX}-")) {
            let (body, len) = rest.rsplit_once('-')?;
            let len: usize = len.parse().ok()?;
            let split = body.len().checked_sub(len)?;
            let name = body.get(split..)?;
            let namespace = body.get(..split)?.strip_suffix('-')?;
            if namespace.is_empty() || name.is_empty() {
                return None;
            }
            SyncKey::new(namespace, name)
        } else {
            let name = reconciler.strip_prefix(&format!("{RECONCILER_PREFIX}-"))?;
            if name.is_empty() {
                return None;
            }
            SyncKey::new(self.controller_namespace.clone(), name)
        };

        // A namespaced-form name pointing at the controller namespace is not ours
        (self.reconciler_name(&candidate) == reconciler).then_some(candidate)
    }

    /// RootSync owning a dependent object, `None` for objects we do not name
    #[must_use]
    pub fn owner_of(&self, kind: DependentKind, key: &ObjectKey) -> Option<SyncKey> {
        match kind {
            DependentKind::WorkerDeployment | DependentKind::ServiceIdentity => {
                if key.namespace.as_deref() != Some(self.controller_namespace.as_str()) {
                    return None;
                }
                self.sync_of_reconciler(&key.name)
            }
            DependentKind::AccessBinding => {
                let reconciler = key.name.strip_prefix(BINDING_PREFIX)?;
                self.sync_of_reconciler(reconciler)
            }
        }
    }
}

/// ClusterRoleBinding name for a reconciler
#[must_use]
pub fn binding_name(reconciler: &str) -> String {
    format!("{BINDING_PREFIX}{reconciler}")
}

/// ClusterRole bound when the RootSync does not override it
#[must_use]
pub fn default_cluster_role(sync_name: &str) -> String {
    format!("{sync_name}-{PERMISSIONS_SUFFIX}")
}

/// Labels stamped on every dependent object
#[must_use]
pub fn owned_labels(key: &SyncKey) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        (SYNC_KIND_LABEL.to_string(), "RootSync".to_string()),
        (SYNC_NAME_LABEL.to_string(), key.name.clone()),
        (SYNC_NAMESPACE_LABEL.to_string(), key.namespace.clone()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    const CMS: &str = "config-management-system";

    #[test]
    fn test_root_reconciler_names() {
        let namer = ObjectNamer::new(CMS);
        let names = namer.names_for(&SyncKey::new(CMS, "rs1")).unwrap();
        assert_eq!(names.reconciler, "reconciler-rs1");
        assert_eq!(names.binding, "configsync.gke.io:reconciler-rs1");
        assert_eq!(
            names.key(DependentKind::WorkerDeployment),
            ObjectKey::namespaced(CMS, "reconciler-rs1")
        );
        assert_eq!(
            names.key(DependentKind::AccessBinding),
            ObjectKey::cluster("configsync.gke.io:reconciler-rs1")
        );
    }

    #[test]
    fn test_namespaced_names_are_injective() {
        let namer = ObjectNamer::new(CMS);
        // Both would be "ns-reconciler-a-b-c" without the length suffix
        let first = namer.reconciler_name(&SyncKey::new("a-b", "c"));
        let second = namer.reconciler_name(&SyncKey::new("a", "b-c"));
        assert_eq!(first, "ns-reconciler-a-b-c-1");
        assert_eq!(second, "ns-reconciler-a-b-c-3");
        assert_ne!(first, second);
    }

    #[test]
    fn test_owner_of_inverts_naming() {
        let namer = ObjectNamer::new(CMS);
        for key in [
            SyncKey::new(CMS, "rs1"),
            SyncKey::new(CMS, "my-root-sync"),
            SyncKey::new("team-a", "repo-sync"),
            SyncKey::new("a", "b-c"),
        ] {
            let names = namer.names_for(&key).unwrap();
            for kind in DependentKind::ALL {
                assert_eq!(namer.owner_of(kind, &names.key(kind)), Some(key.clone()));
            }
        }
    }

    #[test]
    fn test_owner_of_rejects_foreign_objects() {
        let namer = ObjectNamer::new(CMS);
        assert!(namer
            .owner_of(DependentKind::WorkerDeployment, &ObjectKey::namespaced(CMS, "coredns"))
            .is_none());
        assert!(namer
            .owner_of(DependentKind::WorkerDeployment, &ObjectKey::namespaced("default", "reconciler-rs1"))
            .is_none());
        assert!(namer
            .owner_of(DependentKind::AccessBinding, &ObjectKey::cluster("cluster-admin"))
            .is_none());
        // Length suffix does not match the name
        assert!(namer.sync_of_reconciler("ns-reconciler-team-a-sync-9").is_none());
        // Namespaced form for the controller namespace is never produced
        assert!(namer
            .sync_of_reconciler(&format!("ns-reconciler-{CMS}-rs1-3"))
            .is_none());
    }

    #[test]
    fn test_overlong_reconciler_name_is_rejected() {
        let namer = ObjectNamer::new(CMS);
        let long_name = "x".repeat(60);
        assert!(namer.names_for(&SyncKey::new(CMS, long_name)).is_err());
    }

    #[test]
    fn test_owned_labels_and_default_role() {
        let labels = owned_labels(&SyncKey::new(CMS, "rs1"));
        assert_eq!(labels.len(), 4);
        assert_eq!(labels[SYNC_NAME_LABEL], "rs1");
        assert_eq!(labels[SYNC_KIND_LABEL], "RootSync");
        assert_eq!(default_cluster_role("rs1"), "rs1-permissions");
    }
}
