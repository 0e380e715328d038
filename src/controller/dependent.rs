//! # Dependent Objects
//!
//! The closed set of cluster objects a RootSync owns.
//!
//! Every reconciler is made of exactly three objects: the worker Deployment,
//! the ServiceAccount it runs as, and the ClusterRoleBinding granting that
//! ServiceAccount its permissions. They are modelled as one tagged enum so the
//! merge engine and the cluster boundary can dispatch on the kind without
//! dynamic typing.

use crate::cluster::ObjectKey;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use kube_runtime::reflector::ObjectRef;
use std::fmt;

/// Discriminant of [`DependentObject`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DependentKind {
    /// `apps/v1 Deployment` running the reconciler and git-sync containers
    WorkerDeployment,
    /// `v1 ServiceAccount` the reconciler pods run as
    ServiceIdentity,
    /// `rbac.authorization.k8s.io/v1 ClusterRoleBinding` for the ServiceAccount
    AccessBinding,
}

impl DependentKind {
    /// All dependent kinds, in the order they are reconciled
    pub const ALL: [DependentKind; 3] = [
        DependentKind::ServiceIdentity,
        DependentKind::AccessBinding,
        DependentKind::WorkerDeployment,
    ];

    /// Kubernetes kind name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DependentKind::WorkerDeployment => "Deployment",
            DependentKind::ServiceIdentity => "ServiceAccount",
            DependentKind::AccessBinding => "ClusterRoleBinding",
        }
    }

    #[must_use]
    pub fn is_namespaced(self) -> bool {
        !matches!(self, DependentKind::AccessBinding)
    }
}

impl fmt::Display for DependentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A dependent object of one of the three owned kinds
#[derive(Debug, Clone, PartialEq)]
pub enum DependentObject {
    WorkerDeployment(Deployment),
    ServiceIdentity(ServiceAccount),
    AccessBinding(ClusterRoleBinding),
}

impl DependentObject {
    #[must_use]
    pub fn kind(&self) -> DependentKind {
        match self {
            DependentObject::WorkerDeployment(_) => DependentKind::WorkerDeployment,
            DependentObject::ServiceIdentity(_) => DependentKind::ServiceIdentity,
            DependentObject::AccessBinding(_) => DependentKind::AccessBinding,
        }
    }

    #[must_use]
    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            DependentObject::WorkerDeployment(o) => &o.metadata,
            DependentObject::ServiceIdentity(o) => &o.metadata,
            DependentObject::AccessBinding(o) => &o.metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            DependentObject::WorkerDeployment(o) => &mut o.metadata,
            DependentObject::ServiceIdentity(o) => &mut o.metadata,
            DependentObject::AccessBinding(o) => &mut o.metadata,
        }
    }

    /// Namespace/name of the object
    #[must_use]
    pub fn key(&self) -> ObjectKey {
        let meta = self.metadata();
        ObjectKey {
            namespace: meta.namespace.clone(),
            name: meta.name.clone().unwrap_or_default(),
        }
    }

    /// Type-erased reference, as carried by controller trigger reasons
    #[must_use]
    pub fn object_ref(&self) -> ObjectRef<DynamicObject> {
        match self {
            DependentObject::WorkerDeployment(o) => ObjectRef::from_obj(o).erase(),
            DependentObject::ServiceIdentity(o) => ObjectRef::from_obj(o).erase(),
            DependentObject::AccessBinding(o) => ObjectRef::from_obj(o).erase(),
        }
    }

    /// Version token used as the write precondition
    #[must_use]
    pub fn resource_version(&self) -> Option<&str> {
        self.metadata().resource_version.as_deref()
    }

    /// Whether the object has been asked to go away and is waiting on finalizers
    #[must_use]
    pub fn is_terminating(&self) -> bool {
        self.metadata().deletion_timestamp.is_some()
    }

    #[must_use]
    pub fn as_deployment(&self) -> Option<&Deployment> {
        match self {
            DependentObject::WorkerDeployment(d) => Some(d),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_service_account(&self) -> Option<&ServiceAccount> {
        match self {
            DependentObject::ServiceIdentity(sa) => Some(sa),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_cluster_role_binding(&self) -> Option<&ClusterRoleBinding> {
        match self {
            DependentObject::AccessBinding(crb) => Some(crb),
            _ => None,
        }
    }
}

impl From<Deployment> for DependentObject {
    fn from(value: Deployment) -> Self {
        DependentObject::WorkerDeployment(value)
    }
}

impl From<ServiceAccount> for DependentObject {
    fn from(value: ServiceAccount) -> Self {
        DependentObject::ServiceIdentity(value)
    }
}

impl From<ClusterRoleBinding> for DependentObject {
    fn from(value: ClusterRoleBinding) -> Self {
        DependentObject::AccessBinding(value)
    }
}
