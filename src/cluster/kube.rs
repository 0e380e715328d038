//! # Kubernetes Cluster Client
//!
//! [`ClusterClient`] and [`SecretMaterialProvider`] backed by the Kubernetes API.
//!
//! Write failures are mapped to typed errors: HTTP 404 becomes `NotFound`,
//! HTTP 409 with reason `AlreadyExists` becomes `AlreadyExists`, and any other
//! 409 becomes `Conflict`.

use super::{
    ChangeType, ClusterClient, ClusterError, ClusterObject, ObjectKey, SecretError,
    SecretMaterial, SecretMaterialProvider, SyncKey, WatchEvent, WatchedKind,
};
use crate::constants::FIELD_MANAGER;
use crate::controller::dependent::{DependentKind, DependentObject};
use crate::crd::{RootSync, RootSyncStatus};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::Client;
use kube_runtime::watcher;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use tracing::debug;

/// Cluster client talking to a real API server
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl std::fmt::Debug for KubeClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClusterClient").finish_non_exhaustive()
    }
}

impl KubeClusterClient {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced_api<K>(&self, key: &ObjectKey) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        match &key.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::default_namespaced(self.client.clone()),
        }
    }

    fn sync_api(&self, key: &SyncKey) -> Api<RootSync> {
        Api::namespaced(self.client.clone(), &key.namespace)
    }
}

/// Map a kube error onto the typed cluster errors
fn map_kube_error(err: kube::Error, what: String) -> ClusterError {
    match &err {
        kube::Error::Api(api_err) if api_err.code == 404 => ClusterError::NotFound(what),
        kube::Error::Api(api_err) if api_err.code == 409 && api_err.reason == "AlreadyExists" => {
            ClusterError::AlreadyExists(what)
        }
        kube::Error::Api(api_err) if api_err.code == 409 => ClusterError::Conflict(what),
        _ => ClusterError::Api(err),
    }
}

async fn get_opt<K>(api: Api<K>, name: &str) -> Result<Option<K>, ClusterError>
where
    K: Clone + DeserializeOwned + Debug,
{
    api.get_opt(name).await.map_err(ClusterError::Api)
}

async fn create_typed<K>(api: Api<K>, obj: &K, what: String) -> Result<K, ClusterError>
where
    K: Clone + DeserializeOwned + Serialize + Debug,
{
    api.create(&PostParams::default(), obj)
        .await
        .map_err(|e| map_kube_error(e, what))
}

async fn replace_typed<K>(api: Api<K>, name: &str, obj: &K, what: String) -> Result<K, ClusterError>
where
    K: Clone + DeserializeOwned + Serialize + Debug,
{
    api.replace(name, &PostParams::default(), obj)
        .await
        .map_err(|e| map_kube_error(e, what))
}

async fn delete_typed<K>(api: Api<K>, name: &str, what: String) -> Result<(), ClusterError>
where
    K: Clone + DeserializeOwned + Debug,
{
    api.delete(name, &DeleteParams::background())
        .await
        .map(|_| ())
        .map_err(|e| map_kube_error(e, what))
}

/// Turn a watcher stream into cluster watch events
///
/// Initial listing is reported as `Added`; later applies as `Modified`.
fn watch_typed<K>(
    api: Api<K>,
    wrap: fn(K) -> ClusterObject,
) -> BoxStream<'static, Result<WatchEvent, ClusterError>>
where
    K: kube::Resource + Clone + DeserializeOwned + Debug + Send + 'static,
    <K as kube::Resource>::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    watcher(api, watcher::Config::default())
        .filter_map(move |event| async move {
            match event {
                Ok(watcher::Event::InitApply(obj)) => Some(Ok(WatchEvent {
                    change: ChangeType::Added,
                    object: wrap(obj),
                })),
                Ok(watcher::Event::Apply(obj)) => Some(Ok(WatchEvent {
                    change: ChangeType::Modified,
                    object: wrap(obj),
                })),
                Ok(watcher::Event::Delete(obj)) => Some(Ok(WatchEvent {
                    change: ChangeType::Deleted,
                    object: wrap(obj),
                })),
                Ok(watcher::Event::Init | watcher::Event::InitDone) => None,
                Err(e) => Some(Err(ClusterError::Watch(e.to_string()))),
            }
        })
        .boxed()
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_sync(&self, key: &SyncKey) -> Result<Option<RootSync>, ClusterError> {
        get_opt(self.sync_api(key), &key.name).await
    }

    async fn patch_sync_status(
        &self,
        key: &SyncKey,
        status: &RootSyncStatus,
    ) -> Result<(), ClusterError> {
        let patch = serde_json::json!({ "status": status });
        self.sync_api(key)
            .patch_status(&key.name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map(|_| ())
            .map_err(|e| map_kube_error(e, format!("RootSync {key}")))
    }

    async fn get(
        &self,
        kind: DependentKind,
        key: &ObjectKey,
    ) -> Result<Option<DependentObject>, ClusterError> {
        let found = match kind {
            DependentKind::WorkerDeployment => get_opt(self.namespaced_api::<Deployment>(key), &key.name)
                .await?
                .map(DependentObject::from),
            DependentKind::ServiceIdentity => {
                get_opt(self.namespaced_api::<ServiceAccount>(key), &key.name)
                    .await?
                    .map(DependentObject::from)
            }
            DependentKind::AccessBinding => {
                get_opt(Api::<ClusterRoleBinding>::all(self.client.clone()), &key.name)
                    .await?
                    .map(DependentObject::from)
            }
        };
        Ok(found)
    }

    async fn create(&self, object: &DependentObject) -> Result<DependentObject, ClusterError> {
        let key = object.key();
        let what = format!("{} {}", object.kind(), key);
        debug!(kind = %object.kind(), object = %key, "Creating dependent object");
        let created = match object {
            DependentObject::WorkerDeployment(d) => {
                create_typed(self.namespaced_api::<Deployment>(&key), d, what).await?.into()
            }
            DependentObject::ServiceIdentity(sa) => {
                create_typed(self.namespaced_api::<ServiceAccount>(&key), sa, what).await?.into()
            }
            DependentObject::AccessBinding(crb) => {
                create_typed(Api::<ClusterRoleBinding>::all(self.client.clone()), crb, what)
                    .await?
                    .into()
            }
        };
        Ok(created)
    }

    async fn update(&self, object: &DependentObject) -> Result<DependentObject, ClusterError> {
        let key = object.key();
        let what = format!("{} {}", object.kind(), key);
        debug!(
            kind = %object.kind(),
            object = %key,
            resource_version = object.resource_version().unwrap_or("none"),
            "Updating dependent object"
        );
        let updated = match object {
            DependentObject::WorkerDeployment(d) => {
                replace_typed(self.namespaced_api::<Deployment>(&key), &key.name, d, what)
                    .await?
                    .into()
            }
            DependentObject::ServiceIdentity(sa) => {
                replace_typed(self.namespaced_api::<ServiceAccount>(&key), &key.name, sa, what)
                    .await?
                    .into()
            }
            DependentObject::AccessBinding(crb) => replace_typed(
                Api::<ClusterRoleBinding>::all(self.client.clone()),
                &key.name,
                crb,
                what,
            )
            .await?
            .into(),
        };
        Ok(updated)
    }

    async fn delete(&self, kind: DependentKind, key: &ObjectKey) -> Result<(), ClusterError> {
        let what = format!("{kind} {key}");
        debug!(kind = %kind, object = %key, "Deleting dependent object");
        match kind {
            DependentKind::WorkerDeployment => {
                delete_typed(self.namespaced_api::<Deployment>(key), &key.name, what).await
            }
            DependentKind::ServiceIdentity => {
                delete_typed(self.namespaced_api::<ServiceAccount>(key), &key.name, what).await
            }
            DependentKind::AccessBinding => {
                delete_typed(Api::<ClusterRoleBinding>::all(self.client.clone()), &key.name, what)
                    .await
            }
        }
    }

    fn watch(&self, kind: WatchedKind) -> BoxStream<'static, Result<WatchEvent, ClusterError>> {
        let client = self.client.clone();
        match kind {
            WatchedKind::Sync { namespace } => {
                let api: Api<RootSync> = match namespace {
                    Some(ns) => Api::namespaced(client, &ns),
                    None => Api::all(client),
                };
                watch_typed(api, |rs| ClusterObject::Sync(Box::new(rs)))
            }
            WatchedKind::Dependent(DependentKind::WorkerDeployment) => {
                watch_typed(Api::<Deployment>::all(client), |d| {
                    ClusterObject::Dependent(d.into())
                })
            }
            WatchedKind::Dependent(DependentKind::ServiceIdentity) => {
                watch_typed(Api::<ServiceAccount>::all(client), |sa| {
                    ClusterObject::Dependent(sa.into())
                })
            }
            WatchedKind::Dependent(DependentKind::AccessBinding) => {
                watch_typed(Api::<ClusterRoleBinding>::all(client), |crb| {
                    ClusterObject::Dependent(crb.into())
                })
            }
        }
    }
}

#[async_trait]
impl SecretMaterialProvider for KubeClusterClient {
    async fn resolve(&self, namespace: &str, name: &str) -> Result<SecretMaterial, SecretError> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = match secrets.get(name).await {
            Ok(secret) => secret,
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => {
                return Err(SecretError::NotFound(format!("{namespace}/{name}")));
            }
            Err(e) => return Err(SecretError::Cluster(ClusterError::Api(e))),
        };

        let data = secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.0))
            .collect();

        Ok(SecretMaterial {
            name: name.to_string(),
            data,
        })
    }
}
