//! # Desired-State Builder
//!
//! Derives the desired Deployment, ServiceAccount and ClusterRoleBinding of a
//! RootSync. Building is pure: the same RootSync, secret and names always
//! produce equal objects, and nothing here talks to the cluster.
//!
//! Objects are assembled as JSON manifests and deserialized into the typed
//! `k8s-openapi` structs, which keeps the templates readable and close to the
//! YAML operators see with `kubectl get -o yaml`.

use crate::cluster::SecretMaterial;
use crate::config::ControllerConfig;
use crate::constants::{APP_LABEL, APP_LABEL_VALUE, GCP_SA_ANNOTATION, RECONCILER_LABEL};
use crate::controller::dependent::{DependentKind, DependentObject};
use crate::controller::namer::{default_cluster_role, owned_labels, DependentNames};
use crate::crd::{AuthType, GitSpec, RootSync};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Mount point of the shared repository volume in the reconciler container
pub const REPO_MOUNT_PATH: &str = "/repo";
/// Directory git-sync clones into
pub const GIT_SYNC_ROOT: &str = "/repo/source";
/// Mount point of the git credentials in the git-sync container
pub const GIT_SECRET_MOUNT_PATH: &str = "/etc/git-secret";
/// Name of the reconciler container
pub const RECONCILER_CONTAINER: &str = "reconciler";
/// Name of the git-sync container
pub const GIT_SYNC_CONTAINER: &str = "git-sync";
/// Name of the shared repository volume
pub const REPO_VOLUME: &str = "repo";
/// Name of the git credentials volume
pub const GIT_CREDS_VOLUME: &str = "git-creds";
/// File mode of the mounted credentials (0440)
pub const GIT_CREDS_MODE: i32 = 0o440;

/// Errors raised while deriving desired state
///
/// All of them are fixed by editing the RootSync or its Secret.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("sourceType '{0}' is not supported, only 'git' is")]
    UnsupportedSourceType(String),
    #[error("git is required when sourceType is 'git'")]
    MissingGit,
    #[error("auth type {0} requires git.secretRef")]
    MissingSecretRef(AuthType),
    #[error("secret {0} referenced by git.secretRef could not be resolved")]
    UnresolvedSecret(String),
    #[error("secret {secret} is missing key '{key}' required by auth type {auth}")]
    MissingSecretKey {
        secret: String,
        key: &'static str,
        auth: AuthType,
    },
    #[error("auth type {auth} does not use a secret, but git.secretRef names {secret}")]
    UnexpectedSecretRef { auth: AuthType, secret: String },
    #[error("gcpServiceAccountEmail is required for auth type gcpserviceaccount")]
    MissingGcpServiceAccountEmail,
    #[error("failed to assemble {kind}: {source}")]
    Assemble {
        kind: DependentKind,
        #[source]
        source: serde_json::Error,
    },
}

/// Desired state of the three dependents of one RootSync
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredState {
    pub deployment: Deployment,
    pub service_account: ServiceAccount,
    pub binding: ClusterRoleBinding,
}

impl DesiredState {
    #[must_use]
    pub fn object(&self, kind: DependentKind) -> DependentObject {
        match kind {
            DependentKind::WorkerDeployment => self.deployment.clone().into(),
            DependentKind::ServiceIdentity => self.service_account.clone().into(),
            DependentKind::AccessBinding => self.binding.clone().into(),
        }
    }
}

/// Derives desired dependent state from a RootSync
///
/// Implementations must be deterministic and free of I/O.
pub trait DesiredStateBuilder: Send + Sync {
    fn build(
        &self,
        sync: &RootSync,
        secret: Option<&SecretMaterial>,
        names: &DependentNames,
    ) -> Result<DesiredState, BuildError>;
}

/// Builder producing the standard reconciler + git-sync Deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerTemplateBuilder {
    reconciler_image: String,
    git_sync_image: String,
}

impl ReconcilerTemplateBuilder {
    pub fn new(reconciler_image: impl Into<String>, git_sync_image: impl Into<String>) -> Self {
        Self {
            reconciler_image: reconciler_image.into(),
            git_sync_image: git_sync_image.into(),
        }
    }

    #[must_use]
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self::new(config.reconciler_image.clone(), config.git_sync_image.clone())
    }
}

fn env(name: &str, value: impl Into<String>) -> Value {
    json!({ "name": name, "value": value.into() })
}

fn secret_env(name: &str, secret: &str, key: &str) -> Value {
    json!({
        "name": name,
        "valueFrom": { "secretKeyRef": { "name": secret, "key": key } }
    })
}

fn pod_labels(reconciler: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_LABEL.to_string(), APP_LABEL_VALUE.to_string()),
        (RECONCILER_LABEL.to_string(), reconciler.to_string()),
    ])
}

/// Check the auth method against the referenced and resolved secret
///
/// Returns the secret name git-sync should read credentials from, if any.
fn check_credentials(
    git: &GitSpec,
    secret: Option<&SecretMaterial>,
) -> Result<Option<String>, BuildError> {
    let secret_name = git.secret_ref.as_ref().map(|r| r.name.clone());

    match git.auth.required_secret_keys() {
        Some(keys) => {
            let name = secret_name.ok_or(BuildError::MissingSecretRef(git.auth))?;
            let material = secret.ok_or_else(|| BuildError::UnresolvedSecret(name.clone()))?;
            if let Some(missing) = keys.iter().copied().find(|k| !material.has_key(k)) {
                return Err(BuildError::MissingSecretKey {
                    secret: name,
                    key: missing,
                    auth: git.auth,
                });
            }
            Ok(Some(name))
        }
        None => {
            if let Some(name) = secret_name {
                return Err(BuildError::UnexpectedSecretRef {
                    auth: git.auth,
                    secret: name,
                });
            }
            if git.auth == AuthType::Gcpserviceaccount
                && !git
                    .gcp_service_account_email
                    .as_deref()
                    .is_some_and(|e| !e.trim().is_empty())
            {
                return Err(BuildError::MissingGcpServiceAccountEmail);
            }
            Ok(None)
        }
    }
}

impl ReconcilerTemplateBuilder {
    fn reconciler_container(&self, sync: &RootSync, git: &GitSpec, names: &DependentNames) -> Value {
        json!({
            "name": RECONCILER_CONTAINER,
            "image": self.reconciler_image,
            "env": [
                env("SYNC_NAME", names.sync.name.clone()),
                env("SYNC_NAMESPACE", names.sync.namespace.clone()),
                env("RECONCILER_NAME", names.reconciler.clone()),
                env("SOURCE_TYPE", sync.spec.source_type.clone()),
                env("SOURCE_FORMAT", sync.spec.source_format.clone()),
                env("SOURCE_REPO", git.repo.clone()),
                env("SOURCE_BRANCH", git.branch.clone()),
                env("SOURCE_REV", git.revision.clone()),
                env("SYNC_DIR", git.dir.clone()),
            ],
            "volumeMounts": [
                { "name": REPO_VOLUME, "mountPath": REPO_MOUNT_PATH, "readOnly": true }
            ]
        })
    }

    fn git_sync_container(
        &self,
        sync: &RootSync,
        git: &GitSpec,
        secret_name: Option<&str>,
    ) -> Value {
        let git_ref = if git.revision == "HEAD" {
            git.branch.clone()
        } else {
            git.revision.clone()
        };

        let mut envs = vec![
            env("GITSYNC_REPO", git.repo.clone()),
            env("GITSYNC_REF", git_ref),
            env("GITSYNC_ROOT", GIT_SYNC_ROOT),
            env("GITSYNC_LINK", "rev"),
            env("GITSYNC_PERIOD", git.period.clone()),
        ];
        if let Some(depth) = sync
            .spec
            .override_spec
            .as_ref()
            .and_then(|o| o.git_sync_depth)
        {
            envs.push(env("GITSYNC_DEPTH", depth.to_string()));
        }
        if git.no_ssl_verify {
            envs.push(env("GIT_SSL_NO_VERIFY", "true"));
        }

        let mut mounts = vec![json!({ "name": REPO_VOLUME, "mountPath": GIT_SYNC_ROOT })];
        let creds_mount =
            json!({ "name": GIT_CREDS_VOLUME, "mountPath": GIT_SECRET_MOUNT_PATH, "readOnly": true });

        match (git.auth, secret_name) {
            (AuthType::Ssh, Some(_)) => {
                envs.push(env("GITSYNC_SSH", "true"));
                envs.push(env("GITSYNC_SSH_KEY_FILE", format!("{GIT_SECRET_MOUNT_PATH}/ssh")));
                envs.push(env("GITSYNC_SSH_KNOWN_HOSTS", "false"));
                mounts.push(creds_mount);
            }
            (AuthType::Cookiefile, Some(_)) => {
                envs.push(env("GITSYNC_COOKIE_FILE", "true"));
                mounts.push(creds_mount);
            }
            (AuthType::Token, Some(secret)) => {
                envs.push(secret_env("GITSYNC_USERNAME", secret, "username"));
                envs.push(secret_env("GITSYNC_PASSWORD", secret, "token"));
            }
            _ => {}
        }

        json!({
            "name": GIT_SYNC_CONTAINER,
            "image": self.git_sync_image,
            "env": envs,
            "volumeMounts": mounts
        })
    }

    fn volumes(git: &GitSpec, secret_name: Option<&str>) -> Value {
        let mut volumes = vec![json!({ "name": REPO_VOLUME, "emptyDir": {} })];
        if let (AuthType::Ssh | AuthType::Cookiefile, Some(secret)) = (git.auth, secret_name) {
            volumes.push(json!({
                "name": GIT_CREDS_VOLUME,
                "secret": { "secretName": secret, "defaultMode": GIT_CREDS_MODE }
            }));
        }
        Value::Array(volumes)
    }
}

impl DesiredStateBuilder for ReconcilerTemplateBuilder {
    fn build(
        &self,
        sync: &RootSync,
        secret: Option<&SecretMaterial>,
        names: &DependentNames,
    ) -> Result<DesiredState, BuildError> {
        if sync.spec.source_type != "git" {
            return Err(BuildError::UnsupportedSourceType(sync.spec.source_type.clone()));
        }
        let git = sync.spec.git.as_ref().ok_or(BuildError::MissingGit)?;
        let secret_name = check_credentials(git, secret)?;

        let labels = owned_labels(&names.sync);
        let selector = pod_labels(&names.reconciler);

        let deployment: Deployment = serde_json::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": names.reconciler,
                "namespace": names.namespace,
                "labels": labels
            },
            "spec": {
                "replicas": 1,
                "selector": { "matchLabels": selector },
                "template": {
                    "metadata": { "labels": selector },
                    "spec": {
                        "serviceAccountName": names.reconciler,
                        "containers": [
                            self.reconciler_container(sync, git, names),
                            self.git_sync_container(sync, git, secret_name.as_deref())
                        ],
                        "volumes": Self::volumes(git, secret_name.as_deref())
                    }
                }
            }
        }))
        .map_err(|source| BuildError::Assemble {
            kind: DependentKind::WorkerDeployment,
            source,
        })?;

        let mut sa_metadata = json!({
            "name": names.reconciler,
            "namespace": names.namespace,
            "labels": labels
        });
        if git.auth == AuthType::Gcpserviceaccount {
            if let Some(email) = &git.gcp_service_account_email {
                let mut annotations = serde_json::Map::new();
                annotations.insert(GCP_SA_ANNOTATION.to_string(), Value::String(email.clone()));
                sa_metadata["annotations"] = Value::Object(annotations);
            }
        }
        let service_account: ServiceAccount = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ServiceAccount",
            "metadata": sa_metadata
        }))
        .map_err(|source| BuildError::Assemble {
            kind: DependentKind::ServiceIdentity,
            source,
        })?;

        let cluster_role = sync
            .spec
            .override_spec
            .as_ref()
            .and_then(|o| o.cluster_role.clone())
            .unwrap_or_else(|| default_cluster_role(&names.sync.name));
        let binding: ClusterRoleBinding = serde_json::from_value(json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "ClusterRoleBinding",
            "metadata": {
                "name": names.binding,
                "labels": labels
            },
            "roleRef": {
                "apiGroup": "rbac.authorization.k8s.io",
                "kind": "ClusterRole",
                "name": cluster_role
            },
            "subjects": [{
                "kind": "ServiceAccount",
                "name": names.reconciler,
                "namespace": names.namespace
            }]
        }))
        .map_err(|source| BuildError::Assemble {
            kind: DependentKind::AccessBinding,
            source,
        })?;

        Ok(DesiredState {
            deployment,
            service_account,
            binding,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::SyncKey;
    use crate::controller::namer::ObjectNamer;
    use crate::crd::RootSyncSpec;

    const CMS: &str = "config-management-system";

    fn root_sync(name: &str, spec: serde_json::Value) -> RootSync {
        let spec: RootSyncSpec = serde_json::from_value(spec).unwrap();
        let mut rs = RootSync::new(name, spec);
        rs.metadata.namespace = Some(CMS.to_string());
        rs
    }

    fn names(name: &str) -> DependentNames {
        ObjectNamer::new(CMS).names_for(&SyncKey::new(CMS, name)).unwrap()
    }

    fn builder() -> ReconcilerTemplateBuilder {
        ReconcilerTemplateBuilder::new("reconciler:test", "git-sync:test")
    }

    fn ssh_secret() -> SecretMaterial {
        SecretMaterial {
            name: "sec1".to_string(),
            data: BTreeMap::from([("ssh".to_string(), b"key".to_vec())]),
        }
    }

    fn ssh_sync() -> RootSync {
        root_sync(
            "rs1",
            json!({ "git": { "repo": "git@example.com:r.git", "auth": "ssh", "secretRef": { "name": "sec1" } } }),
        )
    }

    fn env_value<'a>(container: &'a k8s_openapi::api::core::v1::Container, name: &str) -> Option<&'a str> {
        container
            .env
            .as_ref()?
            .iter()
            .find(|e| e.name == name)
            .and_then(|e| e.value.as_deref())
    }

    #[test]
    fn test_ssh_sync_builds_all_objects() {
        let state = builder()
            .build(&ssh_sync(), Some(&ssh_secret()), &names("rs1"))
            .unwrap();

        let deploy = &state.deployment;
        assert_eq!(deploy.metadata.name.as_deref(), Some("reconciler-rs1"));
        assert_eq!(deploy.metadata.namespace.as_deref(), Some(CMS));
        let spec = deploy.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(1));
        let pod = spec.template.spec.as_ref().unwrap();
        assert_eq!(pod.service_account_name.as_deref(), Some("reconciler-rs1"));
        assert_eq!(pod.containers.len(), 2);
        let git_sync = pod.containers.iter().find(|c| c.name == GIT_SYNC_CONTAINER).unwrap();
        assert_eq!(env_value(git_sync, "GITSYNC_SSH"), Some("true"));
        assert_eq!(env_value(git_sync, "GITSYNC_REF"), Some("master"));
        let volumes = pod.volumes.as_ref().unwrap();
        assert!(volumes.iter().any(|v| v.name == GIT_CREDS_VOLUME));

        assert_eq!(state.service_account.metadata.name.as_deref(), Some("reconciler-rs1"));
        assert!(state.service_account.metadata.annotations.is_none());

        assert_eq!(
            state.binding.metadata.name.as_deref(),
            Some("configsync.gke.io:reconciler-rs1")
        );
        assert_eq!(state.binding.role_ref.name, "rs1-permissions");
        let subjects = state.binding.subjects.as_ref().unwrap();
        assert_eq!(subjects.len(), 1);
        assert_eq!(subjects[0].name, "reconciler-rs1");
    }

    #[test]
    fn test_build_is_deterministic() {
        let b = builder();
        let first = b.build(&ssh_sync(), Some(&ssh_secret()), &names("rs1")).unwrap();
        let second = b.build(&ssh_sync(), Some(&ssh_secret()), &names("rs1")).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_secret_key_is_rejected() {
        let empty = SecretMaterial {
            name: "sec1".to_string(),
            data: BTreeMap::new(),
        };
        let err = builder().build(&ssh_sync(), Some(&empty), &names("rs1")).unwrap_err();
        assert!(matches!(err, BuildError::MissingSecretKey { key: "ssh", .. }));
    }

    #[test]
    fn test_secret_ref_required_and_forbidden() {
        let rs = root_sync("rs1", json!({ "git": { "repo": "r", "auth": "token" } }));
        assert!(matches!(
            builder().build(&rs, None, &names("rs1")),
            Err(BuildError::MissingSecretRef(AuthType::Token))
        ));

        let rs = root_sync(
            "rs1",
            json!({ "git": { "repo": "r", "auth": "none", "secretRef": { "name": "sec1" } } }),
        );
        assert!(matches!(
            builder().build(&rs, None, &names("rs1")),
            Err(BuildError::UnexpectedSecretRef { .. })
        ));
    }

    #[test]
    fn test_token_auth_uses_secret_key_refs() {
        let rs = root_sync(
            "rs1",
            json!({ "git": { "repo": "https://example.com/r.git", "auth": "token", "secretRef": { "name": "tok" } } }),
        );
        let secret = SecretMaterial {
            name: "tok".to_string(),
            data: BTreeMap::from([
                ("username".to_string(), b"u".to_vec()),
                ("token".to_string(), b"t".to_vec()),
            ]),
        };
        let state = builder().build(&rs, Some(&secret), &names("rs1")).unwrap();
        let pod = state.deployment.spec.unwrap().template.spec.unwrap();
        let git_sync = pod.containers.iter().find(|c| c.name == GIT_SYNC_CONTAINER).unwrap();
        let password = git_sync
            .env
            .as_ref()
            .unwrap()
            .iter()
            .find(|e| e.name == "GITSYNC_PASSWORD")
            .unwrap();
        assert!(password.value_from.is_some());
        // token auth needs no mounted credentials
        assert_eq!(pod.volumes.unwrap().len(), 1);
    }

    #[test]
    fn test_gcp_service_account_annotation_and_override() {
        let rs = root_sync(
            "rs1",
            json!({
                "git": {
                    "repo": "https://example.com/r.git",
                    "revision": "v1.2.0",
                    "auth": "gcpserviceaccount",
                    "gcpServiceAccountEmail": "sync@p.iam.gserviceaccount.com"
                },
                "override": { "clusterRole": "cluster-admin", "gitSyncDepth": 1 }
            }),
        );
        let state = builder().build(&rs, None, &names("rs1")).unwrap();
        let annotations = state.service_account.metadata.annotations.unwrap();
        assert_eq!(annotations[GCP_SA_ANNOTATION], "sync@p.iam.gserviceaccount.com");
        assert_eq!(state.binding.role_ref.name, "cluster-admin");

        let pod = state.deployment.spec.unwrap().template.spec.unwrap();
        let git_sync = pod.containers.iter().find(|c| c.name == GIT_SYNC_CONTAINER).unwrap();
        assert_eq!(env_value(git_sync, "GITSYNC_REF"), Some("v1.2.0"));
        assert_eq!(env_value(git_sync, "GITSYNC_DEPTH"), Some("1"));
    }

    #[test]
    fn test_gcp_service_account_requires_email() {
        let rs = root_sync("rs1", json!({ "git": { "repo": "r", "auth": "gcpserviceaccount" } }));
        assert!(matches!(
            builder().build(&rs, None, &names("rs1")),
            Err(BuildError::MissingGcpServiceAccountEmail)
        ));
    }
}
