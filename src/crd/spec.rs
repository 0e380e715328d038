//! # RootSync Spec
//!
//! Main CRD specification types and default values.

use serde::{Deserialize, Serialize};

/// RootSync Custom Resource Definition
///
/// A RootSync asks the reconciler-manager to run a reconciler that syncs a git
/// repository into the cluster. The reconciler-manager provisions the
/// reconciler Deployment, its ServiceAccount and its ClusterRoleBinding, and
/// keeps their managed fields in sync with this spec.
///
/// # Example
///
/// ```yaml
/// apiVersion: configsync.gke.io/v1beta1
/// kind: RootSync
/// metadata:
///   name: rs1
///   namespace: config-management-system
/// spec:
///   sourceType: git
///   git:
///     repo: git@github.com:example/platform-config.git
///     branch: main
///     auth: ssh
///     secretRef:
///       name: sec1
/// ```
#[derive(kube::CustomResource, Debug, Clone, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "RootSync",
    group = "configsync.gke.io",
    version = "v1beta1",
    namespaced,
    status = "crate::crd::RootSyncStatus",
    shortname = "rs",
    printcolumn = r#"{"name":"Reconciler", "type":"string", "jsonPath":".status.reconciler"}, {"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RootSyncSpec {
    /// Source type to sync from
    /// Only "git" is supported by this reconciler-manager
    /// Default: "git"
    #[serde(default = "default_source_type")]
    pub source_type: String,
    /// Format of the source repository: "unstructured" or "hierarchy"
    /// Default: "unstructured"
    #[serde(default = "default_source_format")]
    pub source_format: String,
    /// Git repository configuration, required when sourceType is "git"
    #[serde(default)]
    pub git: Option<GitSpec>,
    /// Overrides for the provisioned reconciler
    #[serde(default, rename = "override")]
    pub override_spec: Option<OverrideSpec>,
}

impl Default for RootSyncSpec {
    fn default() -> Self {
        Self {
            source_type: default_source_type(),
            source_format: default_source_format(),
            git: None,
            override_spec: None,
        }
    }
}

/// Git source configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitSpec {
    /// URL of the git repository
    pub repo: String,
    /// Branch to sync from
    /// Default: "master"
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Revision (tag, commit or HEAD) to sync
    /// Default: "HEAD"
    #[serde(default = "default_revision")]
    pub revision: String,
    /// Directory inside the repository to sync
    /// Default: "."
    #[serde(default = "default_dir")]
    pub dir: String,
    /// Period between two git-sync polls, as a duration string (e.g. "15s")
    /// Default: "15s"
    #[serde(default = "default_period")]
    pub period: String,
    /// Authentication method used by git-sync
    pub auth: AuthType,
    /// Secret holding the git credentials
    /// Required for ssh, cookiefile and token auth; must be unset otherwise
    #[serde(default)]
    pub secret_ref: Option<SecretReference>,
    /// GCP service account impersonated through Workload Identity
    /// Required when auth is gcpserviceaccount
    #[serde(default)]
    pub gcp_service_account_email: Option<String>,
    /// Disable TLS certificate verification for https repositories
    /// Default: false
    #[serde(default = "default_false", rename = "noSSLVerify")]
    pub no_ssl_verify: bool,
}

/// Git authentication method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    /// SSH private key stored under the `ssh` key of the secret
    Ssh,
    /// Git cookie file stored under the `cookie_file` key of the secret
    Cookiefile,
    /// Username/token pair stored under the `username` and `token` keys of the secret
    Token,
    /// Public repository, no credentials
    None,
    /// Node credentials of the GCE instance
    Gcenode,
    /// GCP service account through Workload Identity
    Gcpserviceaccount,
}

impl AuthType {
    /// Secret keys this auth method reads, or `None` if it takes no secret
    #[must_use]
    pub fn required_secret_keys(self) -> Option<&'static [&'static str]> {
        match self {
            AuthType::Ssh => Some(&["ssh"]),
            AuthType::Cookiefile => Some(&["cookie_file"]),
            AuthType::Token => Some(&["username", "token"]),
            AuthType::None | AuthType::Gcenode | AuthType::Gcpserviceaccount => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            AuthType::Ssh => "ssh",
            AuthType::Cookiefile => "cookiefile",
            AuthType::Token => "token",
            AuthType::None => "none",
            AuthType::Gcenode => "gcenode",
            AuthType::Gcpserviceaccount => "gcpserviceaccount",
        }
    }
}

impl std::fmt::Display for AuthType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a Secret in the controller namespace
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    /// Name of the Secret
    pub name: String,
}

/// Overrides for the provisioned reconciler
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OverrideSpec {
    /// ClusterRole bound to the reconciler ServiceAccount
    /// Default: "<rootsync-name>-permissions"
    #[serde(default)]
    pub cluster_role: Option<String>,
    /// Depth of the shallow clone made by git-sync
    #[serde(default)]
    pub git_sync_depth: Option<i64>,
}

/// Default value for source type
pub fn default_source_type() -> String {
    "git".to_string()
}

/// Default value for source format
pub fn default_source_format() -> String {
    "unstructured".to_string()
}

/// Default value for git branch
pub fn default_branch() -> String {
    "master".to_string()
}

/// Default value for git revision
pub fn default_revision() -> String {
    "HEAD".to_string()
}

/// Default value for sync directory
pub fn default_dir() -> String {
    ".".to_string()
}

/// Default value for git-sync period
pub fn default_period() -> String {
    "15s".to_string()
}

/// Default value for boolean false
pub fn default_false() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_spec_defaults_applied() {
        let spec: RootSyncSpec = serde_json::from_value(serde_json::json!({
            "git": {
                "repo": "https://example.com/repo.git",
                "auth": "none"
            }
        }))
        .unwrap();

        assert_eq!(spec.source_type, "git");
        assert_eq!(spec.source_format, "unstructured");
        let git = spec.git.unwrap();
        assert_eq!(git.branch, "master");
        assert_eq!(git.revision, "HEAD");
        assert_eq!(git.dir, ".");
        assert_eq!(git.period, "15s");
        assert!(!git.no_ssl_verify);
        assert!(spec.override_spec.is_none());
    }

    #[test]
    fn test_override_and_auth_deserialize() {
        let spec: RootSyncSpec = serde_json::from_value(serde_json::json!({
            "git": {
                "repo": "git@example.com:repo.git",
                "auth": "gcpserviceaccount",
                "gcpServiceAccountEmail": "sync@project.iam.gserviceaccount.com",
                "noSSLVerify": true
            },
            "override": { "clusterRole": "custom-role", "gitSyncDepth": 1 }
        }))
        .unwrap();

        let git = spec.git.unwrap();
        assert_eq!(git.auth, AuthType::Gcpserviceaccount);
        assert!(git.no_ssl_verify);
        let ov = spec.override_spec.unwrap();
        assert_eq!(ov.cluster_role.as_deref(), Some("custom-role"));
        assert_eq!(ov.git_sync_depth, Some(1));
    }

    #[test]
    fn test_required_secret_keys() {
        assert_eq!(AuthType::Ssh.required_secret_keys(), Some(&["ssh"][..]));
        assert_eq!(
            AuthType::Token.required_secret_keys(),
            Some(&["username", "token"][..])
        );
        assert!(AuthType::None.required_secret_keys().is_none());
        assert!(AuthType::Gcpserviceaccount.required_secret_keys().is_none());
    }
}
