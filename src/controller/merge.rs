//! # Managed-Field Merge Engine
//!
//! Compares a live dependent object with its desired state over a fixed,
//! per-kind allowlist of managed fields and decides what to write.
//!
//! Only managed fields are ever compared or overwritten. Everything else on
//! the live object (extra labels and annotations, extra containers and
//! volumes, status, server-populated metadata) is carried through untouched.
//!
//! | Kind               | Managed fields                                                          |
//! |--------------------|-------------------------------------------------------------------------|
//! | Deployment         | owned labels, replicas, selector*, template labels, serviceAccountName, containers (by name), volumes (by name) |
//! | ServiceAccount     | owned labels, GCP service account annotation                            |
//! | ClusterRoleBinding | owned labels, roleRef*, subjects                                        |
//!
//! `*` immutable: a difference requires delete and recreate.

use crate::constants::{GCP_SA_ANNOTATION, OWNED_LABELS, OWNED_TEMPLATE_LABELS};
use crate::controller::builder::{GIT_CREDS_VOLUME, REPO_VOLUME};
use crate::controller::dependent::{DependentKind, DependentObject};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, Volume, VolumeMount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::fmt;

/// Volumes this controller has ever provisioned; stale ones are removed
const MANAGED_VOLUMES: [&str; 2] = [REPO_VOLUME, GIT_CREDS_VOLUME];

/// A field under this controller's ownership
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManagedField {
    Labels,
    Replicas,
    Selector,
    TemplateLabels,
    ServiceAccountName,
    Containers,
    Volumes,
    GcpServiceAccountAnnotation,
    RoleRef,
    Subjects,
}

const DEPLOYMENT_FIELDS: &[ManagedField] = &[
    ManagedField::Labels,
    ManagedField::Replicas,
    ManagedField::Selector,
    ManagedField::TemplateLabels,
    ManagedField::ServiceAccountName,
    ManagedField::Containers,
    ManagedField::Volumes,
];

const SERVICE_ACCOUNT_FIELDS: &[ManagedField] = &[
    ManagedField::Labels,
    ManagedField::GcpServiceAccountAnnotation,
];

const BINDING_FIELDS: &[ManagedField] = &[
    ManagedField::Labels,
    ManagedField::RoleRef,
    ManagedField::Subjects,
];

impl ManagedField {
    /// Managed fields of a kind
    #[must_use]
    pub fn allowlist(kind: DependentKind) -> &'static [ManagedField] {
        match kind {
            DependentKind::WorkerDeployment => DEPLOYMENT_FIELDS,
            DependentKind::ServiceIdentity => SERVICE_ACCOUNT_FIELDS,
            DependentKind::AccessBinding => BINDING_FIELDS,
        }
    }

    /// Whether the API server rejects updates to this field
    #[must_use]
    pub fn is_immutable(self) -> bool {
        matches!(self, ManagedField::Selector | ManagedField::RoleRef)
    }

    #[must_use]
    pub fn path(self) -> &'static str {
        match self {
            ManagedField::Labels => "metadata.labels",
            ManagedField::Replicas => "spec.replicas",
            ManagedField::Selector => "spec.selector",
            ManagedField::TemplateLabels => "spec.template.metadata.labels",
            ManagedField::ServiceAccountName => "spec.template.spec.serviceAccountName",
            ManagedField::Containers => "spec.template.spec.containers",
            ManagedField::Volumes => "spec.template.spec.volumes",
            ManagedField::GcpServiceAccountAnnotation => "metadata.annotations",
            ManagedField::RoleRef => "roleRef",
            ManagedField::Subjects => "subjects",
        }
    }
}

impl fmt::Display for ManagedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// What to do to bring a live object to its desired state
#[derive(Debug, Clone, PartialEq)]
pub enum MergeAction {
    /// Every managed field already matches
    NoOp,
    /// The object does not exist
    Create(DependentObject),
    /// Update the live object, which has `fields` overwritten with desired values
    /// and still carries the live `resourceVersion` as the write precondition
    Patch {
        fields: Vec<ManagedField>,
        object: DependentObject,
    },
    /// An immutable field differs: delete the live object, then create `desired`
    Recreate {
        fields: Vec<ManagedField>,
        desired: DependentObject,
    },
    /// The live object is being deleted; wait until it is gone
    WaitForDeletion,
}

impl MergeAction {
    /// Short name used in logs and metrics
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            MergeAction::NoOp => "noop",
            MergeAction::Create(_) => "create",
            MergeAction::Patch { .. } => "update",
            MergeAction::Recreate { .. } => "recreate",
            MergeAction::WaitForDeletion => "wait_for_deletion",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("live object is a {live} but desired state is a {desired}")]
    KindMismatch {
        live: DependentKind,
        desired: DependentKind,
    },
}

/// Decide how to converge `live` onto `desired`
pub fn diff(
    live: Option<&DependentObject>,
    desired: &DependentObject,
) -> Result<MergeAction, MergeError> {
    let Some(live) = live else {
        return Ok(MergeAction::Create(desired.clone()));
    };

    if live.kind() != desired.kind() {
        return Err(MergeError::KindMismatch {
            live: live.kind(),
            desired: desired.kind(),
        });
    }

    if live.is_terminating() {
        return Ok(MergeAction::WaitForDeletion);
    }

    let fields: Vec<ManagedField> = ManagedField::allowlist(desired.kind())
        .iter()
        .copied()
        .filter(|f| field_differs(*f, live, desired))
        .collect();

    if fields.is_empty() {
        return Ok(MergeAction::NoOp);
    }

    if fields.iter().any(|f| f.is_immutable()) {
        return Ok(MergeAction::Recreate {
            fields,
            desired: desired.clone(),
        });
    }

    let mut object = live.clone();
    for field in &fields {
        overwrite(*field, &mut object, desired);
    }
    Ok(MergeAction::Patch { fields, object })
}

// ---- comparison --------------------------------------------------------

fn label_subset<'a>(
    labels: Option<&'a BTreeMap<String, String>>,
    keys: &[&'static str],
) -> BTreeMap<&'static str, &'a str> {
    keys.iter()
        .filter_map(|k| {
            labels
                .and_then(|l| l.get(*k))
                .map(|v| (*k, v.as_str()))
        })
        .collect()
}

fn template_labels(d: &Deployment) -> Option<&BTreeMap<String, String>> {
    d.spec
        .as_ref()?
        .template
        .metadata
        .as_ref()?
        .labels
        .as_ref()
}

fn pod_spec(d: &Deployment) -> Option<&PodSpec> {
    d.spec.as_ref()?.template.spec.as_ref()
}

/// The managed projection of a container
#[derive(Debug, PartialEq)]
struct ContainerView<'a> {
    image: Option<&'a str>,
    args: &'a [String],
    env: &'a [EnvVar],
    volume_mounts: &'a [VolumeMount],
}

impl<'a> From<&'a Container> for ContainerView<'a> {
    fn from(c: &'a Container) -> Self {
        Self {
            image: c.image.as_deref(),
            args: c.args.as_deref().unwrap_or_default(),
            env: c.env.as_deref().unwrap_or_default(),
            volume_mounts: c.volume_mounts.as_deref().unwrap_or_default(),
        }
    }
}

fn containers_differ(live: Option<&PodSpec>, desired: Option<&PodSpec>) -> bool {
    let desired = desired.map(|p| p.containers.as_slice()).unwrap_or_default();
    let live = live.map(|p| p.containers.as_slice()).unwrap_or_default();
    desired
        .iter()
        .any(|want| match live.iter().find(|c| c.name == want.name) {
            Some(have) => ContainerView::from(have) != ContainerView::from(want),
            None => true,
        })
}

fn managed_volume_names(desired: &[Volume]) -> Vec<String> {
    let mut names: Vec<String> = MANAGED_VOLUMES.iter().map(|n| (*n).to_string()).collect();
    for v in desired {
        if !names.contains(&v.name) {
            names.push(v.name.clone());
        }
    }
    names
}

fn volumes_differ(live: Option<&PodSpec>, desired: Option<&PodSpec>) -> bool {
    let desired = desired.and_then(|p| p.volumes.as_deref()).unwrap_or_default();
    let live = live.and_then(|p| p.volumes.as_deref()).unwrap_or_default();
    managed_volume_names(desired).iter().any(|name| {
        let want = desired.iter().find(|v| &v.name == name);
        let have = live.iter().find(|v| &v.name == name);
        want != have
    })
}

fn annotation<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.annotations.as_ref()?.get(key).map(String::as_str)
}

fn field_differs(field: ManagedField, live: &DependentObject, desired: &DependentObject) -> bool {
    if field == ManagedField::Labels {
        return label_subset(live.metadata().labels.as_ref(), &OWNED_LABELS)
            != label_subset(desired.metadata().labels.as_ref(), &OWNED_LABELS);
    }

    match (live, desired) {
        (DependentObject::WorkerDeployment(l), DependentObject::WorkerDeployment(d)) => {
            let ls = l.spec.as_ref();
            let ds = d.spec.as_ref();
            match field {
                ManagedField::Replicas => {
                    ls.and_then(|s| s.replicas) != ds.and_then(|s| s.replicas)
                }
                ManagedField::Selector => ls.map(|s| &s.selector) != ds.map(|s| &s.selector),
                ManagedField::TemplateLabels => {
                    label_subset(template_labels(l), &OWNED_TEMPLATE_LABELS)
                        != label_subset(template_labels(d), &OWNED_TEMPLATE_LABELS)
                }
                ManagedField::ServiceAccountName => {
                    pod_spec(l).and_then(|p| p.service_account_name.as_deref())
                        != pod_spec(d).and_then(|p| p.service_account_name.as_deref())
                }
                ManagedField::Containers => containers_differ(pod_spec(l), pod_spec(d)),
                ManagedField::Volumes => volumes_differ(pod_spec(l), pod_spec(d)),
                _ => false,
            }
        }
        (DependentObject::ServiceIdentity(l), DependentObject::ServiceIdentity(d)) => match field {
            ManagedField::GcpServiceAccountAnnotation => {
                annotation(&l.metadata, GCP_SA_ANNOTATION)
                    != annotation(&d.metadata, GCP_SA_ANNOTATION)
            }
            _ => false,
        },
        (DependentObject::AccessBinding(l), DependentObject::AccessBinding(d)) => match field {
            ManagedField::RoleRef => l.role_ref != d.role_ref,
            ManagedField::Subjects => {
                l.subjects.as_deref().unwrap_or_default() != d.subjects.as_deref().unwrap_or_default()
            }
            _ => false,
        },
        _ => false,
    }
}

// ---- overwrite ---------------------------------------------------------

fn overwrite_labels(
    target: &mut Option<BTreeMap<String, String>>,
    desired: Option<&BTreeMap<String, String>>,
    keys: &[&'static str],
) {
    let labels = target.get_or_insert_with(BTreeMap::new);
    for key in keys {
        match desired.and_then(|d| d.get(*key)) {
            Some(value) => {
                labels.insert((*key).to_string(), value.clone());
            }
            None => {
                labels.remove(*key);
            }
        }
    }
}

fn live_pod_spec(spec: &mut DeploymentSpec) -> &mut PodSpec {
    spec.template.spec.get_or_insert_with(PodSpec::default)
}

fn overwrite_containers(live: &mut PodSpec, desired: &PodSpec) {
    for want in &desired.containers {
        match live.containers.iter_mut().find(|c| c.name == want.name) {
            Some(have) => {
                have.image.clone_from(&want.image);
                have.args.clone_from(&want.args);
                have.env.clone_from(&want.env);
                have.volume_mounts.clone_from(&want.volume_mounts);
            }
            None => live.containers.push(want.clone()),
        }
    }
}

fn overwrite_volumes(live: &mut PodSpec, desired: &PodSpec) {
    let wanted = desired.volumes.as_deref().unwrap_or_default();
    let managed = managed_volume_names(wanted);
    let volumes = live.volumes.get_or_insert_with(Vec::new);
    volumes.retain(|v| !managed.contains(&v.name) || wanted.iter().any(|w| w.name == v.name));
    for want in wanted {
        match volumes.iter_mut().find(|v| v.name == want.name) {
            Some(have) => *have = want.clone(),
            None => volumes.push(want.clone()),
        }
    }
}

fn overwrite_deployment(field: ManagedField, live: &mut Deployment, desired: &Deployment) {
    let Some(want) = desired.spec.as_ref() else {
        return;
    };
    let spec = live.spec.get_or_insert_with(DeploymentSpec::default);
    match field {
        ManagedField::Replicas => spec.replicas = want.replicas,
        ManagedField::Selector => spec.selector = want.selector.clone(),
        ManagedField::TemplateLabels => {
            let desired_labels = want
                .template
                .metadata
                .as_ref()
                .and_then(|m| m.labels.as_ref());
            let meta = spec.template.metadata.get_or_insert_with(ObjectMeta::default);
            overwrite_labels(&mut meta.labels, desired_labels, &OWNED_TEMPLATE_LABELS);
        }
        ManagedField::ServiceAccountName => {
            let name = want
                .template
                .spec
                .as_ref()
                .and_then(|p| p.service_account_name.clone());
            live_pod_spec(spec).service_account_name = name;
        }
        ManagedField::Containers => {
            if let Some(desired_pod) = want.template.spec.as_ref() {
                overwrite_containers(live_pod_spec(spec), desired_pod);
            }
        }
        ManagedField::Volumes => {
            if let Some(desired_pod) = want.template.spec.as_ref() {
                overwrite_volumes(live_pod_spec(spec), desired_pod);
            }
        }
        _ => {}
    }
}

fn overwrite(field: ManagedField, target: &mut DependentObject, desired: &DependentObject) {
    if field == ManagedField::Labels {
        let desired_labels = desired.metadata().labels.clone();
        overwrite_labels(
            &mut target.metadata_mut().labels,
            desired_labels.as_ref(),
            &OWNED_LABELS,
        );
        return;
    }

    match (target, desired) {
        (DependentObject::WorkerDeployment(l), DependentObject::WorkerDeployment(d)) => {
            overwrite_deployment(field, l, d);
        }
        (DependentObject::ServiceIdentity(l), DependentObject::ServiceIdentity(d)) => {
            if field == ManagedField::GcpServiceAccountAnnotation {
                match annotation(&d.metadata, GCP_SA_ANNOTATION) {
                    Some(value) => {
                        l.metadata
                            .annotations
                            .get_or_insert_with(BTreeMap::new)
                            .insert(GCP_SA_ANNOTATION.to_string(), value.to_string());
                    }
                    None => {
                        if let Some(annotations) = l.metadata.annotations.as_mut() {
                            annotations.remove(GCP_SA_ANNOTATION);
                        }
                    }
                }
            }
        }
        (DependentObject::AccessBinding(l), DependentObject::AccessBinding(d)) => match field {
            ManagedField::RoleRef => l.role_ref = d.role_ref.clone(),
            ManagedField::Subjects => l.subjects.clone_from(&d.subjects),
            _ => {}
        },
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{SecretMaterial, SyncKey};
    use crate::controller::builder::{DesiredStateBuilder, ReconcilerTemplateBuilder, GIT_SYNC_CONTAINER};
    use crate::controller::namer::ObjectNamer;
    use crate::crd::{RootSync, RootSyncSpec};

    const CMS: &str = "config-management-system";

    fn desired(kind: DependentKind) -> DependentObject {
        let spec: RootSyncSpec = serde_json::from_value(serde_json::json!({
            "git": { "repo": "git@example.com:r.git", "auth": "ssh", "secretRef": { "name": "sec1" } }
        }))
        .unwrap();
        let mut rs = RootSync::new("rs1", spec);
        rs.metadata.namespace = Some(CMS.to_string());
        let secret = SecretMaterial {
            name: "sec1".to_string(),
            data: BTreeMap::from([("ssh".to_string(), b"k".to_vec())]),
        };
        let names = ObjectNamer::new(CMS).names_for(&SyncKey::new(CMS, "rs1")).unwrap();
        ReconcilerTemplateBuilder::new("r:1", "g:1")
            .build(&rs, Some(&secret), &names)
            .unwrap()
            .object(kind)
    }

    /// Desired object as the API server would return it after create
    fn live(kind: DependentKind) -> DependentObject {
        let mut obj = desired(kind);
        let meta = obj.metadata_mut();
        meta.resource_version = Some("10".to_string());
        meta.uid = Some("uid-10".to_string());
        obj
    }

    fn deployment_mut(obj: &mut DependentObject) -> &mut Deployment {
        match obj {
            DependentObject::WorkerDeployment(d) => d,
            _ => panic!("not a deployment"),
        }
    }

    #[test]
    fn test_absent_object_is_created() {
        let want = desired(DependentKind::ServiceIdentity);
        assert_eq!(diff(None, &want).unwrap(), MergeAction::Create(want.clone()));
    }

    #[test]
    fn test_equal_managed_fields_is_noop() {
        for kind in DependentKind::ALL {
            assert_eq!(diff(Some(&live(kind)), &desired(kind)).unwrap(), MergeAction::NoOp);
        }
    }

    #[test]
    fn test_unmanaged_fields_are_ignored() {
        let mut have = live(DependentKind::WorkerDeployment);
        {
            let d = deployment_mut(&mut have);
            d.metadata
                .labels
                .get_or_insert_with(BTreeMap::new)
                .insert("team".to_string(), "payments".to_string());
            d.metadata
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .insert("deployment.kubernetes.io/revision".to_string(), "3".to_string());
            let pod = d.spec.as_mut().unwrap().template.spec.as_mut().unwrap();
            pod.containers.push(Container {
                name: "sidecar".to_string(),
                image: Some("proxy:1".to_string()),
                ..Default::default()
            });
        }
        assert_eq!(
            diff(Some(&have), &desired(DependentKind::WorkerDeployment)).unwrap(),
            MergeAction::NoOp
        );
    }

    #[test]
    fn test_service_account_name_drift_is_patched() {
        let mut have = live(DependentKind::WorkerDeployment);
        {
            let d = deployment_mut(&mut have);
            d.metadata
                .labels
                .get_or_insert_with(BTreeMap::new)
                .insert("team".to_string(), "payments".to_string());
            let pod = d.spec.as_mut().unwrap().template.spec.as_mut().unwrap();
            pod.service_account_name = Some("intruder".to_string());
        }

        let action = diff(Some(&have), &desired(DependentKind::WorkerDeployment)).unwrap();
        let MergeAction::Patch { fields, object } = action else {
            panic!("expected patch, got {action:?}");
        };
        assert_eq!(fields, vec![ManagedField::ServiceAccountName]);
        let patched = object.as_deployment().unwrap();
        assert_eq!(
            pod_spec(patched).unwrap().service_account_name.as_deref(),
            Some("reconciler-rs1")
        );
        // unmanaged label and the version precondition survive
        assert_eq!(patched.metadata.labels.as_ref().unwrap()["team"], "payments");
        assert_eq!(object.resource_version(), Some("10"));
    }

    #[test]
    fn test_owned_label_drift_is_patched() {
        let mut have = live(DependentKind::ServiceIdentity);
        have.metadata_mut()
            .labels
            .as_mut()
            .unwrap()
            .insert(crate::constants::SYNC_KIND_LABEL.to_string(), "seanboswell".to_string());

        let action = diff(Some(&have), &desired(DependentKind::ServiceIdentity)).unwrap();
        let MergeAction::Patch { fields, object } = action else {
            panic!("expected patch");
        };
        assert_eq!(fields, vec![ManagedField::Labels]);
        assert_eq!(
            object.metadata().labels.as_ref().unwrap()[crate::constants::SYNC_KIND_LABEL],
            "RootSync"
        );
    }

    #[test]
    fn test_container_image_drift_keeps_extra_containers() {
        let mut have = live(DependentKind::WorkerDeployment);
        {
            let pod = deployment_mut(&mut have)
                .spec
                .as_mut()
                .unwrap()
                .template
                .spec
                .as_mut()
                .unwrap();
            pod.containers.push(Container {
                name: "sidecar".to_string(),
                ..Default::default()
            });
            let git_sync = pod.containers.iter_mut().find(|c| c.name == GIT_SYNC_CONTAINER).unwrap();
            git_sync.image = Some("evil:latest".to_string());
        }

        let action = diff(Some(&have), &desired(DependentKind::WorkerDeployment)).unwrap();
        let MergeAction::Patch { fields, object } = action else {
            panic!("expected patch");
        };
        assert_eq!(fields, vec![ManagedField::Containers]);
        let pod = pod_spec(object.as_deployment().unwrap()).unwrap();
        assert_eq!(pod.containers.len(), 3);
        let git_sync = pod.containers.iter().find(|c| c.name == GIT_SYNC_CONTAINER).unwrap();
        assert_eq!(git_sync.image.as_deref(), Some("g:1"));
    }

    #[test]
    fn test_role_ref_drift_requires_recreate() {
        let mut have = live(DependentKind::AccessBinding);
        if let DependentObject::AccessBinding(crb) = &mut have {
            crb.role_ref.name = "cluster-admin".to_string();
        }
        let action = diff(Some(&have), &desired(DependentKind::AccessBinding)).unwrap();
        assert!(matches!(
            action,
            MergeAction::Recreate { ref fields, .. } if fields == &vec![ManagedField::RoleRef]
        ));
    }

    #[test]
    fn test_terminating_object_waits() {
        let mut have = live(DependentKind::ServiceIdentity);
        have.metadata_mut().deletion_timestamp =
            serde_json::from_value(serde_json::json!("2026-01-01T00:00:00Z")).unwrap();
        assert_eq!(
            diff(Some(&have), &desired(DependentKind::ServiceIdentity)).unwrap(),
            MergeAction::WaitForDeletion
        );
    }

    #[test]
    fn test_kind_mismatch_is_an_error() {
        let err = diff(
            Some(&live(DependentKind::ServiceIdentity)),
            &desired(DependentKind::AccessBinding),
        )
        .unwrap_err();
        assert!(matches!(err, MergeError::KindMismatch { .. }));
    }

    #[test]
    fn test_stale_credentials_volume_is_removed() {
        let mut want = desired(DependentKind::WorkerDeployment);
        {
            let pod = deployment_mut(&mut want)
                .spec
                .as_mut()
                .unwrap()
                .template
                .spec
                .as_mut()
                .unwrap();
            pod.volumes
                .as_mut()
                .unwrap()
                .retain(|v| v.name != GIT_CREDS_VOLUME);
        }
        let have = live(DependentKind::WorkerDeployment);

        let action = diff(Some(&have), &want).unwrap();
        let MergeAction::Patch { fields, object } = action else {
            panic!("expected patch");
        };
        assert_eq!(fields, vec![ManagedField::Volumes]);
        let volumes = pod_spec(object.as_deployment().unwrap())
            .unwrap()
            .volumes
            .clone()
            .unwrap();
        assert!(volumes.iter().all(|v| v.name != GIT_CREDS_VOLUME));
    }
}
