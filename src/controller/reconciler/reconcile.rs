//! # Reconcile
//!
//! One reconcile pass for one RootSync:
//!
//! 1. Fetch the RootSync; tear down its dependents if it is gone or terminating
//! 2. Validate the spec and derive the dependent names
//! 3. Resolve the git credentials Secret and build the desired state
//! 4. For each dependent kind: fetch the live object, diff the managed fields
//!    and apply the result, guarded by the live `resourceVersion`
//! 5. Record the outcome on the RootSync status
//!
//! Every pass recomputes everything from the cluster, so a pass can be
//! interrupted at any point and the next one picks up where it left off.

use crate::cluster::{SecretError, SecretMaterial, SyncKey};
use crate::constants::MAX_CONFLICT_RETRIES;
use crate::controller::builder::{BuildError, DesiredState};
use crate::controller::dependent::{DependentKind, DependentObject};
use crate::controller::merge::{diff, MergeAction};
use crate::controller::namer::DependentNames;
use crate::controller::reconciler::status::{update_status, StatusUpdate};
use crate::controller::reconciler::types::{
    ReconcileError, ReconcileOutcome, ReconcileRequest, Reconciler,
};
use crate::controller::reconciler::validation::validate_root_sync_spec;
use crate::crd::RootSync;
use crate::observability;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Progress of the apply phase
#[derive(Debug)]
enum Progress {
    Converged,
    /// Blocked on a terminating object or on persistent write races
    Pending(Duration),
    /// The RootSync disappeared mid-pass
    SyncGone,
}

impl Reconciler {
    /// Reconcile one RootSync
    ///
    /// Never panics and never returns early without an outcome: the caller
    /// decides how to requeue from the returned [`ReconcileOutcome`].
    pub async fn reconcile(&self, request: &ReconcileRequest) -> ReconcileOutcome {
        let span = info_span!(
            "reconcile",
            resource.namespace = %request.key.namespace,
            resource.name = %request.key.name,
            retries = request.retries,
        );

        async move {
            let start = Instant::now();
            debug!("Reconciling {} (retries: {})", request.key, request.retries);

            let outcome = self.reconcile_sync(request).await;

            observability::metrics::increment_reconciliations(outcome.as_str());
            observability::metrics::observe_reconciliation_duration(start.elapsed().as_secs_f64());
            match &outcome {
                ReconcileOutcome::Failed(err) => {
                    observability::metrics::increment_reconciliation_errors(err.reason());
                    match err {
                        ReconcileError::InvariantViolation(_) => {
                            error!("❌ Reconciliation of {} violated an invariant: {}", request.key, err);
                        }
                        _ => warn!("❌ Reconciliation of {} failed: {}", request.key, err),
                    }
                }
                ReconcileOutcome::Pending { after } => {
                    debug!("Reconciliation of {} pending, retrying in {:?}", request.key, after);
                }
                ReconcileOutcome::Converged | ReconcileOutcome::TornDown => {
                    debug!(
                        "Reconciliation of {} finished: {} ({:.3}s)",
                        request.key,
                        outcome.as_str(),
                        start.elapsed().as_secs_f64()
                    );
                }
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn reconcile_sync(&self, request: &ReconcileRequest) -> ReconcileOutcome {
        let key = &request.key;

        let sync = match self.client.get_sync(key).await {
            Ok(sync) => sync,
            Err(e) => {
                return ReconcileOutcome::Failed(ReconcileError::transient(
                    "get", "RootSync", key, e,
                ))
            }
        };

        let Some(sync) = sync.filter(|rs| rs.metadata.deletion_timestamp.is_none()) else {
            return self.tear_down(key).await;
        };

        let names = self.namer.names_for(key).ok();
        let result = match &names {
            Some(names) => self.converge(&sync, names).await,
            None => Err(self.naming_error(key)),
        };

        match result {
            Ok(Progress::Converged) => {
                let Some(names) = names else {
                    return ReconcileOutcome::Failed(self.naming_error(key));
                };
                let update = StatusUpdate::Converged {
                    reconciler: &names.reconciler,
                };
                match update_status(self, key, &sync, update).await {
                    Ok(_) => ReconcileOutcome::Converged,
                    Err(e) => ReconcileOutcome::Failed(ReconcileError::transient(
                        "update status of",
                        "RootSync",
                        key,
                        e,
                    )),
                }
            }
            Ok(Progress::Pending(after)) => ReconcileOutcome::Pending { after },
            Ok(Progress::SyncGone) => self.tear_down(key).await,
            Err(err) => {
                let update = StatusUpdate::Failed {
                    error: &err,
                    reconciler: names.as_ref().map(|n| n.reconciler.as_str()),
                    retries: request.retries,
                };
                if let Err(e) = update_status(self, key, &sync, update).await {
                    warn!("Failed to record error status for {}: {}", key, e);
                }
                ReconcileOutcome::Failed(err)
            }
        }
    }

    /// Rebuild the naming error so it can be reported as a configuration error
    fn naming_error(&self, key: &SyncKey) -> ReconcileError {
        match self.namer.names_for(key) {
            Err(e) => ReconcileError::Configuration(format!("{e:#}")),
            Ok(_) => ReconcileError::InvariantViolation(format!(
                "names for {key} changed between two derivations"
            )),
        }
    }

    async fn tear_down(&self, key: &SyncKey) -> ReconcileOutcome {
        // A key that cannot be named never had dependents
        let Ok(names) = self.namer.names_for(key) else {
            return ReconcileOutcome::TornDown;
        };
        match self.teardown(&names).await {
            Ok(()) => {
                info!("✅ Dependents of {} removed", key);
                ReconcileOutcome::TornDown
            }
            Err(err) => ReconcileOutcome::Failed(err),
        }
    }

    async fn converge(
        &self,
        sync: &RootSync,
        names: &DependentNames,
    ) -> Result<Progress, ReconcileError> {
        let key = &names.sync;

        if !self.multi_tenant && key.namespace != self.namer.controller_namespace() {
            return Err(ReconcileError::Configuration(format!(
                "RootSync must be in namespace {} unless multi-tenant mode is enabled",
                self.namer.controller_namespace()
            )));
        }

        validate_root_sync_spec(&sync.spec)
            .map_err(|e| ReconcileError::Configuration(format!("{e:#}")))?;

        self.check_naming_round_trip(names)?;

        let secret = self.resolve_secret(sync).await?;
        let desired = self.build_desired(sync, secret.as_ref(), names)?;

        let mut pending: Option<Duration> = None;
        for kind in DependentKind::ALL {
            match self.apply_kind(sync, names, &desired.object(kind)).await? {
                Progress::Converged => {}
                Progress::Pending(after) => {
                    pending = Some(pending.map_or(after, |p| p.min(after)));
                }
                Progress::SyncGone => return Ok(Progress::SyncGone),
            }
        }

        Ok(pending.map_or(Progress::Converged, Progress::Pending))
    }

    fn check_naming_round_trip(&self, names: &DependentNames) -> Result<(), ReconcileError> {
        for kind in DependentKind::ALL {
            let object_key = names.key(kind);
            let owner = self.namer.owner_of(kind, &object_key);
            if owner.as_ref() != Some(&names.sync) {
                return Err(ReconcileError::InvariantViolation(format!(
                    "{kind} {object_key} maps back to {owner:?} instead of {}",
                    names.sync
                )));
            }
        }
        Ok(())
    }

    /// Resolve the credentials Secret, `None` when the auth type needs none or it does not exist
    ///
    /// A missing Secret is reported by the builder, which knows whether the
    /// auth type needed it.
    async fn resolve_secret(&self, sync: &RootSync) -> Result<Option<SecretMaterial>, ReconcileError> {
        let Some(git) = sync.spec.git.as_ref() else {
            return Ok(None);
        };
        let (Some(_), Some(secret_ref)) = (git.auth.required_secret_keys(), git.secret_ref.as_ref())
        else {
            return Ok(None);
        };

        let namespace = self.namer.controller_namespace();
        match self.secrets.resolve(namespace, &secret_ref.name).await {
            Ok(material) => Ok(Some(material)),
            Err(SecretError::NotFound(_)) => {
                debug!("Secret {}/{} not found", namespace, secret_ref.name);
                Ok(None)
            }
            Err(SecretError::Validation { name, reason }) => Err(ReconcileError::Configuration(
                format!("secret {name} is invalid: {reason}"),
            )),
            Err(SecretError::Cluster(e)) => Err(ReconcileError::transient(
                "get",
                "Secret",
                format!("{namespace}/{}", secret_ref.name),
                e,
            )),
        }
    }

    fn build_desired(
        &self,
        sync: &RootSync,
        secret: Option<&SecretMaterial>,
        names: &DependentNames,
    ) -> Result<DesiredState, ReconcileError> {
        let desired = self.builder.build(sync, secret, names)?;
        let again = self.builder.build(sync, secret, names).map_err(|e: BuildError| {
            ReconcileError::InvariantViolation(format!(
                "desired state build succeeded once then failed: {e}"
            ))
        })?;
        if desired != again {
            return Err(ReconcileError::InvariantViolation(format!(
                "desired state for {} is not deterministic",
                names.sync
            )));
        }
        Ok(desired)
    }

    /// Converge one dependent, retrying immediately on write races
    async fn apply_kind(
        &self,
        sync: &RootSync,
        names: &DependentNames,
        desired: &DependentObject,
    ) -> Result<Progress, ReconcileError> {
        let kind = desired.kind();
        let key = desired.key();
        let in_sync_generation =
            sync.status.as_ref().and_then(|s| s.observed_generation) == sync.metadata.generation;

        for attempt in 0..=MAX_CONFLICT_RETRIES {
            let live = self
                .client
                .get(kind, &key)
                .await
                .map_err(|e| ReconcileError::transient("get", kind.as_str(), &key, e))?;

            let action = diff(live.as_ref(), desired)?;
            debug!("{} {}: {}", kind, key, action.name());

            let result = match action {
                MergeAction::NoOp => return Ok(Progress::Converged),
                MergeAction::WaitForDeletion => {
                    debug!("{} {} is terminating, waiting for it to go away", kind, key);
                    return Ok(Progress::Pending(self.config.conflict_requeue_duration()));
                }
                MergeAction::Create(object) => {
                    if !self.sync_still_exists(&names.sync).await? {
                        return Ok(Progress::SyncGone);
                    }
                    self.client.create(&object).await.map(|_| {
                        observability::metrics::record_dependent_operation(kind.as_str(), "create");
                        info!("✨ Created {} {} for {}", kind, key, names.sync);
                    })
                }
                MergeAction::Patch { fields, object } => {
                    self.client.update(&object).await.map(|_| {
                        observability::metrics::record_dependent_operation(kind.as_str(), "update");
                        let fields: Vec<&str> = fields.iter().map(|f| f.path()).collect();
                        if in_sync_generation {
                            observability::metrics::increment_drift_corrections(kind.as_str());
                            info!(
                                "🔁 Reverted drift on {} {} for {} (fields: {})",
                                kind,
                                key,
                                names.sync,
                                fields.join(", ")
                            );
                        } else {
                            info!("📝 Updated {} {} (fields: {})", kind, key, fields.join(", "));
                        }
                    })
                }
                MergeAction::Recreate { fields, desired } => {
                    let fields: Vec<&str> = fields.iter().map(|f| f.path()).collect();
                    info!(
                        "♻️  Recreating {} {}: immutable fields differ ({})",
                        kind,
                        key,
                        fields.join(", ")
                    );
                    match self.client.delete(kind, &key).await {
                        Ok(()) => {
                            observability::metrics::record_dependent_operation(kind.as_str(), "delete");
                        }
                        Err(e) if e.is_not_found() => {}
                        Err(e) => {
                            return Err(ReconcileError::transient("delete", kind.as_str(), &key, e))
                        }
                    }
                    if !self.sync_still_exists(&names.sync).await? {
                        return Ok(Progress::SyncGone);
                    }
                    self.client.create(&desired).await.map(|_| {
                        observability::metrics::record_dependent_operation(kind.as_str(), "create");
                    })
                }
            };

            match result {
                Ok(()) => return Ok(Progress::Converged),
                Err(e) if e.is_write_race() => {
                    observability::metrics::increment_write_conflicts(kind.as_str());
                    debug!(
                        "Write to {} {} raced another writer (attempt {}/{}): {}",
                        kind,
                        key,
                        attempt + 1,
                        MAX_CONFLICT_RETRIES + 1,
                        e
                    );
                }
                Err(e) => return Err(ReconcileError::transient("write", kind.as_str(), &key, e)),
            }
        }

        warn!(
            "⚠️  {} {} still conflicting after {} attempts, requeueing",
            kind,
            key,
            MAX_CONFLICT_RETRIES + 1
        );
        Ok(Progress::Pending(self.config.conflict_requeue_duration()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{
        ClusterClient, ClusterError, Fault, InMemoryCluster, ObjectKey, Operation, WatchEvent,
        WatchedKind,
    };
    use crate::config::ControllerConfig;
    use crate::controller::builder::{DesiredStateBuilder, ReconcilerTemplateBuilder};
    use crate::crd::RootSyncStatus;
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use std::sync::Arc;

    const NS: &str = "config-management-system";

    fn setup() -> (Arc<InMemoryCluster>, Reconciler) {
        let cluster = Arc::new(InMemoryCluster::new());
        let reconciler = Reconciler::new(cluster.clone(), cluster.clone(), ControllerConfig::default());
        (cluster, reconciler)
    }

    fn root_sync(name: &str, git: serde_json::Value) -> RootSync {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "configsync.gke.io/v1beta1",
            "kind": "RootSync",
            "metadata": { "name": name, "namespace": NS },
            "spec": { "git": git }
        }))
        .unwrap()
    }

    fn request(name: &str) -> ReconcileRequest {
        ReconcileRequest::new(SyncKey::new(NS, name))
    }

    fn sa_key(name: &str) -> ObjectKey {
        ObjectKey::namespaced(NS, format!("reconciler-{name}"))
    }

    #[tokio::test]
    async fn test_first_pass_creates_all_dependents() {
        let (cluster, reconciler) = setup();
        cluster.apply_sync(root_sync("rs1", serde_json::json!({ "repo": "https://example.com/r.git", "auth": "none" })));

        let outcome = reconciler.reconcile(&request("rs1")).await;
        assert!(matches!(outcome, ReconcileOutcome::Converged), "{outcome:?}");
        for kind in DependentKind::ALL {
            assert_eq!(cluster.calls(Operation::Create, Some(kind)), 1);
        }

        let status = cluster.sync_status(&SyncKey::new(NS, "rs1")).unwrap();
        assert_eq!(status.reconciler.as_deref(), Some("reconciler-rs1"));
    }

    #[tokio::test]
    async fn test_second_pass_makes_no_writes() {
        let (cluster, reconciler) = setup();
        cluster.apply_sync(root_sync("rs1", serde_json::json!({ "repo": "https://example.com/r.git", "auth": "none" })));
        reconciler.reconcile(&request("rs1")).await;

        cluster.reset_counters();
        let outcome = reconciler.reconcile(&request("rs1")).await;
        assert!(matches!(outcome, ReconcileOutcome::Converged));
        assert_eq!(cluster.mutation_count(), 0);
        assert_eq!(cluster.calls(Operation::PatchStatus, None), 0);
    }

    #[tokio::test]
    async fn test_missing_secret_is_configuration_error() {
        let (cluster, reconciler) = setup();
        cluster.apply_sync(root_sync(
            "rs1",
            serde_json::json!({ "repo": "git@example.com:r.git", "auth": "ssh", "secretRef": { "name": "sec1" } }),
        ));

        let outcome = reconciler.reconcile(&request("rs1")).await;
        match outcome {
            ReconcileOutcome::Failed(ReconcileError::Configuration(msg)) => {
                assert!(msg.contains("sec1"), "{msg}");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(cluster.count(DependentKind::WorkerDeployment), 0);

        let status = cluster.sync_status(&SyncKey::new(NS, "rs1")).unwrap();
        assert_eq!(status.condition("Stalled").unwrap().status, "True");
    }

    #[tokio::test]
    async fn test_conflict_is_retried_in_place() {
        let (cluster, reconciler) = setup();
        cluster.apply_sync(root_sync("rs1", serde_json::json!({ "repo": "https://example.com/r.git", "auth": "none" })));
        reconciler.reconcile(&request("rs1")).await;

        cluster.mutate(DependentKind::ServiceIdentity, &sa_key("rs1"), |obj| {
            if let Some(labels) = obj.metadata_mut().labels.as_mut() {
                labels.insert("configsync.gke.io/sync-kind".to_string(), "seanboswell".to_string());
            }
        });
        cluster.fail_next(Operation::Update, Some(DependentKind::ServiceIdentity), Fault::Conflict, 2);

        let outcome = reconciler.reconcile(&request("rs1")).await;
        assert!(matches!(outcome, ReconcileOutcome::Converged), "{outcome:?}");
        let sa = cluster.object(DependentKind::ServiceIdentity, &sa_key("rs1")).unwrap();
        assert_eq!(
            sa.metadata().labels.as_ref().unwrap()["configsync.gke.io/sync-kind"],
            "RootSync"
        );
    }

    #[tokio::test]
    async fn test_persistent_conflict_becomes_pending() {
        let (cluster, reconciler) = setup();
        cluster.apply_sync(root_sync("rs1", serde_json::json!({ "repo": "https://example.com/r.git", "auth": "none" })));
        cluster.fail_next(
            Operation::Create,
            Some(DependentKind::WorkerDeployment),
            Fault::AlreadyExists,
            MAX_CONFLICT_RETRIES + 1,
        );

        let outcome = reconciler.reconcile(&request("rs1")).await;
        assert!(matches!(outcome, ReconcileOutcome::Pending { .. }), "{outcome:?}");
        // The other kinds still converged
        assert_eq!(cluster.count(DependentKind::ServiceIdentity), 1);
        assert_eq!(cluster.count(DependentKind::AccessBinding), 1);
    }

    #[tokio::test]
    async fn test_unavailable_cluster_is_transient() {
        let (cluster, reconciler) = setup();
        cluster.apply_sync(root_sync("rs1", serde_json::json!({ "repo": "https://example.com/r.git", "auth": "none" })));
        cluster.fail_next(Operation::Get, Some(DependentKind::ServiceIdentity), Fault::Unavailable, 1);

        let outcome = reconciler.reconcile(&request("rs1")).await;
        assert!(matches!(
            outcome,
            ReconcileOutcome::Failed(ReconcileError::Transient { .. })
        ));
        // Below the degraded threshold the status is left alone
        assert!(cluster.sync_status(&SyncKey::new(NS, "rs1")).is_none());
    }

    #[tokio::test]
    async fn test_deleted_sync_tears_down() {
        let (cluster, reconciler) = setup();
        let key = SyncKey::new(NS, "rs1");
        cluster.apply_sync(root_sync("rs1", serde_json::json!({ "repo": "https://example.com/r.git", "auth": "none" })));
        reconciler.reconcile(&request("rs1")).await;

        cluster.delete_sync(&key);
        let outcome = reconciler.reconcile(&request("rs1")).await;
        assert!(matches!(outcome, ReconcileOutcome::TornDown));
        for kind in DependentKind::ALL {
            assert_eq!(cluster.count(kind), 0);
        }

        // Repeating teardown is harmless
        let outcome = reconciler.reconcile(&request("rs1")).await;
        assert!(matches!(outcome, ReconcileOutcome::TornDown));
    }

    #[tokio::test]
    async fn test_namespaced_sync_rejected_in_single_tenant_mode() {
        let (cluster, reconciler) = setup();
        let mut rs = root_sync("rs1", serde_json::json!({ "repo": "https://example.com/r.git", "auth": "none" }));
        rs.metadata.namespace = Some("team-a".to_string());
        cluster.apply_sync(rs);

        let req = ReconcileRequest::new(SyncKey::new("team-a", "rs1"));
        let outcome = reconciler.reconcile(&req).await;
        assert!(matches!(
            outcome,
            ReconcileOutcome::Failed(ReconcileError::Configuration(_))
        ));

        let outcome = reconciler.clone().multi_tenant(true).reconcile(&req).await;
        assert!(matches!(outcome, ReconcileOutcome::Converged), "{outcome:?}");
        let sa = cluster
            .get(
                DependentKind::ServiceIdentity,
                &ObjectKey::namespaced(NS, "ns-reconciler-team-a-rs1-3"),
            )
            .await
            .unwrap();
        assert!(sa.is_some());
    }

    /// Builder that deletes the RootSync while its desired state is built
    struct DeletingBuilder {
        cluster: Arc<InMemoryCluster>,
        inner: ReconcilerTemplateBuilder,
    }

    impl DesiredStateBuilder for DeletingBuilder {
        fn build(
            &self,
            sync: &RootSync,
            secret: Option<&SecretMaterial>,
            names: &DependentNames,
        ) -> Result<DesiredState, BuildError> {
            self.cluster.delete_sync(&names.sync);
            self.inner.build(sync, secret, names)
        }
    }

    /// Cluster that deletes `sync` once the first dependent was created
    struct DeleteAfterFirstCreate {
        cluster: Arc<InMemoryCluster>,
        sync: SyncKey,
    }

    #[async_trait]
    impl ClusterClient for DeleteAfterFirstCreate {
        async fn get_sync(&self, key: &SyncKey) -> Result<Option<RootSync>, ClusterError> {
            self.cluster.get_sync(key).await
        }

        async fn patch_sync_status(
            &self,
            key: &SyncKey,
            status: &RootSyncStatus,
        ) -> Result<(), ClusterError> {
            self.cluster.patch_sync_status(key, status).await
        }

        async fn get(
            &self,
            kind: DependentKind,
            key: &ObjectKey,
        ) -> Result<Option<DependentObject>, ClusterError> {
            self.cluster.get(kind, key).await
        }

        async fn create(&self, object: &DependentObject) -> Result<DependentObject, ClusterError> {
            let created = self.cluster.create(object).await?;
            self.cluster.delete_sync(&self.sync);
            Ok(created)
        }

        async fn update(&self, object: &DependentObject) -> Result<DependentObject, ClusterError> {
            self.cluster.update(object).await
        }

        async fn delete(&self, kind: DependentKind, key: &ObjectKey) -> Result<(), ClusterError> {
            self.cluster.delete(kind, key).await
        }

        fn watch(&self, kind: WatchedKind) -> BoxStream<'static, Result<WatchEvent, ClusterError>> {
            self.cluster.watch(kind)
        }
    }

    fn creates(cluster: &InMemoryCluster) -> u64 {
        DependentKind::ALL
            .iter()
            .map(|kind| cluster.calls(Operation::Create, Some(*kind)))
            .sum()
    }

    fn public_sync(name: &str) -> RootSync {
        root_sync(name, serde_json::json!({ "repo": "https://example.com/r.git", "auth": "none" }))
    }

    #[tokio::test]
    async fn test_sync_deleted_during_build_creates_nothing() {
        let cluster = Arc::new(InMemoryCluster::new());
        let config = ControllerConfig::default();
        let builder = Arc::new(DeletingBuilder {
            cluster: cluster.clone(),
            inner: ReconcilerTemplateBuilder::from_config(&config),
        });
        let reconciler = Reconciler::with_builder(cluster.clone(), cluster.clone(), builder, config);
        cluster.apply_sync(public_sync("rs1"));

        let outcome = reconciler.reconcile(&request("rs1")).await;
        assert!(matches!(outcome, ReconcileOutcome::TornDown), "{outcome:?}");
        assert_eq!(creates(&cluster), 0);
        for kind in DependentKind::ALL {
            assert_eq!(cluster.count(kind), 0, "{kind} was created");
        }
    }

    #[tokio::test]
    async fn test_sync_deleted_between_creates_removes_created_dependents() {
        let cluster = Arc::new(InMemoryCluster::new());
        let client = Arc::new(DeleteAfterFirstCreate {
            cluster: cluster.clone(),
            sync: SyncKey::new(NS, "rs1"),
        });
        let reconciler = Reconciler::new(client, cluster.clone(), ControllerConfig::default());
        cluster.apply_sync(public_sync("rs1"));

        let outcome = reconciler.reconcile(&request("rs1")).await;
        assert!(matches!(outcome, ReconcileOutcome::TornDown), "{outcome:?}");
        assert_eq!(creates(&cluster), 1);
        for kind in DependentKind::ALL {
            assert_eq!(cluster.count(kind), 0, "{kind} left behind");
        }
    }
}
