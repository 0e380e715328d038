//! # Lifecycle
//!
//! Teardown of dependents once their RootSync is gone, and the existence
//! check that keeps a deleted RootSync from having its dependents recreated.

use crate::cluster::SyncKey;
use crate::controller::dependent::DependentKind;
use crate::controller::namer::DependentNames;
use crate::controller::reconciler::types::{ReconcileError, Reconciler};
use crate::observability;
use tracing::{debug, info};

/// Order dependents are deleted in: the workload first, its permissions last
const TEARDOWN_ORDER: [DependentKind; 3] = [
    DependentKind::WorkerDeployment,
    DependentKind::AccessBinding,
    DependentKind::ServiceIdentity,
];

impl Reconciler {
    /// Delete every dependent of a RootSync
    ///
    /// Objects that are already gone count as deleted, so teardown can be
    /// repeated any number of times.
    pub async fn teardown(&self, names: &DependentNames) -> Result<(), ReconcileError> {
        for kind in TEARDOWN_ORDER {
            let key = names.key(kind);
            match self.client.delete(kind, &key).await {
                Ok(()) => {
                    observability::metrics::record_dependent_operation(kind.as_str(), "delete");
                    info!("🗑️  Deleted {} {} for {}", kind, key, names.sync);
                }
                Err(e) if e.is_not_found() => {
                    debug!("{} {} already absent", kind, key);
                }
                Err(e) => return Err(ReconcileError::transient("delete", kind.as_str(), &key, e)),
            }
        }
        Ok(())
    }

    /// Whether the RootSync still exists and is not being deleted
    pub async fn sync_still_exists(&self, key: &SyncKey) -> Result<bool, ReconcileError> {
        let sync = self
            .client
            .get_sync(key)
            .await
            .map_err(|e| ReconcileError::transient("get", "RootSync", key, e))?;
        Ok(sync.is_some_and(|rs| rs.metadata.deletion_timestamp.is_none()))
    }
}
