//! # Error Policy
//!
//! Turns reconcile results into the [`Action`] the controller schedules next.
//!
//! | Outcome                  | Failure history | Next attempt                         |
//! |--------------------------|-----------------|--------------------------------------|
//! | Converged, TornDown      | forgotten       | next watch event                     |
//! | Pending                  | kept            | after the pending delay              |
//! | Configuration error      | forgotten       | after the slow configuration requeue |
//! | Transient error          | kept            | after the key's exponential backoff  |
//! | Invariant violation      | forgotten       | next watch event                     |
//!
//! The scheduler holds one pending run per RootSync. A requeue for a RootSync
//! that is already scheduled keeps whichever run is due first.

use crate::cluster::SyncKey;
use crate::controller::manager::ControllerContext;
use crate::controller::reconciler::{ReconcileError, ReconcileOutcome};
use crate::crd::RootSync;
use kube_runtime::controller::Action;
use std::sync::Arc;
use tracing::info;

/// Action for a finished pass; failures go to [`handle_reconciliation_error`]
pub fn completion_action(outcome: ReconcileOutcome) -> Result<Action, ReconcileError> {
    match outcome {
        ReconcileOutcome::Converged | ReconcileOutcome::TornDown => Ok(Action::await_change()),
        ReconcileOutcome::Pending { after } => Ok(Action::requeue(after)),
        ReconcileOutcome::Failed(e) => Err(e),
    }
}

/// Decide when a RootSync whose reconcile failed is looked at again
pub fn handle_reconciliation_error(
    rs: Arc<RootSync>,
    error: &ReconcileError,
    ctx: Arc<ControllerContext>,
) -> Action {
    let key = SyncKey::from(&*rs);
    match error {
        ReconcileError::Configuration(_) => {
            ctx.forget(&key);
            Action::requeue(ctx.reconciler().config().configuration_error_requeue_duration())
        }
        ReconcileError::Transient { .. } => {
            let (delay, attempt) = ctx.next_backoff(&key);
            info!(
                "🔄 Retrying {} with backoff: {:?} (attempt {})",
                key, delay, attempt
            );
            Action::requeue(delay)
        }
        ReconcileError::InvariantViolation(_) => {
            ctx.forget(&key);
            Action::await_change()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterError, InMemoryCluster};
    use crate::config::ControllerConfig;
    use crate::controller::reconciler::Reconciler;
    use crate::crd::RootSyncSpec;
    use futures::channel::mpsc;
    use std::time::Duration;

    fn context(config: ControllerConfig) -> Arc<ControllerContext> {
        let cluster = Arc::new(InMemoryCluster::new());
        let reconciler = Reconciler::new(cluster.clone(), cluster, config);
        let (released, _) = mpsc::unbounded();
        Arc::new(ControllerContext::new(reconciler, released))
    }

    fn sync(name: &str) -> Arc<RootSync> {
        let mut rs = RootSync::new(name, RootSyncSpec::default());
        rs.metadata.namespace = Some("config-management-system".to_string());
        Arc::new(rs)
    }

    fn unavailable() -> ReconcileError {
        ReconcileError::transient(
            "get",
            "Deployment",
            "ns/name",
            ClusterError::Unavailable("down".to_string()),
        )
    }

    #[test]
    fn test_completion_actions() {
        assert_eq!(
            completion_action(ReconcileOutcome::Converged).unwrap(),
            Action::await_change()
        );
        assert_eq!(
            completion_action(ReconcileOutcome::TornDown).unwrap(),
            Action::await_change()
        );
        assert_eq!(
            completion_action(ReconcileOutcome::Pending {
                after: Duration::from_millis(250)
            })
            .unwrap(),
            Action::requeue(Duration::from_millis(250))
        );
        assert!(matches!(
            completion_action(ReconcileOutcome::Failed(unavailable())),
            Err(ReconcileError::Transient { .. })
        ));
    }

    #[test]
    fn test_transient_errors_back_off_per_key() {
        let ctx = context(ControllerConfig::default());
        let rs = sync("rs1");
        let key = SyncKey::from(&*rs);

        let first = handle_reconciliation_error(rs.clone(), &unavailable(), ctx.clone());
        let second = handle_reconciliation_error(rs.clone(), &unavailable(), ctx.clone());
        assert_eq!(first, Action::requeue(Duration::from_millis(500)));
        assert_eq!(second, Action::requeue(Duration::from_secs(1)));
        assert_eq!(ctx.retries(&key), 2);

        // Another RootSync starts from the initial delay
        let other = handle_reconciliation_error(sync("rs2"), &unavailable(), ctx.clone());
        assert_eq!(other, Action::requeue(Duration::from_millis(500)));
    }

    #[test]
    fn test_non_transient_errors_forget_history() {
        let ctx = context(ControllerConfig::default());
        let rs = sync("rs1");
        let key = SyncKey::from(&*rs);

        handle_reconciliation_error(rs.clone(), &unavailable(), ctx.clone());
        let action = handle_reconciliation_error(
            rs.clone(),
            &ReconcileError::Configuration("bad".to_string()),
            ctx.clone(),
        );
        assert_eq!(action, Action::requeue(Duration::from_secs(300)));
        assert_eq!(ctx.retries(&key), 0);

        handle_reconciliation_error(rs.clone(), &unavailable(), ctx.clone());
        let action = handle_reconciliation_error(
            rs,
            &ReconcileError::InvariantViolation("x".to_string()),
            ctx.clone(),
        );
        assert_eq!(action, Action::await_change());
        assert_eq!(ctx.retries(&key), 0);
    }
}
