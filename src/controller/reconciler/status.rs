//! # Status
//!
//! Records the result of a reconcile pass on the RootSync status.
//!
//! The status is only written when something other than a timestamp changed.
//! Every write produces a RootSync watch event, so writing unconditionally
//! would requeue the key forever.

use crate::cluster::{ClusterError, SyncKey};
use crate::controller::reconciler::types::{ReconcileError, Reconciler};
use crate::crd::{Condition, RootSync, RootSyncStatus};
use tracing::debug;

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_STALLED: &str = "Stalled";

const STATUS_TRUE: &str = "True";
const STATUS_FALSE: &str = "False";

/// What a reconcile pass has to report
#[derive(Debug, Clone, Copy)]
pub enum StatusUpdate<'a> {
    /// All dependents match the current generation
    Converged { reconciler: &'a str },
    /// The pass failed; `retries` counts earlier consecutive failures of the key
    Failed {
        error: &'a ReconcileError,
        reconciler: Option<&'a str>,
        retries: u32,
    },
}

/// Set a condition, keeping its transition time when the status did not flip
fn set_condition(
    conditions: &mut Vec<Condition>,
    condition_type: &str,
    status: &str,
    reason: &str,
    message: String,
    now: &str,
) {
    let previous = conditions
        .iter()
        .position(|c| c.r#type == condition_type);

    let last_transition_time = match previous.map(|i| &conditions[i]) {
        Some(existing) if existing.status == status => existing.last_transition_time.clone(),
        _ => Some(now.to_string()),
    };

    let condition = Condition {
        r#type: condition_type.to_string(),
        status: status.to_string(),
        last_transition_time,
        reason: Some(reason.to_string()),
        message: Some(message),
    };

    match previous {
        Some(i) => conditions[i] = condition,
        None => conditions.push(condition),
    }
}

/// Compute the status to record, `None` when the update should leave it alone
///
/// Transient failures only surface once a key has failed `degraded_after`
/// times in a row; until then the previous conditions stand.
#[must_use]
pub fn compute_status(
    sync: &RootSync,
    update: StatusUpdate<'_>,
    degraded_after: u32,
    now: &str,
) -> Option<RootSyncStatus> {
    let mut status = sync.status.clone().unwrap_or_default();
    let generation = sync.metadata.generation;

    match update {
        StatusUpdate::Converged { reconciler } => {
            status.observed_generation = generation;
            status.reconciler = Some(reconciler.to_string());
            set_condition(
                &mut status.conditions,
                CONDITION_READY,
                STATUS_TRUE,
                "Reconciled",
                format!("Reconciler {reconciler} is provisioned"),
                now,
            );
            set_condition(
                &mut status.conditions,
                CONDITION_STALLED,
                STATUS_FALSE,
                "Reconciled",
                String::new(),
                now,
            );
        }
        StatusUpdate::Failed {
            error,
            reconciler,
            retries,
        } => {
            if let Some(reconciler) = reconciler {
                status.reconciler = Some(reconciler.to_string());
            }
            match error {
                ReconcileError::Configuration(_) | ReconcileError::InvariantViolation(_) => {
                    status.observed_generation = generation;
                    set_condition(
                        &mut status.conditions,
                        CONDITION_STALLED,
                        STATUS_TRUE,
                        error.reason(),
                        error.to_string(),
                        now,
                    );
                    set_condition(
                        &mut status.conditions,
                        CONDITION_READY,
                        STATUS_FALSE,
                        error.reason(),
                        error.to_string(),
                        now,
                    );
                }
                ReconcileError::Transient { .. } => {
                    if retries.saturating_add(1) < degraded_after {
                        return None;
                    }
                    set_condition(
                        &mut status.conditions,
                        CONDITION_READY,
                        STATUS_FALSE,
                        error.reason(),
                        format!("{error} (after {} attempts)", retries.saturating_add(1)),
                        now,
                    );
                }
            }
        }
    }

    status.last_reconcile_time = Some(now.to_string());
    Some(status)
}

/// Whether two statuses differ in anything but timestamps
#[must_use]
pub fn status_changed(current: Option<&RootSyncStatus>, desired: &RootSyncStatus) -> bool {
    fn strip(status: &RootSyncStatus) -> RootSyncStatus {
        let mut status = status.clone();
        status.last_reconcile_time = None;
        for condition in &mut status.conditions {
            condition.last_transition_time = None;
        }
        status
    }

    match current {
        Some(current) => strip(current) != strip(desired),
        None => true,
    }
}

/// Record a reconcile result on the RootSync
///
/// Returns whether the status subresource was written.
pub async fn update_status(
    ctx: &Reconciler,
    key: &SyncKey,
    sync: &RootSync,
    update: StatusUpdate<'_>,
) -> Result<bool, ClusterError> {
    let now = chrono::Utc::now().to_rfc3339();
    let Some(status) = compute_status(sync, update, ctx.config.degraded_after_retries, &now)
    else {
        return Ok(false);
    };

    if !status_changed(sync.status.as_ref(), &status) {
        debug!("Status unchanged for {}, skipping update", key);
        return Ok(false);
    }

    ctx.client.patch_sync_status(key, &status).await?;
    debug!("Updated status for {}", key);
    Ok(true)
}
