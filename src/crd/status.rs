//! # RootSync Status
//!
//! Status types for tracking reconciler provisioning state and conditions.

use serde::{Deserialize, Serialize};

/// Status of the RootSync resource
///
/// Written only by the reconciler-manager. The spec is never modified.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RootSyncStatus {
    /// Generation of the spec the conditions were computed from
    #[serde(default)]
    pub observed_generation: Option<i64>,
    /// Name of the reconciler provisioned for this RootSync
    /// Example: "reconciler-rs1"
    #[serde(default)]
    pub reconciler: Option<String>,
    /// Conditions represent the latest available observations
    /// Types: Ready, Stalled
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Last reconciliation time (RFC3339)
    #[serde(default)]
    pub last_reconcile_time: Option<String>,
}

impl RootSyncStatus {
    /// Look up a condition by type
    #[must_use]
    pub fn condition(&self, condition_type: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.r#type == condition_type)
    }
}

/// Condition represents a condition of a resource
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    pub r#type: String,
    /// Status of the condition (True, False, Unknown)
    pub status: String,
    /// Last transition time
    #[serde(default)]
    pub last_transition_time: Option<String>,
    /// Reason for the condition
    #[serde(default)]
    pub reason: Option<String>,
    /// Message describing the condition
    #[serde(default)]
    pub message: Option<String>,
}
