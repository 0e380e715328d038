//! # Custom Resource Definitions
//!
//! CRD types for the reconciler-manager.
//!
//! ## Module Structure
//!
//! - `spec.rs` - RootSync specification and default values
//! - `status.rs` - Status types for tracking reconciliation state

mod spec;
mod status;

pub use spec::{
    default_branch, default_dir, default_false, default_period, default_revision,
    default_source_format, default_source_type, AuthType, GitSpec, OverrideSpec, RootSync,
    RootSyncSpec, SecretReference,
};
pub use status::{Condition, RootSyncStatus};
