//! # Reconciler
//!
//! Converges the dependents of one RootSync per pass.
//!
//! - `types`: reconcile request, outcome, error taxonomy and the `Reconciler` context
//! - `reconcile`: the reconcile pass and the per-kind apply loop
//! - `lifecycle`: teardown and the RootSync existence check
//! - `status`: condition bookkeeping on the RootSync status
//! - `validation`: RootSync spec and name validation

pub mod lifecycle;
pub mod reconcile;
pub mod status;
pub mod types;
pub mod validation;

pub use types::{ReconcileError, ReconcileOutcome, ReconcileRequest, Reconciler};
