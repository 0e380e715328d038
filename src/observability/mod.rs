//! # Observability
//!
//! Prometheus metrics for the reconciler-manager.

pub mod metrics;
