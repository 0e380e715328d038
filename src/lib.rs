//! Reconciler Manager Library
//!
//! Provisions a reconciler (Deployment, ServiceAccount and ClusterRoleBinding)
//! for every `RootSync` and keeps the managed fields of those objects from
//! drifting.
//!
//! ## Quick Start
//!
//! ```rust
//! use reconciler_manager::prelude::*;
//! ```
//!
//! This brings commonly used types and traits into scope. For more specific imports,
//! use the individual modules.

pub mod cluster;
pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod observability;
pub mod prelude;
pub mod runtime;
