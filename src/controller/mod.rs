//! # Controller
//!
//! The RootSync controller: naming, desired-state construction, managed-field
//! merging, reconciliation and the manager that hosts it.

pub mod backoff;
pub mod builder;
pub mod dependent;
pub mod manager;
pub mod merge;
pub mod namer;
pub mod reconciler;
pub mod server;
