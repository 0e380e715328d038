//! # Runtime
//!
//! Process startup and the error policy applied by the controller manager.

pub mod error_policy;
pub mod initialization;
