//! # Configuration
//!
//! Runtime configuration for the reconciler-manager.
//!
//! - `controller.rs` - Reconcile loop, backoff and provisioning settings
//! - `server.rs` - HTTP server settings

mod controller;
mod server;

pub use controller::ControllerConfig;
pub use server::ServerConfig;
