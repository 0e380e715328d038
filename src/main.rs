//! # Reconciler Manager
//!
//! Kubernetes controller that provisions a reconciler for every `RootSync`
//! and reverts out-of-band changes to the objects it owns.
//!
//! ## Overview
//!
//! For each RootSync the controller maintains:
//!
//! 1. **Deployment** `reconciler-<name>` running the reconciler and git-sync containers
//! 2. **ServiceAccount** `reconciler-<name>`, optionally bound to a GCP service account
//! 3. **ClusterRoleBinding** `configsync.gke.io:reconciler-<name>` granting its ClusterRole
//!
//! Only managed fields are enforced; everything else on those objects is left alone.

use anyhow::{Context, Result};
use clap::Parser;
use reconciler_manager::cluster::{ClusterClient, KubeClusterClient, SecretMaterialProvider};
use reconciler_manager::config::ServerConfig;
use reconciler_manager::controller::manager::ControllerManager;
use reconciler_manager::controller::reconciler::Reconciler;
use reconciler_manager::runtime::initialization::initialize;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "reconciler-manager", version, about)]
struct Args {
    /// Also reconcile RootSyncs outside the controller namespace
    #[arg(long, env = "MULTI_TENANT")]
    multi_tenant: bool,

    /// Port for /metrics, /healthz and /readyz
    #[arg(long, env = "METRICS_PORT")]
    metrics_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut server_config = ServerConfig::from_env();
    if let Some(port) = args.metrics_port {
        server_config.metrics_port = port;
    }

    let init = initialize(server_config).await?;
    let cluster = Arc::new(KubeClusterClient::new(init.client.clone()));
    let client: Arc<dyn ClusterClient> = Arc::<KubeClusterClient>::clone(&cluster);
    let secrets: Arc<dyn SecretMaterialProvider> = cluster;

    let reconciler = Reconciler::new(
        Arc::clone(&client),
        secrets,
        init.controller_config.clone(),
    );
    let mut manager = ControllerManager::new(client, init.controller_config.clone());
    reconciler
        .setup_with_controller(&mut manager, args.multi_tenant)
        .context("Failed to set up RootSync controller")?;

    init.server_state.set_ready(true);
    info!("Controller initialized, starting controller manager...");

    let server_state = Arc::clone(&init.server_state);
    manager
        .run(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received shutdown signal (SIGINT/SIGTERM), initiating graceful shutdown...");
            server_state.set_ready(false);
        })
        .await
}
