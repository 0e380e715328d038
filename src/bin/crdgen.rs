//! Prints the RootSync CustomResourceDefinition as YAML.
//!
//! ```sh
//! cargo run --bin crdgen > config/crd/rootsync.yaml
//! ```

use anyhow::{Context, Result};
use kube::CustomResourceExt;
use reconciler_manager::crd::RootSync;

fn main() -> Result<()> {
    let yaml = serde_yaml::to_string(&RootSync::crd()).context("Failed to serialize RootSync CRD")?;
    print!("{yaml}");
    Ok(())
}
