//! Command-line arguments for lora-facade.

use std::path::PathBuf;

use clap::Parser;
use lora_facade::config::FacadeConfig;

#[derive(Parser, Debug)]
#[command(name = "lora-facade", version, about = "Shared device-state coordination node")]
pub struct Args {
    /// Path to TOML configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Lock owner identity for this instance.
    #[arg(long)]
    pub instance_id: Option<String>,

    /// TOML file with `[[devices]]` to load into the registry.
    #[arg(long)]
    pub registry_seed: Option<PathBuf>,

    /// Seconds between address cache reconciliation passes.
    #[arg(long)]
    pub sync_interval_secs: Option<u64>,

    /// Disable scheduled address cache reconciliation.
    #[arg(long)]
    pub no_sync: bool,
}

impl Args {
    /// Apply flags on top of file and environment settings.
    pub fn apply_to(&self, config: &mut FacadeConfig) {
        if let Some(instance_id) = &self.instance_id {
            config.instance_id = instance_id.clone();
        }
        if let Some(path) = &self.registry_seed {
            config.registry.seed_file = Some(path.clone());
        }
        if let Some(secs) = self.sync_interval_secs {
            config.sync.interval_secs = secs;
        }
        if self.no_sync {
            config.sync.enabled = false;
        }
    }
}
