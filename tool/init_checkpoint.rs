#![recursion_limit = "256"]

use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::module::Module;
use burn_deepv2d::{
    InferenceBackend,
    config::Deepv2dConfig,
    model::network::{DeepV2dNetwork, save_checkpoint},
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, Serialize, Deserialize, Parser)]
#[command(about = "burn_deepv2d init_checkpoint", version, long_about = None)]
pub struct InitCheckpointConfig {
    #[arg(long, default_value = "cfgs/kitti.yaml")]
    pub cfg: PathBuf,

    #[arg(long, default_value = "models/kitti.mpk")]
    pub output: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = InitCheckpointConfig::parse();
    let config = Deepv2dConfig::from_file(&args.cfg)
        .with_context(|| format!("failed to load config `{}`", args.cfg.display()))?;

    let device = Default::default();
    let network = DeepV2dNetwork::<InferenceBackend>::new(&device, &config);
    info!(params = network.num_params(), "initialized network");

    let written = save_checkpoint(&network, &args.output).context("failed to save checkpoint")?;
    println!("wrote {}", written.display());

    Ok(())
}
