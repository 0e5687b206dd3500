#![recursion_limit = "256"]

use std::path::PathBuf;

use anyhow::{Context, Result};
use burn_deepv2d::{
    InferenceBackend,
    config::{Deepv2dConfig, resolve_config_path},
    host::{ExecutionHost, RunRequest, RunStage, log_stage},
    model::{DeepV2d, DeepV2dOptions, RunMode},
    sequence::{FrameSelection, load_test_sequence},
    session::{MemoryPolicy, SessionSettings},
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

const DEFAULT_CHECKPOINT: &str = "models/kitti.mpk";
const DEFAULT_SEQUENCE: &str = "data/demos/kitti_0";

#[derive(Clone, Debug, Serialize, Deserialize, Parser)]
#[command(about = "DeepV2D demo: depth and camera poses for a short video sequence", version, long_about = None)]
pub struct DemoConfig {
    /// Config the model was trained with; derived from `--model` when omitted.
    #[arg(long)]
    pub cfg: Option<PathBuf>,

    /// Model checkpoint.
    #[arg(long, default_value = DEFAULT_CHECKPOINT)]
    pub model: PathBuf,

    /// Keyframe or global pose optimization.
    #[arg(long, value_enum, default_value_t = RunMode::Keyframe)]
    pub mode: RunMode,

    /// Initialize depth from a single image instead of a constant.
    #[arg(long)]
    pub fcrn: bool,

    #[arg(long = "n_iters", default_value_t = 5)]
    pub n_iters: usize,

    /// Ignore `intrinsics.txt` and estimate the focal length.
    #[arg(long)]
    pub uncalibrated: bool,

    /// Folder holding the `*.png` frames and `intrinsics.txt`.
    #[arg(long, default_value = DEFAULT_SEQUENCE)]
    pub sequence: PathBuf,

    /// Randomly keep this many frames besides the keyframe.
    #[arg(long = "n_frames")]
    pub n_frames: Option<usize>,

    /// Seed for frame subsampling.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Compute device index.
    #[arg(long, default_value_t = 0)]
    pub gpu: usize,

    #[arg(long, value_enum, default_value_t = MemoryPolicy::Incremental)]
    pub memory: MemoryPolicy,

    /// Where depth images and poses are written.
    #[arg(long, default_value = "output")]
    pub output: PathBuf,

    #[arg(long)]
    pub no_viz: bool,
}

impl DemoConfig {
    fn selection(&self) -> FrameSelection {
        FrameSelection {
            limit: self.n_frames,
            seed: self.seed,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = DemoConfig::parse();
    log_stage(RunStage::Start);

    let cfg_path = resolve_config_path(&args.model, args.cfg.as_deref());
    let config = Deepv2dConfig::from_file(&cfg_path)
        .with_context(|| format!("failed to load config `{}`", cfg_path.display()))?;
    log_stage(RunStage::ConfigResolved);

    let sequence = load_test_sequence(&args.sequence, args.selection())
        .with_context(|| format!("failed to load sequence `{}`", args.sequence.display()))?;
    log_stage(RunStage::SequenceLoaded);

    let is_calibrated = !args.uncalibrated;
    let mut model = DeepV2d::<InferenceBackend>::new(
        config,
        &args.model,
        DeepV2dOptions {
            use_fcrn: args.fcrn,
            is_calibrated,
            mode: args.mode,
            viz_dir: args.output.clone(),
        },
    );
    log_stage(RunStage::ModelConstructed);

    let host = ExecutionHost::new(SessionSettings {
        device_index: args.gpu,
        memory: args.memory,
    });
    let result = host
        .run::<InferenceBackend, _>(
            &mut model,
            &sequence,
            RunRequest {
                calibrated: is_calibrated,
                iters: args.n_iters,
                viz: !args.no_viz,
            },
        )
        .context("inference failed")?;

    let depth = &result.depths[0];
    println!(
        "depths: {} x {}x{} (keyframe {})",
        result.len(),
        depth.height,
        depth.width,
        sequence.keyframe_path().display()
    );
    if let Some((min, max)) = depth.finite_range() {
        println!("keyframe depth range: {min:.3} .. {max:.3}");
    }
    println!("intrinsics (fx fy cx cy): {:?}", result.intrinsics);
    println!("poses: {}", result.poses.len());
    for (idx, pose) in result.poses.iter().enumerate() {
        let t = pose.translation.vector;
        println!("  frame {idx}: t = [{:.4}, {:.4}, {:.4}]", t.x, t.y, t.z);
    }
    if !args.no_viz {
        println!("saved visualization to {}", args.output.display());
    }

    Ok(())
}
