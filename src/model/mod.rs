pub mod network;
pub mod pose;

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use burn::prelude::*;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    config::Deepv2dConfig,
    error::{Error, Result},
    inference::InferenceResult,
    sequence::Intrinsics,
    session::{ComputeSession, SessionBackend},
    viz::save_visualization,
};
use network::{DeepV2dNetwork, NetworkRequest, load_checkpoint};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Refine the keyframe depth only.
    #[default]
    Keyframe,
    /// Refine every frame's depth against the rest of the sequence.
    Global,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::Keyframe => "keyframe",
            RunMode::Global => "global",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "keyframe" => Ok(RunMode::Keyframe),
            "global" => Ok(RunMode::Global),
            other => Err(format!("unknown run mode `{other}`, expected keyframe or global")),
        }
    }
}

/// Anything that turns a frame batch into per-frame depths and poses.
pub trait DepthPoseEstimator<B: SessionBackend> {
    /// Attaches the estimator to the session it will run on.
    fn bind(&mut self, session: &ComputeSession<B>) -> Result<()>;

    fn infer(
        &self,
        images: Tensor<B, 4>,
        intrinsics: Option<&Intrinsics>,
        iters: usize,
        viz: bool,
    ) -> Result<InferenceResult>;
}

#[derive(Clone, Debug)]
pub struct DeepV2dOptions {
    pub use_fcrn: bool,
    pub is_calibrated: bool,
    pub mode: RunMode,
    pub viz_dir: PathBuf,
}

impl Default for DeepV2dOptions {
    fn default() -> Self {
        Self {
            use_fcrn: false,
            is_calibrated: true,
            mode: RunMode::Keyframe,
            viz_dir: PathBuf::from("output"),
        }
    }
}

struct Bound<B: Backend> {
    network: DeepV2dNetwork<B>,
    device: B::Device,
}

/// Video-to-depth model; weights are read from the checkpoint when bound.
pub struct DeepV2d<B: Backend> {
    config: Deepv2dConfig,
    checkpoint: PathBuf,
    options: DeepV2dOptions,
    bound: Option<Bound<B>>,
}

impl<B: Backend> DeepV2d<B> {
    pub fn new(config: Deepv2dConfig, checkpoint: impl Into<PathBuf>, options: DeepV2dOptions) -> Self {
        let checkpoint = checkpoint.into();
        info!(
            checkpoint = %checkpoint.display(),
            mode = %options.mode,
            fcrn = options.use_fcrn,
            calibrated = options.is_calibrated,
            "constructed DeepV2D"
        );
        Self {
            config,
            checkpoint,
            options,
            bound: None,
        }
    }

    pub fn config(&self) -> &Deepv2dConfig {
        &self.config
    }

    pub fn checkpoint(&self) -> &Path {
        &self.checkpoint
    }

    pub fn options(&self) -> &DeepV2dOptions {
        &self.options
    }

    pub fn is_bound(&self) -> bool {
        self.bound.is_some()
    }

    /// Intrinsics rescaled from the frame size to the network input size.
    fn network_intrinsics(
        &self,
        intrinsics: Option<&Intrinsics>,
        frame_size: [usize; 2],
    ) -> Result<Option<[f32; 4]>> {
        match (self.options.is_calibrated, intrinsics) {
            (true, None) => Err(Error::MissingIntrinsics),
            (true, Some(intrinsics)) => {
                let [fx, fy, cx, cy] = intrinsics.pinhole()?;
                let [height, width] = frame_size;
                let sx = self.config.input.width as f32 / width as f32;
                let sy = self.config.input.height as f32 / height as f32;
                Ok(Some([fx * sx, fy * sy, cx * sx, cy * sy]))
            }
            (false, Some(_)) => {
                warn!("uncalibrated model ignores the provided intrinsics");
                Ok(None)
            }
            (false, None) => Ok(None),
        }
    }
}

impl<B: SessionBackend> DepthPoseEstimator<B> for DeepV2d<B> {
    fn bind(&mut self, session: &ComputeSession<B>) -> Result<()> {
        let device = session.device().clone();
        let network = load_checkpoint::<B>(&self.config, &self.checkpoint, &device)?;
        info!(
            checkpoint = %self.checkpoint.display(),
            params = network.num_params(),
            "bound DeepV2D to session"
        );
        self.bound = Some(Bound { network, device });
        Ok(())
    }

    fn infer(
        &self,
        images: Tensor<B, 4>,
        intrinsics: Option<&Intrinsics>,
        iters: usize,
        viz: bool,
    ) -> Result<InferenceResult> {
        let bound = self.bound.as_ref().ok_or(Error::Unbound)?;
        let [frames, _, height, width] = images.dims();
        if frames == 0 {
            return Err(Error::EmptyBatch);
        }

        let request = NetworkRequest {
            intrinsics: self.network_intrinsics(intrinsics, [height, width])?,
            iters,
            mode: self.options.mode,
            use_fcrn: self.options.use_fcrn,
        };

        let (target_height, target_width) = bound.network.input_size();
        let images = resize_batch(images.to_device(&bound.device), [target_height, target_width]);
        debug!(
            frames,
            from = ?(height, width),
            to = ?(target_height, target_width),
            "prepared batch"
        );

        let output = bound.network.forward(images, &request)?;
        let result = InferenceResult::from_tensors(output.depths, output.poses, output.intrinsics)?;
        info!(frames = result.len(), iters, "inference finished");

        if viz {
            save_visualization(&result, &self.options.viz_dir)?;
        }
        Ok(result)
    }
}

fn resize_batch<B: Backend>(images: Tensor<B, 4>, output_size: [usize; 2]) -> Tensor<B, 4> {
    use burn::nn::interpolate::{Interpolate2dConfig, InterpolateMode};

    let [_, _, height, width] = images.dims();
    if [height, width] == output_size {
        return images;
    }

    Interpolate2dConfig::new()
        .with_output_size(Some(output_size))
        .with_mode(InterpolateMode::Linear)
        .init()
        .forward(images)
}
