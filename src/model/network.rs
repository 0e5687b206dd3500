use std::path::{Path, PathBuf};

use burn::{
    module::{Ignored, Module},
    nn::{
        Linear, LinearConfig, PaddingConfig2d,
        conv::{Conv2d, Conv2dConfig},
        interpolate::{Interpolate2dConfig, InterpolateMode},
    },
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::activation::{relu, softplus},
};
use nalgebra::Isometry3;
use tracing::trace;

use super::{
    RunMode,
    pose::{apply_increments, isometry_to_twist},
};
use crate::{
    config::Deepv2dConfig,
    error::{Error, Result},
    inference::tensor_values,
};

const CHECKPOINT_EXTENSION: &str = "mpk";
// intrinsics (4) + current pose twist (6)
const MOTION_STATE_DIM: usize = 10;

#[derive(Module, Debug)]
struct ConvActivation<B: Backend> {
    conv: Conv2d<B>,
    with_relu: bool,
}

impl<B: Backend> ConvActivation<B> {
    fn new(
        device: &B::Device,
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        with_relu: bool,
    ) -> Self {
        let conv = Conv2dConfig::new([in_channels, out_channels], [3, 3])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);

        Self { conv, with_relu }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = self.conv.forward(x);
        if self.with_relu { relu(out) } else { out }
    }
}

fn forward_blocks<B: Backend>(blocks: &[ConvActivation<B>], x: Tensor<B, 4>) -> Tensor<B, 4> {
    blocks.iter().fold(x, |x, block| block.forward(x))
}

fn global_average<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 2> {
    let [batch, channels, _, _] = x.dims();
    x.mean_dim(3).mean_dim(2).reshape([batch, channels])
}

/// Quarter-resolution image features.
#[derive(Module, Debug)]
struct FeatureEncoder<B: Backend> {
    blocks: Vec<ConvActivation<B>>,
}

impl<B: Backend> FeatureEncoder<B> {
    fn new(device: &B::Device, features: usize) -> Self {
        let half = (features / 2).max(1);
        Self {
            blocks: vec![
                ConvActivation::new(device, 3, half, 2, true),
                ConvActivation::new(device, half, features, 2, true),
                ConvActivation::new(device, features, features, 1, true),
            ],
        }
    }

    fn forward(&self, normalized: Tensor<B, 4>) -> Tensor<B, 4> {
        forward_blocks(&self.blocks, normalized)
    }
}

/// Residual depth update from a frame's features and the context of its neighbours.
#[derive(Module, Debug)]
struct DepthUpdate<B: Backend> {
    blocks: Vec<ConvActivation<B>>,
    residual: ConvActivation<B>,
}

impl<B: Backend> DepthUpdate<B> {
    fn new(device: &B::Device, features: usize) -> Self {
        Self {
            blocks: vec![
                ConvActivation::new(device, 2 * features + 1, features, 1, true),
                ConvActivation::new(device, features, features, 1, true),
            ],
            residual: ConvActivation::new(device, features, 1, 1, false),
        }
    }

    fn forward(
        &self,
        features: Tensor<B, 4>,
        context: Tensor<B, 4>,
        depth: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let x = Tensor::cat(vec![features, context, depth.clone()], 1);
        let x = forward_blocks(&self.blocks, x);
        depth + self.residual.forward(x)
    }
}

#[derive(Module, Debug)]
struct MotionHead<B: Backend> {
    blocks: Vec<ConvActivation<B>>,
    hidden: Linear<B>,
    output: Linear<B>,
}

impl<B: Backend> MotionHead<B> {
    fn new(device: &B::Device, features: usize, hidden: usize) -> Self {
        Self {
            blocks: vec![
                ConvActivation::new(device, 2 * features + 1, features, 2, true),
                ConvActivation::new(device, features, features, 2, true),
            ],
            hidden: LinearConfig::new(features + MOTION_STATE_DIM, hidden).init(device),
            output: LinearConfig::new(hidden, 6).init(device),
        }
    }

    /// Pose increments `[M * 6]` for every supporting frame against the keyframe.
    fn forward(
        &self,
        features: Tensor<B, 4>,
        keyframe_depth: Tensor<B, 4>,
        intrinsics: [f32; 4],
        poses: &[Isometry3<f32>],
        step_scale: f32,
    ) -> Result<Vec<f32>> {
        let [frames, _, _, _] = features.dims();
        let supports = frames - 1;
        let device = features.device();

        let keyframe = features.clone().slice([0..1]).repeat_dim(0, supports);
        let inverse_depth = keyframe_depth.recip().repeat_dim(0, supports);
        let x = Tensor::cat(
            vec![keyframe, features.slice([1..frames]), inverse_depth],
            1,
        );
        let pooled = global_average(forward_blocks(&self.blocks, x));

        let mut state = Vec::with_capacity(supports * MOTION_STATE_DIM);
        for pose in poses {
            state.extend(intrinsics);
            state.extend(isometry_to_twist(pose));
        }
        let state = Tensor::<B, 1>::from_floats(state.as_slice(), &device)
            .reshape([supports, MOTION_STATE_DIM]);

        let hidden = relu(self.hidden.forward(Tensor::cat(vec![pooled, state], 1)));
        tensor_values(self.output.forward(hidden).mul_scalar(step_scale))
    }
}

/// Focal length regressor used when the camera is uncalibrated.
#[derive(Module, Debug)]
struct FocalHead<B: Backend> {
    block: ConvActivation<B>,
    output: Linear<B>,
}

impl<B: Backend> FocalHead<B> {
    fn new(device: &B::Device, features: usize) -> Self {
        Self {
            block: ConvActivation::new(device, features, features, 2, true),
            output: LinearConfig::new(features, 1).init(device),
        }
    }

    /// Focal length in pixels, relative to half the image width.
    fn forward(&self, keyframe_features: Tensor<B, 4>, width: usize) -> f32 {
        let pooled = global_average(self.block.forward(keyframe_features));
        self.output
            .forward(pooled)
            .exp()
            .mul_scalar(width as f32 * 0.5)
            .into_scalar()
            .elem::<f32>()
    }
}

/// Single-image depth used to initialize the refinement instead of a constant.
#[derive(Module, Debug)]
struct SingleImageDepth<B: Backend> {
    encoder: FeatureEncoder<B>,
    head: ConvActivation<B>,
}

impl<B: Backend> SingleImageDepth<B> {
    fn new(device: &B::Device, features: usize) -> Self {
        Self {
            encoder: FeatureEncoder::new(device, features),
            head: ConvActivation::new(device, features, 1, 1, false),
        }
    }

    fn forward(&self, normalized: Tensor<B, 4>) -> Tensor<B, 4> {
        softplus(self.head.forward(self.encoder.forward(normalized)), 1.0)
    }
}

#[derive(Clone, Debug)]
pub struct NetworkSettings {
    pub height: usize,
    pub width: usize,
    pub min_depth: f32,
    pub max_depth: f32,
    pub init_depth: f32,
    pub step_scale: f32,
}

impl From<&Deepv2dConfig> for NetworkSettings {
    fn from(config: &Deepv2dConfig) -> Self {
        Self {
            height: config.input.height,
            width: config.input.width,
            min_depth: config.structure.min_depth,
            max_depth: config.structure.max_depth,
            init_depth: config.structure.init_depth,
            step_scale: config.motion.step_scale,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct NetworkRequest {
    pub intrinsics: Option<[f32; 4]>,
    pub iters: usize,
    pub mode: RunMode,
    pub use_fcrn: bool,
}

pub struct NetworkOutput<B: Backend> {
    pub depths: Tensor<B, 3>,
    pub poses: Vec<Isometry3<f32>>,
    pub intrinsics: [f32; 4],
}

#[derive(Module, Debug)]
pub struct DeepV2dNetwork<B: Backend> {
    encoder: FeatureEncoder<B>,
    depth_update: DepthUpdate<B>,
    motion: MotionHead<B>,
    focal: FocalHead<B>,
    fcrn: SingleImageDepth<B>,
    settings: Ignored<NetworkSettings>,
}

impl<B: Backend> DeepV2dNetwork<B> {
    pub fn new(device: &B::Device, config: &Deepv2dConfig) -> Self {
        let features = config.structure.features;
        Self {
            encoder: FeatureEncoder::new(device, features),
            depth_update: DepthUpdate::new(device, features),
            motion: MotionHead::new(device, features, config.motion.hidden),
            focal: FocalHead::new(device, features),
            fcrn: SingleImageDepth::new(device, features),
            settings: Ignored(NetworkSettings::from(config)),
        }
    }

    pub fn settings(&self) -> &NetworkSettings {
        &self.settings.0
    }

    /// `(height, width)` the batch must have before [`Self::forward`].
    pub fn input_size(&self) -> (usize, usize) {
        (self.settings.0.height, self.settings.0.width)
    }

    /// Alternates pose and depth refinement over an `[N, 3, H, W]` batch of raw
    /// pixel values whose first frame is the keyframe.
    pub fn forward(&self, images: Tensor<B, 4>, request: &NetworkRequest) -> Result<NetworkOutput<B>> {
        let settings = &self.settings.0;
        let [frames, _, height, width] = images.dims();
        if frames == 0 {
            return Err(Error::EmptyBatch);
        }
        let device = images.device();

        let normalized = images.div_scalar(127.5).sub_scalar(1.0);
        let features = self.encoder.forward(normalized.clone());
        let [_, _, feature_height, feature_width] = features.dims();

        let intrinsics = match request.intrinsics {
            Some(intrinsics) => intrinsics,
            None => {
                let focal = self
                    .focal
                    .forward(features.clone().slice([0..1]), width);
                [focal, focal, width as f32 * 0.5, height as f32 * 0.5]
            }
        };
        let normalized_intrinsics = [
            intrinsics[0] / width as f32,
            intrinsics[1] / height as f32,
            intrinsics[2] / width as f32,
            intrinsics[3] / height as f32,
        ];

        let mut depth = if request.use_fcrn {
            self.fcrn
                .forward(normalized)
                .clamp(settings.min_depth, settings.max_depth)
        } else {
            Tensor::<B, 4>::ones([frames, 1, feature_height, feature_width], &device)
                .mul_scalar(settings.init_depth)
        };

        let mut poses = vec![Isometry3::identity(); frames];
        for iteration in 0..request.iters {
            if frames > 1 {
                let increments = self.motion.forward(
                    features.clone(),
                    depth.clone().slice([0..1]),
                    normalized_intrinsics,
                    &poses[1..],
                    settings.step_scale,
                )?;
                apply_increments(&mut poses[1..], &increments);
            }

            depth = match request.mode {
                RunMode::Keyframe => {
                    let updated = self
                        .depth_update
                        .forward(
                            features.clone().slice([0..1]),
                            keyframe_context(features.clone()),
                            depth.clone().slice([0..1]),
                        )
                        .clamp(settings.min_depth, settings.max_depth);
                    depth.slice_assign([0..1, 0..1, 0..feature_height, 0..feature_width], updated)
                }
                RunMode::Global => self
                    .depth_update
                    .forward(features.clone(), global_context(features.clone()), depth)
                    .clamp(settings.min_depth, settings.max_depth),
            };
            trace!(iteration, "refinement step");
        }

        let depths = Interpolate2dConfig::new()
            .with_output_size(Some([height, width]))
            .with_mode(InterpolateMode::Linear)
            .init()
            .forward(depth)
            .reshape([frames, height, width]);

        Ok(NetworkOutput {
            depths,
            poses,
            intrinsics,
        })
    }
}

/// Mean features of the supporting frames, or the keyframe's own when alone.
fn keyframe_context<B: Backend>(features: Tensor<B, 4>) -> Tensor<B, 4> {
    let [frames, _, _, _] = features.dims();
    if frames == 1 {
        return features;
    }
    features.slice([1..frames]).mean_dim(0)
}

/// Per frame, the mean features of every other frame.
fn global_context<B: Backend>(features: Tensor<B, 4>) -> Tensor<B, 4> {
    let [frames, _, _, _] = features.dims();
    if frames == 1 {
        return features;
    }
    features
        .clone()
        .sum_dim(0)
        .repeat_dim(0, frames)
        .sub(features)
        .div_scalar((frames - 1) as f32)
}

/// Path the recorder actually reads or writes for `path`.
pub fn checkpoint_file(path: &Path) -> PathBuf {
    path.with_extension(CHECKPOINT_EXTENSION)
}

pub fn load_checkpoint<B: Backend>(
    config: &Deepv2dConfig,
    path: &Path,
    device: &B::Device,
) -> Result<DeepV2dNetwork<B>> {
    let file = checkpoint_file(path);
    if !file.exists() {
        return Err(Error::CheckpointNotFound(file));
    }

    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    DeepV2dNetwork::<B>::new(device, config)
        .load_file(&file, &recorder, device)
        .map_err(|err| Error::Checkpoint {
            path: file,
            message: err.to_string(),
        })
}

pub fn save_checkpoint<B: Backend>(network: &DeepV2dNetwork<B>, path: &Path) -> Result<PathBuf> {
    let file = checkpoint_file(path);
    if let Some(parent) = file.parent() {
        std::fs::create_dir_all(parent).map_err(|err| Error::io(parent, err))?;
    }

    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    network
        .clone()
        .save_file(&file, &recorder)
        .map_err(|err| Error::Checkpoint {
            path: file.clone(),
            message: err.to_string(),
        })?;
    Ok(file)
}
