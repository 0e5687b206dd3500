use burn::prelude::*;
use image::RgbImage;
use nalgebra::Isometry3;

use crate::error::{Error, Result};

/// Converts packed RGB bytes into channel-first planes of raw `[0, 255]` values.
///
/// The input slice must contain `width * height * 3` bytes in row-major order.
pub fn rgb_to_planar(rgb: &[u8], width: usize, height: usize) -> Result<Vec<f32>, String> {
    let expected_len = width
        .checked_mul(height)
        .and_then(|pixels| pixels.checked_mul(3))
        .ok_or_else(|| "image dimensions overflowed while preparing input".to_string())?;

    if rgb.len() != expected_len {
        return Err(format!(
            "expected {expected_len} RGB bytes for {width}x{height}, got {}",
            rgb.len()
        ));
    }

    let hw = width * height;
    let mut data = vec![0.0f32; 3 * hw];

    for (idx, pixel) in rgb.chunks_exact(3).enumerate() {
        for channel in 0..3 {
            data[channel * hw + idx] = pixel[channel] as f32;
        }
    }

    Ok(data)
}

/// Stacks equally sized frames into an `[N, 3, H, W]` float batch.
pub fn frames_to_batch<B: Backend>(frames: &[RgbImage], device: &B::Device) -> Result<Tensor<B, 4>> {
    let first = frames.first().ok_or(Error::EmptyBatch)?;
    let width = first.width() as usize;
    let height = first.height() as usize;

    let mut data = Vec::with_capacity(frames.len() * 3 * width * height);
    for frame in frames {
        let planes = rgb_to_planar(frame.as_raw(), width, height).map_err(Error::Tensor)?;
        data.extend(planes);
    }

    Ok(
        Tensor::<B, 1>::from_floats(data.as_slice(), device).reshape([
            frames.len() as i32,
            3,
            height as i32,
            width as i32,
        ]),
    )
}

/// Reads a float tensor back into host memory.
pub(crate) fn tensor_values<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| Error::Tensor(format!("{err:?}")))
}

/// Row-major depth values of a single frame.
#[derive(Clone, Debug, PartialEq)]
pub struct DepthMap {
    pub width: usize,
    pub height: usize,
    pub values: Vec<f32>,
}

impl DepthMap {
    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.values[y * self.width + x]
    }

    /// Smallest and largest finite depth, if any.
    pub fn finite_range(&self) -> Option<(f32, f32)> {
        self.values
            .iter()
            .copied()
            .filter(|value| value.is_finite())
            .fold(None, |range, value| match range {
                None => Some((value, value)),
                Some((min, max)) => Some((min.min(value), max.max(value))),
            })
    }
}

/// Depths and camera poses for every frame of a sequence.
///
/// Poses map keyframe coordinates into each frame; the keyframe pose is the identity.
#[derive(Clone, Debug)]
pub struct InferenceResult {
    pub depths: Vec<DepthMap>,
    pub poses: Vec<Isometry3<f32>>,
    /// `[fx, fy, cx, cy]` at network resolution, given or estimated.
    pub intrinsics: [f32; 4],
}

impl InferenceResult {
    pub fn len(&self) -> usize {
        self.depths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.depths.is_empty()
    }

    /// Splits an `[N, H, W]` depth tensor into per-frame maps.
    pub fn from_tensors<B: Backend>(
        depths: Tensor<B, 3>,
        poses: Vec<Isometry3<f32>>,
        intrinsics: [f32; 4],
    ) -> Result<Self> {
        let [batch, height, width] = depths.dims();
        let values = tensor_values(depths)?;
        let depths = values
            .chunks_exact(height * width)
            .take(batch)
            .map(|chunk| DepthMap {
                width,
                height,
                values: chunk.to_vec(),
            })
            .collect();

        Ok(Self {
            depths,
            poses,
            intrinsics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use image::Rgb;

    type TestBackend = NdArray<f32>;

    #[test]
    fn rgb_to_planar_splits_channels() {
        let rgb = vec![
            0u8, 255, 128, //
            255, 0, 64,
        ];
        let planes = rgb_to_planar(&rgb, 1, 2).unwrap();
        assert_eq!(planes, vec![0.0, 255.0, 255.0, 0.0, 128.0, 64.0]);
    }

    #[test]
    fn rgb_to_planar_rejects_invalid_length() {
        let rgb = vec![0u8; 5];
        assert!(rgb_to_planar(&rgb, 1, 2).is_err());
    }

    #[test]
    fn frames_stack_in_order() {
        let device = <TestBackend as Backend>::Device::default();
        let frames = vec![
            RgbImage::from_pixel(3, 2, Rgb([1, 2, 3])),
            RgbImage::from_pixel(3, 2, Rgb([4, 5, 6])),
        ];
        let batch = frames_to_batch::<TestBackend>(&frames, &device).unwrap();
        assert_eq!(batch.dims(), [2, 3, 2, 3]);

        let second_red = batch.slice([1..2, 0..1, 0..1, 0..1]).into_scalar();
        assert_eq!(second_red, 4.0);
    }

    #[test]
    fn empty_batch_is_rejected() {
        let device = <TestBackend as Backend>::Device::default();
        assert!(matches!(
            frames_to_batch::<TestBackend>(&[], &device),
            Err(Error::EmptyBatch)
        ));
    }

    #[test]
    fn result_splits_depth_per_frame() {
        let device = <TestBackend as Backend>::Device::default();
        let depths = Tensor::<TestBackend, 1>::from_floats(
            [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0].as_slice(),
            &device,
        )
        .reshape([2, 2, 2]);
        let poses = vec![Isometry3::identity(); 2];
        let result = InferenceResult::from_tensors(depths, poses, [1.0, 1.0, 0.5, 0.5]).unwrap();

        assert_eq!(result.len(), 2);
        assert_eq!(result.depths[1].get(1, 0), 6.0);
        assert_eq!(result.depths[0].finite_range(), Some((1.0, 4.0)));
    }
}
