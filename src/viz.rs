use std::{
    fs,
    path::{Path, PathBuf},
};

use image::GrayImage;
use tracing::info;

use crate::{
    error::{Error, Result},
    inference::{DepthMap, InferenceResult},
    model::pose::kitti_row,
};

pub const POSES_FILE: &str = "poses.txt";

/// Inverse depth scaled to `[0, 255]`, near surfaces bright.
pub fn depth_to_image(depth: &DepthMap) -> Result<GrayImage> {
    let inverse: Vec<f32> = depth
        .values
        .iter()
        .map(|&value| if value > 0.0 { value.recip() } else { f32::NAN })
        .collect();

    let (mut min_value, mut max_value) = (f32::INFINITY, f32::NEG_INFINITY);
    for &value in &inverse {
        if value.is_finite() {
            min_value = min_value.min(value);
            max_value = max_value.max(value);
        }
    }
    if !min_value.is_finite() || !max_value.is_finite() {
        min_value = 0.0;
        max_value = 1.0;
    }
    let range = (max_value - min_value).max(f32::EPSILON);

    let pixels: Vec<u8> = inverse
        .into_iter()
        .map(|value| {
            let normalized = if value.is_finite() {
                ((value - min_value) / range).clamp(0.0, 1.0)
            } else {
                0.0
            };
            (normalized * 255.0).round().clamp(0.0, 255.0) as u8
        })
        .collect();

    let width = u32::try_from(depth.width)
        .map_err(|_| Error::Tensor(format!("depth width {} out of range", depth.width)))?;
    let height = u32::try_from(depth.height)
        .map_err(|_| Error::Tensor(format!("depth height {} out of range", depth.height)))?;
    GrayImage::from_vec(width, height, pixels)
        .ok_or_else(|| Error::Tensor(format!("depth size mismatch {width}x{height}")))
}

/// Writes `depth_###.png` per frame plus `poses.txt`, returning the written paths.
pub fn save_visualization(result: &InferenceResult, dir: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir).map_err(|err| Error::io(dir, err))?;

    let mut written = Vec::with_capacity(result.len() + 1);
    for (idx, depth) in result.depths.iter().enumerate() {
        let path = dir.join(format!("depth_{idx:03}.png"));
        depth_to_image(depth)?
            .save(&path)
            .map_err(|source| Error::Visualization {
                path: path.clone(),
                source,
            })?;
        written.push(path);
    }

    let poses_path = dir.join(POSES_FILE);
    let rows: Vec<String> = result.poses.iter().map(kitti_row).collect();
    fs::write(&poses_path, rows.join("\n") + "\n").map_err(|err| Error::io(&poses_path, err))?;
    written.push(poses_path);

    for (idx, pose) in result.poses.iter().enumerate() {
        let t = pose.translation.vector;
        info!(
            frame = idx,
            tx = t.x,
            ty = t.y,
            tz = t.z,
            angle = pose.rotation.angle(),
            "pose"
        );
    }
    info!(dir = %dir.display(), files = written.len(), "saved visualization");

    Ok(written)
}
