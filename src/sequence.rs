use std::{
    fs,
    path::{Path, PathBuf},
};

use burn::prelude::*;
use image::RgbImage;
use rand::{SeedableRng, rngs::StdRng, seq::index};
use tracing::{debug, info};

use crate::{
    error::{Error, Result},
    inference::frames_to_batch,
};

pub const INTRINSICS_FILE: &str = "intrinsics.txt";
const FRAME_EXTENSION: &str = "png";

/// How many supporting frames to keep besides the keyframe.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameSelection {
    pub limit: Option<usize>,
    pub seed: Option<u64>,
}

impl FrameSelection {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn limited(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            seed: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }
}

/// Camera matrix as written in `intrinsics.txt`, shape preserved.
#[derive(Clone, Debug, PartialEq)]
pub struct Intrinsics {
    values: Vec<f32>,
    shape: Vec<usize>,
}

impl Intrinsics {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|err| Error::io(path, err))?;
        Self::parse(&text)
    }

    /// Parses whitespace separated rows, skipping blank lines and `#` comments.
    /// A single row or a single column collapses to one dimension.
    pub fn parse(text: &str) -> Result<Self> {
        let mut values = Vec::new();
        let mut rows = 0usize;
        let mut cols = None;

        for (line_idx, line) in text.lines().enumerate() {
            let content = line.split('#').next().unwrap_or_default().trim();
            if content.is_empty() {
                continue;
            }

            let row = content
                .split_whitespace()
                .map(|token| {
                    token.parse::<f32>().map_err(|err| Error::Intrinsics {
                        line: line_idx + 1,
                        message: format!("`{token}`: {err}"),
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            match cols {
                None => cols = Some(row.len()),
                Some(expected) if expected != row.len() => {
                    return Err(Error::Intrinsics {
                        line: line_idx + 1,
                        message: format!("expected {expected} columns, found {}", row.len()),
                    });
                }
                Some(_) => {}
            }

            values.extend(row);
            rows += 1;
        }

        let cols = cols.unwrap_or(0);
        let shape = if rows == 1 || cols == 1 {
            vec![values.len()]
        } else {
            vec![rows, cols]
        };

        Ok(Self { values, shape })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Reads `[fx, fy, cx, cy]` from either a 4-vector or a 3x3 camera matrix.
    pub fn pinhole(&self) -> Result<[f32; 4]> {
        match self.shape.as_slice() {
            [4] => Ok([self.values[0], self.values[1], self.values[2], self.values[3]]),
            [3, 3] => Ok([self.values[0], self.values[4], self.values[2], self.values[5]]),
            shape => Err(Error::IntrinsicsShape(shape.to_vec())),
        }
    }
}

#[derive(Clone, Debug)]
pub struct FrameSequence {
    paths: Vec<PathBuf>,
    frames: Vec<RgbImage>,
    intrinsics: Intrinsics,
}

impl FrameSequence {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn keyframe_path(&self) -> &Path {
        &self.paths[0]
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn frames(&self) -> &[RgbImage] {
        &self.frames
    }

    pub fn intrinsics(&self) -> &Intrinsics {
        &self.intrinsics
    }

    /// `(width, height)` shared by every frame.
    pub fn frame_size(&self) -> (u32, u32) {
        self.frames[0].dimensions()
    }

    /// Stacks the frames into an `[N, 3, H, W]` batch of raw `[0, 255]` values.
    pub fn to_batch<B: Backend>(&self, device: &B::Device) -> Result<Tensor<B, 4>> {
        frames_to_batch::<B>(&self.frames, device)
    }
}

/// Lists `*.png` files of `dir` in lexicographic order. The extension match is
/// case-sensitive.
pub fn list_frames(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(Error::SequenceNotFound(dir.to_path_buf()));
    }

    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).map_err(|err| Error::io(dir, err))? {
        let path = entry.map_err(|err| Error::io(dir, err))?.path();
        let is_frame = path.is_file()
            && path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext == FRAME_EXTENSION);
        if is_frame {
            paths.push(path);
        }
    }
    paths.sort();

    if paths.is_empty() {
        return Err(Error::NoFrames(dir.to_path_buf()));
    }
    Ok(paths)
}

/// Picks frame indices out of `total`, keyframe first.
///
/// With a positive `limit`, that many supporting frames are drawn without
/// replacement from `1..total`; otherwise every frame is kept in order.
pub fn select_frame_indices(
    total: usize,
    limit: Option<usize>,
    rng: &mut StdRng,
) -> Result<Vec<usize>> {
    if total == 0 {
        return Err(Error::EmptyBatch);
    }

    let available = total - 1;
    match limit {
        Some(requested) if requested > 0 => {
            if requested > available {
                return Err(Error::FrameLimit {
                    requested,
                    available,
                });
            }
            let mut indices = Vec::with_capacity(requested + 1);
            indices.push(0);
            indices.extend(
                index::sample(rng, available, requested)
                    .into_iter()
                    .map(|idx| idx + 1),
            );
            Ok(indices)
        }
        _ => Ok((0..total).collect()),
    }
}

/// Loads the frames and `intrinsics.txt` of a demo sequence folder.
pub fn load_test_sequence(dir: &Path, selection: FrameSelection) -> Result<FrameSequence> {
    let available = list_frames(dir)?;
    let mut rng = selection.rng();
    let indices = select_frame_indices(available.len(), selection.limit, &mut rng)?;
    debug!(?indices, "selected frames");

    let mut paths = Vec::with_capacity(indices.len());
    let mut frames: Vec<RgbImage> = Vec::with_capacity(indices.len());
    for idx in indices {
        let path = available[idx].clone();
        let frame = image::open(&path)
            .map_err(|source| Error::Image {
                path: path.clone(),
                source,
            })?
            .to_rgb8();

        if let Some(keyframe) = frames.first() {
            if keyframe.dimensions() != frame.dimensions() {
                return Err(Error::FrameSize {
                    path,
                    expected: keyframe.dimensions(),
                    found: frame.dimensions(),
                });
            }
        }

        paths.push(path);
        frames.push(frame);
    }

    let intrinsics = Intrinsics::from_file(&dir.join(INTRINSICS_FILE))?;

    info!(
        dir = %dir.display(),
        frames = frames.len(),
        available = available.len(),
        keyframe = %paths[0].display(),
        "loaded sequence"
    );

    Ok(FrameSequence {
        paths,
        frames,
        intrinsics,
    })
}
