use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("sequence directory `{0}` does not exist")]
    SequenceNotFound(PathBuf),

    #[error("no png frames found in `{0}`")]
    NoFrames(PathBuf),

    #[error("I/O error on `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode frame `{path}`: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("frame `{path}` is {found:?}, expected {expected:?} like the keyframe")]
    FrameSize {
        path: PathBuf,
        expected: (u32, u32),
        found: (u32, u32),
    },

    #[error("cannot sample {requested} supporting frames from {available}")]
    FrameLimit { requested: usize, available: usize },

    #[error("malformed intrinsics at line {line}: {message}")]
    Intrinsics { line: usize, message: String },

    #[error("intrinsics of shape {0:?} are neither `fx fy cx cy` nor a 3x3 matrix")]
    IntrinsicsShape(Vec<usize>),

    #[error("calibrated inference requires intrinsics")]
    MissingIntrinsics,

    #[error("failed to parse config `{path}`: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("unknown config key `{key}` in `{path}`")]
    UnknownConfigKey { path: PathBuf, key: String },

    #[error("checkpoint `{0}` not found")]
    CheckpointNotFound(PathBuf),

    #[error("failed to load checkpoint `{path}`: {message}")]
    Checkpoint { path: PathBuf, message: String },

    #[error("model is not bound to a compute session")]
    Unbound,

    #[error("empty frame batch")]
    EmptyBatch,

    #[error("failed to read tensor data: {0}")]
    Tensor(String),

    #[error("failed to write visualization `{path}`: {source}")]
    Visualization {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
