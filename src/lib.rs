#![recursion_limit = "256"]

pub mod config;
pub mod error;
pub mod host;
pub mod inference;
pub mod model;
pub mod sequence;
pub mod session;
pub mod viz;

pub use error::{Error, Result};

#[cfg(feature = "backend_cuda")]
pub type InferenceBackend = burn::backend::Cuda<f32>;

#[cfg(all(feature = "backend_wgpu", not(feature = "backend_cuda")))]
pub type InferenceBackend = burn::backend::Wgpu<f32>;

#[cfg(all(
    feature = "backend_ndarray",
    not(any(feature = "backend_wgpu", feature = "backend_cuda"))
))]
pub type InferenceBackend = burn::backend::NdArray<f32>;

#[cfg(not(any(
    feature = "backend_ndarray",
    feature = "backend_wgpu",
    feature = "backend_cuda"
)))]
compile_error!("enable one of the `backend_ndarray`, `backend_wgpu` or `backend_cuda` features");
