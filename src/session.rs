use std::{
    fmt,
    sync::{Mutex, PoisonError},
};

use burn::prelude::*;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// How the runtime reserves device memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MemoryPolicy {
    /// Grow allocations on demand.
    #[default]
    Incremental,
    /// Reserve whole pages up front.
    Eager,
}

impl fmt::Display for MemoryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incremental => f.write_str("incremental"),
            Self::Eager => f.write_str("eager"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionSettings {
    pub device_index: usize,
    pub memory: MemoryPolicy,
}

/// Backends a [`ComputeSession`] can be opened on.
pub trait SessionBackend: Backend {
    fn select_device(index: usize) -> Self::Device;

    /// Called on every session open. Backends whose runtime can only be set up
    /// once per device must skip repeat calls.
    fn configure_runtime(device: &Self::Device, memory: MemoryPolicy);
}

/// Devices whose runtime was already configured in this process.
#[cfg_attr(not(feature = "backend_wgpu"), allow(dead_code))]
struct ConfiguredDevices<D>(Mutex<Vec<D>>);

#[cfg_attr(not(feature = "backend_wgpu"), allow(dead_code))]
impl<D: PartialEq + Clone> ConfiguredDevices<D> {
    const fn new() -> Self {
        Self(Mutex::new(Vec::new()))
    }

    /// True only for the first claim of `device`.
    fn claim(&self, device: &D) -> bool {
        let mut devices = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if devices.contains(device) {
            return false;
        }
        devices.push(device.clone());
        true
    }
}

#[cfg(feature = "backend_ndarray")]
impl SessionBackend for burn::backend::NdArray<f32> {
    fn select_device(index: usize) -> Self::Device {
        if index != 0 {
            tracing::warn!(index, "ndarray runs on the host, ignoring device index");
        }
        Default::default()
    }

    fn configure_runtime(_device: &Self::Device, memory: MemoryPolicy) {
        debug!(%memory, "host backend, memory policy has no effect");
    }
}

#[cfg(feature = "backend_wgpu")]
impl SessionBackend for burn::backend::Wgpu<f32> {
    /// Index 0 is whatever adapter wgpu prefers, so integrated and cpu
    /// adapters work out of the box. Other indices pick a discrete gpu.
    fn select_device(index: usize) -> Self::Device {
        use burn::backend::wgpu::WgpuDevice;

        match index {
            0 => WgpuDevice::DefaultDevice,
            index => WgpuDevice::DiscreteGpu(index),
        }
    }

    fn configure_runtime(device: &Self::Device, memory: MemoryPolicy) {
        use burn::backend::wgpu::{
            MemoryConfiguration, RuntimeOptions, WgpuDevice, graphics::AutoGraphicsApi,
            init_setup,
        };
        use std::panic::{self, AssertUnwindSafe};

        static CONFIGURED: ConfiguredDevices<WgpuDevice> = ConfiguredDevices::new();

        if !CONFIGURED.claim(device) {
            debug!(?device, "wgpu runtime already configured");
            return;
        }

        let memory_config = match memory {
            MemoryPolicy::Incremental => MemoryConfiguration::SubSlices,
            MemoryPolicy::Eager => MemoryConfiguration::ExclusivePages,
        };
        let options = RuntimeOptions {
            memory_config,
            ..Default::default()
        };
        // a tensor created on `device` before the first session registers a
        // default runtime, and a second registration panics
        let setup = panic::catch_unwind(AssertUnwindSafe(|| {
            init_setup::<AutoGraphicsApi>(device, options);
        }));
        if setup.is_err() {
            tracing::warn!(?device, %memory, "wgpu runtime was set up elsewhere, memory policy ignored");
        }
    }
}

#[cfg(feature = "backend_cuda")]
impl SessionBackend for burn::backend::Cuda<f32> {
    fn select_device(index: usize) -> Self::Device {
        burn::backend::cuda::CudaDevice::new(index)
    }

    fn configure_runtime(_device: &Self::Device, memory: MemoryPolicy) {
        // the cuda runtime always pools allocations lazily
        debug!(%memory, "cuda memory policy is fixed by the runtime");
    }
}

/// The single compute session of a run. Dropping it flushes pending work.
pub struct ComputeSession<B: SessionBackend> {
    device: B::Device,
    settings: SessionSettings,
}

impl<B: SessionBackend> ComputeSession<B> {
    pub fn open(settings: SessionSettings) -> Self {
        let device = B::select_device(settings.device_index);
        B::configure_runtime(&device, settings.memory);
        info!(
            device = ?device,
            memory = %settings.memory,
            "opened compute session"
        );
        Self { device, settings }
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn settings(&self) -> SessionSettings {
        self.settings
    }
}

impl<B: SessionBackend> Drop for ComputeSession<B> {
    fn drop(&mut self) {
        let _ = B::sync(&self.device);
        #[cfg(test)]
        RELEASED.with(|count| count.set(count.get() + 1));
        info!(device = ?self.device, "released compute session");
    }
}

#[cfg(test)]
thread_local! {
    static RELEASED: std::cell::Cell<usize> = const { std::cell::Cell::new(0) };
}

/// Sessions dropped on the calling thread so far.
#[cfg(test)]
pub(crate) fn released_sessions() -> usize {
    RELEASED.with(std::cell::Cell::get)
}

/// Runs `f` inside a session that is released however `f` exits.
pub fn with_session<B: SessionBackend, R>(
    settings: SessionSettings,
    f: impl FnOnce(&ComputeSession<B>) -> R,
) -> R {
    let session = ComputeSession::<B>::open(settings);
    f(&session)
}
