//! Backend abstraction - Multi-backend support
//!
//! CUDA or WGPU when compiled in, NdArray (CPU) otherwise. The accelerator is
//! used whenever one is detected at runtime.

use std::fmt;

use burn::backend::Autodiff;
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// --------------------------------------------------------------------------------
// BACKEND SELECTION: CUDA, then WGPU, then NdArray
// --------------------------------------------------------------------------------

#[cfg(feature = "cuda")]
pub type DefaultBackend = burn_cuda::Cuda;

#[cfg(all(not(feature = "cuda"), feature = "wgpu"))]
pub type DefaultBackend = burn::backend::Wgpu;

#[cfg(all(not(feature = "cuda"), not(feature = "wgpu"), feature = "ndarray"))]
pub type DefaultBackend = burn_ndarray::NdArray;

#[cfg(not(any(feature = "cuda", feature = "wgpu", feature = "ndarray")))]
compile_error!("At least one backend (cuda, wgpu, or ndarray) must be enabled!");

/// The default autodiff backend for training
pub type TrainingBackend = Autodiff<DefaultBackend>;

/// Device of the default backend
pub type DefaultDevice = <DefaultBackend as Backend>::Device;

/// Which kind of hardware to run on
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ComputeDevice {
    Cpu,
    /// Accelerator ordinal
    Accelerator(usize),
}

impl ComputeDevice {
    /// Accelerator 0 if a discrete GPU is present, CPU otherwise
    pub fn detect() -> Self {
        if has_nvidia_gpu() || has_amd_gpu() {
            ComputeDevice::Accelerator(0)
        } else {
            ComputeDevice::Cpu
        }
    }
}

impl fmt::Display for ComputeDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputeDevice::Cpu => write!(f, "CPU"),
            ComputeDevice::Accelerator(id) => write!(f, "GPU:{}", id),
        }
    }
}

/// Map a hardware choice onto a device of the compiled-in backend
pub fn select_device(choice: ComputeDevice) -> DefaultDevice {
    let device = device_for(choice);
    info!("Using {} on {:?} ({})", backend_name(), device, choice);
    device
}

/// Detect the hardware and return the matching device
pub fn auto_device() -> DefaultDevice {
    select_device(ComputeDevice::detect())
}

#[cfg(feature = "cuda")]
fn device_for(choice: ComputeDevice) -> DefaultDevice {
    match choice {
        ComputeDevice::Accelerator(id) => burn_cuda::CudaDevice::new(id),
        ComputeDevice::Cpu => {
            warn!("CPU requested but the binary was built for CUDA; using GPU:0");
            burn_cuda::CudaDevice::new(0)
        }
    }
}

#[cfg(all(not(feature = "cuda"), feature = "wgpu"))]
fn device_for(choice: ComputeDevice) -> DefaultDevice {
    use burn::backend::wgpu::WgpuDevice;
    match choice {
        ComputeDevice::Accelerator(id) => WgpuDevice::DiscreteGpu(id),
        ComputeDevice::Cpu => WgpuDevice::Cpu,
    }
}

#[cfg(all(not(feature = "cuda"), not(feature = "wgpu"), feature = "ndarray"))]
fn device_for(choice: ComputeDevice) -> DefaultDevice {
    if let ComputeDevice::Accelerator(_) = choice {
        warn!(
            "GPU detected but this build only has the NdArray backend; \
             rebuild with --features cuda or wgpu"
        );
    }
    burn_ndarray::NdArrayDevice::Cpu
}

/// Get a human-readable name for the current backend
pub fn backend_name() -> &'static str {
    #[cfg(feature = "cuda")]
    {
        "CUDA (GPU)"
    }

    #[cfg(all(not(feature = "cuda"), feature = "wgpu"))]
    {
        "WGPU"
    }

    #[cfg(all(not(feature = "cuda"), not(feature = "wgpu"), feature = "ndarray"))]
    {
        "NdArray (CPU)"
    }
}

/// Check for NVIDIA GPU (CUDA)
fn has_nvidia_gpu() -> bool {
    #[cfg(target_os = "linux")]
    {
        std::path::Path::new("/proc/driver/nvidia/version").exists()
            || std::path::Path::new("/dev/nvidia0").exists()
            || command_succeeds("nvidia-smi")
    }

    #[cfg(target_os = "windows")]
    {
        command_succeeds("nvidia-smi.exe")
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        false
    }
}

/// Check for AMD GPU (ROCm)
fn has_amd_gpu() -> bool {
    #[cfg(target_os = "linux")]
    {
        std::path::Path::new("/sys/module/amdgpu").exists() || command_succeeds("rocm-smi")
    }

    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

#[allow(dead_code)]
fn command_succeeds(program: &str) -> bool {
    std::process::Command::new(program)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_display() {
        assert_eq!(ComputeDevice::Cpu.to_string(), "CPU");
        assert_eq!(ComputeDevice::Accelerator(1).to_string(), "GPU:1");
    }

    #[test]
    fn test_detect_returns_a_device() {
        assert!(matches!(
            ComputeDevice::detect(),
            ComputeDevice::Cpu | ComputeDevice::Accelerator(0)
        ));
    }

    #[cfg(all(not(feature = "cuda"), not(feature = "wgpu")))]
    #[test]
    fn test_ndarray_always_cpu() {
        assert_eq!(select_device(ComputeDevice::Accelerator(0)), burn_ndarray::NdArrayDevice::Cpu);
        assert_eq!(backend_name(), "NdArray (CPU)");
    }
}
