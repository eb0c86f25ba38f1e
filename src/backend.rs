//! Device runtime backend selection.
//!
//! Determines whether the memory manager drives real GPU memory through the
//! CUDA driver or emulates device memory in page-aligned host RAM.
//!
//! # Detection Logic
//!
//! In `Auto` mode the CUDA backend is chosen when the NVIDIA kernel driver is
//! loaded, which is checked by:
//! 1. Is `/proc/driver/nvidia/version` readable?
//! 2. Does the control node `/dev/nvidiactl` exist?
//!
//! The user-space driver library is only loaded once a [`CudaRuntime`] is
//! created, so `Auto` never loads `libcuda` on machines without a GPU.
//!
//! [`CudaRuntime`]: crate::cuda::CudaRuntime

use std::path::Path;
use std::sync::Arc;

use crate::cuda::CudaRuntime;
use crate::error::{Error, ErrorKind};
use crate::host::HostRuntime;
use crate::runtime::DeviceRuntime;

/// Which device runtime backs GPU memory operations.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Use the CUDA driver. Fails if no GPU is present.
    Cuda,
    /// Emulate device memory in host RAM.
    Host,
    /// Use CUDA when the NVIDIA driver is loaded, otherwise host emulation (default).
    #[default]
    Auto,
}

impl Backend {
    /// Parse a backend name.
    ///
    /// Accepts (case-insensitive) `"cuda"`/`"gpu"`, `"host"`/`"emulated"` and `"auto"`.
    pub fn parse(s: &str) -> crate::error::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cuda" | "gpu" => Ok(Backend::Cuda),
            "host" | "emulated" => Ok(Backend::Host),
            "auto" => Ok(Backend::Auto),
            _ => Err(Error::new(
                ErrorKind::ConfigInvalid,
                format!("unknown backend: {s:?}"),
            )
            .with_operation("Backend::parse")),
        }
    }

    /// Returns `true` if this backend never touches a real GPU.
    pub fn is_emulated(self) -> bool {
        self == Backend::Host
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Cuda => f.write_str("cuda"),
            Backend::Host => f.write_str("host"),
            Backend::Auto => f.write_str("auto"),
        }
    }
}

/// Check whether the NVIDIA kernel driver is loaded.
pub fn is_nvidia_driver_loaded() -> bool {
    Path::new("/proc/driver/nvidia/version").is_file() && Path::new("/dev/nvidiactl").exists()
}

/// Determine the effective backend for this machine.
///
/// `Cuda` and `Host` are returned unchanged.
pub fn resolve_backend(backend: Backend) -> Backend {
    match backend {
        Backend::Cuda | Backend::Host => backend,
        Backend::Auto => {
            if is_nvidia_driver_loaded() {
                Backend::Cuda
            } else {
                Backend::Host
            }
        }
    }
}

/// Instantiate the device runtime for `backend`.
pub fn open_runtime(backend: Backend) -> crate::error::Result<Arc<dyn DeviceRuntime>> {
    match resolve_backend(backend) {
        Backend::Cuda => {
            let runtime =
                CudaRuntime::new().map_err(|e| e.with_operation("backend::open_runtime"))?;
            Ok(Arc::new(runtime))
        }
        _ => Ok(Arc::new(HostRuntime::default())),
    }
}
