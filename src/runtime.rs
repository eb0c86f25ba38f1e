//! The device runtime seam.
//!
//! [`DeviceRuntime`] is the narrow set of GPU driver primitives the memory
//! manager and transfer engine need. [`CudaRuntime`](crate::cuda::CudaRuntime)
//! implements it on the CUDA driver API; [`HostRuntime`](crate::host::HostRuntime)
//! emulates it in host memory.

use std::fmt;

use crate::error::Result;

/// Runtime-assigned device ordinal.
pub type DeviceId = usize;

/// An address in a device's DMA address space.
///
/// Carries no ownership; the [`MemoryManager`](crate::memory::MemoryManager)
/// decides whether a given pointer still refers to live memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    /// Pointer `bytes` past this one.
    pub fn offset(self, bytes: usize) -> DevicePtr {
        DevicePtr(self.0 + bytes as u64)
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Static description of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub name: String,
    pub pci_domain: u32,
    pub pci_bus: u32,
    pub pci_device: u32,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:04x}:{:02x}:{:02x})",
            self.name, self.pci_domain, self.pci_bus, self.pci_device
        )
    }
}

/// Device memory primitives. Every call blocks until the device has finished.
///
/// # Safety
///
/// The `unsafe` methods take raw device addresses. Callers must pass
/// addresses returned by [`allocate`](Self::allocate) or
/// [`register_io_memory`](Self::register_io_memory) on the same runtime,
/// with ranges that stay inside those allocations, and must not use an
/// address after it has been freed or unregistered.
pub trait DeviceRuntime: Send + Sync {
    /// Short name for diagnostics.
    fn name(&self) -> &'static str;

    /// Returns `true` if device memory is emulated in host RAM.
    fn is_emulated(&self) -> bool;

    /// Number of devices visible to this runtime.
    fn device_count(&self) -> Result<usize>;

    /// Query a device. Unknown ids yield [`ErrorKind::NotFound`](crate::ErrorKind::NotFound).
    fn info(&self, device: DeviceId) -> Result<DeviceInfo>;

    /// Allocate `size` bytes of device memory.
    fn allocate(&self, device: DeviceId, size: usize) -> Result<DevicePtr>;

    /// Release memory returned by [`allocate`](Self::allocate).
    ///
    /// # Safety
    ///
    /// `ptr` must be live and not used afterwards.
    unsafe fn free(&self, device: DeviceId, ptr: DevicePtr) -> Result<()>;

    /// Set `len` bytes at `ptr` to `value`.
    ///
    /// # Safety
    ///
    /// See the trait-level contract.
    unsafe fn memset(&self, device: DeviceId, ptr: DevicePtr, len: usize, value: u8) -> Result<()>;

    /// Copy device memory at `src` into `dst`.
    ///
    /// # Safety
    ///
    /// See the trait-level contract.
    unsafe fn copy_to_host(&self, device: DeviceId, src: DevicePtr, dst: &mut [u8]) -> Result<()>;

    /// Copy `src` into device memory at `dst`.
    ///
    /// # Safety
    ///
    /// See the trait-level contract.
    unsafe fn copy_from_host(&self, device: DeviceId, dst: DevicePtr, src: &[u8]) -> Result<()>;

    /// Copy between two device-visible addresses (including registered I/O memory).
    ///
    /// # Safety
    ///
    /// See the trait-level contract. The ranges must not overlap.
    unsafe fn copy_device_to_device(
        &self,
        device: DeviceId,
        dst: DevicePtr,
        src: DevicePtr,
        len: usize,
    ) -> Result<()>;

    /// Require memory operations on `ptr` to be synchronous with respect to
    /// accesses initiated outside the device (e.g. by a fabric adapter).
    ///
    /// # Safety
    ///
    /// See the trait-level contract.
    unsafe fn set_sync_memops(&self, ptr: DevicePtr) -> Result<()>;

    /// Whether [`set_sync_memops`](Self::set_sync_memops) is in effect for `ptr`.
    ///
    /// # Safety
    ///
    /// See the trait-level contract.
    unsafe fn sync_memops(&self, ptr: DevicePtr) -> Result<bool>;

    /// Make `len` bytes of mapped I/O memory at `host` addressable by the
    /// device and return the device-side address.
    ///
    /// # Safety
    ///
    /// `host` must stay mapped until [`unregister_io_memory`](Self::unregister_io_memory).
    unsafe fn register_io_memory(&self, device: DeviceId, host: *mut u8, len: usize)
    -> Result<DevicePtr>;

    /// Undo [`register_io_memory`](Self::register_io_memory).
    ///
    /// # Safety
    ///
    /// `host` must have been registered on this runtime.
    unsafe fn unregister_io_memory(&self, device: DeviceId, host: *mut u8) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_ptr_offset_and_display() {
        let p = DevicePtr(0x7f00_0000_1000);
        assert_eq!(p.offset(0x10), DevicePtr(0x7f00_0000_1010));
        assert_eq!(format!("{p}"), "0x7f0000001000");
    }

    #[test]
    fn test_device_info_display() {
        let info = DeviceInfo {
            id: 0,
            name: "Tesla K40c".to_string(),
            pci_domain: 0,
            pci_bus: 0x3b,
            pci_device: 0,
        };
        assert_eq!(info.to_string(), "Tesla K40c (0000:3b:00)");
    }
}
