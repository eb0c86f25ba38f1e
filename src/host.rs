//! Host-memory emulation of a device runtime.
//!
//! Every emulated device allocation is a zeroed, page-aligned `posix_memalign`
//! block, and a device pointer is simply its host address. Registered I/O
//! memory is identity-mapped the same way. The runtime tracks every range it
//! hands out, so each primitive checks its arguments and a stale pointer is an
//! [`ErrorKind::InvalidHandle`] error rather than a wild write.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use crate::align::page_size;
use crate::error::{Error, ErrorKind, Result};
use crate::runtime::{DeviceId, DeviceInfo, DevicePtr, DeviceRuntime};

#[derive(Debug, Clone, Copy)]
struct Region {
    device: DeviceId,
    len: usize,
}

#[derive(Debug, Default)]
struct HostState {
    allocations: BTreeMap<u64, Region>,
    registered: BTreeMap<u64, Region>,
    sync_memops: HashSet<u64>,
    used: Vec<usize>,
}

impl HostState {
    /// Base of the tracked range that fully contains `ptr..ptr+len`.
    fn containing(map: &BTreeMap<u64, Region>, ptr: u64, len: usize) -> Option<u64> {
        let (&base, region) = map.range(..=ptr).next_back()?;
        let end = base + region.len as u64;
        (ptr.checked_add(len as u64)? <= end).then_some(base)
    }

    fn check(&self, ptr: DevicePtr, len: usize, operation: &'static str) -> Result<()> {
        if Self::containing(&self.allocations, ptr.0, len).is_some()
            || Self::containing(&self.registered, ptr.0, len).is_some()
        {
            return Ok(());
        }
        Err(Error::new(
            ErrorKind::InvalidHandle,
            "address range is not inside live device memory",
        )
        .with_operation(operation)
        .with_context("ptr", ptr.to_string())
        .with_context("len", len.to_string()))
    }
}

/// Device runtime emulated in host RAM.
#[derive(Debug)]
pub struct HostRuntime {
    devices: usize,
    capacity: Option<usize>,
    state: Mutex<HostState>,
}

impl HostRuntime {
    /// Emulate `devices` devices with unbounded memory.
    pub fn new(devices: usize) -> Self {
        Self {
            devices,
            capacity: None,
            state: Mutex::new(HostState {
                used: vec![0; devices],
                ..HostState::default()
            }),
        }
    }

    /// Limit each emulated device to `bytes` of memory.
    pub fn with_capacity(mut self, bytes: usize) -> Self {
        self.capacity = Some(bytes);
        self
    }

    /// Number of allocations not yet freed.
    pub fn allocation_count(&self) -> usize {
        self.state.lock().expect("host state lock poisoned").allocations.len()
    }

    /// Number of I/O ranges currently registered.
    pub fn registered_count(&self) -> usize {
        self.state.lock().expect("host state lock poisoned").registered.len()
    }

    fn check_device(&self, device: DeviceId, operation: &'static str) -> Result<()> {
        if device < self.devices {
            return Ok(());
        }
        Err(Error::new(ErrorKind::NotFound, format!("no emulated device with id {device}"))
            .with_operation(operation)
            .with_context("devices", self.devices.to_string()))
    }
}

impl Default for HostRuntime {
    fn default() -> Self {
        Self::new(1)
    }
}

impl Drop for HostRuntime {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|p| p.into_inner());
        for &base in state.allocations.keys() {
            // SAFETY: every key is a live posix_memalign block owned by us.
            unsafe { libc::free(base as *mut libc::c_void) };
        }
        state.allocations.clear();
    }
}

impl DeviceRuntime for HostRuntime {
    fn name(&self) -> &'static str {
        "host"
    }

    fn is_emulated(&self) -> bool {
        true
    }

    fn device_count(&self) -> Result<usize> {
        Ok(self.devices)
    }

    fn info(&self, device: DeviceId) -> Result<DeviceInfo> {
        self.check_device(device, "HostRuntime::info")?;
        Ok(DeviceInfo {
            id: device,
            name: format!("Emulated device {device}"),
            pci_domain: 0,
            pci_bus: 0,
            pci_device: device as u32,
        })
    }

    fn allocate(&self, device: DeviceId, size: usize) -> Result<DevicePtr> {
        self.check_device(device, "HostRuntime::allocate")?;
        let mut state = self.state.lock().expect("host state lock poisoned");
        if let Some(capacity) = self.capacity {
            if state.used[device].saturating_add(size) > capacity {
                return Err(Error::new(ErrorKind::AllocationFailed, "out of device memory")
                    .with_operation("HostRuntime::allocate")
                    .with_context("size", size.to_string())
                    .with_context("free", (capacity - state.used[device]).to_string()));
            }
        }

        let mut ptr: *mut libc::c_void = std::ptr::null_mut();
        // SAFETY: page_size() is a power of two and a multiple of sizeof(void*).
        let ret = unsafe { libc::posix_memalign(&mut ptr, page_size(), size.max(1)) };
        if ret != 0 {
            return Err(Error::new(ErrorKind::AllocationFailed, "posix_memalign failed")
                .with_operation("HostRuntime::allocate")
                .with_context("size", size.to_string())
                .set_source(std::io::Error::from_raw_os_error(ret)));
        }
        // SAFETY: the block is at least `size` bytes.
        unsafe { std::ptr::write_bytes(ptr as *mut u8, 0, size) };

        state.allocations.insert(ptr as u64, Region { device, len: size });
        state.used[device] += size;
        Ok(DevicePtr(ptr as u64))
    }

    unsafe fn free(&self, device: DeviceId, ptr: DevicePtr) -> Result<()> {
        let mut state = self.state.lock().expect("host state lock poisoned");
        let region = match state.allocations.get(&ptr.0) {
            Some(region) if region.device == device => *region,
            _ => {
                return Err(Error::new(ErrorKind::InvalidHandle, "pointer is not a live allocation")
                    .with_operation("HostRuntime::free")
                    .with_context("ptr", ptr.to_string()));
            }
        };
        state.allocations.remove(&ptr.0);
        state.sync_memops.remove(&ptr.0);
        state.used[device] -= region.len;
        // SAFETY: `ptr` was returned by posix_memalign and is tracked as live.
        unsafe { libc::free(ptr.0 as *mut libc::c_void) };
        Ok(())
    }

    unsafe fn memset(&self, device: DeviceId, ptr: DevicePtr, len: usize, value: u8) -> Result<()> {
        self.check_device(device, "HostRuntime::memset")?;
        let state = self.state.lock().expect("host state lock poisoned");
        state.check(ptr, len, "HostRuntime::memset")?;
        // SAFETY: range checked against a live region above.
        unsafe { std::ptr::write_bytes(ptr.0 as *mut u8, value, len) };
        Ok(())
    }

    unsafe fn copy_to_host(&self, device: DeviceId, src: DevicePtr, dst: &mut [u8]) -> Result<()> {
        self.check_device(device, "HostRuntime::copy_to_host")?;
        let state = self.state.lock().expect("host state lock poisoned");
        state.check(src, dst.len(), "HostRuntime::copy_to_host")?;
        // SAFETY: source range checked; `dst` is a distinct Rust slice.
        unsafe { std::ptr::copy_nonoverlapping(src.0 as *const u8, dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }

    unsafe fn copy_from_host(&self, device: DeviceId, dst: DevicePtr, src: &[u8]) -> Result<()> {
        self.check_device(device, "HostRuntime::copy_from_host")?;
        let state = self.state.lock().expect("host state lock poisoned");
        state.check(dst, src.len(), "HostRuntime::copy_from_host")?;
        // SAFETY: destination range checked; `src` is a distinct Rust slice.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst.0 as *mut u8, src.len()) };
        Ok(())
    }

    unsafe fn copy_device_to_device(
        &self,
        device: DeviceId,
        dst: DevicePtr,
        src: DevicePtr,
        len: usize,
    ) -> Result<()> {
        self.check_device(device, "HostRuntime::copy_device_to_device")?;
        let state = self.state.lock().expect("host state lock poisoned");
        state.check(src, len, "HostRuntime::copy_device_to_device")?;
        state.check(dst, len, "HostRuntime::copy_device_to_device")?;
        // SAFETY: both ranges checked against live regions.
        unsafe { std::ptr::copy(src.0 as *const u8, dst.0 as *mut u8, len) };
        Ok(())
    }

    unsafe fn set_sync_memops(&self, ptr: DevicePtr) -> Result<()> {
        let mut state = self.state.lock().expect("host state lock poisoned");
        let base = HostState::containing(&state.allocations, ptr.0, 0).ok_or_else(|| {
            Error::new(ErrorKind::InvalidHandle, "pointer is not a live allocation")
                .with_operation("HostRuntime::set_sync_memops")
                .with_context("ptr", ptr.to_string())
        })?;
        state.sync_memops.insert(base);
        Ok(())
    }

    unsafe fn sync_memops(&self, ptr: DevicePtr) -> Result<bool> {
        let state = self.state.lock().expect("host state lock poisoned");
        let base = HostState::containing(&state.allocations, ptr.0, 0).ok_or_else(|| {
            Error::new(ErrorKind::InvalidHandle, "pointer is not a live allocation")
                .with_operation("HostRuntime::sync_memops")
                .with_context("ptr", ptr.to_string())
        })?;
        Ok(state.sync_memops.contains(&base))
    }

    unsafe fn register_io_memory(
        &self,
        device: DeviceId,
        host: *mut u8,
        len: usize,
    ) -> Result<DevicePtr> {
        self.check_device(device, "HostRuntime::register_io_memory")?;
        if host.is_null() || len == 0 {
            return Err(Error::new(ErrorKind::ConfigInvalid, "empty I/O range")
                .with_operation("HostRuntime::register_io_memory"));
        }
        let start = host as u64;
        let end = start + len as u64;
        let mut state = self.state.lock().expect("host state lock poisoned");
        let overlaps = state
            .registered
            .range(..end)
            .next_back()
            .is_some_and(|(&base, r)| base + r.len as u64 > start);
        if overlaps {
            return Err(Error::new(ErrorKind::AlreadyBound, "I/O range is already registered")
                .with_operation("HostRuntime::register_io_memory")
                .with_context("host", format!("{start:#x}")));
        }
        state.registered.insert(start, Region { device, len });
        Ok(DevicePtr(start))
    }

    unsafe fn unregister_io_memory(&self, device: DeviceId, host: *mut u8) -> Result<()> {
        let mut state = self.state.lock().expect("host state lock poisoned");
        match state.registered.get(&(host as u64)) {
            Some(region) if region.device == device => {
                state.registered.remove(&(host as u64));
                Ok(())
            }
            _ => Err(Error::new(ErrorKind::InvalidHandle, "I/O range is not registered")
                .with_operation("HostRuntime::unregister_io_memory")
                .with_context("host", format!("{:#x}", host as u64))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_is_zeroed_and_page_aligned() {
        let rt = HostRuntime::default();
        let ptr = rt.allocate(0, 10_000).unwrap();
        assert_eq!(ptr.0 as usize % page_size(), 0);
        let mut out = vec![0xffu8; 10_000];
        unsafe { rt.copy_to_host(0, ptr, &mut out).unwrap() };
        assert!(out.iter().all(|&b| b == 0));
        unsafe { rt.free(0, ptr).unwrap() };
        assert_eq!(rt.allocation_count(), 0);
    }

    #[test]
    fn test_unknown_device() {
        let rt = HostRuntime::new(2);
        assert_eq!(rt.info(1).unwrap().name, "Emulated device 1");
        assert_eq!(rt.info(2).unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(rt.allocate(5, 64).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_capacity_limit() {
        let rt = HostRuntime::default().with_capacity(8192);
        let a = rt.allocate(0, 8192).unwrap();
        let err = rt.allocate(0, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AllocationFailed);
        unsafe { rt.free(0, a).unwrap() };
        rt.allocate(0, 4096).unwrap();
    }

    #[test]
    fn test_double_free_is_invalid_handle() {
        let rt = HostRuntime::default();
        let ptr = rt.allocate(0, 4096).unwrap();
        unsafe { rt.free(0, ptr).unwrap() };
        let err = unsafe { rt.free(0, ptr) }.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidHandle);
    }

    #[test]
    fn test_out_of_range_access_rejected() {
        let rt = HostRuntime::default();
        let ptr = rt.allocate(0, 4096).unwrap();
        unsafe { rt.memset(0, ptr.offset(4000), 96, 1).unwrap() };
        let err = unsafe { rt.memset(0, ptr.offset(4000), 97, 1) }.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidHandle);
    }

    #[test]
    fn test_sync_memops_follows_allocation() {
        let rt = HostRuntime::default();
        let ptr = rt.allocate(0, 8192).unwrap();
        unsafe {
            assert!(!rt.sync_memops(ptr).unwrap());
            rt.set_sync_memops(ptr.offset(100)).unwrap();
            assert!(rt.sync_memops(ptr).unwrap());
            rt.free(0, ptr).unwrap();
            assert!(rt.sync_memops(ptr).is_err());
        }
    }

    #[test]
    fn test_register_io_memory_round_trip() {
        let rt = HostRuntime::default();
        let mut window = vec![7u8; 4096];
        let host = window.as_mut_ptr();
        let dev = unsafe { rt.register_io_memory(0, host, 4096).unwrap() };
        assert_eq!(dev.0, host as u64);

        let err = unsafe { rt.register_io_memory(0, host, 4096) }.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyBound);

        let buf = rt.allocate(0, 4096).unwrap();
        unsafe { rt.copy_device_to_device(0, buf, dev, 4096).unwrap() };
        let mut out = vec![0u8; 4096];
        unsafe { rt.copy_to_host(0, buf, &mut out).unwrap() };
        assert_eq!(out, window);

        unsafe { rt.unregister_io_memory(0, host).unwrap() };
        assert_eq!(rt.registered_count(), 0);
        let err = unsafe { rt.unregister_io_memory(0, host) }.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidHandle);
    }
}
