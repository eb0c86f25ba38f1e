//! GPU memory management.
//!
//! [`MemoryManager`] owns a [`DeviceRuntime`] and a registry of live
//! allocations. A [`DeviceBuffer`] is the owning handle for one allocation;
//! releasing it (explicitly or on drop) removes it from the registry, after
//! which every operation that still names its address fails with
//! [`ErrorKind::InvalidHandle`].
//!
//! Each allocation carries a generation number so a buffer never frees a
//! later allocation that happens to reuse its address.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::backend::open_runtime;
use crate::config::Config;
use crate::error::{Error, ErrorKind, Result};
use crate::fabric::RemoteWindow;
use crate::log::Logger;
use crate::runtime::{DeviceId, DeviceInfo, DevicePtr, DeviceRuntime};
use crate::status::StatusCode;

#[derive(Debug, Clone, Copy)]
pub(crate) struct LiveAllocation {
    pub(crate) device: DeviceId,
    pub(crate) len: usize,
    pub(crate) generation: u64,
}

struct Inner {
    runtime: Arc<dyn DeviceRuntime>,
    live: RwLock<BTreeMap<DevicePtr, LiveAllocation>>,
    next_generation: AtomicU64,
    logger: Logger,
}

impl Inner {
    fn invalid_handle(ptr: DevicePtr, operation: &'static str) -> Error {
        Error::new(ErrorKind::InvalidHandle, "device memory was already released")
            .with_operation(operation)
            .with_context("device_ptr", ptr.to_string())
    }

    /// Free the allocation at `ptr`. With `generation`, only that allocation.
    fn release(&self, ptr: DevicePtr, generation: Option<u64>, operation: &'static str) -> Result<()> {
        let mut live = self.live.write().expect("live allocations lock poisoned");
        let alloc = match live.get(&ptr) {
            Some(a) if generation.is_none_or(|g| g == a.generation) => *a,
            _ => return Err(Self::invalid_handle(ptr, operation)),
        };
        live.remove(&ptr);
        // SAFETY: `ptr` was live in the registry and is now unreachable through it.
        unsafe { self.runtime.free(alloc.device, ptr) }.map_err(|e| e.with_operation(operation))?;
        crate::log_debug!(
            self.logger,
            "freed {} bytes at {} on device {}",
            alloc.len,
            ptr,
            alloc.device
        );
        Ok(())
    }
}

/// Allocates, fills and inspects device memory.
///
/// Cheap to clone; clones share the runtime and the allocation registry.
#[derive(Clone)]
pub struct MemoryManager {
    inner: Arc<Inner>,
}

impl MemoryManager {
    /// Create a manager over `runtime`, logging to `logger`.
    pub fn new(runtime: Arc<dyn DeviceRuntime>, logger: Logger) -> Self {
        Self {
            inner: Arc::new(Inner {
                runtime,
                live: RwLock::new(BTreeMap::new()),
                next_generation: AtomicU64::new(1),
                logger,
            }),
        }
    }

    /// Create a manager on the backend selected by [`Config`], logging to
    /// [`Logger::global`].
    pub fn from_config() -> Result<Self> {
        let config = Config::get();
        let runtime =
            open_runtime(config.backend).map_err(|e| e.with_operation("MemoryManager::from_config"))?;
        Ok(Self::new(runtime, Logger::global()))
    }

    pub fn runtime(&self) -> &Arc<dyn DeviceRuntime> {
        &self.inner.runtime
    }

    pub fn logger(&self) -> &Logger {
        &self.inner.logger
    }

    /// Describe `device`.
    pub fn info(&self, device: DeviceId) -> Result<DeviceInfo> {
        self.inner
            .runtime
            .info(device)
            .map_err(|e| e.with_operation("MemoryManager::info"))
    }

    /// Allocate `size` bytes on `device`.
    pub fn allocate(&self, device: DeviceId, size: usize) -> Result<DeviceBuffer> {
        if size == 0 {
            return Err(Error::new(ErrorKind::ConfigInvalid, "cannot allocate zero bytes")
                .with_operation("MemoryManager::allocate")
                .with_context("device", device.to_string()));
        }
        let ptr = self.inner.runtime.allocate(device, size).map_err(|e| {
            Error::new(
                ErrorKind::AllocationFailed,
                format!("failed to allocate {size} bytes on device {device}"),
            )
            .with_operation("MemoryManager::allocate")
            .with_context("device", device.to_string())
            .with_context("size", size.to_string())
            .set_source(e)
        })?;

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        self.inner
            .live
            .write()
            .expect("live allocations lock poisoned")
            .insert(ptr, LiveAllocation {
                device,
                len: size,
                generation,
            });
        crate::log_debug!(
            self.inner.logger,
            "allocated {} bytes at {} on device {}",
            size,
            ptr,
            device
        );

        Ok(DeviceBuffer {
            inner: Arc::clone(&self.inner),
            device,
            ptr,
            len: size,
            generation,
            owned: true,
        })
    }

    /// Release `buffer`.
    pub fn free(&self, mut buffer: DeviceBuffer) -> Result<()> {
        buffer.owned = false;
        buffer
            .inner
            .release(buffer.ptr, Some(buffer.generation), "MemoryManager::free")
    }

    /// Release whatever allocation currently lives at `ptr`.
    ///
    /// Any [`DeviceBuffer`] for it becomes stale. Releasing an address twice
    /// returns [`ErrorKind::InvalidHandle`].
    pub fn free_raw(&self, ptr: DevicePtr) -> Result<()> {
        self.inner.release(ptr, None, "MemoryManager::free_raw")
    }

    /// Whether `ptr` is the base of a live allocation.
    pub fn is_live(&self, ptr: DevicePtr) -> bool {
        self.inner
            .live
            .read()
            .expect("live allocations lock poisoned")
            .contains_key(&ptr)
    }

    /// Set `len` bytes of `buffer` starting at `offset` to `value`.
    pub fn fill(&self, buffer: &DeviceBuffer, offset: usize, len: usize, value: u8) -> Result<()> {
        let op = "MemoryManager::fill";
        check_range(buffer, offset, len, op)?;
        self.with_live(buffer.ptr, buffer.generation, op, |alloc| {
            // SAFETY: range checked against the live allocation, which cannot be
            // freed while the registry read lock is held.
            unsafe {
                self.inner
                    .runtime
                    .memset(alloc.device, buffer.ptr.offset(offset), len, value)
            }
        })
    }

    /// Upload `src` into `buffer` at `offset`.
    pub fn write(&self, buffer: &DeviceBuffer, offset: usize, src: &[u8]) -> Result<()> {
        let op = "MemoryManager::write";
        check_range(buffer, offset, src.len(), op)?;
        self.with_live(buffer.ptr, buffer.generation, op, |alloc| {
            // SAFETY: as in `fill`.
            unsafe {
                self.inner
                    .runtime
                    .copy_from_host(alloc.device, buffer.ptr.offset(offset), src)
            }
        })
    }

    /// Copy the start of `buffer` into `dst`, returning the bytes copied
    /// (the shorter of the two lengths).
    pub fn copy_to_host(&self, buffer: &DeviceBuffer, dst: &mut [u8]) -> Result<usize> {
        let n = dst.len().min(buffer.len);
        self.with_live(buffer.ptr, buffer.generation, "MemoryManager::copy_to_host", |alloc| {
            // SAFETY: as in `fill`.
            unsafe {
                self.inner
                    .runtime
                    .copy_to_host(alloc.device, buffer.ptr, &mut dst[..n])
            }
        })?;
        Ok(n)
    }

    /// Compare the first `len` bytes of `buffer` with `window`.
    ///
    /// The window is read with volatile loads, so the answer is only a
    /// snapshot of memory another node may be changing.
    pub fn compare(&self, buffer: &DeviceBuffer, window: &RemoteWindow, len: usize) -> Result<bool> {
        let op = "MemoryManager::compare";
        check_range(buffer, 0, len, op)?;
        if len > window.len() {
            return Err(Error::fabric(StatusCode::OUT_OF_RANGE)
                .with_operation(op)
                .with_context("len", len.to_string())
                .with_context("window", window.len().to_string()));
        }
        let mut local = vec![0u8; len];
        self.copy_to_host(buffer, &mut local)
            .map_err(|e| e.with_operation(op))?;
        let mut remote = vec![0u8; len];
        window.read_volatile(0, &mut remote)?;
        Ok(local == remote)
    }

    /// The DMA address of `buffer`, if it is still live.
    pub fn device_pointer(&self, buffer: &DeviceBuffer) -> Result<DevicePtr> {
        self.with_live(buffer.ptr, buffer.generation, "MemoryManager::device_pointer", |_| {
            Ok(buffer.ptr)
        })
    }

    /// Make device-side memory operations on `ptr` synchronous with DMA
    /// issued by other agents on the bus.
    pub fn mark_sync_required(&self, ptr: DevicePtr) -> Result<()> {
        let op = "MemoryManager::mark_sync_required";
        let live = self.inner.live.read().expect("live allocations lock poisoned");
        if !live.contains_key(&ptr) {
            return Err(Inner::invalid_handle(ptr, op));
        }
        // SAFETY: `ptr` is live and the read lock is held.
        unsafe { self.inner.runtime.set_sync_memops(ptr) }.map_err(|e| e.with_operation(op))
    }

    /// Whether [`mark_sync_required`](Self::mark_sync_required) is in effect for `ptr`.
    pub fn sync_required(&self, ptr: DevicePtr) -> Result<bool> {
        let op = "MemoryManager::sync_required";
        let live = self.inner.live.read().expect("live allocations lock poisoned");
        if !live.contains_key(&ptr) {
            return Err(Inner::invalid_handle(ptr, op));
        }
        // SAFETY: `ptr` is live and the read lock is held.
        unsafe { self.inner.runtime.sync_memops(ptr) }.map_err(|e| e.with_operation(op))
    }

    /// Run `f` while the allocation `ptr`/`generation` is pinned live.
    pub(crate) fn with_live<R>(
        &self,
        ptr: DevicePtr,
        generation: u64,
        operation: &'static str,
        f: impl FnOnce(&LiveAllocation) -> Result<R>,
    ) -> Result<R> {
        let live = self.inner.live.read().expect("live allocations lock poisoned");
        match live.get(&ptr) {
            Some(alloc) if alloc.generation == generation => {
                f(alloc).map_err(|e| e.with_operation(operation))
            }
            _ => Err(Inner::invalid_handle(ptr, operation)),
        }
    }
}

impl fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let live = self.inner.live.read().expect("live allocations lock poisoned");
        f.debug_struct("MemoryManager")
            .field("runtime", &self.inner.runtime.name())
            .field("live_allocations", &live.len())
            .finish()
    }
}

fn check_range(buffer: &DeviceBuffer, offset: usize, len: usize, operation: &'static str) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= buffer.len => Ok(()),
        _ => Err(Error::new(ErrorKind::ConfigInvalid, "range exceeds buffer")
            .with_operation(operation)
            .with_context("offset", offset.to_string())
            .with_context("len", len.to_string())
            .with_context("buffer_len", buffer.len.to_string())),
    }
}

/// An owned device memory allocation. Freed on drop.
pub struct DeviceBuffer {
    inner: Arc<Inner>,
    device: DeviceId,
    ptr: DevicePtr,
    len: usize,
    generation: u64,
    owned: bool,
}

impl DeviceBuffer {
    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The base address, without checking that it is still live.
    pub fn as_device_ptr(&self) -> DevicePtr {
        self.ptr
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        // Already released through `free_raw`: nothing left to do.
        let _ = self.inner.release(self.ptr, Some(self.generation), "DeviceBuffer::drop");
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("device", &self.device)
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::{Fabric, LoopbackFabric};
    use crate::host::HostRuntime;
    use crate::log::{LogSink, Verbosity};

    fn manager() -> (MemoryManager, Arc<HostRuntime>) {
        let runtime = Arc::new(HostRuntime::new(2));
        let (sink, _) = LogSink::memory();
        let mm = MemoryManager::new(runtime.clone(), Logger::new(Verbosity::ERRORS, sink));
        (mm, runtime)
    }

    #[test]
    fn test_info() {
        let (mm, _) = manager();
        assert_eq!(mm.info(1).unwrap().id, 1);
        assert_eq!(mm.info(7).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_allocate_errors() {
        let (mm, _) = manager();
        assert_eq!(mm.allocate(0, 0).unwrap_err().kind(), ErrorKind::ConfigInvalid);
        let err = mm.allocate(9, 4096).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AllocationFailed);
        assert_eq!(err.operation(), "MemoryManager::allocate");
    }

    #[test]
    fn test_drop_frees() {
        let (mm, rt) = manager();
        let buf = mm.allocate(0, 4096).unwrap();
        let ptr = buf.as_device_ptr();
        assert!(mm.is_live(ptr));
        drop(buf);
        assert!(!mm.is_live(ptr));
        assert_eq!(rt.allocation_count(), 0);
    }

    #[test]
    fn test_free_consumes_buffer() {
        let (mm, rt) = manager();
        let buf = mm.allocate(1, 8192).unwrap();
        mm.free(buf).unwrap();
        assert_eq!(rt.allocation_count(), 0);
    }

    #[test]
    fn test_free_raw_twice_is_invalid_handle() {
        let (mm, _) = manager();
        let buf = mm.allocate(0, 4096).unwrap();
        let ptr = buf.as_device_ptr();
        mm.free_raw(ptr).unwrap();
        let err = mm.free_raw(ptr).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidHandle);

        // The stale handle is rejected rather than touching freed memory.
        assert_eq!(mm.fill(&buf, 0, 16, 1).unwrap_err().kind(), ErrorKind::InvalidHandle);
        assert_eq!(mm.device_pointer(&buf).unwrap_err().kind(), ErrorKind::InvalidHandle);
    }

    #[test]
    fn test_stale_buffer_does_not_free_reused_address() {
        let (mm, _) = manager();
        let stale = mm.allocate(0, 4096).unwrap();
        mm.free_raw(stale.as_device_ptr()).unwrap();
        let fresh = mm.allocate(0, 4096).unwrap();
        drop(stale);
        assert!(mm.is_live(fresh.as_device_ptr()));
        mm.fill(&fresh, 0, 4096, 3).unwrap();
    }

    #[test]
    fn test_fill_and_readback() {
        let (mm, _) = manager();
        let buf = mm.allocate(0, 4096).unwrap();
        mm.fill(&buf, 0, 4096, 0x11).unwrap();
        mm.fill(&buf, 100, 50, 0x22).unwrap();
        let mut out = vec![0u8; 4096];
        assert_eq!(mm.copy_to_host(&buf, &mut out).unwrap(), 4096);
        assert!(out[..100].iter().all(|&b| b == 0x11));
        assert!(out[100..150].iter().all(|&b| b == 0x22));
        assert!(out[150..].iter().all(|&b| b == 0x11));

        let err = mm.fill(&buf, 4000, 100, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
    }

    #[test]
    fn test_copy_to_host_short_destination() {
        let (mm, _) = manager();
        let buf = mm.allocate(0, 64).unwrap();
        let mut big = vec![0xffu8; 128];
        assert_eq!(mm.copy_to_host(&buf, &mut big).unwrap(), 64);
        assert!(big[..64].iter().all(|&b| b == 0));
        assert!(big[64..].iter().all(|&b| b == 0xff));
    }

    #[test]
    fn test_compare_against_window() {
        let (mm, _) = manager();
        let fabric = LoopbackFabric::new(0);
        fabric.create_segment(1, 4096).unwrap();
        let window = fabric.connect(0, 1).unwrap();

        let buf = mm.allocate(0, 4096).unwrap();
        assert!(mm.compare(&buf, &window, 4096).unwrap());

        fabric.write_segment(1, 10, &[9]).unwrap();
        assert!(!mm.compare(&buf, &window, 4096).unwrap());
        assert!(mm.compare(&buf, &window, 10).unwrap());

        let err = mm.compare(&buf, &window, 8192).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
    }

    #[test]
    fn test_mark_sync_required() {
        let (mm, _) = manager();
        let buf = mm.allocate(0, 4096).unwrap();
        let ptr = mm.device_pointer(&buf).unwrap();
        assert!(!mm.sync_required(ptr).unwrap());
        mm.mark_sync_required(ptr).unwrap();
        assert!(mm.sync_required(ptr).unwrap());

        let err = mm.mark_sync_required(ptr.offset(1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidHandle);
    }

    #[test]
    fn test_buffer_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<DeviceBuffer>();
        assert_send::<MemoryManager>();
    }
}
