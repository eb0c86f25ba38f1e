//! [`DeviceRuntime`] on the CUDA driver API.
//!
//! Built on cudarc's `result`/`sys` layers rather than its safe slices: the
//! engine needs raw device pointers it can hand to the fabric, pointer
//! attributes, and I/O-memory host registration, none of which the safe API
//! exposes. Each call binds the device's primary context to the calling
//! thread first, so the runtime can be shared across threads.

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::{Arc, Mutex};

use cudarc::driver::{CudaContext, result, sys};

use crate::error::{Error, ErrorKind, Result};
use crate::runtime::{DeviceId, DeviceInfo, DevicePtr, DeviceRuntime};

/// `CU_MEMHOSTREGISTER_DEVICEMAP`: map the range into the device address space.
const HOST_REGISTER_DEVICEMAP: u32 = 0x02;
/// `CU_MEMHOSTREGISTER_IOMEMORY`: the range is PCIe I/O memory, not RAM.
const HOST_REGISTER_IOMEMORY: u32 = 0x04;

/// CUDA driver backed device runtime.
pub struct CudaRuntime {
    contexts: Mutex<HashMap<DeviceId, Arc<CudaContext>>>,
}

impl CudaRuntime {
    /// Initialize the CUDA driver.
    pub fn new() -> Result<Self> {
        result::init().map_err(|e| Error::from(e).with_operation("CudaRuntime::new"))?;
        Ok(Self {
            contexts: Mutex::new(HashMap::new()),
        })
    }

    /// Bind `device`'s context to the calling thread, creating it on first use.
    fn bind(&self, device: DeviceId) -> Result<Arc<CudaContext>> {
        let ctx = {
            let mut contexts = self.contexts.lock().expect("contexts lock poisoned");
            match contexts.get(&device) {
                Some(ctx) => Arc::clone(ctx),
                None => {
                    if device >= self.device_count()? {
                        return Err(no_such_device(device));
                    }
                    let ctx = CudaContext::new(device)?;
                    contexts.insert(device, Arc::clone(&ctx));
                    ctx
                }
            }
        };
        ctx.bind_to_thread()?;
        Ok(ctx)
    }
}

fn no_such_device(device: DeviceId) -> Error {
    Error::new(ErrorKind::NotFound, format!("no CUDA device with id {device}"))
        .with_context("device", device.to_string())
}

fn cuda_call(what: &'static str, status: sys::CUresult) -> Result<()> {
    status
        .result()
        .map_err(|e| Error::from(e).with_context("call", what))
}

impl DeviceRuntime for CudaRuntime {
    fn name(&self) -> &'static str {
        "cuda"
    }

    fn is_emulated(&self) -> bool {
        false
    }

    fn device_count(&self) -> Result<usize> {
        let count = result::device::get_count()
            .map_err(|e| Error::from(e).with_operation("CudaRuntime::device_count"))?;
        Ok(count.max(0) as usize)
    }

    fn info(&self, device: DeviceId) -> Result<DeviceInfo> {
        if device >= self.device_count()? {
            return Err(no_such_device(device).with_operation("CudaRuntime::info"));
        }
        let dev = result::device::get(device as i32)?;
        let name = result::device::get_name(dev)?;
        let attribute = |attr: sys::CUdevice_attribute| -> Result<u32> {
            // SAFETY: `dev` was returned by cuDeviceGet for a valid ordinal.
            let value = unsafe { result::device::get_attribute(dev, attr) }?;
            Ok(value as u32)
        };
        Ok(DeviceInfo {
            id: device,
            name,
            pci_domain: attribute(sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_PCI_DOMAIN_ID)?,
            pci_bus: attribute(sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_PCI_BUS_ID)?,
            pci_device: attribute(sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_PCI_DEVICE_ID)?,
        })
    }

    fn allocate(&self, device: DeviceId, size: usize) -> Result<DevicePtr> {
        self.bind(device)
            .map_err(|e| e.with_operation("CudaRuntime::allocate"))?;
        // SAFETY: a context is bound to this thread.
        let ptr = unsafe { result::malloc_sync(size) }.map_err(|e| {
            Error::new(
                ErrorKind::AllocationFailed,
                format!("cuMemAlloc of {size} bytes failed: {e}"),
            )
            .with_operation("CudaRuntime::allocate")
            .set_source(e)
        })?;
        Ok(DevicePtr(ptr))
    }

    unsafe fn free(&self, device: DeviceId, ptr: DevicePtr) -> Result<()> {
        self.bind(device)?;
        // SAFETY: caller guarantees `ptr` came from `allocate` and is live.
        unsafe { result::free_sync(ptr.0) }
            .map_err(|e| Error::from(e).with_operation("CudaRuntime::free"))
    }

    unsafe fn memset(&self, device: DeviceId, ptr: DevicePtr, len: usize, value: u8) -> Result<()> {
        self.bind(device)?;
        // SAFETY: caller guarantees the range is inside a live allocation.
        unsafe { result::memset_d8_sync(ptr.0, value, len) }
            .map_err(|e| Error::from(e).with_operation("CudaRuntime::memset"))
    }

    unsafe fn copy_to_host(&self, device: DeviceId, src: DevicePtr, dst: &mut [u8]) -> Result<()> {
        self.bind(device)?;
        // SAFETY: caller guarantees `src..src+dst.len()` is live device memory.
        unsafe { result::memcpy_dtoh_sync(dst, src.0) }
            .map_err(|e| Error::from(e).with_operation("CudaRuntime::copy_to_host"))
    }

    unsafe fn copy_from_host(&self, device: DeviceId, dst: DevicePtr, src: &[u8]) -> Result<()> {
        self.bind(device)?;
        // SAFETY: caller guarantees `dst..dst+src.len()` is live device memory.
        unsafe { result::memcpy_htod_sync(dst.0, src) }
            .map_err(|e| Error::from(e).with_operation("CudaRuntime::copy_from_host"))
    }

    unsafe fn copy_device_to_device(
        &self,
        device: DeviceId,
        dst: DevicePtr,
        src: DevicePtr,
        len: usize,
    ) -> Result<()> {
        self.bind(device)?;
        // SAFETY: caller guarantees both ranges are device-visible and disjoint.
        unsafe { result::memcpy_dtod_sync(dst.0, src.0, len) }
            .map_err(|e| Error::from(e).with_operation("CudaRuntime::copy_device_to_device"))
    }

    unsafe fn set_sync_memops(&self, ptr: DevicePtr) -> Result<()> {
        let enable: u32 = 1;
        // SAFETY: `enable` outlives the call; caller guarantees `ptr` is live.
        let status = unsafe {
            sys::cuPointerSetAttribute(
                &enable as *const u32 as *const c_void,
                sys::CUpointer_attribute::CU_POINTER_ATTRIBUTE_SYNC_MEMOPS,
                ptr.0,
            )
        };
        cuda_call("cuPointerSetAttribute", status)
            .map_err(|e| e.with_operation("CudaRuntime::set_sync_memops"))
    }

    unsafe fn sync_memops(&self, ptr: DevicePtr) -> Result<bool> {
        let mut value: u32 = 0;
        // SAFETY: `value` is a valid out-parameter of the attribute's size.
        let status = unsafe {
            sys::cuPointerGetAttribute(
                &mut value as *mut u32 as *mut c_void,
                sys::CUpointer_attribute::CU_POINTER_ATTRIBUTE_SYNC_MEMOPS,
                ptr.0,
            )
        };
        cuda_call("cuPointerGetAttribute", status)
            .map_err(|e| e.with_operation("CudaRuntime::sync_memops"))?;
        Ok(value != 0)
    }

    unsafe fn register_io_memory(
        &self,
        device: DeviceId,
        host: *mut u8,
        len: usize,
    ) -> Result<DevicePtr> {
        self.bind(device)?;
        let flags = HOST_REGISTER_IOMEMORY | HOST_REGISTER_DEVICEMAP;
        // SAFETY: caller guarantees `host..host+len` is a mapped I/O window.
        let status = unsafe { sys::cuMemHostRegister_v2(host as *mut c_void, len, flags) };
        cuda_call("cuMemHostRegister", status)
            .map_err(|e| e.with_operation("CudaRuntime::register_io_memory"))?;

        let mut dev_ptr: sys::CUdeviceptr = 0;
        // SAFETY: `host` was registered with DEVICEMAP just above.
        let status =
            unsafe { sys::cuMemHostGetDevicePointer_v2(&mut dev_ptr, host as *mut c_void, 0) };
        if let Err(e) = cuda_call("cuMemHostGetDevicePointer", status) {
            // SAFETY: undo the registration made above.
            let _ = unsafe { sys::cuMemHostUnregister(host as *mut c_void) };
            return Err(e.with_operation("CudaRuntime::register_io_memory"));
        }
        Ok(DevicePtr(dev_ptr))
    }

    unsafe fn unregister_io_memory(&self, device: DeviceId, host: *mut u8) -> Result<()> {
        self.bind(device)?;
        // SAFETY: caller guarantees `host` was registered on this runtime.
        let status = unsafe { sys::cuMemHostUnregister(host as *mut c_void) };
        cuda_call("cuMemHostUnregister", status)
            .map_err(|e| e.with_operation("CudaRuntime::unregister_io_memory"))
    }
}

impl std::fmt::Debug for CudaRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bound: Vec<_> = self
            .contexts
            .lock()
            .expect("contexts lock poisoned")
            .keys()
            .copied()
            .collect();
        f.debug_struct("CudaRuntime").field("contexts", &bound).finish()
    }
}
