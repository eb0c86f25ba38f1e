//! Remote DMA transfer engine.
//!
//! [`TransferEngine::prepare_transfer`] binds a mapped [`RemoteWindow`] to a
//! [`DeviceBuffer`]: the window is validated against the DMA alignment, the
//! buffer is marked sync-required, and the window is registered with the
//! device runtime so the GPU can address it directly. The resulting
//! [`RemoteSegment`] is the handle every copy goes through.
//!
//! # Transfer sequence
//!
//! 1. Zero the destination if `clear` is set.
//! 2. Start the fabric's error-checking sequence.
//! 3. Copy device-to-device between the buffer and the registered window.
//! 4. Check the sequence. A fabric error here means the data may not have
//!    arrived intact.
//!
//! On failure the destination is zeroed again when `clear` is set, so a
//! cleared transfer either delivers all `len` bytes or leaves zeros. Nothing
//! is retried here; transient fabric codes come back as
//! [`ErrorStatus::Temporary`](crate::ErrorStatus::Temporary).

use std::collections::BTreeSet;
use std::fmt;
use std::ops::BitOr;
use std::sync::{Mutex, MutexGuard};

use crate::align::check_dma_window;
use crate::config::Config;
use crate::error::{Error, ErrorKind, Result};
use crate::fabric::{RegionKey, RemoteWindow};
use crate::log::Logger;
use crate::memory::{DeviceBuffer, MemoryManager};
use crate::runtime::{DeviceId, DevicePtr};
use crate::status::StatusCode;

/// Access the local side is granted on a remote segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentFlags(u32);

impl SegmentFlags {
    /// Remote-to-local copies are allowed.
    pub const READ: SegmentFlags = SegmentFlags(0x1);
    /// Local-to-remote copies are allowed.
    pub const WRITE: SegmentFlags = SegmentFlags(0x2);

    pub fn contains(self, other: SegmentFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl Default for SegmentFlags {
    fn default() -> Self {
        SegmentFlags::READ | SegmentFlags::WRITE
    }
}

impl BitOr for SegmentFlags {
    type Output = SegmentFlags;

    fn bitor(self, rhs: SegmentFlags) -> SegmentFlags {
        SegmentFlags(self.0 | rhs.0)
    }
}

/// Synchronization attribute of the buffer behind a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Unsynchronized,
    /// Device memory operations are synchronous with respect to fabric DMA.
    SyncRequired,
}

/// Which way a transfer moves data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Remote window into the device buffer.
    RemoteToLocal,
    /// Device buffer into the remote window.
    LocalToRemote,
}

impl Direction {
    fn required_flag(self) -> SegmentFlags {
        match self {
            Direction::RemoteToLocal => SegmentFlags::READ,
            Direction::LocalToRemote => SegmentFlags::WRITE,
        }
    }

    fn operation(self) -> &'static str {
        match self {
            Direction::RemoteToLocal => "TransferEngine::copy_remote_to_local",
            Direction::LocalToRemote => "TransferEngine::copy_local_to_remote",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::RemoteToLocal => f.write_str("remote-to-local"),
            Direction::LocalToRemote => f.write_str("local-to-remote"),
        }
    }
}

/// One directional copy request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub direction: Direction,
    pub len: usize,
    /// Zero the destination first, and again if the copy fails.
    pub clear: bool,
}

impl Transfer {
    pub fn remote_to_local(len: usize) -> Self {
        Self {
            direction: Direction::RemoteToLocal,
            len,
            clear: false,
        }
    }

    pub fn local_to_remote(len: usize) -> Self {
        Self {
            direction: Direction::LocalToRemote,
            len,
            clear: false,
        }
    }

    pub fn with_clear(mut self, clear: bool) -> Self {
        self.clear = clear;
        self
    }
}

/// Regions currently bound by any engine in the process.
static BOUND_REGIONS: Mutex<BTreeSet<RegionKey>> = Mutex::new(BTreeSet::new());

fn bound_regions() -> MutexGuard<'static, BTreeSet<RegionKey>> {
    BOUND_REGIONS.lock().expect("bound regions lock poisoned")
}

/// Binds remote windows to device buffers and moves data between them.
#[derive(Clone)]
pub struct TransferEngine {
    memory: MemoryManager,
    alignment: usize,
    logger: Logger,
}

impl TransferEngine {
    /// Create an engine on `memory`, using the DMA alignment from [`Config`].
    pub fn new(memory: MemoryManager) -> Self {
        let logger = memory.logger().clone();
        Self {
            memory,
            alignment: Config::get().dma_alignment,
            logger,
        }
    }

    /// Override the required window alignment.
    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Whether `region` is bound by any engine in this process.
    pub fn is_bound(region: RegionKey) -> bool {
        bound_regions().contains(&region)
    }

    /// Bind `window` to `buffer` for DMA.
    pub fn prepare_transfer(
        &self,
        buffer: &DeviceBuffer,
        flags: SegmentFlags,
        window: RemoteWindow,
    ) -> Result<RemoteSegment> {
        let op = "TransferEngine::prepare_transfer";
        let buffer_ptr = self
            .memory
            .device_pointer(buffer)
            .map_err(|e| e.with_operation(op))?;
        check_dma_window(window.as_ptr() as usize, window.len(), self.alignment)
            .map_err(|e| e.with_operation(op))?;
        if buffer.len() < window.len() {
            return Err(Error::new(
                ErrorKind::ConfigInvalid,
                "device buffer is smaller than the remote window",
            )
            .with_fabric_status(StatusCode::OUT_OF_RANGE)
            .with_operation(op)
            .with_context("buffer_len", buffer.len().to_string())
            .with_context("window_len", window.len().to_string()));
        }

        let key = window.region();
        if !bound_regions().insert(key) {
            return Err(Error::new(ErrorKind::AlreadyBound, "remote segment is already bound")
                .with_operation(op)
                .with_context("node", key.node.to_string())
                .with_context("segment", key.segment.to_string()));
        }

        let registered = self.memory.mark_sync_required(buffer_ptr).and_then(|()| {
            // SAFETY: the window keeps its mapping alive until the segment is
            // dropped, which unregisters it first.
            unsafe {
                self.memory
                    .runtime()
                    .register_io_memory(buffer.device(), window.as_ptr(), window.len())
            }
        });
        let remote_ptr = match registered {
            Ok(ptr) => ptr,
            Err(e) => {
                bound_regions().remove(&key);
                return Err(e.with_operation(op));
            }
        };

        crate::log_info!(
            self.logger,
            "bound {} ({} bytes) to device {}",
            key,
            window.len(),
            buffer.device()
        );
        crate::log_debug!(
            self.logger,
            "window {:p} registered as {}, local buffer {}",
            window.as_ptr(),
            remote_ptr,
            buffer_ptr
        );

        Ok(RemoteSegment {
            window,
            device: buffer.device(),
            buffer_ptr,
            buffer_generation: buffer.generation(),
            buffer_len: buffer.len(),
            remote_ptr,
            flags,
            sync: SyncState::SyncRequired,
            memory: self.memory.clone(),
            logger: self.logger.clone(),
            released: false,
        })
    }

    /// Copy `len` bytes from the remote window into the bound buffer.
    pub fn copy_remote_to_local(&self, segment: &mut RemoteSegment, len: usize, clear: bool) -> Result<u64> {
        self.transfer(segment, Transfer::remote_to_local(len).with_clear(clear))
    }

    /// Copy `len` bytes from the bound buffer into the remote window.
    pub fn copy_local_to_remote(&self, segment: &mut RemoteSegment, len: usize, clear: bool) -> Result<u64> {
        self.transfer(segment, Transfer::local_to_remote(len).with_clear(clear))
    }

    /// Execute `transfer` on `segment`, returning the number of bytes moved.
    pub fn transfer(&self, segment: &mut RemoteSegment, transfer: Transfer) -> Result<u64> {
        let op = transfer.direction.operation();
        if transfer.len == 0 {
            return Ok(0);
        }
        if transfer.len > segment.window.len() || transfer.len > segment.buffer_len {
            return Err(Error::fabric(StatusCode::OUT_OF_RANGE)
                .with_operation(op)
                .with_context("len", transfer.len.to_string())
                .with_context("window", segment.window.len().to_string())
                .with_context("buffer", segment.buffer_len.to_string()));
        }
        if !segment.flags.contains(transfer.direction.required_flag()) {
            return Err(Error::fabric(StatusCode::ACCESS)
                .with_operation(op)
                .with_context("direction", transfer.direction.to_string()));
        }

        let seg = &*segment;
        seg.memory
            .with_live(seg.buffer_ptr, seg.buffer_generation, op, |_| {
                self.execute(seg, transfer)
            })
            .map(|n| n as u64)
    }

    /// Host-staged copy of the start of `buffer` into `dst`.
    pub fn copy_device_to_host(&self, buffer: &DeviceBuffer, dst: &mut [u8]) -> Result<usize> {
        self.memory
            .copy_to_host(buffer, dst)
            .map_err(|e| e.with_operation("TransferEngine::copy_device_to_host"))
    }

    /// Must run while the local buffer is pinned live.
    fn execute(&self, seg: &RemoteSegment, transfer: Transfer) -> Result<usize> {
        let len = transfer.len;
        let (dst, src) = match transfer.direction {
            Direction::RemoteToLocal => (seg.buffer_ptr, seg.remote_ptr),
            Direction::LocalToRemote => (seg.remote_ptr, seg.buffer_ptr),
        };
        crate::log_debug!(
            self.logger,
            "{} copy of {} bytes, {} -> {}, clear={}",
            transfer.direction,
            len,
            src,
            dst,
            transfer.clear
        );

        let result = (|| {
            if transfer.clear {
                self.clear_destination(seg, transfer)?;
            }
            seg.window.start_sequence()?;
            // SAFETY: both ranges are `len` bytes inside the pinned buffer and
            // the registered window.
            unsafe {
                seg.memory
                    .runtime()
                    .copy_device_to_device(seg.device, dst, src, len)?
            };
            seg.window.check_sequence()
        })();

        match result {
            Ok(()) => Ok(len),
            Err(err) => {
                if transfer.clear {
                    if let Err(e) = self.clear_destination(seg, transfer) {
                        crate::log_debug!(self.logger, "re-clearing destination failed: {}", e.message());
                    }
                }
                crate::log_warn!(
                    self.logger,
                    "{} transfer of {} bytes on segment {} failed: {}",
                    transfer.direction,
                    len,
                    seg.window.segment(),
                    err.message()
                );
                Err(err
                    .with_context("segment", seg.window.segment().to_string())
                    .with_context("len", len.to_string()))
            }
        }
    }

    fn clear_destination(&self, seg: &RemoteSegment, transfer: Transfer) -> Result<()> {
        match transfer.direction {
            // SAFETY: the buffer is pinned live by the caller.
            Direction::RemoteToLocal => unsafe {
                seg.memory
                    .runtime()
                    .memset(seg.device, seg.buffer_ptr, transfer.len, 0)
            },
            Direction::LocalToRemote => seg.window.fill_volatile(0, transfer.len, 0),
        }
    }
}

impl fmt::Debug for TransferEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferEngine")
            .field("memory", &self.memory)
            .field("alignment", &self.alignment)
            .finish()
    }
}

/// A remote window bound to a device buffer.
///
/// Dropping the segment unregisters the window and frees its slot.
pub struct RemoteSegment {
    window: RemoteWindow,
    device: DeviceId,
    buffer_ptr: DevicePtr,
    buffer_generation: u64,
    buffer_len: usize,
    remote_ptr: DevicePtr,
    flags: SegmentFlags,
    sync: SyncState,
    memory: MemoryManager,
    logger: Logger,
    released: bool,
}

impl RemoteSegment {
    pub fn window(&self) -> &RemoteWindow {
        &self.window
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn flags(&self) -> SegmentFlags {
        self.flags
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync
    }

    /// Device-side address of the registered window.
    pub fn remote_device_ptr(&self) -> DevicePtr {
        self.remote_ptr
    }

    /// Local buffer this segment copies to and from.
    pub fn local_device_ptr(&self) -> DevicePtr {
        self.buffer_ptr
    }

    /// Unbind now and report any failure, instead of on drop.
    pub fn release(mut self) -> Result<()> {
        self.unbind()
    }

    fn unbind(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        bound_regions().remove(&self.window.region());
        // SAFETY: registered in `prepare_transfer` and not yet unregistered.
        unsafe {
            self.memory
                .runtime()
                .unregister_io_memory(self.device, self.window.as_ptr())
        }
        .map_err(|e| e.with_operation("RemoteSegment::release"))?;
        crate::log_info!(self.logger, "released {}", self.window.region());
        Ok(())
    }
}

impl Drop for RemoteSegment {
    fn drop(&mut self) {
        if let Err(e) = self.unbind() {
            crate::log_warn!(self.logger, "unbinding segment failed: {}", e);
        }
    }
}

impl fmt::Debug for RemoteSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSegment")
            .field("window", &self.window)
            .field("device", &self.device)
            .field("buffer_ptr", &self.buffer_ptr)
            .field("remote_ptr", &self.remote_ptr)
            .field("flags", &self.flags)
            .field("sync", &self.sync)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::{Fabric, LoopbackFabric};
    use crate::host::HostRuntime;
    use crate::log::{LogSink, MemoryLog, Verbosity};
    use std::sync::Arc;

    const PAGE: usize = 4096;

    fn setup(verbosity: Verbosity) -> (TransferEngine, LoopbackFabric, MemoryLog) {
        let (sink, out) = LogSink::memory();
        let memory = MemoryManager::new(
            Arc::new(HostRuntime::default()),
            Logger::new(verbosity, sink),
        );
        let engine = TransferEngine::new(memory).with_alignment(PAGE);
        (engine, LoopbackFabric::new(0), out)
    }

    #[test]
    fn test_flags() {
        let rw = SegmentFlags::default();
        assert!(rw.contains(SegmentFlags::READ));
        assert!(rw.contains(SegmentFlags::WRITE));
        assert!(!SegmentFlags::READ.contains(SegmentFlags::WRITE));
        assert_eq!(rw.bits(), 3);
    }

    #[test]
    fn test_prepare_marks_sync_and_registers() {
        let (engine, fabric, _) = setup(Verbosity::ERRORS);
        fabric.create_segment(1, 2 * PAGE).unwrap();
        let buffer = engine.memory().allocate(0, 2 * PAGE).unwrap();
        let window = fabric.connect(0, 1).unwrap();

        let seg = engine
            .prepare_transfer(&buffer, SegmentFlags::default(), window)
            .unwrap();
        assert_eq!(seg.sync_state(), SyncState::SyncRequired);
        assert!(engine.memory().sync_required(buffer.as_device_ptr()).unwrap());
        assert!(TransferEngine::is_bound(fabric.region(0, 1)));
        assert_eq!(seg.len(), 2 * PAGE);

        drop(seg);
        assert!(!TransferEngine::is_bound(fabric.region(0, 1)));
    }

    #[test]
    fn test_buffer_smaller_than_window() {
        let (engine, fabric, _) = setup(Verbosity::ERRORS);
        fabric.create_segment(1, 2 * PAGE).unwrap();
        let buffer = engine.memory().allocate(0, PAGE).unwrap();
        let err = engine
            .prepare_transfer(&buffer, SegmentFlags::default(), fabric.connect(0, 1).unwrap())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
        assert_eq!(err.fabric_status(), Some(StatusCode::OUT_OF_RANGE));
        assert_eq!(err.message(), "device buffer is smaller than the remote window");
        assert!(!TransferEngine::is_bound(fabric.region(0, 1)));
    }

    #[test]
    fn test_zero_length_transfer() {
        let (engine, fabric, _) = setup(Verbosity::ERRORS);
        fabric.create_segment(1, PAGE).unwrap();
        let buffer = engine.memory().allocate(0, PAGE).unwrap();
        let mut seg = engine
            .prepare_transfer(&buffer, SegmentFlags::default(), fabric.connect(0, 1).unwrap())
            .unwrap();
        assert_eq!(engine.copy_remote_to_local(&mut seg, 0, true).unwrap(), 0);
    }

    #[test]
    fn test_length_beyond_window() {
        let (engine, fabric, _) = setup(Verbosity::ERRORS);
        fabric.create_segment(1, PAGE).unwrap();
        let buffer = engine.memory().allocate(0, PAGE).unwrap();
        let mut seg = engine
            .prepare_transfer(&buffer, SegmentFlags::default(), fabric.connect(0, 1).unwrap())
            .unwrap();
        let err = engine.copy_local_to_remote(&mut seg, PAGE + 1, false).unwrap_err();
        assert_eq!(err.fabric_status(), Some(StatusCode::OUT_OF_RANGE));
    }

    #[test]
    fn test_flags_gate_direction() {
        let (engine, fabric, _) = setup(Verbosity::ERRORS);
        fabric.create_segment(1, PAGE).unwrap();
        let buffer = engine.memory().allocate(0, PAGE).unwrap();
        let mut seg = engine
            .prepare_transfer(&buffer, SegmentFlags::READ, fabric.connect(0, 1).unwrap())
            .unwrap();
        engine.copy_remote_to_local(&mut seg, PAGE, false).unwrap();
        let err = engine.copy_local_to_remote(&mut seg, PAGE, false).unwrap_err();
        assert_eq!(err.fabric_status(), Some(StatusCode::ACCESS));
    }

    #[test]
    fn test_remote_to_local_moves_data() {
        let (engine, fabric, _) = setup(Verbosity::ERRORS);
        fabric.create_segment(1, PAGE).unwrap();
        let pattern: Vec<u8> = (0..PAGE).map(|i| (i % 251) as u8).collect();
        fabric.write_segment(1, 0, &pattern).unwrap();

        let buffer = engine.memory().allocate(0, PAGE).unwrap();
        let mut seg = engine
            .prepare_transfer(&buffer, SegmentFlags::default(), fabric.connect(0, 1).unwrap())
            .unwrap();
        assert_eq!(engine.copy_remote_to_local(&mut seg, PAGE, false).unwrap(), PAGE as u64);

        let mut out = vec![0u8; PAGE];
        engine.copy_device_to_host(&buffer, &mut out).unwrap();
        assert_eq!(out, pattern);
    }

    #[test]
    fn test_failed_cleared_copy_leaves_zeros() {
        let (engine, fabric, _) = setup(Verbosity::ERRORS);
        fabric.create_segment(1, PAGE).unwrap();
        fabric.write_segment(1, 0, &vec![0x5a; PAGE]).unwrap();
        let buffer = engine.memory().allocate(0, PAGE).unwrap();
        engine.memory().fill(&buffer, 0, PAGE, 0xee).unwrap();

        let mut seg = engine
            .prepare_transfer(&buffer, SegmentFlags::default(), fabric.connect(0, 1).unwrap())
            .unwrap();
        fabric.inject_fault(1, StatusCode::TRANSFER_FAILED).unwrap();
        let err = engine.copy_remote_to_local(&mut seg, PAGE, true).unwrap_err();
        assert_eq!(err.fabric_status(), Some(StatusCode::TRANSFER_FAILED));
        assert_eq!(err.operation(), "TransferEngine::copy_remote_to_local");

        let mut out = vec![0xffu8; PAGE];
        engine.copy_device_to_host(&buffer, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_failed_uncleared_copy_is_reported() {
        let (engine, fabric, _) = setup(Verbosity::ERRORS);
        fabric.create_segment(1, PAGE).unwrap();
        let buffer = engine.memory().allocate(0, PAGE).unwrap();
        let mut seg = engine
            .prepare_transfer(&buffer, SegmentFlags::default(), fabric.connect(0, 1).unwrap())
            .unwrap();
        fabric.inject_fault(1, StatusCode::TIMEOUT).unwrap();
        let err = engine.copy_local_to_remote(&mut seg, PAGE, false).unwrap_err();
        assert!(err.is_temporary());
        // The fault was one-shot.
        assert_eq!(engine.copy_local_to_remote(&mut seg, PAGE, false).unwrap(), PAGE as u64);
    }

    #[test]
    fn test_failure_logged_on_warning_channel() {
        let (engine, fabric, out) = setup(Verbosity::WARNINGS);
        fabric.create_segment(1, PAGE).unwrap();
        let buffer = engine.memory().allocate(0, PAGE).unwrap();
        let mut seg = engine
            .prepare_transfer(&buffer, SegmentFlags::default(), fabric.connect(0, 1).unwrap())
            .unwrap();
        fabric.set_link_down(1, true).unwrap();
        engine.copy_remote_to_local(&mut seg, PAGE, false).unwrap_err();

        let text = out.contents();
        assert_eq!(text.lines().count(), 1);
        assert!(text.starts_with("WARNING: remote-to-local transfer of 4096 bytes on segment 1 failed"));
        assert!(text.contains("Local link is not operational"));
    }

    #[test]
    fn test_release_reports_and_unbinds() {
        let (engine, fabric, _) = setup(Verbosity::ERRORS);
        fabric.create_segment(1, PAGE).unwrap();
        let buffer = engine.memory().allocate(0, PAGE).unwrap();
        let seg = engine
            .prepare_transfer(&buffer, SegmentFlags::default(), fabric.connect(0, 1).unwrap())
            .unwrap();
        seg.release().unwrap();
        assert!(!TransferEngine::is_bound(fabric.region(0, 1)));
        engine
            .prepare_transfer(&buffer, SegmentFlags::default(), fabric.connect(0, 1).unwrap())
            .unwrap();
    }
}
