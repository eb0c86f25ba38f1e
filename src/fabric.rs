//! The interconnect seam.
//!
//! A [`Fabric`] connects to a segment exported by another node and maps it
//! into the local address space as a [`RemoteWindow`]. Access through the
//! window is bracketed by an error-checking sequence: the fabric driver
//! reports link or remote-side failures only when the sequence is checked,
//! not at the faulting load or store.
//!
//! [`LoopbackFabric`] serves segments from this process's own memory and
//! can inject failures, so the transfer path is testable without an adapter.
//! The Dolphin driver binding lives in `crate::sisci` behind the `sisci`
//! feature.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::align::{align_up, page_size};
use crate::error::{Error, Result};
use crate::status::StatusCode;

/// Fabric-assigned node identifier.
pub type NodeId = u32;
/// Segment identifier, unique per exporting node.
pub type SegmentId = u32;

/// Domain shared by every handle onto the physical interconnect.
pub const INTERCONNECT_DOMAIN: u64 = 0;

static NEXT_LOOPBACK_DOMAIN: AtomicU64 = AtomicU64::new(INTERCONNECT_DOMAIN + 1);

/// Process-wide identity of an exported region.
///
/// Node and segment ids are only unique within a domain: all handles onto
/// the real interconnect share [`INTERCONNECT_DOMAIN`], while each
/// [`LoopbackFabric`] is a domain of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionKey {
    pub domain: u64,
    pub node: NodeId,
    pub segment: SegmentId,
}

impl fmt::Display for RegionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "segment {} on node {}", self.segment, self.node)
    }
}

/// A remote segment mapped into this process.
///
/// # Safety
///
/// Implementors must keep `base()..base()+len()` mapped and writable for the
/// lifetime of the value.
pub unsafe trait MappedSegment: Send + Sync {
    /// First byte of the mapping.
    fn base(&self) -> *mut u8;

    /// Mapped length in bytes.
    fn len(&self) -> usize;

    /// Begin an error-checked access sequence.
    fn start_sequence(&self) -> Result<()>;

    /// Report any error raised since the matching [`start_sequence`](Self::start_sequence).
    fn check_sequence(&self) -> Result<()>;
}

/// Mapped view of a segment on another node.
///
/// The contents may change underneath us at any time, so the window is
/// only ever accessed through volatile loads and stores or by DMA.
pub struct RemoteWindow {
    region: RegionKey,
    mapping: Box<dyn MappedSegment>,
}

impl RemoteWindow {
    /// Wrap a mapping of `region`.
    pub fn new(region: RegionKey, mapping: Box<dyn MappedSegment>) -> Self {
        Self { region, mapping }
    }

    pub fn region(&self) -> RegionKey {
        self.region
    }

    pub fn node(&self) -> NodeId {
        self.region.node
    }

    pub fn segment(&self) -> SegmentId {
        self.region.segment
    }

    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Local address of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.mapping.base()
    }

    pub fn start_sequence(&self) -> Result<()> {
        self.mapping.start_sequence()
    }

    pub fn check_sequence(&self) -> Result<()> {
        self.mapping.check_sequence()
    }

    fn check_range(&self, offset: usize, len: usize, operation: &'static str) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len() => Ok(()),
            _ => Err(Error::fabric(StatusCode::OUT_OF_RANGE)
                .with_operation(operation)
                .with_context("offset", offset.to_string())
                .with_context("len", len.to_string())
                .with_context("window", self.len().to_string())),
        }
    }

    /// Volatile byte-wise read of `dst.len()` bytes at `offset`.
    pub fn read_volatile(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check_range(offset, dst.len(), "RemoteWindow::read_volatile")?;
        let base = self.as_ptr();
        for (i, byte) in dst.iter_mut().enumerate() {
            // SAFETY: range checked; the mapping is live while `self` is.
            *byte = unsafe { base.add(offset + i).read_volatile() };
        }
        Ok(())
    }

    /// Volatile byte-wise write of `src` at `offset`.
    pub fn write_volatile(&self, offset: usize, src: &[u8]) -> Result<()> {
        self.check_range(offset, src.len(), "RemoteWindow::write_volatile")?;
        let base = self.as_ptr();
        for (i, &byte) in src.iter().enumerate() {
            // SAFETY: range checked; the mapping is live while `self` is.
            unsafe { base.add(offset + i).write_volatile(byte) };
        }
        Ok(())
    }

    /// Volatile fill of `len` bytes at `offset` with `value`.
    pub fn fill_volatile(&self, offset: usize, len: usize, value: u8) -> Result<()> {
        self.check_range(offset, len, "RemoteWindow::fill_volatile")?;
        let base = self.as_ptr();
        for i in 0..len {
            // SAFETY: range checked; the mapping is live while `self` is.
            unsafe { base.add(offset + i).write_volatile(value) };
        }
        Ok(())
    }
}

impl fmt::Debug for RemoteWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteWindow")
            .field("region", &self.region)
            .field("base", &self.as_ptr())
            .field("len", &self.len())
            .finish()
    }
}

/// Connects to remote segments.
pub trait Fabric {
    /// This node's identifier on the fabric.
    fn local_node(&self) -> NodeId;

    /// Namespace the node and segment ids of this fabric live in.
    fn domain(&self) -> u64;

    /// Connect to `segment` exported by `node` and map it.
    fn connect(&self, node: NodeId, segment: SegmentId) -> Result<RemoteWindow>;

    /// Identity of `segment` on `node` as seen through this fabric.
    fn region(&self, node: NodeId, segment: SegmentId) -> RegionKey {
        RegionKey {
            domain: self.domain(),
            node,
            segment,
        }
    }
}

/// Page-aligned memory standing in for an exported segment.
struct LoopbackSegment {
    mem: *mut u8,
    len: usize,
    fault: Mutex<Option<StatusCode>>,
    link_down: AtomicBool,
}

// SAFETY: `mem` is owned by the segment and only accessed through volatile
// operations, DMA, or the peer helpers below.
unsafe impl Send for LoopbackSegment {}
unsafe impl Sync for LoopbackSegment {}

impl LoopbackSegment {
    fn new(size: usize) -> Result<Self> {
        let len = align_up(size, page_size());
        let mut ptr: *mut libc::c_void = std::ptr::null_mut();
        // SAFETY: page_size() is a valid posix_memalign alignment.
        let ret = unsafe { libc::posix_memalign(&mut ptr, page_size(), len) };
        if ret != 0 {
            return Err(Error::fabric(StatusCode::NOSPC)
                .with_operation("LoopbackFabric::create_segment")
                .set_source(std::io::Error::from_raw_os_error(ret)));
        }
        // SAFETY: fresh block of `len` bytes.
        unsafe { std::ptr::write_bytes(ptr as *mut u8, 0, len) };
        Ok(Self {
            mem: ptr as *mut u8,
            len,
            fault: Mutex::new(None),
            link_down: AtomicBool::new(false),
        })
    }

    fn link_status(&self) -> Result<()> {
        if self.link_down.load(Ordering::Acquire) {
            return Err(Error::fabric(StatusCode::NO_LINK_ACCESS));
        }
        Ok(())
    }
}

impl Drop for LoopbackSegment {
    fn drop(&mut self) {
        // SAFETY: `mem` came from posix_memalign and nothing maps it any more.
        unsafe { libc::free(self.mem as *mut libc::c_void) };
    }
}

struct LoopbackMapping {
    segment: Arc<LoopbackSegment>,
}

// SAFETY: the Arc keeps the segment memory alive as long as the mapping.
unsafe impl MappedSegment for LoopbackMapping {
    fn base(&self) -> *mut u8 {
        self.segment.mem
    }

    fn len(&self) -> usize {
        self.segment.len
    }

    fn start_sequence(&self) -> Result<()> {
        self.segment
            .link_status()
            .map_err(|e| e.with_operation("LoopbackFabric::start_sequence"))
    }

    fn check_sequence(&self) -> Result<()> {
        self.segment
            .link_status()
            .map_err(|e| e.with_operation("LoopbackFabric::check_sequence"))?;
        let fault = self.segment.fault.lock().expect("fault lock poisoned").take();
        match fault {
            Some(code) => {
                Err(Error::fabric(code).with_operation("LoopbackFabric::check_sequence"))
            }
            None => Ok(()),
        }
    }
}

/// In-process fabric whose "remote" segments live in local memory.
///
/// The test harness plays the exporting peer through
/// [`write_segment`](Self::write_segment) and [`read_segment`](Self::read_segment).
#[derive(Clone)]
pub struct LoopbackFabric {
    node: NodeId,
    domain: u64,
    segments: Arc<Mutex<HashMap<SegmentId, Arc<LoopbackSegment>>>>,
}

impl LoopbackFabric {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            domain: NEXT_LOOPBACK_DOMAIN.fetch_add(1, Ordering::Relaxed),
            segments: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Export a zeroed segment of at least `size` bytes (rounded up to a page).
    pub fn create_segment(&self, id: SegmentId, size: usize) -> Result<()> {
        if size == 0 {
            return Err(Error::fabric(StatusCode::SIZE_ALIGNMENT)
                .with_operation("LoopbackFabric::create_segment"));
        }
        let mut segments = self.segments.lock().expect("segments lock poisoned");
        if segments.contains_key(&id) {
            return Err(Error::fabric(StatusCode::SEGMENTID_USED)
                .with_operation("LoopbackFabric::create_segment")
                .with_context("segment", id.to_string()));
        }
        segments.insert(id, Arc::new(LoopbackSegment::new(size)?));
        Ok(())
    }

    /// Stop exporting `id`. Existing mappings stay valid until dropped.
    pub fn remove_segment(&self, id: SegmentId) -> Result<()> {
        self.segments
            .lock()
            .expect("segments lock poisoned")
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| self.no_such_segment(id, "LoopbackFabric::remove_segment"))
    }

    /// Make the next [`check_sequence`](MappedSegment::check_sequence) on `id` fail with `code`.
    pub fn inject_fault(&self, id: SegmentId, code: StatusCode) -> Result<()> {
        let segment = self.segment(id, "LoopbackFabric::inject_fault")?;
        *segment.fault.lock().expect("fault lock poisoned") = Some(code);
        Ok(())
    }

    /// Take the link to `id` down (or back up).
    pub fn set_link_down(&self, id: SegmentId, down: bool) -> Result<()> {
        let segment = self.segment(id, "LoopbackFabric::set_link_down")?;
        segment.link_down.store(down, Ordering::Release);
        Ok(())
    }

    /// Read segment contents as the exporting node sees them.
    pub fn read_segment(&self, id: SegmentId, offset: usize, dst: &mut [u8]) -> Result<()> {
        let window = self.map(id, "LoopbackFabric::read_segment")?;
        window.read_volatile(offset, dst)
    }

    /// Write segment contents as the exporting node.
    pub fn write_segment(&self, id: SegmentId, offset: usize, src: &[u8]) -> Result<()> {
        let window = self.map(id, "LoopbackFabric::write_segment")?;
        window.write_volatile(offset, src)
    }

    fn segment(&self, id: SegmentId, operation: &'static str) -> Result<Arc<LoopbackSegment>> {
        self.segments
            .lock()
            .expect("segments lock poisoned")
            .get(&id)
            .cloned()
            .ok_or_else(|| self.no_such_segment(id, operation))
    }

    fn map(&self, id: SegmentId, operation: &'static str) -> Result<RemoteWindow> {
        let segment = self.segment(id, operation)?;
        Ok(RemoteWindow::new(
            self.region(self.node, id),
            Box::new(LoopbackMapping { segment }),
        ))
    }

    fn no_such_segment(&self, id: SegmentId, operation: &'static str) -> Error {
        Error::fabric(StatusCode::NO_SUCH_SEGMENT)
            .with_operation(operation)
            .with_context("node", self.node.to_string())
            .with_context("segment", id.to_string())
    }
}

impl Fabric for LoopbackFabric {
    fn local_node(&self) -> NodeId {
        self.node
    }

    fn domain(&self) -> u64 {
        self.domain
    }

    fn connect(&self, node: NodeId, segment: SegmentId) -> Result<RemoteWindow> {
        if node != self.node {
            return Err(Error::fabric(StatusCode::NO_SUCH_NODEID)
                .with_operation("LoopbackFabric::connect")
                .with_context("node", node.to_string()));
        }
        self.map(segment, "LoopbackFabric::connect")
    }
}

impl fmt::Debug for LoopbackFabric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self
            .segments
            .lock()
            .expect("segments lock poisoned")
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        f.debug_struct("LoopbackFabric")
            .field("node", &self.node)
            .field("domain", &self.domain)
            .field("segments", &ids)
            .finish()
    }
}
