//! [`Fabric`] on Dolphin's SISCI API.
//!
//! Only the calls needed to connect to, map, and error-check a remote
//! segment are bound. Requires `libsisci` at link time.

use std::hint;
use std::ptr;
use std::sync::Arc;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::fabric::{Fabric, INTERCONNECT_DOMAIN, MappedSegment, NodeId, RemoteWindow, SegmentId};
use crate::status::StatusCode;

#[allow(non_camel_case_types)]
mod ffi {
    use std::ffi::c_void;

    pub type sci_error_t = u32;
    pub type sci_desc_t = *mut c_void;
    pub type sci_remote_segment_t = *mut c_void;
    pub type sci_map_t = *mut c_void;
    pub type sci_sequence_t = *mut c_void;
    pub type sci_cb_remote_segment_t = Option<unsafe extern "C" fn()>;

    pub const SCI_INFINITE_TIMEOUT: u32 = 0xffff_ffff;

    pub const SCI_SEQ_OK: u32 = 0;
    pub const SCI_SEQ_RETRIABLE: u32 = 1;
    pub const SCI_SEQ_PENDING: u32 = 3;

    #[link(name = "sisci")]
    unsafe extern "C" {
        pub fn SCIInitialize(flags: u32, error: *mut sci_error_t);
        pub fn SCITerminate();
        pub fn SCIOpen(sd: *mut sci_desc_t, flags: u32, error: *mut sci_error_t);
        pub fn SCIClose(sd: sci_desc_t, flags: u32, error: *mut sci_error_t);
        pub fn SCIGetLocalNodeId(
            adapter_no: u32,
            node_id: *mut u32,
            flags: u32,
            error: *mut sci_error_t,
        );
        pub fn SCIConnectSegment(
            sd: sci_desc_t,
            segment: *mut sci_remote_segment_t,
            node_id: u32,
            segment_id: u32,
            local_adapter_no: u32,
            callback: sci_cb_remote_segment_t,
            callback_arg: *mut c_void,
            timeout: u32,
            flags: u32,
            error: *mut sci_error_t,
        );
        pub fn SCIDisconnectSegment(segment: sci_remote_segment_t, flags: u32, error: *mut sci_error_t);
        pub fn SCIGetRemoteSegmentSize(segment: sci_remote_segment_t) -> usize;
        pub fn SCIMapRemoteSegment(
            segment: sci_remote_segment_t,
            map: *mut sci_map_t,
            offset: usize,
            size: usize,
            addr: *mut c_void,
            flags: u32,
            error: *mut sci_error_t,
        ) -> *mut c_void;
        pub fn SCIUnmapSegment(map: sci_map_t, flags: u32, error: *mut sci_error_t);
        pub fn SCICreateMapSequence(
            map: sci_map_t,
            sequence: *mut sci_sequence_t,
            flags: u32,
            error: *mut sci_error_t,
        );
        pub fn SCIRemoveSequence(sequence: sci_sequence_t, flags: u32, error: *mut sci_error_t);
        pub fn SCIStartSequence(sequence: sci_sequence_t, flags: u32, error: *mut sci_error_t) -> u32;
        pub fn SCICheckSequence(sequence: sci_sequence_t, flags: u32, error: *mut sci_error_t) -> u32;
    }
}

fn check(code: ffi::sci_error_t, operation: &'static str) -> Result<()> {
    let code = StatusCode(code);
    if code.is_ok() {
        Ok(())
    } else {
        Err(Error::fabric(code).with_operation(operation))
    }
}

/// An open descriptor, plus the API initialization it depends on.
///
/// Shared by the fabric and every mapping made through it, so the API is
/// torn down only after the last segment is disconnected.
struct Descriptor {
    sd: ffi::sci_desc_t,
}

// SAFETY: SISCI descriptors may be used from any thread.
unsafe impl Send for Descriptor {}
unsafe impl Sync for Descriptor {}

impl Drop for Descriptor {
    fn drop(&mut self) {
        let mut err = 0;
        // SAFETY: `sd` was opened after a successful SCIInitialize, and no
        // mapping holds a reference any more.
        unsafe {
            ffi::SCIClose(self.sd, 0, &mut err);
            ffi::SCITerminate();
        }
    }
}

/// An open SISCI descriptor on one local adapter.
pub struct SisciFabric {
    desc: Arc<Descriptor>,
    adapter: u32,
    timeout: u32,
    local_node: NodeId,
}

impl SisciFabric {
    /// Open the adapter and timeout named in [`Config`].
    pub fn from_config() -> Result<Self> {
        let config = Config::get();
        Self::open(config.adapter, config.connect_timeout_ms)
    }

    /// Initialize the API and open a descriptor on `adapter`.
    ///
    /// A `connect_timeout_ms` of 0 waits forever.
    pub fn open(adapter: u32, connect_timeout_ms: u32) -> Result<Self> {
        let mut err = 0;
        // SAFETY: plain FFI calls with valid out-pointers.
        unsafe { ffi::SCIInitialize(0, &mut err) };
        check(err, "SisciFabric::open")?;

        let mut sd = ptr::null_mut();
        // SAFETY: as above.
        unsafe { ffi::SCIOpen(&mut sd, 0, &mut err) };
        if let Err(e) = check(err, "SisciFabric::open") {
            // SAFETY: balances the successful SCIInitialize.
            unsafe { ffi::SCITerminate() };
            return Err(e);
        }

        let desc = Arc::new(Descriptor { sd });

        let mut local_node = 0;
        // SAFETY: as above.
        unsafe { ffi::SCIGetLocalNodeId(adapter, &mut local_node, 0, &mut err) };
        let fabric = Self {
            desc,
            adapter,
            timeout: if connect_timeout_ms == 0 {
                ffi::SCI_INFINITE_TIMEOUT
            } else {
                connect_timeout_ms
            },
            local_node,
        };
        check(err, "SisciFabric::open").map_err(|e| e.with_context("adapter", adapter.to_string()))?;
        Ok(fabric)
    }

    pub fn adapter(&self) -> u32 {
        self.adapter
    }
}

impl Fabric for SisciFabric {
    fn local_node(&self) -> NodeId {
        self.local_node
    }

    fn domain(&self) -> u64 {
        INTERCONNECT_DOMAIN
    }

    fn connect(&self, node: NodeId, segment: SegmentId) -> Result<RemoteWindow> {
        let op = "SisciFabric::connect";
        let mut err = 0;
        let mut remote = ptr::null_mut();
        // SAFETY: valid descriptor and out-pointers; no callback registered.
        unsafe {
            ffi::SCIConnectSegment(
                self.desc.sd,
                &mut remote,
                node,
                segment,
                self.adapter,
                None,
                ptr::null_mut(),
                self.timeout,
                0,
                &mut err,
            )
        };
        check(err, op).map_err(|e| {
            e.with_context("node", node.to_string())
                .with_context("segment", segment.to_string())
        })?;

        let mut mapping = SisciMapping {
            segment: remote,
            map: ptr::null_mut(),
            sequence: ptr::null_mut(),
            base: ptr::null_mut(),
            len: 0,
            _desc: Arc::clone(&self.desc),
        };
        // SAFETY: `remote` is a connected segment.
        mapping.len = unsafe { ffi::SCIGetRemoteSegmentSize(remote) };
        // SAFETY: maps the whole segment; the map handle is owned by `mapping`.
        let base = unsafe {
            ffi::SCIMapRemoteSegment(remote, &mut mapping.map, 0, mapping.len, ptr::null_mut(), 0, &mut err)
        };
        check(err, op)?;
        mapping.base = base as *mut u8;

        // SAFETY: `map` is a live mapping.
        unsafe { ffi::SCICreateMapSequence(mapping.map, &mut mapping.sequence, 0, &mut err) };
        check(err, op)?;

        Ok(RemoteWindow::new(self.region(node, segment), Box::new(mapping)))
    }
}

/// Connected, mapped segment with its error-check sequence.
struct SisciMapping {
    segment: ffi::sci_remote_segment_t,
    map: ffi::sci_map_t,
    sequence: ffi::sci_sequence_t,
    base: *mut u8,
    len: usize,
    // Dropped after the handles above are released.
    _desc: Arc<Descriptor>,
}

// SAFETY: SISCI handles are process-global and thread-agnostic.
unsafe impl Send for SisciMapping {}
unsafe impl Sync for SisciMapping {}

impl SisciMapping {
    fn sequence_result(&self, status: u32, err: ffi::sci_error_t, operation: &'static str) -> Result<()> {
        check(err, operation)?;
        match status {
            ffi::SCI_SEQ_OK => Ok(()),
            ffi::SCI_SEQ_RETRIABLE => Err(Error::fabric(StatusCode::TRANSFER_FAILED)
                .set_temporary()
                .with_operation(operation)),
            _ => Err(Error::fabric(StatusCode::TRANSFER_FAILED).with_operation(operation)),
        }
    }
}

// SAFETY: the mapping stays in place until `drop` unmaps it.
unsafe impl MappedSegment for SisciMapping {
    fn base(&self) -> *mut u8 {
        self.base
    }

    fn len(&self) -> usize {
        self.len
    }

    fn start_sequence(&self) -> Result<()> {
        let mut err = 0;
        loop {
            // SAFETY: `sequence` belongs to this live mapping.
            let status = unsafe { ffi::SCIStartSequence(self.sequence, 0, &mut err) };
            if status != ffi::SCI_SEQ_PENDING {
                return self.sequence_result(status, err, "SisciFabric::start_sequence");
            }
            hint::spin_loop();
        }
    }

    fn check_sequence(&self) -> Result<()> {
        let mut err = 0;
        // SAFETY: `sequence` belongs to this live mapping.
        let status = unsafe { ffi::SCICheckSequence(self.sequence, 0, &mut err) };
        self.sequence_result(status, err, "SisciFabric::check_sequence")
    }
}

impl Drop for SisciMapping {
    fn drop(&mut self) {
        let mut err = 0;
        // SAFETY: tear down in reverse order of creation, skipping handles
        // that were never created.
        unsafe {
            if !self.sequence.is_null() {
                ffi::SCIRemoveSequence(self.sequence, 0, &mut err);
            }
            if !self.map.is_null() {
                ffi::SCIUnmapSegment(self.map, 0, &mut err);
            }
            ffi::SCIDisconnectSegment(self.segment, 0, &mut err);
        }
    }
}
