//! Fabric driver status codes and their canonical messages.
//!
//! The interconnect driver reports failures as numeric `sci_error_t` values.
//! [`StatusCode`] wraps the raw value and [`lookup`] renders it through one
//! static table. The values mirror `sisci_error.h`: every error is an index
//! ORed with [`SCI_ERR_MASK`], `OK` is zero. Indices are grouped: general
//! errors from `0x900`, node and link errors from `0xA00`, and blocking or
//! busy conditions from `0xB00`. The groups have holes (`0x903`, `0xA01`,
//! `0xA03`) where the driver retired codes.
//!
//! # Table revision history
//!
//! | Version | Change |
//! |---------|--------|
//! | 1 | Single table. `COND_INT_RACE_PROBLEM`, `EWOULD_BLOCK` and `SEMAPHORE_COUNT_EXCEEDED` given their own messages; entries from `OVERFLOW` on re-paired with their codes. "Unknown error" is the only fallback text. |
//! | 2 | Node/link codes moved to `0xA00..=0xA06` and blocking codes to `0xB00..=0xB05`, matching the driver header. Messages unchanged. |

use std::fmt;

/// Revision of the code → message table.
pub const TABLE_VERSION: u32 = 2;

/// Bit set on every non-OK driver status.
pub const SCI_ERR_MASK: u32 = 0x4000_0000;

/// Message returned for any code not present in the table.
pub const UNKNOWN_STATUS: &str = "Unknown error";

/// A raw fabric driver status value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusCode(pub u32);

const fn err(index: u32) -> StatusCode {
    StatusCode(index | SCI_ERR_MASK)
}

impl StatusCode {
    pub const OK: StatusCode = StatusCode(0);
    pub const BUSY: StatusCode = err(0x900);
    pub const FLAG_NOT_IMPLEMENTED: StatusCode = err(0x901);
    pub const ILLEGAL_FLAG: StatusCode = err(0x902);
    pub const NOSPC: StatusCode = err(0x904);
    pub const API_NOSPC: StatusCode = err(0x905);
    pub const HW_NOSPC: StatusCode = err(0x906);
    pub const NOT_IMPLEMENTED: StatusCode = err(0x907);
    pub const ILLEGAL_ADAPTERNO: StatusCode = err(0x908);
    pub const NO_SUCH_ADAPTERNO: StatusCode = err(0x909);
    pub const TIMEOUT: StatusCode = err(0x90A);
    pub const OUT_OF_RANGE: StatusCode = err(0x90B);
    pub const NO_SUCH_SEGMENT: StatusCode = err(0x90C);
    pub const ILLEGAL_NODEID: StatusCode = err(0x90D);
    pub const CONNECTION_REFUSED: StatusCode = err(0x90E);
    pub const SEGMENT_NOT_CONNECTED: StatusCode = err(0x90F);
    pub const SIZE_ALIGNMENT: StatusCode = err(0x910);
    pub const OFFSET_ALIGNMENT: StatusCode = err(0x911);
    pub const ILLEGAL_PARAMETER: StatusCode = err(0x912);
    pub const MAX_ENTRIES: StatusCode = err(0x913);
    pub const SEGMENT_NOT_PREPARED: StatusCode = err(0x914);
    pub const ILLEGAL_ADDRESS: StatusCode = err(0x915);
    pub const ILLEGAL_OPERATION: StatusCode = err(0x916);
    pub const ILLEGAL_QUERY: StatusCode = err(0x917);
    pub const SEGMENTID_USED: StatusCode = err(0x918);
    pub const SYSTEM: StatusCode = err(0x919);
    pub const CANCELLED: StatusCode = err(0x91A);
    pub const NOT_CONNECTED: StatusCode = err(0x91B);
    pub const NOT_AVAILABLE: StatusCode = err(0x91C);
    pub const INCONSISTENT_VERSIONS: StatusCode = err(0x91D);
    pub const COND_INT_RACE_PROBLEM: StatusCode = err(0x91E);
    pub const OVERFLOW: StatusCode = err(0x91F);
    pub const NOT_INITIALIZED: StatusCode = err(0x920);
    pub const ACCESS: StatusCode = err(0x921);
    pub const NOT_SUPPORTED: StatusCode = err(0x922);
    pub const DEPRECATED: StatusCode = err(0x923);
    pub const NO_SUCH_NODEID: StatusCode = err(0xA00);
    pub const NODE_NOT_RESPONDING: StatusCode = err(0xA02);
    pub const NO_REMOTE_LINK_ACCESS: StatusCode = err(0xA04);
    pub const NO_LINK_ACCESS: StatusCode = err(0xA05);
    pub const TRANSFER_FAILED: StatusCode = err(0xA06);
    pub const EWOULD_BLOCK: StatusCode = err(0xB00);
    pub const SEMAPHORE_COUNT_EXCEEDED: StatusCode = err(0xB01);
    pub const IRQL_ILLEGAL: StatusCode = err(0xB02);
    pub const REMOTE_BUSY: StatusCode = err(0xB03);
    pub const LOCAL_BUSY: StatusCode = err(0xB04);
    pub const ALL_BUSY: StatusCode = err(0xB05);

    /// Returns `true` for [`StatusCode::OK`].
    pub fn is_ok(self) -> bool {
        self == StatusCode::OK
    }

    /// Codes that describe a condition which may clear on its own.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            StatusCode::BUSY
                | StatusCode::TIMEOUT
                | StatusCode::EWOULD_BLOCK
                | StatusCode::REMOTE_BUSY
                | StatusCode::LOCAL_BUSY
                | StatusCode::ALL_BUSY
        )
    }

    /// The canonical message for this code.
    pub fn message(self) -> &'static str {
        lookup(self)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// One immutable entry of the status table.
#[derive(Debug, Clone, Copy)]
pub struct StatusEntry {
    pub code: StatusCode,
    pub message: &'static str,
}

const fn entry(code: StatusCode, message: &'static str) -> StatusEntry {
    StatusEntry { code, message }
}

/// The canonical code → message table.
pub static TABLE: [StatusEntry; 47] = [
    entry(StatusCode::OK, "OK"),
    entry(StatusCode::BUSY, "Resource busy"),
    entry(StatusCode::FLAG_NOT_IMPLEMENTED, "Flag option is not implemented"),
    entry(StatusCode::ILLEGAL_FLAG, "Illegal flag option"),
    entry(StatusCode::NOSPC, "Out of local resources"),
    entry(StatusCode::API_NOSPC, "Out of local API resources"),
    entry(StatusCode::HW_NOSPC, "Out of hardware resources"),
    entry(StatusCode::NOT_IMPLEMENTED, "Not implemented"),
    entry(StatusCode::ILLEGAL_ADAPTERNO, "Illegal adapter number"),
    entry(StatusCode::NO_SUCH_ADAPTERNO, "Adapter not found"),
    entry(StatusCode::TIMEOUT, "Operation timed out"),
    entry(StatusCode::OUT_OF_RANGE, "Out of range"),
    entry(StatusCode::NO_SUCH_SEGMENT, "Segment ID not found"),
    entry(StatusCode::ILLEGAL_NODEID, "Illegal node ID"),
    entry(StatusCode::CONNECTION_REFUSED, "Connection to remote node is refused"),
    entry(StatusCode::SEGMENT_NOT_CONNECTED, "No connection to segment"),
    entry(StatusCode::SIZE_ALIGNMENT, "Size is not aligned"),
    entry(StatusCode::OFFSET_ALIGNMENT, "Offset is not aligned"),
    entry(StatusCode::ILLEGAL_PARAMETER, "Illegal function parameter"),
    entry(StatusCode::MAX_ENTRIES, "Maximum possible physical mapping is exceeded"),
    entry(StatusCode::SEGMENT_NOT_PREPARED, "Segment is not prepared"),
    entry(StatusCode::ILLEGAL_ADDRESS, "Illegal address"),
    entry(StatusCode::ILLEGAL_OPERATION, "Illegal operation"),
    entry(StatusCode::ILLEGAL_QUERY, "Illegal query operation"),
    entry(StatusCode::SEGMENTID_USED, "Segment ID already used"),
    entry(StatusCode::SYSTEM, "Could not get requested resource from the system"),
    entry(StatusCode::CANCELLED, "Operation cancelled"),
    entry(StatusCode::NOT_CONNECTED, "Host is not connected to remote host"),
    entry(StatusCode::NOT_AVAILABLE, "Operation not available"),
    entry(StatusCode::INCONSISTENT_VERSIONS, "Inconsistent driver version"),
    entry(StatusCode::COND_INT_RACE_PROBLEM, "Conditional interrupt race"),
    entry(StatusCode::OVERFLOW, "Out of local resources"),
    entry(StatusCode::NOT_INITIALIZED, "Host not initialized"),
    entry(StatusCode::ACCESS, "No local or remote access for requested operation"),
    entry(StatusCode::NOT_SUPPORTED, "Request not supported"),
    entry(StatusCode::DEPRECATED, "Function deprecated"),
    entry(StatusCode::NO_SUCH_NODEID, "Node ID not found"),
    entry(StatusCode::NODE_NOT_RESPONDING, "Node does not respond"),
    entry(StatusCode::NO_REMOTE_LINK_ACCESS, "Remote link is not operational"),
    entry(StatusCode::NO_LINK_ACCESS, "Local link is not operational"),
    entry(StatusCode::TRANSFER_FAILED, "Transfer failed"),
    entry(StatusCode::EWOULD_BLOCK, "Operation would block"),
    entry(StatusCode::SEMAPHORE_COUNT_EXCEEDED, "Semaphore count exceeded"),
    entry(StatusCode::IRQL_ILLEGAL, "Illegal interrupt line"),
    entry(StatusCode::REMOTE_BUSY, "Remote host is busy"),
    entry(StatusCode::LOCAL_BUSY, "Local host is busy"),
    entry(StatusCode::ALL_BUSY, "System is busy"),
];

/// Look up the message for a driver status code.
///
/// Returns [`UNKNOWN_STATUS`] for codes not in the table.
pub fn lookup(code: StatusCode) -> &'static str {
    TABLE
        .iter()
        .find(|e| e.code == code)
        .map_or(UNKNOWN_STATUS, |e| e.message)
}
