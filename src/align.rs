//! Alignment rules for DMA windows.
//!
//! The fabric maps remote memory in page-sized units and the device runtime
//! can only register I/O memory on page boundaries, so a remote window must
//! start and end on an alignment boundary (a power of two, usually the page
//! size).

use crate::error::{Error, ErrorKind, Result};
use crate::status::StatusCode;

/// Returns the page size of the system (typically 4096).
pub fn page_size() -> usize {
    // SAFETY: _SC_PAGESIZE is always valid on Linux.
    let ps = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    debug_assert!(ps > 0, "sysconf(_SC_PAGESIZE) returned {ps}");
    ps as usize
}

/// Check if `value` is a multiple of `alignment` (a power of two).
#[inline]
pub fn is_aligned(value: usize, alignment: usize) -> bool {
    debug_assert!(alignment.is_power_of_two(), "alignment must be a power of two");
    value & (alignment - 1) == 0
}

/// Round `value` up to the next multiple of `alignment` (a power of two).
///
/// ```
/// use gpudma_rs::align::align_up;
/// assert_eq!(align_up(1, 4096), 4096);
/// assert_eq!(align_up(8192, 4096), 8192);
/// ```
#[inline]
pub fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two(), "alignment must be a power of two");
    (value + alignment - 1) & !(alignment - 1)
}

/// Validate that a window at `base` of `len` bytes can be bound for DMA.
///
/// Failures carry the driver status the fabric itself would report:
/// `OFFSET_ALIGNMENT` for a misaligned base, `SIZE_ALIGNMENT` for a length
/// that is zero or not a multiple of `alignment`.
pub fn check_dma_window(base: usize, len: usize, alignment: usize) -> Result<()> {
    if !alignment.is_power_of_two() {
        return Err(Error::new(
            ErrorKind::ConfigInvalid,
            format!("DMA alignment must be a power of two, got {alignment}"),
        )
        .with_operation("align::check_dma_window"));
    }
    if !is_aligned(base, alignment) {
        return Err(misaligned(StatusCode::OFFSET_ALIGNMENT)
            .with_context("base", format!("{base:#x}"))
            .with_context("alignment", alignment.to_string()));
    }
    if len == 0 || !is_aligned(len, alignment) {
        return Err(misaligned(StatusCode::SIZE_ALIGNMENT)
            .with_context("len", len.to_string())
            .with_context("alignment", alignment.to_string()));
    }
    Ok(())
}

fn misaligned(code: StatusCode) -> Error {
    Error::new(ErrorKind::Misaligned, code.message())
        .with_fabric_status(code)
        .with_operation("align::check_dma_window")
}
