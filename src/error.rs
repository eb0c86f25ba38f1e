//! Error types for gpudma-rs.
//!
//! # Design
//!
//! - [`ErrorKind`] categorizes *what* went wrong.
//! - [`ErrorStatus`] indicates *what to do about it*. Nothing in this crate
//!   retries; the status only tells the caller whether a retry is sensible.
//! - [`Error`] combines both with rich context for debugging, and carries the
//!   fabric's numeric [`StatusCode`] when the failure came from the interconnect.
//!
//! Errors are constructed via a fluent builder pattern:
//!
//! ```
//! use gpudma_rs::error::{Error, ErrorKind};
//!
//! let err = Error::new(ErrorKind::AllocationFailed, "device memory exhausted")
//!     .with_operation("MemoryManager::allocate")
//!     .with_context("device", "0")
//!     .with_context("size", "1073741824");
//! ```

use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;

use crate::log::Logger;
use crate::status::{self, StatusCode};

/// A specialized `Result` type for gpudma-rs operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Categorizes the type of error that occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An unexpected/internal error that should not happen under normal conditions.
    Unexpected,
    /// The requested device, segment or node was not found.
    NotFound,
    /// Invalid configuration or arguments.
    ConfigInvalid,
    /// Device memory could not be allocated.
    AllocationFailed,
    /// A handle was used after it had been released.
    InvalidHandle,
    /// An address or length violates the DMA alignment constraint.
    Misaligned,
    /// The remote region is already bound to a segment.
    AlreadyBound,
    /// A device runtime (CUDA) call failed.
    CudaError,
    /// The fabric driver reported a non-OK status.
    FabricError,
    /// A transfer did not complete.
    TransferFailed,
    /// The requested feature is not supported in the current environment.
    Unsupported,
}

impl ErrorKind {
    /// Returns a static string label for this error kind.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Unexpected => "Unexpected",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::ConfigInvalid => "ConfigInvalid",
            ErrorKind::AllocationFailed => "AllocationFailed",
            ErrorKind::InvalidHandle => "InvalidHandle",
            ErrorKind::Misaligned => "Misaligned",
            ErrorKind::AlreadyBound => "AlreadyBound",
            ErrorKind::CudaError => "CudaError",
            ErrorKind::FabricError => "FabricError",
            ErrorKind::TransferFailed => "TransferFailed",
            ErrorKind::Unsupported => "Unsupported",
        }
    }

    /// Backtraces are only worth their cost where the call site is surprising.
    fn enable_backtrace(&self) -> bool {
        matches!(self, ErrorKind::Unexpected)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Indicates whether the caller should retry the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStatus {
    /// The error is permanent and should not be retried.
    Permanent,
    /// The error is transient and may succeed on retry.
    Temporary,
    /// The error was transient but persisted after the caller's retries.
    Persistent,
}

impl fmt::Display for ErrorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorStatus::Permanent => f.write_str("permanent"),
            ErrorStatus::Temporary => f.write_str("temporary"),
            ErrorStatus::Persistent => f.write_str("persistent"),
        }
    }
}

/// The main error type for gpudma-rs.
pub struct Error {
    kind: ErrorKind,
    message: String,
    status: ErrorStatus,
    fabric_status: Option<StatusCode>,
    operation: &'static str,
    context: Vec<(&'static str, String)>,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
    backtrace: Option<Box<Backtrace>>,
}

impl Error {
    /// Create a new error with the given kind and message.
    ///
    /// Defaults to `ErrorStatus::Permanent`, no fabric status and empty
    /// operation/context.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: ErrorStatus::Permanent,
            fabric_status: None,
            operation: "",
            context: Vec::new(),
            source: None,
            // `Backtrace::capture()` is free when `RUST_BACKTRACE` is unset.
            backtrace: kind
                .enable_backtrace()
                .then(Backtrace::capture)
                .filter(|bt| bt.status() == BacktraceStatus::Captured)
                .map(Box::new),
        }
    }

    /// Create a [`ErrorKind::FabricError`] from a driver status code.
    ///
    /// The message is the canonical text from the status table. Codes the
    /// driver documents as transient are marked [`ErrorStatus::Temporary`].
    pub fn fabric(code: StatusCode) -> Self {
        let mut err = Error::new(ErrorKind::FabricError, status::lookup(code));
        err.fabric_status = Some(code);
        if code.is_transient() {
            err.status = ErrorStatus::Temporary;
        }
        err.with_context("status", code.to_string())
    }

    /// Attach the driver status code that corresponds to this error.
    pub fn with_fabric_status(mut self, code: StatusCode) -> Self {
        self.fabric_status = Some(code);
        self
    }

    /// Returns the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the error status.
    pub fn status(&self) -> ErrorStatus {
        self.status
    }

    /// Returns the fabric driver status code, if the failure came from the fabric.
    pub fn fabric_status(&self) -> Option<StatusCode> {
        self.fabric_status
    }

    /// Returns the operation that caused this error.
    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// Returns the human-readable error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the error context as key-value pairs.
    pub fn context_iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.context.iter().map(|(k, v)| (*k, v.as_str()))
    }

    /// Returns `true` if this error is permanent.
    pub fn is_permanent(&self) -> bool {
        self.status == ErrorStatus::Permanent
    }

    /// Returns `true` if this error is temporary (retryable).
    pub fn is_temporary(&self) -> bool {
        self.status == ErrorStatus::Temporary
    }

    /// Returns `true` if this error is persistent (was temporary, no longer retryable).
    pub fn is_persistent(&self) -> bool {
        self.status == ErrorStatus::Persistent
    }

    /// Set the error status to permanent. Consumes and returns self.
    pub fn set_permanent(mut self) -> Self {
        self.status = ErrorStatus::Permanent;
        self
    }

    /// Set the error status to temporary. Consumes and returns self.
    pub fn set_temporary(mut self) -> Self {
        self.status = ErrorStatus::Temporary;
        self
    }

    /// Set the error status to persistent. Consumes and returns self.
    pub fn set_persistent(mut self) -> Self {
        self.status = ErrorStatus::Persistent;
        self
    }

    /// Set the operation that caused this error.
    ///
    /// If the error already has an operation, the previous one is pushed
    /// into context as `("called", previous_operation)`.
    pub fn with_operation(mut self, operation: &'static str) -> Self {
        if !self.operation.is_empty() {
            self.context.push(("called", self.operation.to_string()));
        }
        self.operation = operation;
        self
    }

    /// Add a key-value context pair.
    pub fn with_context(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.context.push((key, value.into()));
        self
    }

    /// Set the underlying source error.
    pub fn set_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Returns the captured backtrace, if any.
    ///
    /// Only captured for [`ErrorKind::Unexpected`] with `RUST_BACKTRACE` set.
    pub fn backtrace(&self) -> Option<&Backtrace> {
        self.backtrace.as_deref()
    }

    /// Emit this error as a single line on the logger's error channel.
    ///
    /// The error channel is never filtered, so this always produces output.
    pub fn report(&self, logger: &Logger) {
        logger.error(format_args!("{self}"));
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            let mut d = f.debug_struct("Error");
            d.field("kind", &self.kind);
            d.field("message", &self.message);
            d.field("status", &self.status);
            d.field("fabric_status", &self.fabric_status);
            d.field("operation", &self.operation);
            d.field("context", &self.context);
            d.field("source", &self.source.as_ref().map(|s| s.to_string()));
            d.finish()
        } else {
            writeln!(
                f,
                "{} ({}) at {} => {}",
                self.kind, self.status, self.operation, self.message
            )?;
            if !self.context.is_empty() {
                writeln!(f)?;
                writeln!(f, "Context:")?;
                for (k, v) in &self.context {
                    writeln!(f, "   {k}: {v}")?;
                }
            }
            if let Some(source) = &self.source {
                writeln!(f)?;
                writeln!(f, "Source:")?;
                writeln!(f, "   {source}")?;
            }
            if let Some(backtrace) = &self.backtrace {
                writeln!(f)?;
                writeln!(f, "Backtrace:")?;
                writeln!(f, "{backtrace}")?;
            }
            Ok(())
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) at {}", self.kind, self.status, self.operation)?;
        if !self.context.is_empty() {
            write!(f, ", context: {{ ")?;
            for (i, (k, v)) in self.context.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{k}: {v}")?;
            }
            write!(f, " }}")?;
        }
        write!(f, " => {}", self.message)?;
        if let Some(source) = &self.source {
            write!(f, ", source: {source}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

impl From<cudarc::driver::DriverError> for Error {
    fn from(err: cudarc::driver::DriverError) -> Self {
        Error::new(ErrorKind::CudaError, format!("CUDA driver call failed: {err}")).set_source(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    use crate::log::{LogSink, Verbosity};

    #[test]
    fn test_error_kind_display() {
        assert_eq!(format!("{}", ErrorKind::InvalidHandle), "InvalidHandle");
        assert_eq!(format!("{}", ErrorKind::FabricError), "FabricError");
        assert_eq!(ErrorKind::AlreadyBound.as_str(), "AlreadyBound");
    }

    #[test]
    fn test_error_new_defaults() {
        let err = Error::new(ErrorKind::NotFound, "no such device");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.status(), ErrorStatus::Permanent);
        assert_eq!(err.operation(), "");
        assert_eq!(err.message(), "no such device");
        assert!(err.fabric_status().is_none());
        assert!(err.is_permanent());
    }

    #[test]
    fn test_error_builder_chain() {
        let err = Error::new(ErrorKind::Misaligned, "window base is not aligned")
            .with_operation("TransferEngine::prepare_transfer")
            .with_context("alignment", "4096")
            .set_temporary();

        assert_eq!(err.operation(), "TransferEngine::prepare_transfer");
        assert!(err.is_temporary());
        let ctx: Vec<_> = err.context_iter().collect();
        assert_eq!(ctx, vec![("alignment", "4096")]);
    }

    #[test]
    fn test_error_operation_chaining() {
        let err = Error::new(ErrorKind::CudaError, "memset failed")
            .with_operation("CudaRuntime::memset")
            .with_operation("MemoryManager::fill");

        assert_eq!(err.operation(), "MemoryManager::fill");
        let ctx: Vec<_> = err.context_iter().collect();
        assert_eq!(ctx, vec![("called", "CudaRuntime::memset")]);
    }

    #[test]
    fn test_fabric_error_uses_table_message() {
        let err = Error::fabric(StatusCode::SIZE_ALIGNMENT);
        assert_eq!(err.kind(), ErrorKind::FabricError);
        assert_eq!(err.fabric_status(), Some(StatusCode::SIZE_ALIGNMENT));
        assert_eq!(err.message(), "Size is not aligned");
        assert!(err.is_permanent());
    }

    #[test]
    fn test_fabric_error_transient_codes_are_temporary() {
        assert!(Error::fabric(StatusCode::TIMEOUT).is_temporary());
        assert!(Error::fabric(StatusCode::BUSY).is_temporary());
        assert!(Error::fabric(StatusCode::NO_LINK_ACCESS).is_permanent());
    }

    #[test]
    fn test_fabric_error_unknown_code() {
        let err = Error::fabric(StatusCode(0xdead_beef));
        assert_eq!(err.message(), status::UNKNOWN_STATUS);
    }

    #[test]
    fn test_error_with_source() {
        let io_err = std::io::Error::other("driver gone");
        let err = Error::new(ErrorKind::CudaError, "context creation failed").set_source(io_err);
        let source = StdError::source(&err).unwrap();
        assert!(source.to_string().contains("driver gone"));
        assert!(format!("{err}").contains("source: driver gone"));
    }

    #[test]
    fn test_error_display_format() {
        let err = Error::new(ErrorKind::InvalidHandle, "buffer was released")
            .with_operation("TransferEngine::copy_remote_to_local")
            .with_context("device_ptr", "0x1000");

        let display = format!("{err}");
        assert!(display.contains("InvalidHandle"));
        assert!(display.contains("permanent"));
        assert!(display.contains("TransferEngine::copy_remote_to_local"));
        assert!(display.contains("device_ptr: 0x1000"));
        assert!(display.contains("buffer was released"));
    }

    #[test]
    fn test_error_debug_format() {
        let err = Error::fabric(StatusCode::TRANSFER_FAILED).with_operation("transfer");
        let debug = format!("{err:?}");
        assert!(debug.contains("FabricError"));
        assert!(debug.contains("Transfer failed"));
        assert!(debug.contains("Context:"));

        let alt = format!("{err:#?}");
        assert!(alt.contains("fabric_status"));
    }

    #[test]
    fn test_error_report_emits_one_line_at_verbosity_zero() {
        let (sink, captured) = LogSink::memory();
        let logger = Logger::new(Verbosity::ERRORS, sink);
        Error::fabric(StatusCode::CANCELLED)
            .with_operation("transfer")
            .report(&logger);

        let text = captured.contents();
        assert_eq!(text.lines().count(), 1);
        assert!(text.starts_with("ERROR  : FabricError"));
        assert!(text.contains("Operation cancelled"));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync + std::error::Error>() {}
        assert_send_sync::<Error>();
    }

    #[test]
    fn test_backtrace_not_captured_for_expected_kinds() {
        assert!(Error::new(ErrorKind::NotFound, "x").backtrace().is_none());
        assert!(Error::fabric(StatusCode::BUSY).backtrace().is_none());
    }
}
