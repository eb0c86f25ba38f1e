//! Tiered diagnostic logging.
//!
//! Four channels gated by one [`Verbosity`] value:
//!
//! | Channel | Tag | Emitted when |
//! |---------|-----|--------------|
//! | error | `ERROR  : ` | always |
//! | warn | `WARNING: ` | verbosity >= 1 |
//! | info | `INFO   : ` | verbosity >= 2 |
//! | debug | `DEBUG  : ` | verbosity >= 3 |
//!
//! A message is formatted into a fixed [`MAX_MESSAGE_LEN`] buffer (longer text
//! is cut silently), framed with its tag and a newline, and written to the
//! sink with a single `write_all` followed by `flush` while the sink's lock is
//! held. Lines from concurrent callers never interleave, and a line is on the
//! stream before the call returns even if the process aborts right after.
//!
//! Every emitted line is also forwarded to [`tracing`] under the `gpudma`
//! target at the matching level.
//!
//! [`Logger`] is a plain value and is passed to the components that log. A
//! process default is available through [`Logger::global`].

use std::fmt::{self, Write as _};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use crate::config::Config;
use crate::error::{Error, ErrorKind, Result};

/// Maximum number of message bytes kept per line, excluding tag and newline.
pub const MAX_MESSAGE_LEN: usize = 1024;

const TAG_LEN: usize = 9;

/// How much is logged besides errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Verbosity(u8);

impl Verbosity {
    pub const ERRORS: Verbosity = Verbosity(0);
    pub const WARNINGS: Verbosity = Verbosity(1);
    pub const INFO: Verbosity = Verbosity(2);
    pub const DEBUG: Verbosity = Verbosity(3);

    /// Create a verbosity level. Valid levels are 0 through 3.
    pub fn new(level: u8) -> Result<Self> {
        if level > Self::DEBUG.0 {
            return Err(Error::new(
                ErrorKind::ConfigInvalid,
                format!("verbosity must be between 0 and 3, got {level}"),
            )
            .with_operation("Verbosity::new"));
        }
        Ok(Verbosity(level))
    }

    /// Numeric level.
    pub fn level(self) -> u8 {
        self.0
    }

    /// One step more verbose, saturating at [`Verbosity::DEBUG`].
    pub fn increase(self) -> Self {
        Verbosity(self.0.saturating_add(1).min(Self::DEBUG.0))
    }
}

/// Severity channel of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
}

impl Level {
    /// The fixed-width tag that starts every line of this channel.
    pub fn tag(self) -> &'static str {
        match self {
            Level::Error => "ERROR  : ",
            Level::Warn => "WARNING: ",
            Level::Info => "INFO   : ",
            Level::Debug => "DEBUG  : ",
        }
    }

    fn threshold(self) -> Verbosity {
        match self {
            Level::Error => Verbosity::ERRORS,
            Level::Warn => Verbosity::WARNINGS,
            Level::Info => Verbosity::INFO,
            Level::Debug => Verbosity::DEBUG,
        }
    }
}

type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// A diagnostic output stream shared by every logger writing to it.
///
/// The sink's lock is the critical section for one framed line.
#[derive(Clone)]
pub struct LogSink {
    writer: SharedWriter,
}

static STDERR_SINK: OnceLock<LogSink> = OnceLock::new();

impl LogSink {
    /// The process-wide standard error sink.
    pub fn stderr() -> LogSink {
        STDERR_SINK
            .get_or_init(|| LogSink::from_writer(std::io::stderr()))
            .clone()
    }

    /// Wrap an arbitrary writer.
    pub fn from_writer(writer: impl Write + Send + 'static) -> LogSink {
        LogSink {
            writer: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Append to a file, creating it if needed.
    pub fn file(path: &Path) -> Result<LogSink> {
        let file = File::options()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                Error::new(ErrorKind::ConfigInvalid, "failed to open log file")
                    .with_operation("LogSink::file")
                    .with_context("path", path.display().to_string())
                    .set_source(e)
            })?;
        Ok(LogSink::from_writer(file))
    }

    /// An in-memory sink and a handle to read back what was written.
    pub fn memory() -> (LogSink, MemoryLog) {
        let log = MemoryLog::default();
        (LogSink::from_writer(log.clone()), log)
    }

    fn write_line(&self, line: &[u8]) {
        // A poisoned sink still holds complete lines; keep writing.
        let mut w = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        // Diagnostics have nowhere to report their own I/O failure.
        let _ = w.write_all(line);
        let _ = w.flush();
    }
}

impl fmt::Debug for LogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogSink").finish_non_exhaustive()
    }
}

/// Captured output of a [`LogSink::memory`] sink.
#[derive(Clone, Default)]
pub struct MemoryLog {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemoryLog {
    /// Everything written so far, lossily decoded.
    pub fn contents(&self) -> String {
        let bytes = self.bytes.lock().unwrap_or_else(|p| p.into_inner());
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl Write for MemoryLog {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.bytes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Fixed-capacity line buffer. Writes past the end are dropped.
struct LineBuf {
    bytes: [u8; TAG_LEN + MAX_MESSAGE_LEN + 1],
    len: usize,
    limit: usize,
}

impl LineBuf {
    fn new(tag: &str) -> Self {
        let mut buf = LineBuf {
            bytes: [0; TAG_LEN + MAX_MESSAGE_LEN + 1],
            len: 0,
            limit: TAG_LEN + MAX_MESSAGE_LEN,
        };
        buf.push(tag);
        buf
    }

    fn push(&mut self, s: &str) {
        let room = self.limit - self.len;
        let mut take = s.len().min(room);
        while !s.is_char_boundary(take) {
            take -= 1;
        }
        self.bytes[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
    }

    fn message(&self) -> &str {
        // Only whole `str` prefixes cut on char boundaries are ever pushed.
        std::str::from_utf8(&self.bytes[TAG_LEN..self.len]).unwrap_or_default()
    }

    fn finish(&mut self) -> &[u8] {
        self.bytes[self.len] = b'\n';
        &self.bytes[..self.len + 1]
    }
}

impl fmt::Write for LineBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.push(s);
        Ok(())
    }
}

/// A verbosity level bound to an output sink.
#[derive(Debug, Clone)]
pub struct Logger {
    verbosity: Verbosity,
    sink: LogSink,
}

static GLOBAL_LOGGER: OnceLock<RwLock<Logger>> = OnceLock::new();

impl Logger {
    /// Create a logger writing to `sink`.
    pub fn new(verbosity: Verbosity, sink: LogSink) -> Self {
        Self { verbosity, sink }
    }

    /// A logger on the shared standard error sink.
    pub fn stderr(verbosity: Verbosity) -> Self {
        Self::new(verbosity, LogSink::stderr())
    }

    /// The process default logger.
    ///
    /// On first use it writes to stderr at the verbosity from [`Config`].
    pub fn global() -> Logger {
        let lock = GLOBAL_LOGGER.get_or_init(|| RwLock::new(Logger::stderr(Config::get().verbosity)));
        lock.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Replace the process default logger.
    pub fn set_global(logger: Logger) {
        let lock = GLOBAL_LOGGER.get_or_init(|| RwLock::new(logger.clone()));
        *lock.write().unwrap_or_else(|p| p.into_inner()) = logger;
    }

    /// The configured verbosity.
    pub fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    /// A copy of this logger at a different verbosity, sharing the sink.
    pub fn with_verbosity(&self, verbosity: Verbosity) -> Self {
        Self::new(verbosity, self.sink.clone())
    }

    /// Whether lines on `level` are emitted.
    pub fn enabled(&self, level: Level) -> bool {
        self.verbosity >= level.threshold()
    }

    /// Format, frame, write and flush one line if `level` is enabled.
    pub fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        if !self.enabled(level) {
            return;
        }
        let mut line = LineBuf::new(level.tag());
        let _ = line.write_fmt(args);
        let message = line.message();
        match level {
            Level::Error => tracing::error!(target: "gpudma", "{message}"),
            Level::Warn => tracing::warn!(target: "gpudma", "{message}"),
            Level::Info => tracing::info!(target: "gpudma", "{message}"),
            Level::Debug => tracing::debug!(target: "gpudma", "{message}"),
        }
        self.sink.write_line(line.finish());
    }

    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Error, args);
    }

    pub fn warn(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Warn, args);
    }

    pub fn info(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Info, args);
    }

    pub fn debug(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Debug, args);
    }
}

/// Log on the error channel: `log_error!(logger, "fmt", args..)`.
#[macro_export]
macro_rules! log_error {
    ($logger:expr, $($arg:tt)+) => {
        $logger.error(format_args!($($arg)+))
    };
}

/// Log on the warning channel.
#[macro_export]
macro_rules! log_warn {
    ($logger:expr, $($arg:tt)+) => {
        $logger.warn(format_args!($($arg)+))
    };
}

/// Log on the info channel.
#[macro_export]
macro_rules! log_info {
    ($logger:expr, $($arg:tt)+) => {
        $logger.info(format_args!($($arg)+))
    };
}

/// Log on the debug channel.
#[macro_export]
macro_rules! log_debug {
    ($logger:expr, $($arg:tt)+) => {
        $logger.debug(format_args!($($arg)+))
    };
}
