//! Runtime-configurable defaults for gpudma-rs.
//!
//! Configuration is read from environment variables on first access, and can
//! be modified at runtime through a global singleton. The harness normally
//! sets it once at startup.
//!
//! # Environment Variables
//!
//! | Variable | Type | Default | Description |
//! |----------|------|---------|-------------|
//! | `GPUDMA_BACKEND` | `Backend` | `auto` | Device runtime to use |
//! | `GPUDMA_VERBOSITY` | `0..=3` | `0` | Logger verbosity |
//! | `GPUDMA_DMA_ALIGNMENT` | `usize` | page size | Required alignment of remote windows |
//! | `GPUDMA_ADAPTER` | `u32` | `0` | Local fabric adapter number |
//! | `GPUDMA_CONNECT_TIMEOUT_MS` | `u32` | `0` (infinite) | Segment connect timeout |

use std::sync::{OnceLock, RwLock};

use crate::align::page_size;
use crate::backend::Backend;
use crate::error::{Error, ErrorKind};
use crate::log::Verbosity;

/// Runtime configuration for gpudma-rs.
///
/// Thread-safe access through the global singleton via [`Config::get`] and [`Config::set`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Which device runtime backs the memory manager.
    pub backend: Backend,
    /// Verbosity of the process default logger.
    pub verbosity: Verbosity,
    /// Alignment (bytes) required of remote window base and length.
    pub dma_alignment: usize,
    /// Local adapter used when connecting to remote segments.
    pub adapter: u32,
    /// Timeout for connecting to a remote segment; 0 waits forever.
    pub connect_timeout_ms: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: Backend::Auto,
            verbosity: Verbosity::ERRORS,
            dma_alignment: page_size(),
            adapter: 0,
            connect_timeout_ms: 0,
        }
    }
}

static GLOBAL_CONFIG: OnceLock<RwLock<Config>> = OnceLock::new();

impl Config {
    /// Create a configuration from environment variables, falling back to defaults.
    pub fn from_env() -> crate::error::Result<Self> {
        let mut config = Config::default();

        if let Some(val) = env_var("GPUDMA_BACKEND")? {
            config.backend = Backend::parse(&val)?;
        }

        if let Some(val) = env_var("GPUDMA_VERBOSITY")? {
            let level = parse_u32(&val, "GPUDMA_VERBOSITY")?;
            config.verbosity = u8::try_from(level)
                .map_err(|_| invalid_value("GPUDMA_VERBOSITY", &val))
                .and_then(Verbosity::new)
                .map_err(|e| e.with_operation("Config::from_env"))?;
        }

        if let Some(val) = env_var("GPUDMA_DMA_ALIGNMENT")? {
            let alignment = parse_u32(&val, "GPUDMA_DMA_ALIGNMENT")? as usize;
            if !alignment.is_power_of_two() {
                return Err(Error::new(
                    ErrorKind::ConfigInvalid,
                    format!("GPUDMA_DMA_ALIGNMENT must be a power of two, got {alignment}"),
                )
                .with_operation("Config::from_env")
                .with_context("env_var", "GPUDMA_DMA_ALIGNMENT"));
            }
            config.dma_alignment = alignment;
        }

        if let Some(val) = env_var("GPUDMA_ADAPTER")? {
            config.adapter = parse_u32(&val, "GPUDMA_ADAPTER")?;
        }

        if let Some(val) = env_var("GPUDMA_CONNECT_TIMEOUT_MS")? {
            config.connect_timeout_ms = parse_u32(&val, "GPUDMA_CONNECT_TIMEOUT_MS")?;
        }

        Ok(config)
    }

    /// Get a read-only snapshot of the global configuration.
    ///
    /// On first call, reads from environment variables. A malformed
    /// environment falls back to the defaults.
    pub fn get() -> Config {
        let lock = GLOBAL_CONFIG.get_or_init(|| RwLock::new(Config::from_env().unwrap_or_default()));
        lock.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Replace the global configuration.
    pub fn set(config: Config) {
        let lock = GLOBAL_CONFIG.get_or_init(|| RwLock::new(Config::default()));
        *lock.write().unwrap_or_else(|p| p.into_inner()) = config;
    }

    /// Modify the global configuration in place via a closure.
    pub fn update(f: impl FnOnce(&mut Config)) {
        let lock = GLOBAL_CONFIG.get_or_init(|| RwLock::new(Config::default()));
        f(&mut lock.write().unwrap_or_else(|p| p.into_inner()));
    }
}

/// Read an environment variable, returning `None` if it is unset or empty.
fn env_var(name: &str) -> crate::error::Result<Option<String>> {
    match std::env::var(name) {
        Ok(val) if val.trim().is_empty() => Ok(None),
        Ok(val) => Ok(Some(val)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(Error::new(
            ErrorKind::ConfigInvalid,
            format!("environment variable {name} contains invalid Unicode"),
        )
        .with_operation("Config::from_env")
        .with_context("env_var", name)),
    }
}

fn invalid_value(var_name: &str, val: &str) -> Error {
    Error::new(
        ErrorKind::ConfigInvalid,
        format!("invalid value for {var_name}: {val:?}"),
    )
    .with_operation("Config::from_env")
    .with_context("env_var", var_name.to_string())
}

fn parse_u32(val: &str, var_name: &str) -> crate::error::Result<u32> {
    val.trim()
        .parse::<u32>()
        .map_err(|e| invalid_value(var_name, val).set_source(e))
}
