//! Configuration environment variable integration tests.

mod test_utils;

use std::sync::{Mutex, MutexGuard};

use gpudma_rs::{Backend, Config, ErrorKind, Logger, MemoryManager, Verbosity};

use test_utils::EnvVarGuard;

const ALL_VARS: &[&str] = &[
    "GPUDMA_BACKEND",
    "GPUDMA_VERBOSITY",
    "GPUDMA_DMA_ALIGNMENT",
    "GPUDMA_ADAPTER",
    "GPUDMA_CONNECT_TIMEOUT_MS",
];

static ENV_LOCK: Mutex<()> = Mutex::new(());

/// Serialize env access and start from an unset environment.
///
/// The env guard comes first so it restores before the lock is released.
fn clean_env() -> (EnvVarGuard, MutexGuard<'static, ()>) {
    let lock = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    (EnvVarGuard::remove(ALL_VARS), lock)
}

#[test]
fn test_env_defaults() {
    let _clean = clean_env();
    let config = Config::from_env().unwrap();
    assert_eq!(config.backend, Backend::Auto);
    assert_eq!(config.verbosity, Verbosity::ERRORS);
    assert_eq!(config.dma_alignment, gpudma_rs::align::page_size());
    assert_eq!(config.adapter, 0);
    assert_eq!(config.connect_timeout_ms, 0);
}

#[test]
fn test_env_backend() {
    let _clean = clean_env();
    let _guard = EnvVarGuard::new(&[("GPUDMA_BACKEND", "emulated")]);
    assert_eq!(Config::from_env().unwrap().backend, Backend::Host);
}

#[test]
fn test_env_verbosity() {
    let _clean = clean_env();
    let _guard = EnvVarGuard::new(&[("GPUDMA_VERBOSITY", "3")]);
    assert_eq!(Config::from_env().unwrap().verbosity, Verbosity::DEBUG);
}

#[test]
fn test_env_alignment_adapter_timeout() {
    let _clean = clean_env();
    let _guard = EnvVarGuard::new(&[
        ("GPUDMA_DMA_ALIGNMENT", "65536"),
        ("GPUDMA_ADAPTER", "2"),
        ("GPUDMA_CONNECT_TIMEOUT_MS", "1500"),
    ]);
    let config = Config::from_env().unwrap();
    assert_eq!(config.dma_alignment, 65536);
    assert_eq!(config.adapter, 2);
    assert_eq!(config.connect_timeout_ms, 1500);
}

#[test]
fn test_env_empty_value_uses_default() {
    let _clean = clean_env();
    let _guard = EnvVarGuard::new(&[("GPUDMA_ADAPTER", "  ")]);
    assert_eq!(Config::from_env().unwrap().adapter, 0);
}

/// The only test here that touches the process-wide `Config` and `Logger`.
#[test]
fn test_from_config_and_global_logger_follow_env() {
    let _clean = clean_env();
    let _guard = EnvVarGuard::new(&[("GPUDMA_BACKEND", "host"), ("GPUDMA_VERBOSITY", "2")]);

    let memory = MemoryManager::from_config().unwrap();
    assert_eq!(memory.runtime().name(), "host");
    assert_eq!(memory.logger().verbosity(), Verbosity::INFO);
    assert_eq!(Logger::global().verbosity(), Verbosity::INFO);

    let buffer = memory.allocate(0, 4096).unwrap();
    assert!(memory.is_live(buffer.as_device_ptr()));
}

// ---- Invalid values ----

#[test]
fn test_invalid_backend() {
    let _clean = clean_env();
    let _guard = EnvVarGuard::new(&[("GPUDMA_BACKEND", "opencl")]);
    assert_eq!(Config::from_env().unwrap_err().kind(), ErrorKind::ConfigInvalid);
}

#[test]
fn test_invalid_verbosity() {
    let _clean = clean_env();
    for bad in ["4", "-1", "loud", "300"] {
        let _guard = EnvVarGuard::new(&[("GPUDMA_VERBOSITY", bad)]);
        let err = Config::from_env().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigInvalid, "{bad:?}");
    }
}

#[test]
fn test_invalid_alignment_not_power_of_two() {
    let _clean = clean_env();
    let _guard = EnvVarGuard::new(&[("GPUDMA_DMA_ALIGNMENT", "3000")]);
    let err = Config::from_env().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
    assert!(err.message().contains("power of two"));
}

#[test]
fn test_invalid_adapter_reports_variable() {
    let _clean = clean_env();
    let _guard = EnvVarGuard::new(&[("GPUDMA_ADAPTER", "abc")]);
    let err = Config::from_env().unwrap_err();
    let ctx: Vec<_> = err.context_iter().collect();
    assert!(ctx.contains(&("env_var", "GPUDMA_ADAPTER")));
}
