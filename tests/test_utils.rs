//! Shared test utilities for gpudma-rs integration tests.
//!
//! Environment variable guards, deterministic data generation, and
//! constructors for an emulated-device stack wired to a loopback fabric.

#![allow(dead_code)]

use std::env;
use std::sync::Arc;

use gpudma_rs::host::HostRuntime;
use gpudma_rs::log::{LogSink, Logger, MemoryLog, Verbosity};
use gpudma_rs::{LoopbackFabric, MemoryManager, TransferEngine};

/// Page size used by the loopback fixtures.
pub const PAGE: usize = 4096;

/// RAII guard for temporarily setting environment variables.
///
/// Saves the current value of each variable on construction and restores it
/// on drop.
///
/// # Safety
///
/// Environment variable manipulation is not thread-safe. Tests using this
/// guard must not run in parallel with other tests reading the same
/// variables.
pub struct EnvVarGuard {
    saved: Vec<(String, Option<String>)>,
}

impl EnvVarGuard {
    /// Set each `(key, value)` pair until the guard is dropped.
    pub fn new(vars: &[(&str, &str)]) -> Self {
        let mut saved = Vec::with_capacity(vars.len());
        for (key, value) in vars {
            saved.push((key.to_string(), env::var(key).ok()));
            // SAFETY: see the type-level note.
            unsafe { env::set_var(key, value) };
        }
        Self { saved }
    }

    /// Remove the given variables until the guard is dropped.
    pub fn remove(vars: &[&str]) -> Self {
        let mut saved = Vec::with_capacity(vars.len());
        for key in vars {
            saved.push((key.to_string(), env::var(key).ok()));
            // SAFETY: see the type-level note.
            unsafe { env::remove_var(key) };
        }
        Self { saved }
    }
}

impl Drop for EnvVarGuard {
    fn drop(&mut self) {
        for (key, prev) in &self.saved {
            // SAFETY: restoring previous state.
            match prev {
                Some(val) => unsafe { env::set_var(key, val) },
                None => unsafe { env::remove_var(key) },
            }
        }
    }
}

/// Deterministic, non-repeating-per-page test data.
///
/// Uses a prime modulus so every page of the pattern differs from the last.
pub fn gen_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

/// Compare two byte slices, reporting the first mismatching offset.
pub fn assert_data_eq(expected: &[u8], actual: &[u8]) {
    assert_eq!(
        expected.len(),
        actual.len(),
        "buffer length mismatch: expected {}, got {}",
        expected.len(),
        actual.len()
    );
    if let Some(i) = expected.iter().zip(actual).position(|(e, a)| e != a) {
        panic!(
            "data mismatch at byte {i}: expected 0x{:02x}, got 0x{:02x} ({} bytes compared)",
            expected[i],
            actual[i],
            expected.len()
        );
    }
}

/// Assert every byte is zero.
pub fn assert_zeroed(actual: &[u8]) {
    if let Some(i) = actual.iter().position(|&b| b != 0) {
        panic!("expected zeros, found 0x{:02x} at byte {i}", actual[i]);
    }
}

/// An emulated GPU stack plus its captured log output.
pub struct Harness {
    pub runtime: Arc<HostRuntime>,
    pub memory: MemoryManager,
    pub engine: TransferEngine,
    pub fabric: LoopbackFabric,
    pub log: MemoryLog,
    pub logger: Logger,
}

impl Harness {
    /// One emulated device, loopback node 0, page alignment.
    pub fn new(verbosity: Verbosity) -> Self {
        Self::with_runtime(HostRuntime::default(), verbosity)
    }

    pub fn with_runtime(runtime: HostRuntime, verbosity: Verbosity) -> Self {
        let runtime = Arc::new(runtime);
        let (sink, log) = LogSink::memory();
        let logger = Logger::new(verbosity, sink);
        let memory = MemoryManager::new(runtime.clone(), logger.clone());
        let engine = TransferEngine::new(memory.clone()).with_alignment(PAGE);
        Self {
            runtime,
            memory,
            engine,
            fabric: LoopbackFabric::new(0),
            log,
            logger,
        }
    }

    /// Read back a whole device buffer.
    pub fn read_buffer(&self, buffer: &gpudma_rs::DeviceBuffer) -> Vec<u8> {
        let mut out = vec![0u8; buffer.len()];
        let n = self.memory.copy_to_host(buffer, &mut out).unwrap();
        assert_eq!(n, buffer.len());
        out
    }

    /// Read back `len` bytes of a loopback segment as its exporter sees them.
    pub fn read_segment(&self, id: u32, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        self.fabric.read_segment(id, 0, &mut out).unwrap();
        out
    }
}

/// Whether a CUDA device is usable in this process.
pub fn cuda_available() -> bool {
    gpudma_rs::backend::is_nvidia_driver_loaded()
        && gpudma_rs::cuda::CudaRuntime::new()
            .and_then(|rt| gpudma_rs::DeviceRuntime::device_count(&rt))
            .is_ok_and(|n| n > 0)
}
