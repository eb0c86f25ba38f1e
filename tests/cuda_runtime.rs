//! CUDA driver backend tests.
//!
//! **Requires:** an NVIDIA GPU and driver. Skips (passes) when none is found.
//!
//! ```sh
//! cargo test --test cuda_runtime -- --ignored --nocapture
//! ```

mod test_utils;

use std::sync::Arc;

use gpudma_rs::cuda::CudaRuntime;
use gpudma_rs::log::{LogSink, Logger, Verbosity};
use gpudma_rs::{DeviceRuntime, ErrorKind, MemoryManager};

use test_utils::{assert_data_eq, cuda_available, gen_data};

fn manager() -> Option<MemoryManager> {
    if !cuda_available() {
        eprintln!("SKIP: no CUDA device");
        return None;
    }
    let runtime = CudaRuntime::new().unwrap();
    let (sink, _) = LogSink::memory();
    Some(MemoryManager::new(
        Arc::new(runtime),
        Logger::new(Verbosity::ERRORS, sink),
    ))
}

#[test]
#[ignore = "requires CUDA GPU: cargo test --test cuda_runtime -- --ignored"]
fn test_device_info() {
    let Some(mm) = manager() else { return };
    let info = mm.info(0).unwrap();
    assert_eq!(info.id, 0);
    assert!(!info.name.is_empty());
    println!("device 0: {info}");

    let count = mm.runtime().device_count().unwrap();
    assert_eq!(mm.info(count).unwrap_err().kind(), ErrorKind::NotFound);
}

#[test]
#[ignore = "requires CUDA GPU: cargo test --test cuda_runtime -- --ignored"]
fn test_allocate_fill_write_readback() {
    let Some(mm) = manager() else { return };
    let size = 1 << 20;
    let buf = mm.allocate(0, size).unwrap();
    mm.fill(&buf, 0, size, 0x3c).unwrap();
    let mut out = vec![0u8; size];
    mm.copy_to_host(&buf, &mut out).unwrap();
    assert!(out.iter().all(|&b| b == 0x3c));

    let data = gen_data(size);
    mm.write(&buf, 0, &data).unwrap();
    mm.copy_to_host(&buf, &mut out).unwrap();
    assert_data_eq(&data, &out);
}

#[test]
#[ignore = "requires CUDA GPU: cargo test --test cuda_runtime -- --ignored"]
fn test_sync_memops_attribute() {
    let Some(mm) = manager() else { return };
    let buf = mm.allocate(0, 1 << 16).unwrap();
    let ptr = mm.device_pointer(&buf).unwrap();
    mm.mark_sync_required(ptr).unwrap();
    assert!(mm.sync_required(ptr).unwrap());
}

#[test]
#[ignore = "requires CUDA GPU: cargo test --test cuda_runtime -- --ignored"]
fn test_double_free_rejected() {
    let Some(mm) = manager() else { return };
    let buf = mm.allocate(0, 4096).unwrap();
    let ptr = buf.as_device_ptr();
    mm.free_raw(ptr).unwrap();
    assert_eq!(mm.free_raw(ptr).unwrap_err().kind(), ErrorKind::InvalidHandle);
}
