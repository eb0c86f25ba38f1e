//! # gpudma-rs
//!
//! Zero-copy DMA between GPU memory on one cluster node and memory on
//! another, across a PCIe interconnect fabric (Dolphin SISCI class).
//!
//! ## Architecture
//!
//! A remote segment is mapped into the local address space by a [`Fabric`],
//! registered with the GPU driver as I/O memory, and bound to a
//! [`DeviceBuffer`]. Copies then run device-to-device between the buffer and
//! the registered window, so data never stages through host RAM.
//!
//! - [`MemoryManager`] allocates and inspects device memory.
//! - [`TransferEngine`] binds windows to buffers and executes copies.
//! - [`status`] translates fabric status codes into messages.
//! - [`log`] provides the tiered diagnostic logger.
//!
//! Device memory comes from the CUDA driver via [`cudarc`], or is emulated in
//! host RAM when no GPU is present (see [`Backend`]).
//!
//! ```
//! use gpudma_rs::{Fabric, LoopbackFabric, MemoryManager, SegmentFlags, TransferEngine};
//! use gpudma_rs::host::HostRuntime;
//! use gpudma_rs::log::{Logger, Verbosity};
//! use std::sync::Arc;
//!
//! let memory = MemoryManager::new(Arc::new(HostRuntime::default()), Logger::stderr(Verbosity::ERRORS));
//! let engine = TransferEngine::new(memory.clone()).with_alignment(4096);
//! let fabric = LoopbackFabric::new(0);
//! fabric.create_segment(1, 4096)?;
//!
//! let buffer = memory.allocate(0, 4096)?;
//! let mut segment = engine.prepare_transfer(&buffer, SegmentFlags::default(), fabric.connect(0, 1)?)?;
//! assert_eq!(engine.copy_remote_to_local(&mut segment, 4096, false)?, 4096);
//! # Ok::<(), gpudma_rs::Error>(())
//! ```
//!
//! ## Feature Flags
//!
//! - `sisci`: link against `libsisci` and expose [`sisci::SisciFabric`].

pub mod align;
pub mod backend;
pub mod config;
pub mod cuda;
pub mod engine;
pub mod error;
pub mod fabric;
pub mod host;
pub mod log;
pub mod memory;
pub mod runtime;
#[cfg(feature = "sisci")]
pub mod sisci;
pub mod status;

pub use backend::Backend;
pub use config::Config;
pub use engine::{Direction, RemoteSegment, SegmentFlags, SyncState, Transfer, TransferEngine};
pub use error::{Error, ErrorKind, ErrorStatus, Result};
pub use fabric::{Fabric, LoopbackFabric, RegionKey, RemoteWindow};
pub use log::{Logger, Verbosity};
pub use memory::{DeviceBuffer, MemoryManager};
pub use runtime::{DeviceInfo, DevicePtr, DeviceRuntime};
pub use status::StatusCode;
