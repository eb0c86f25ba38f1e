//! Loopback transfer example.
//!
//! Binds a loopback segment to a device buffer, pushes data to the "remote"
//! side, pulls it back, then shows how a failed cleared copy is reported.
//! Loopback segments are ordinary host memory, which the CUDA driver refuses
//! to register as I/O memory, so this always runs on the host-emulated
//! runtime. No GPU or fabric adapter required.
//!
//! # Usage
//!
//! ```sh
//! GPUDMA_VERBOSITY=2 cargo run --example loopback_transfer
//! ```

use std::process;
use std::time::Instant;

use gpudma_rs::backend::open_runtime;
use gpudma_rs::{
    Backend, Config, Error, ErrorKind, Fabric, LoopbackFabric, Logger, MemoryManager, Result,
    SegmentFlags, StatusCode, TransferEngine,
};

const SEGMENT_ID: u32 = 7;
const SIZE: usize = 1 << 20;

fn main() {
    println!("gpudma-rs: Loopback Transfer Example");
    println!("====================================\n");

    let logger = Logger::global();
    if let Err(e) = run(&logger) {
        e.report(&logger);
        process::exit(1);
    }
}

fn run(logger: &Logger) -> Result<()> {
    let config = Config::get();
    println!("Configuration:");
    println!("  verbosity:     {}", config.verbosity.level());
    println!("  dma_alignment: {} bytes", config.dma_alignment);
    println!();

    let memory = MemoryManager::new(open_runtime(Backend::Host)?, logger.clone());
    println!("Runtime: {}", memory.runtime().name());
    println!("Device 0: {}\n", memory.info(0)?);

    let engine = TransferEngine::new(memory.clone());
    let fabric = LoopbackFabric::new(0);
    fabric.create_segment(SEGMENT_ID, SIZE)?;

    let data: Vec<u8> = (0..SIZE).map(|i| (i % 251) as u8).collect();
    let buffer = memory.allocate(0, SIZE)?;
    memory.write(&buffer, 0, &data)?;

    let window = fabric.connect(0, SEGMENT_ID)?;
    let mut segment = engine.prepare_transfer(&buffer, SegmentFlags::default(), window)?;

    // ---- Local to remote ----
    let start = Instant::now();
    let n = engine.copy_local_to_remote(&mut segment, SIZE, false)?;
    println!("local -> remote: {n} bytes in {:?}", start.elapsed());

    // ---- Remote to local, into a cleared buffer ----
    let start = Instant::now();
    let n = engine.copy_remote_to_local(&mut segment, SIZE, true)?;
    println!("remote -> local: {n} bytes in {:?}", start.elapsed());

    let matches = memory.compare(&buffer, segment.window(), SIZE)?;
    println!("buffer matches remote: {matches}\n");
    if !matches {
        return Err(Error::new(ErrorKind::Unexpected, "buffer differs from remote after copy")
            .with_operation("loopback_transfer"));
    }

    // ---- Failure path ----
    fabric.inject_fault(SEGMENT_ID, StatusCode::TRANSFER_FAILED)?;
    match engine.copy_remote_to_local(&mut segment, SIZE, true) {
        Ok(_) => println!("unexpected success"),
        Err(e) => {
            println!("failed copy: {} ({:?})", e.message(), e.fabric_status());
            e.report(logger);
        }
    }
    let mut host = vec![0xffu8; SIZE];
    engine.copy_device_to_host(&buffer, &mut host)?;
    println!("buffer zeroed after failure: {}", host.iter().all(|&b| b == 0));
    Ok(())
}
