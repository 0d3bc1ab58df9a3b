//! Leak check example for LZFS.
//!
//! Runs the dispatcher on a tracking heap, forgets one buffer on purpose
//! and lets the heap report it with the allocating call stack.

use lzfs_core::{
    Dispatcher, DispatcherConfig, SharedHeap, SystemHeap, TrackingHeap, WorkFlags,
};
use std::fs;
use std::sync::Arc;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    println!("LZFS Leak Check Example");

    let tracking =
        Arc::new(TrackingHeap::new(SystemHeap::shared("system")).with_backtraces(true));
    let heap: SharedHeap = tracking.clone();
    let dispatcher = Dispatcher::new(DispatcherConfig::default(), heap.clone())?;

    let path = "/tmp/lzfs_example_leak.bin";
    let write = dispatcher.submit_write(path, &b"leaky data"[..], true);
    println!("write status {}", write.status_code());
    drop(write);

    let mut read = dispatcher.submit_read(path, &heap, WorkFlags::NONE.compressed(true));
    let buffer = read.take_buffer();
    drop(read);
    dispatcher.shutdown()?;

    println!("\n=== Before forgetting the buffer ===");
    println!("live allocations: {}", tracking.live_allocations());

    // Leak the read buffer on purpose
    std::mem::forget(buffer);

    println!("\n=== After forgetting the buffer ===");
    let leaks = tracking.report_leaks();
    println!("leaks reported: {}", leaks);
    for leak in tracking.leaks() {
        println!("{:#x}: {} bytes", leak.address, leak.size);
    }

    let _ = fs::remove_file(path);
    Ok(())
}
