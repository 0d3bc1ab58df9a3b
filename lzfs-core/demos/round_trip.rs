//! Round trip example for LZFS.
//!
//! Writes a file plain and compressed, reads both back and prints what
//! landed on disk.

use lzfs_core::{Dispatcher, DispatcherConfig, SystemHeap, WorkFlags};
use std::fs;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    println!("LZFS Round Trip Example");

    let heap = SystemHeap::shared("example");
    let dispatcher = Dispatcher::new(DispatcherConfig::default(), heap.clone())?;

    let plain_path = "/tmp/lzfs_example_plain.bin";
    let compressed_path = "/tmp/lzfs_example_compressed.bin";
    let payload = "the quick brown fox jumps over the lazy dog. ".repeat(256);

    // Both writes run concurrently
    let plain = dispatcher.submit_write(plain_path, payload.as_bytes(), false);
    let compressed = dispatcher.submit_write(compressed_path, payload.as_bytes(), true);

    println!("\n=== Writes ===");
    println!(
        "plain:      status {}, {} bytes on disk",
        plain.status_code(),
        plain.size()
    );
    println!(
        "compressed: status {}, {} bytes on disk ({:.1}% of original)",
        compressed.status_code(),
        compressed.size(),
        compressed.size() as f64 * 100.0 / payload.len() as f64
    );

    let read = dispatcher.submit_read(
        compressed_path,
        &heap,
        WorkFlags::NONE.compressed(true).null_terminate(true),
    );

    println!("\n=== Read ===");
    match read.buffer() {
        Some(data) => {
            println!("status {}, {} bytes", read.status_code(), read.size());
            println!("matches original: {}", data == payload.as_bytes());
        }
        None => println!("read failed: {:?}", read.result()),
    }

    drop((plain, compressed, read));
    let stats = dispatcher.stats();
    println!("\n=== Stats ===\n{:#?}", stats);

    dispatcher.shutdown()?;

    let _ = fs::remove_file(plain_path);
    let _ = fs::remove_file(compressed_path);
    Ok(())
}
