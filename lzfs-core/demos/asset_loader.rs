//! Asset loader example for LZFS.
//!
//! A render loop keeps ticking while its assets stream in, and only
//! touches each asset once its work has completed.

use lzfs_core::{Dispatcher, DispatcherConfig, SystemHeap, WorkFlags, WorkHandle};
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

struct Asset {
    name: &'static str,
    handle: WorkHandle,
    loaded: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    println!("LZFS Asset Loader Example");

    let asset_dir = PathBuf::from("/tmp/lzfs_example_assets");
    fs::create_dir_all(&asset_dir)?;

    let heap = SystemHeap::shared("assets");
    let dispatcher = Dispatcher::new(
        DispatcherConfig {
            pin_threads: true,
            ..DispatcherConfig::default()
        },
        heap.clone(),
    )?;

    // Pack the assets first; shaders are stored compressed
    let sources: [(&'static str, Vec<u8>, bool); 3] = [
        ("triangle.vert", b"#version 450\nvoid main() {}\n".repeat(64), true),
        ("triangle.frag", b"#version 450\nlayout(location = 0) out vec4 color;\n".repeat(64), true),
        ("music.wav", vec![0x7f; 48_000], false),
    ];
    let packing: Vec<WorkHandle> = sources
        .iter()
        .map(|(name, data, compressed)| {
            let path = asset_dir.join(name);
            dispatcher.submit_write(&path.to_string_lossy(), data.clone(), *compressed)
        })
        .collect();
    for (handle, (name, _, _)) in packing.iter().zip(&sources) {
        println!("packed {:<14} -> status {}", name, handle.status_code());
    }
    drop(packing);

    // Now stream them back in without blocking the frame loop
    let mut assets: Vec<Asset> = sources
        .iter()
        .map(|(name, _, compressed)| Asset {
            name: *name,
            handle: dispatcher.submit_read(
                &asset_dir.join(name).to_string_lossy(),
                &heap,
                WorkFlags::NONE.compressed(*compressed).null_terminate(true),
            ),
            loaded: false,
        })
        .collect();

    let start = Instant::now();
    let mut frame = 0u64;
    while assets.iter().any(|asset| !asset.loaded) {
        frame += 1;
        for asset in assets.iter_mut().filter(|asset| !asset.loaded) {
            if asset.handle.is_done() {
                asset.loaded = true;
                println!(
                    "frame {:>4}: {:<14} loaded, status {}, {} bytes",
                    frame,
                    asset.name,
                    asset.handle.status_code(),
                    asset.handle.size()
                );
            }
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    println!("all assets loaded after {} frames ({:?})", frame, start.elapsed());

    // Keep the music buffer, release the rest with their handles
    let mut music = assets.pop().map(|asset| asset.handle);
    let samples = music.as_mut().and_then(WorkHandle::take_buffer);
    drop(assets);
    drop(music);
    if let Some(samples) = samples {
        println!("kept {} music bytes from heap `{}`", samples.len(), samples.heap().name());
    }

    dispatcher.shutdown()?;
    fs::remove_dir_all(&asset_dir)?;
    Ok(())
}
