use super::*;
use crate::backend::OpenMode;
use crate::codec::{read_header, HEADER_SIZE};
use crate::error::{CodecError, WorkError, STATUS_ABANDONED, STATUS_CODEC, STATUS_PATH_ENCODING};
use crate::heap::{SystemHeap, TrackingHeap};
use crate::work::MAX_PATH_LEN;
use rand::Rng;
use std::fs::{self, File};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn temp_path(name: &str) -> String {
    std::env::temp_dir()
        .join(format!("lzfs-{}-{}", uuid::Uuid::new_v4().as_simple(), name))
        .to_string_lossy()
        .into_owned()
}

fn compressible_payload(len: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| b"lzfs"[rng.gen_range(0..4)]).collect()
}

fn start(capacity: usize) -> (Dispatcher, SharedHeap) {
    let heap = SystemHeap::shared("test");
    let dispatcher = Dispatcher::new(DispatcherConfig::with_capacity(capacity), heap.clone())
        .expect("dispatcher starts");
    (dispatcher, heap)
}

#[test]
fn test_write_then_read_plain() {
    init_tracing();
    let (dispatcher, heap) = start(8);
    let path = temp_path("test.bin");

    let write = dispatcher.submit_write(&path, &b"hello"[..], false);
    assert_eq!(write.status_code(), 0);
    assert_eq!(write.size(), 5);
    assert_eq!(write.buffer(), Some(&b"hello"[..]));

    let read = dispatcher.submit_read(&path, &heap, WorkFlags::NONE.null_terminate(true));
    assert_eq!(read.status_code(), 0);
    assert_eq!(read.size(), 5);
    assert_eq!(read.buffer(), Some(&b"hello"[..]));
    assert_eq!(read.buffer_with_terminator(), Some(&b"hello\0"[..]));

    drop(write);
    drop(read);
    dispatcher.shutdown().unwrap();
    let _ = fs::remove_file(&path);
}

#[test]
fn test_plain_read_without_terminator() {
    let (dispatcher, heap) = start(8);
    let path = temp_path("plain.bin");
    fs::write(&path, b"0123456789").unwrap();

    let mut read = dispatcher.submit_read(&path, &heap, WorkFlags::NONE);
    assert_eq!(read.status_code(), 0);
    assert_eq!(read.size(), 10);
    assert!(read.buffer_with_terminator().is_none());

    let buffer = read.take_buffer().unwrap();
    assert_eq!(&buffer[..], b"0123456789");
    assert!(read.take_buffer().is_none());

    dispatcher.shutdown().unwrap();
    let _ = fs::remove_file(&path);
}

#[test]
fn test_compressed_round_trip() {
    init_tracing();
    let (dispatcher, heap) = start(4);
    let path = temp_path("compressed.bin");
    let payload = compressible_payload(64 * 1024);

    let write = dispatcher.submit_write(&path, payload.clone(), true);
    assert_eq!(write.status_code(), 0);

    // The file is a frame: original length, then the LZ4 block
    let on_disk = fs::read(&path).unwrap();
    assert_eq!(on_disk.len(), write.size());
    assert_eq!(read_header(&on_disk).unwrap(), payload.len());
    assert_eq!(&on_disk[..HEADER_SIZE], &(payload.len() as u32).to_le_bytes());
    assert!(on_disk.len() < payload.len());
    assert_eq!(write.buffer(), Some(&on_disk[..]));

    let read = dispatcher.submit_read(&path, &heap, WorkFlags::NONE.compressed(true));
    assert_eq!(read.status_code(), 0);
    assert_eq!(read.size(), payload.len());
    assert_eq!(read.buffer(), Some(&payload[..]));

    let terminated = dispatcher.submit_read(
        &path,
        &heap,
        WorkFlags::NONE.compressed(true).null_terminate(true),
    );
    assert_eq!(terminated.size(), payload.len());
    let with_terminator = terminated.buffer_with_terminator().unwrap();
    assert_eq!(with_terminator.len(), payload.len() + 1);
    assert_eq!(with_terminator[payload.len()], 0);

    drop((write, read, terminated));
    dispatcher.shutdown().unwrap();
    let _ = fs::remove_file(&path);
}

#[test]
fn test_compressed_empty_file() {
    let (dispatcher, heap) = start(2);
    let path = temp_path("empty.bin");

    let write = dispatcher.submit_write(&path, Vec::new(), true);
    assert_eq!(write.status_code(), 0);
    assert!(write.size() >= HEADER_SIZE);

    let read = dispatcher.submit_read(&path, &heap, WorkFlags::NONE.compressed(true));
    assert_eq!(read.status_code(), 0);
    assert_eq!(read.size(), 0);
    assert_eq!(read.buffer(), Some(&[][..]));

    drop((write, read));
    dispatcher.shutdown().unwrap();
    let _ = fs::remove_file(&path);
}

#[test]
fn test_caller_buffer_is_only_borrowed() {
    let (dispatcher, _heap) = start(2);
    let plain_path = temp_path("borrowed-plain.bin");
    let compressed_path = temp_path("borrowed-compressed.bin");
    let data: Arc<[u8]> = Arc::from(&b"caller owned bytes"[..]);

    let plain = dispatcher.submit_write(&plain_path, Arc::clone(&data), false);
    let compressed = dispatcher.submit_write(&compressed_path, Arc::clone(&data), true);
    plain.wait();
    compressed.wait();

    // The compression stage released its reference once the frame was built
    assert_eq!(Arc::strong_count(&data), 2);
    drop(plain);
    assert_eq!(Arc::strong_count(&data), 1);
    assert_eq!(&data[..], b"caller owned bytes");

    drop(compressed);
    dispatcher.shutdown().unwrap();
    let _ = fs::remove_file(&plain_path);
    let _ = fs::remove_file(&compressed_path);
}

#[test]
fn test_missing_file_reports_os_error() {
    let (dispatcher, heap) = start(2);
    let path = temp_path("does-not-exist.bin");

    let read = dispatcher.submit_read(&path, &heap, WorkFlags::NONE);
    match read.result() {
        Err(WorkError::Io(e)) => {
            assert_eq!(e.kind(), io::ErrorKind::NotFound);
            assert_eq!(Some(read.status_code()), e.raw_os_error());
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(read.status_code() > 0);
    assert!(read.buffer().is_none());

    drop(read);
    dispatcher.shutdown().unwrap();
}

#[test]
fn test_write_into_missing_directory_reports_os_error() {
    let (dispatcher, _heap) = start(2);
    let path = std::env::temp_dir()
        .join(format!("lzfs-{}", uuid::Uuid::new_v4().as_simple()))
        .join("missing-dir")
        .join("file.bin")
        .to_string_lossy()
        .into_owned();

    for compressed in [false, true] {
        let write = dispatcher.submit_write(&path, &b"never lands"[..], compressed);
        match write.result() {
            Err(WorkError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::NotFound),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(write.status_code() > 0);
    }
    assert!(!Path::new(&path).exists());

    let stats = dispatcher.stats();
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.bytes_written, 0);
    dispatcher.shutdown().unwrap();
}

#[test]
fn test_corrupt_frames_are_codec_errors() {
    let (dispatcher, heap) = start(4);
    let flags = WorkFlags::NONE.compressed(true);

    // Shorter than the header
    let truncated = temp_path("truncated.bin");
    fs::write(&truncated, [7u8, 0]).unwrap();

    // Valid header, garbage payload
    let garbage = temp_path("garbage.bin");
    let mut frame = 64u32.to_le_bytes().to_vec();
    frame.extend_from_slice(&[0xff; 32]);
    fs::write(&garbage, &frame).unwrap();

    // Header announces more than the payload holds
    let mismatch = temp_path("mismatch.bin");
    let mut frame = 100u32.to_le_bytes().to_vec();
    frame.extend_from_slice(&lz4_flex::block::compress(b"only a few bytes"));
    fs::write(&mismatch, &frame).unwrap();

    let handles: Vec<_> = [&truncated, &garbage, &mismatch]
        .iter()
        .map(|path| dispatcher.submit_read(path, &heap, flags))
        .collect();

    for handle in &handles {
        assert_eq!(handle.status_code(), STATUS_CODEC);
        assert!(handle.buffer().is_none());
    }
    assert!(matches!(
        handles[0].result(),
        Err(WorkError::Codec(CodecError::Truncated { len: 2 }))
    ));
    assert!(matches!(
        handles[2].result(),
        Err(WorkError::Codec(CodecError::SizeMismatch { expected: 100, .. }))
    ));

    drop(handles);
    dispatcher.shutdown().unwrap();
    for path in [truncated, garbage, mismatch] {
        let _ = fs::remove_file(path);
    }
}

#[test]
fn test_implausible_header_allocates_nothing() {
    let (dispatcher, _) = start(2);
    let tracking = Arc::new(TrackingHeap::new(SystemHeap::shared("system")));
    let owner: SharedHeap = tracking.clone();

    // Claims almost 4 GiB behind a two-byte payload
    let path = temp_path("implausible.bin");
    fs::write(&path, [0xF0, 0xFF, 0xFF, 0xFF, 0x10, b'a']).unwrap();

    let read = dispatcher.submit_read(&path, &owner, WorkFlags::NONE.compressed(true));
    assert_eq!(read.status_code(), STATUS_CODEC);
    assert!(matches!(
        read.result(),
        Err(WorkError::Codec(CodecError::ImplausibleSize {
            claimed: 0xFFFF_FFF0,
            payload: 2,
            ..
        }))
    ));
    assert!(read.buffer().is_none());
    assert_eq!(tracking.total_allocations(), 0);

    drop(read);
    dispatcher.shutdown().unwrap();
    let _ = fs::remove_file(&path);
}

#[test]
fn test_bad_paths_complete_without_io() {
    let (dispatcher, heap) = start(2);

    let long = "p".repeat(MAX_PATH_LEN + 10);
    let read = dispatcher.submit_read(&long, &heap, WorkFlags::NONE);
    assert!(read.is_done());
    assert_eq!(read.status_code(), STATUS_PATH_ENCODING);

    let write = dispatcher.submit_write(&long, &b"data"[..], true);
    assert!(write.is_done());
    assert_eq!(write.status_code(), STATUS_PATH_ENCODING);

    // Fits the field but cannot be handed to the platform
    let empty = dispatcher.submit_read("", &heap, WorkFlags::NONE);
    assert_eq!(empty.status_code(), STATUS_PATH_ENCODING);
    let nul = dispatcher.submit_write("bad\0name", &b"data"[..], false);
    assert_eq!(nul.status_code(), STATUS_PATH_ENCODING);

    let stats = dispatcher.stats();
    assert_eq!(stats.reads_submitted, 2);
    assert_eq!(stats.writes_submitted, 2);
    assert_eq!(stats.failed, 4);
    assert_eq!(stats.in_flight(), 0);

    drop((read, write, empty, nul));
    dispatcher.shutdown().unwrap();
}

/// Backend whose `open` waits for the test to let it through.
struct GatedBackend {
    entered: mpsc::Sender<()>,
    release: mpsc::Receiver<()>,
}

impl IoBackend for GatedBackend {
    type Handle = File;

    fn open(&mut self, path: &Path, mode: OpenMode) -> io::Result<File> {
        let _ = self.entered.send(());
        self.release
            .recv()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "gate dropped"))?;
        StdBackend.open(path, mode)
    }

    fn query_size(&mut self, handle: &mut File) -> io::Result<u64> {
        StdBackend.query_size(handle)
    }

    fn read(&mut self, handle: &mut File, buf: &mut [u8]) -> io::Result<usize> {
        StdBackend.read(handle, buf)
    }

    fn write(&mut self, handle: &mut File, buf: &[u8]) -> io::Result<usize> {
        StdBackend.write(handle, buf)
    }

    fn close(&mut self, handle: File) -> io::Result<()> {
        StdBackend.close(handle)
    }
}

#[test]
fn test_submission_blocks_while_queue_is_full() {
    init_tracing();
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let heap = SystemHeap::shared("test");
    let dispatcher = Dispatcher::with_components(
        DispatcherConfig::with_capacity(2),
        heap.clone(),
        GatedBackend {
            entered: entered_tx,
            release: release_rx,
        },
        Lz4Codec,
    )
    .unwrap();

    let path = temp_path("gated.bin");
    fs::write(&path, b"gated").unwrap();

    // The worker holds the first read inside `open`
    let first = dispatcher.submit_read(&path, &heap, WorkFlags::NONE);
    entered_rx.recv().unwrap();

    // Two more fill the queue
    let second = dispatcher.submit_read(&path, &heap, WorkFlags::NONE);
    let third = dispatcher.submit_read(&path, &heap, WorkFlags::NONE);
    assert!(!first.is_done());

    let pushed = AtomicBool::new(false);
    thread::scope(|s| {
        let blocked = s.spawn(|| {
            let handle = dispatcher.submit_read(&path, &heap, WorkFlags::NONE);
            pushed.store(true, Ordering::SeqCst);
            handle
        });

        thread::sleep(Duration::from_millis(100));
        assert!(!pushed.load(Ordering::SeqCst));

        // Finishing the first read frees one slot
        release_tx.send(()).unwrap();
        let fourth = blocked.join().unwrap();
        assert!(pushed.load(Ordering::SeqCst));

        for _ in 0..3 {
            release_tx.send(()).unwrap();
        }
        for handle in [&first, &second, &third, &fourth] {
            assert_eq!(handle.status_code(), 0);
            assert_eq!(handle.buffer(), Some(&b"gated"[..]));
        }
    });

    drop((first, second, third));
    dispatcher.shutdown().unwrap();
    let _ = fs::remove_file(&path);
}

#[test]
fn test_shutdown_completes_queued_work() {
    let (dispatcher, heap) = start(4);
    let payload = compressible_payload(4096);

    let paths: Vec<_> = (0..16).map(|i| temp_path(&format!("queued-{}.bin", i))).collect();
    let writes: Vec<_> = paths
        .iter()
        .map(|path| dispatcher.submit_write(path, payload.clone(), true))
        .collect();

    // The pill must not overtake compressed writes on their way back
    dispatcher.shutdown().unwrap();
    for write in &writes {
        assert!(write.is_done());
        assert_eq!(write.status_code(), 0);
    }

    let (dispatcher, _) = start(4);
    let reads: Vec<_> = paths
        .iter()
        .map(|path| dispatcher.submit_read(path, &heap, WorkFlags::NONE.compressed(true)))
        .collect();
    dispatcher.shutdown().unwrap();
    for read in &reads {
        assert_eq!(read.status_code(), 0);
        assert_eq!(read.buffer(), Some(&payload[..]));
    }

    for path in paths {
        let _ = fs::remove_file(path);
    }
}

#[test]
fn test_no_leaks_after_shutdown() {
    init_tracing();
    let tracking = Arc::new(TrackingHeap::new(SystemHeap::shared("system")).with_backtraces(true));
    let heap: SharedHeap = tracking.clone();
    let dispatcher = Dispatcher::new(DispatcherConfig::default(), heap.clone()).unwrap();

    let plain = temp_path("leak-plain.bin");
    let compressed = temp_path("leak-compressed.bin");
    let payload = compressible_payload(10_000);

    let handles = vec![
        dispatcher.submit_write(&plain, payload.clone(), false),
        dispatcher.submit_write(&compressed, payload.clone(), true),
    ];
    handles.iter().for_each(WorkHandle::wait);

    let mut reads = vec![
        dispatcher.submit_read(&plain, &heap, WorkFlags::NONE.null_terminate(true)),
        dispatcher.submit_read(&compressed, &heap, WorkFlags::NONE.compressed(true)),
        dispatcher.submit_read(&temp_path("missing.bin"), &heap, WorkFlags::NONE),
    ];
    let taken = reads[1].take_buffer().unwrap();
    assert_eq!(&taken[..], &payload[..]);
    assert!(tracking.live_allocations() > 0);

    drop(handles);
    drop(reads);
    drop(taken);
    dispatcher.shutdown().unwrap();

    assert_eq!(tracking.live_allocations(), 0, "{:?}", tracking.leaks());
    assert_eq!(tracking.live_bytes(), 0);
    assert!(tracking.total_allocations() >= 4);

    let _ = fs::remove_file(&plain);
    let _ = fs::remove_file(&compressed);
}

#[test]
fn test_concurrent_submitters() {
    let (dispatcher, heap) = start(8);

    thread::scope(|s| {
        for t in 0..4 {
            let dispatcher = &dispatcher;
            let heap = &heap;
            s.spawn(move || {
                for i in 0..16 {
                    let path = temp_path(&format!("concurrent-{}-{}.bin", t, i));
                    let payload = compressible_payload(512 + i * 64);
                    let compressed = (t + i) % 2 == 0;

                    let write = dispatcher.submit_write(&path, payload.clone(), compressed);
                    assert_eq!(write.status_code(), 0);

                    let read = dispatcher.submit_read(
                        &path,
                        heap,
                        WorkFlags::NONE.compressed(compressed),
                    );
                    assert_eq!(read.buffer(), Some(&payload[..]));
                    let _ = fs::remove_file(&path);
                }
            });
        }
    });

    let stats = dispatcher.stats();
    assert_eq!(stats.reads_submitted, 64);
    assert_eq!(stats.writes_submitted, 64);
    assert_eq!(stats.completed, 128);
    assert_eq!(stats.failed, 0);
    assert!(stats.bytes_read > 0);
    dispatcher.shutdown().unwrap();
}

#[test]
fn test_dispatchers_are_independent() {
    let (first, heap) = start(2);
    let (second, _) = start(2);
    let path = temp_path("independent.bin");

    let write = first.submit_write(&path, &b"shared file"[..], true);
    assert_eq!(write.status_code(), 0);
    first.shutdown().unwrap();

    // The second dispatcher keeps running after the first one stopped
    let read = second.submit_read(&path, &heap, WorkFlags::NONE.compressed(true));
    assert_eq!(read.buffer(), Some(&b"shared file"[..]));
    assert_eq!(second.stats().reads_submitted, 1);
    assert_eq!(second.stats().writes_submitted, 0);

    drop((write, read));
    drop(second);
    let _ = fs::remove_file(&path);
}

/// Codec that fails every call by panicking.
struct PanickingCodec;

impl Codec for PanickingCodec {
    fn bound(&self, len: usize) -> usize {
        len
    }

    fn compress(&mut self, _src: &[u8], _dst: &mut [u8]) -> Result<usize, CodecError> {
        panic!("codec failure");
    }

    fn decompress(&mut self, _src: &[u8], _dst: &mut [u8]) -> Result<usize, CodecError> {
        panic!("codec failure");
    }
}

#[test]
fn test_worker_panic_abandons_work() {
    init_tracing();
    let heap = SystemHeap::shared("test");
    let dispatcher = Dispatcher::with_components(
        DispatcherConfig::with_capacity(2),
        heap.clone(),
        StdBackend,
        PanickingCodec,
    )
    .unwrap();
    let path = temp_path("panic.bin");

    let write = dispatcher.submit_write(&path, &b"boom"[..], true);
    assert_eq!(write.status_code(), STATUS_ABANDONED);

    // The I/O worker follows the compression worker out
    for _ in 0..200 {
        if dispatcher.workers.iter().all(WorkerThread::is_finished) {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert!(dispatcher.io_queue.is_closed());
    assert!(dispatcher.compression_queue.is_closed());

    let read = dispatcher.submit_read(&path, &heap, WorkFlags::NONE);
    assert_eq!(read.status_code(), STATUS_ABANDONED);

    let err = dispatcher.shutdown().unwrap_err();
    assert!(format!("{:#}", err).contains("panicked"));
    let _ = fs::remove_file(&path);
}

/// Codec that reports an error from every call.
struct FailingCodec;

impl Codec for FailingCodec {
    fn bound(&self, len: usize) -> usize {
        len
    }

    fn compress(&mut self, _src: &[u8], _dst: &mut [u8]) -> Result<usize, CodecError> {
        Err(CodecError::Compress("encoder rejected input".into()))
    }

    fn decompress(&mut self, _src: &[u8], _dst: &mut [u8]) -> Result<usize, CodecError> {
        Err(CodecError::Decompress("decoder rejected input".into()))
    }
}

#[test]
fn test_codec_failure_writes_nothing() {
    let heap = SystemHeap::shared("test");
    let dispatcher = Dispatcher::with_components(
        DispatcherConfig::with_capacity(2),
        heap.clone(),
        StdBackend,
        FailingCodec,
    )
    .unwrap();
    let path = temp_path("codec-failure.bin");

    let write = dispatcher.submit_write(&path, &b"payload"[..], true);
    assert_eq!(write.status_code(), STATUS_CODEC);
    assert!(matches!(
        write.result(),
        Err(WorkError::Codec(CodecError::Compress(_)))
    ));
    assert!(!Path::new(&path).exists());

    // The worker keeps serving after a codec error
    let plain = dispatcher.submit_write(&path, &b"payload"[..], false);
    assert_eq!(plain.status_code(), 0);
    assert_eq!(fs::read(&path).unwrap(), b"payload");

    drop((write, plain));
    dispatcher.shutdown().unwrap();
    let _ = fs::remove_file(&path);
}

#[tokio::test]
async fn test_await_completion() {
    let (dispatcher, heap) = start(4);
    let paths: Vec<_> = (0..4).map(|i| temp_path(&format!("async-{}.bin", i))).collect();

    let writes: Vec<_> = paths
        .iter()
        .map(|path| dispatcher.submit_write(path, path.as_bytes().to_vec(), true))
        .collect();
    futures::future::join_all(writes.iter().map(WorkHandle::completion)).await;
    assert!(writes.iter().all(WorkHandle::is_done));

    let reads: Vec<_> = paths
        .iter()
        .map(|path| dispatcher.submit_read(path, &heap, WorkFlags::NONE.compressed(true)))
        .collect();
    for (read, path) in reads.iter().zip(&paths) {
        read.completion().await;
        assert_eq!(read.buffer(), Some(path.as_bytes()));
    }

    drop((writes, reads));
    dispatcher.shutdown().unwrap();
    for path in paths {
        let _ = fs::remove_file(path);
    }
}
