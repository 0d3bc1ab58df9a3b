//! Platform I/O backend used by the I/O worker.
//!
//! The backend is moved into the I/O worker thread when the dispatcher starts
//! and is never touched by any other thread.

use crate::error::PathError;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// How a file is opened by the I/O worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Open an existing file for reading.
    SharedRead,

    /// Create the file, or truncate an existing one, for writing.
    CreateTruncate,
}

/// Raw file primitives.
pub trait IoBackend: Send + 'static {
    /// An open file.
    type Handle;

    /// Translates a UTF-8 path into the backend's native path.
    ///
    /// Failures never reach `open`.
    fn translate_path(&self, path: &str) -> Result<PathBuf, PathError> {
        native_path(path)
    }

    /// Opens `path` in the given mode.
    fn open(&mut self, path: &Path, mode: OpenMode) -> io::Result<Self::Handle>;

    /// Returns the size of the open file in bytes.
    fn query_size(&mut self, handle: &mut Self::Handle) -> io::Result<u64>;

    /// Reads into `buf`, returning the number of bytes read; zero means end
    /// of file.
    fn read(&mut self, handle: &mut Self::Handle, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes from `buf`, returning the number of bytes written.
    fn write(&mut self, handle: &mut Self::Handle, buf: &[u8]) -> io::Result<usize>;

    /// Closes the file.
    fn close(&mut self, handle: Self::Handle) -> io::Result<()>;
}

/// Validates a UTF-8 path for the platform.
pub fn native_path(path: &str) -> Result<PathBuf, PathError> {
    if path.is_empty() {
        return Err(PathError::Empty);
    }
    if let Some(offset) = path.bytes().position(|b| b == 0) {
        return Err(PathError::InteriorNul(offset));
    }
    Ok(PathBuf::from(path))
}

/// Backend over `std::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdBackend;

impl IoBackend for StdBackend {
    type Handle = File;

    fn open(&mut self, path: &Path, mode: OpenMode) -> io::Result<File> {
        match mode {
            OpenMode::SharedRead => File::open(path),
            OpenMode::CreateTruncate => OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path),
        }
    }

    fn query_size(&mut self, handle: &mut File) -> io::Result<u64> {
        Ok(handle.metadata()?.len())
    }

    fn read(&mut self, handle: &mut File, buf: &mut [u8]) -> io::Result<usize> {
        handle.read(buf)
    }

    fn write(&mut self, handle: &mut File, buf: &[u8]) -> io::Result<usize> {
        handle.write(buf)
    }

    fn close(&mut self, mut handle: File) -> io::Result<()> {
        handle.flush()
    }
}

/// Reads until `buf` is full or the file ends, returning the bytes read.
pub fn read_full<B: IoBackend + ?Sized>(
    backend: &mut B,
    handle: &mut B::Handle,
    buf: &mut [u8],
) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match backend.read(handle, &mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Writes all of `buf`, returning the bytes written.
pub fn write_full<B: IoBackend + ?Sized>(
    backend: &mut B,
    handle: &mut B::Handle,
    buf: &[u8],
) -> io::Result<usize> {
    let mut written = 0;
    while written < buf.len() {
        match backend.write(handle, &buf[written..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "backend accepted no bytes",
                ))
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}
