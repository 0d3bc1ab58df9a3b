//! Error types captured by work descriptors.
//!
//! Workers never return errors to a caller directly. Every failure is stored
//! in the descriptor and observed later through the handle accessors, either
//! as a typed [`WorkError`] or as the integer status code the rest of the
//! application logs.

use std::io;
use thiserror::Error;

/// Status code reported for a successful operation.
pub const STATUS_OK: i32 = 0;

/// Status code for a path that could not be encoded for the backend.
pub const STATUS_PATH_ENCODING: i32 = -1;

/// Status code for a compression or decompression failure.
pub const STATUS_CODEC: i32 = -2;

/// Status code for a heap that refused an allocation.
pub const STATUS_OUT_OF_MEMORY: i32 = -3;

/// Status code for a descriptor dropped before reaching a terminal stage.
pub const STATUS_ABANDONED: i32 = -4;

/// Status code for a platform error that carries no OS error number.
pub const STATUS_IO_UNKNOWN: i32 = -5;

/// Why a path was rejected before reaching the backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    /// The path is longer than the descriptor's fixed path field.
    #[error("path is {len} bytes, limit is {max}")]
    TooLong {
        /// Length of the rejected path in bytes.
        len: usize,
        /// Maximum accepted length in bytes.
        max: usize,
    },

    /// The path is empty.
    #[error("path is empty")]
    Empty,

    /// The path contains a NUL byte and cannot be handed to the platform.
    #[error("path contains an interior NUL byte at offset {0}")]
    InteriorNul(usize),
}

/// Failure reported by a [`Codec`](crate::codec::Codec) or by the frame
/// header checks around it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The codec failed to compress the payload.
    #[error("compression failed: {0}")]
    Compress(String),

    /// The codec rejected the compressed payload.
    #[error("decompression failed: {0}")]
    Decompress(String),

    /// The on-disk data is shorter than the frame header.
    #[error("compressed frame is {len} bytes, shorter than its header")]
    Truncated {
        /// Number of bytes actually present.
        len: usize,
    },

    /// Decompression produced a different length than the header announced.
    #[error("frame header announced {expected} bytes, decompressed {actual}")]
    SizeMismatch {
        /// Size stored in the frame header.
        expected: usize,
        /// Size produced by the codec.
        actual: usize,
    },

    /// The frame header claims more bytes than the payload can decode to.
    #[error("frame header claims {claimed} bytes, a {payload}-byte payload decodes to at most {bound}")]
    ImplausibleSize {
        /// Size stored in the frame header.
        claimed: usize,
        /// Length of the compressed payload.
        payload: usize,
        /// Largest size the codec can decode from the payload.
        bound: usize,
    },

    /// The payload does not fit the 32-bit size field of the frame header.
    #[error("payload of {len} bytes does not fit a 32-bit frame header")]
    TooLarge {
        /// Payload length in bytes.
        len: usize,
    },
}

/// A heap could not satisfy an allocation request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("heap `{heap}` failed to allocate {size} bytes (align {align})")]
pub struct AllocError {
    /// Name of the heap that refused the request.
    pub heap: String,
    /// Requested size in bytes.
    pub size: usize,
    /// Requested alignment in bytes.
    pub align: usize,
}

/// Terminal error of a work descriptor.
#[derive(Debug, Error)]
pub enum WorkError {
    /// The path could not be stored or translated for the backend.
    #[error("path encoding error: {0}")]
    PathEncoding(#[from] PathError),

    /// The platform backend failed to open, size, read or write the file.
    #[error("platform I/O error: {0}")]
    Io(#[from] io::Error),

    /// The payload could not be compressed or decompressed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// A buffer could not be allocated.
    #[error("out of memory: {0}")]
    OutOfMemory(#[from] AllocError),

    /// The descriptor was dropped before any stage completed it.
    #[error("work was abandoned before completion")]
    Abandoned,
}

impl WorkError {
    /// Returns the integer status code for this error.
    ///
    /// Platform errors report the raw OS error number so callers can compare
    /// against platform constants.
    pub fn status_code(&self) -> i32 {
        match self {
            Self::PathEncoding(_) => STATUS_PATH_ENCODING,
            Self::Io(e) => e.raw_os_error().unwrap_or(STATUS_IO_UNKNOWN),
            Self::Codec(_) => STATUS_CODEC,
            Self::OutOfMemory(_) => STATUS_OUT_OF_MEMORY,
            Self::Abandoned => STATUS_ABANDONED,
        }
    }
}

/// Maps a work result onto its status code.
pub fn status_code(result: &Result<(), WorkError>) -> i32 {
    match result {
        Ok(()) => STATUS_OK,
        Err(e) => e.status_code(),
    }
}
