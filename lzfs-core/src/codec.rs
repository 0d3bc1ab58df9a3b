//! Compression codec and on-disk framing.
//!
//! Compressed files are stored as a frame:
//!
//! ```text
//! +------------------------+---------------------------+
//! | original size (u32 LE) | compressed payload ...    |
//! +------------------------+---------------------------+
//! ```
//!
//! The header lets the reader size the destination buffer before
//! decompressing. A file written compressed must be read back compressed.

use crate::error::CodecError;

/// Size of the frame header in bytes.
pub const HEADER_SIZE: usize = 4;

/// A block compressor used by the compression worker.
///
/// The codec is moved into the worker thread and only ever used from there.
pub trait Codec: Send + 'static {
    /// Worst-case compressed size for `len` input bytes.
    fn bound(&self, len: usize) -> usize;

    /// Compresses `src` into `dst`, returning the compressed length.
    fn compress(&mut self, src: &[u8], dst: &mut [u8]) -> Result<usize, CodecError>;

    /// Decompresses `src` into `dst`, returning the decompressed length.
    fn decompress(&mut self, src: &[u8], dst: &mut [u8]) -> Result<usize, CodecError>;

    /// Largest output `decompress` can produce from `compressed_len` bytes.
    fn decompressed_bound(&self, compressed_len: usize) -> usize {
        let _ = compressed_len;
        usize::MAX
    }
}

/// Upper bound of the LZ4 block expansion ratio.
const LZ4_MAX_RATIO: usize = 255;

/// LZ4 block codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4Codec;

impl Codec for Lz4Codec {
    fn bound(&self, len: usize) -> usize {
        lz4_flex::block::get_maximum_output_size(len)
    }

    fn compress(&mut self, src: &[u8], dst: &mut [u8]) -> Result<usize, CodecError> {
        lz4_flex::block::compress_into(src, dst).map_err(|e| CodecError::Compress(e.to_string()))
    }

    fn decompress(&mut self, src: &[u8], dst: &mut [u8]) -> Result<usize, CodecError> {
        lz4_flex::block::decompress_into(src, dst)
            .map_err(|e| CodecError::Decompress(e.to_string()))
    }

    fn decompressed_bound(&self, compressed_len: usize) -> usize {
        compressed_len.saturating_mul(LZ4_MAX_RATIO)
    }
}

/// Writes the frame header for a payload of `original_len` bytes.
pub fn write_header(frame: &mut [u8], original_len: usize) -> Result<(), CodecError> {
    let len = u32::try_from(original_len).map_err(|_| CodecError::TooLarge { len: original_len })?;
    let frame_len = frame.len();
    let header = frame
        .get_mut(..HEADER_SIZE)
        .ok_or(CodecError::Truncated { len: frame_len })?;
    header.copy_from_slice(&len.to_le_bytes());
    Ok(())
}

/// Reads the original payload size from a frame header.
pub fn read_header(frame: &[u8]) -> Result<usize, CodecError> {
    let header: [u8; HEADER_SIZE] = frame
        .get(..HEADER_SIZE)
        .and_then(|h| h.try_into().ok())
        .ok_or(CodecError::Truncated { len: frame.len() })?;
    Ok(u32::from_le_bytes(header) as usize)
}

/// Reads the frame header and checks that the payload can hold it.
///
/// Use this before sizing a destination buffer from untrusted data.
pub fn check_header<C: Codec + ?Sized>(codec: &C, frame: &[u8]) -> Result<usize, CodecError> {
    let claimed = read_header(frame)?;
    let payload = frame.len() - HEADER_SIZE;
    let bound = codec.decompressed_bound(payload);
    if claimed > bound {
        return Err(CodecError::ImplausibleSize {
            claimed,
            payload,
            bound,
        });
    }
    Ok(claimed)
}

/// Frame capacity needed to compress `len` bytes with `codec`.
pub fn frame_bound<C: Codec + ?Sized>(codec: &C, len: usize) -> usize {
    HEADER_SIZE + codec.bound(len)
}

/// Compresses `src` into `frame`, returning the total frame length.
///
/// `frame` must hold at least [`frame_bound`] bytes.
pub fn encode_frame<C: Codec + ?Sized>(
    codec: &mut C,
    src: &[u8],
    frame: &mut [u8],
) -> Result<usize, CodecError> {
    write_header(frame, src.len())?;
    let compressed = codec.compress(src, &mut frame[HEADER_SIZE..])?;
    Ok(HEADER_SIZE + compressed)
}

/// Decompresses the payload of `frame` into `dst`.
///
/// `dst` must hold at least the size returned by [`check_header`]; the
/// decompressed length must match it exactly.
pub fn decode_frame<C: Codec + ?Sized>(
    codec: &mut C,
    frame: &[u8],
    dst: &mut [u8],
) -> Result<usize, CodecError> {
    let expected = check_header(codec, frame)?;
    let target = dst.get_mut(..expected).ok_or(CodecError::SizeMismatch {
        expected,
        actual: 0,
    })?;
    let actual = codec.decompress(&frame[HEADER_SIZE..], target)?;
    if actual != expected {
        return Err(CodecError::SizeMismatch { expected, actual });
    }
    Ok(actual)
}
