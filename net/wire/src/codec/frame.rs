//! Length-prefixed snappy frames.
//!
//! A frame is the uncompressed length as a varint, followed by a snappy frame stream that
//! decompresses to exactly that length. The chunks of the stream are walked and their
//! decompressed sizes checked against the declared length before anything is decompressed, a peer
//! can't make us inflate more than the declared length.
use std::io::{Read, Write};

use bytes::{Buf, BufMut, BytesMut};

use crate::{
    codec::varint::{peek_varint, write_varint},
    u64_to_usize, WireError,
};

/// The size of a snappy chunk header, a type byte and a 3 byte length.
const CHUNK_HEADER_LEN: usize = 4;
/// The size of the checksum at the start of data chunks.
const CHECKSUM_LEN: usize = 4;
/// The most bytes a single snappy data chunk decompresses to.
const MAX_UNCOMPRESSED_CHUNK_LEN: usize = 65_536;
/// The size of the stream identifier chunk.
const STREAM_IDENTIFIER_LEN: usize = 10;

const CHUNK_STREAM_IDENTIFIER: u8 = 0xff;
const CHUNK_COMPRESSED: u8 = 0x00;
const CHUNK_UNCOMPRESSED: u8 = 0x01;

/// The bounds on the uncompressed length of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    pub min: usize,
    pub max: usize,
}

impl FrameLimits {
    pub const fn new(min: usize, max: usize) -> Self {
        Self { min, max }
    }
}

/// The most bytes a valid snappy frame stream of `len` uncompressed bytes can take.
pub const fn max_encoded_len(len: usize) -> usize {
    let chunks = if len == 0 {
        1
    } else {
        len.div_ceil(MAX_UNCOMPRESSED_CHUNK_LEN)
    };

    STREAM_IDENTIFIER_LEN
        .saturating_add(chunks.saturating_mul(CHUNK_HEADER_LEN + CHECKSUM_LEN + 32))
        .saturating_add(len)
        .saturating_add(len / 6)
}

/// Decodes a single frame from the start of `src`.
///
/// Returns `Ok(None)` if `src` does not hold the whole frame yet, nothing is consumed then.
pub fn decode_frame(src: &mut BytesMut, limits: FrameLimits) -> Result<Option<Vec<u8>>, WireError> {
    let Some((declared, prefix_len)) = peek_varint(src)? else {
        return Ok(None);
    };

    let declared = u64_to_usize(declared);
    if declared > limits.max {
        tracing::trace!(declared, max = limits.max, "frame declares an oversized payload");
        return Err(WireError::SizeLimitExceeded { limit: limits.max });
    }
    if declared < limits.min {
        return Err(WireError::InvalidLength {
            declared,
            min: limits.min,
            max: limits.max,
        });
    }

    if declared == 0 {
        src.advance(prefix_len);
        return Ok(Some(Vec::new()));
    }

    let Some(stream_len) = find_stream_end(&src[prefix_len..], declared)? else {
        return Ok(None);
    };

    let stream = &src[prefix_len..prefix_len + stream_len];
    let mut payload = Vec::with_capacity(declared);
    snap::read::FrameDecoder::new(stream)
        .take(u64::try_from(declared).unwrap_or(u64::MAX))
        .read_to_end(&mut payload)
        .map_err(|_| WireError::InvalidFrame("invalid snappy stream"))?;

    if payload.len() != declared {
        return Err(WireError::InvalidFrame(
            "snappy stream does not match its declared length",
        ));
    }

    src.advance(prefix_len + stream_len);
    Ok(Some(payload))
}

/// Walks the snappy chunks in `buf` until they add up to `declared` uncompressed bytes.
///
/// Returns the amount of bytes the chunks take, or `None` if `buf` ends first.
fn find_stream_end(buf: &[u8], declared: usize) -> Result<Option<usize>, WireError> {
    let encoded_limit = max_encoded_len(declared);
    let mut pos = 0;
    let mut uncompressed = 0_usize;

    while uncompressed < declared {
        if pos > encoded_limit {
            return Err(WireError::SizeLimitExceeded { limit: declared });
        }

        let Some(header) = buf.get(pos..pos + CHUNK_HEADER_LEN) else {
            return Ok(None);
        };
        let chunk_type = header[0];
        let chunk_len = usize::from(header[1])
            | (usize::from(header[2]) << 8)
            | (usize::from(header[3]) << 16);

        let body_start = pos + CHUNK_HEADER_LEN;
        let body_end = body_start + chunk_len;
        if body_end > encoded_limit {
            return Err(WireError::SizeLimitExceeded { limit: declared });
        }
        let Some(body) = buf.get(body_start..body_end) else {
            return Ok(None);
        };

        let chunk_uncompressed = match chunk_type {
            CHUNK_STREAM_IDENTIFIER => 0,
            CHUNK_COMPRESSED => {
                let data = body
                    .get(CHECKSUM_LEN..)
                    .ok_or(WireError::InvalidFrame("snappy chunk too short"))?;
                snap::raw::decompress_len(data)
                    .map_err(|_| WireError::InvalidFrame("invalid snappy chunk"))?
            }
            CHUNK_UNCOMPRESSED => body
                .len()
                .checked_sub(CHECKSUM_LEN)
                .ok_or(WireError::InvalidFrame("snappy chunk too short"))?,
            // Padding and skippable chunks.
            0x80..=0xfe => 0,
            _ => return Err(WireError::InvalidFrame("reserved snappy chunk type")),
        };

        if chunk_uncompressed > MAX_UNCOMPRESSED_CHUNK_LEN {
            return Err(WireError::InvalidFrame("snappy chunk is too large"));
        }

        uncompressed = uncompressed.saturating_add(chunk_uncompressed);
        if uncompressed > declared {
            return Err(WireError::SizeLimitExceeded { limit: declared });
        }

        pos = body_end;
    }

    Ok(Some(pos))
}

/// Writes `payload` as a frame.
pub fn encode_frame(payload: &[u8], dst: &mut BytesMut) -> Result<(), WireError> {
    write_varint(u64::try_from(payload.len()).unwrap_or(u64::MAX), dst);
    if payload.is_empty() {
        return Ok(());
    }

    let mut encoder = snap::write::FrameEncoder::new(dst.writer());
    encoder.write_all(payload)?;
    encoder
        .into_inner()
        .map_err(|e| WireError::Io(e.into_error()))?;

    Ok(())
}
