//! Codecs.
//!
//! Requests are a single frame, responses a sequence of [`ResponseChunk`]s ended by closing the
//! stream. Both are [`tokio_util::codec`] codecs so they can be driven by `FramedRead`/`FramedWrite`.
mod chunk;
mod frame;
mod request;
mod varint;

pub use chunk::{ResponseChunk, ResponseChunkCodec};
pub use frame::{decode_frame, encode_frame, max_encoded_len, FrameLimits};
pub use request::RequestCodec;
pub use varint::{peek_varint, write_varint};
