use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use beacon_ssz::{TypeDescriptor, Value};

use crate::{
    codec::frame::{decode_frame, encode_frame, FrameLimits},
    constants::{FORK_DIGEST_LEN, MAX_ERROR_MESSAGE_LEN},
    u64_to_usize, ForkDigest, ForkName, MessageType, ResponseCode, SchemaRegistry, WireError,
};

/// A single chunk of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseChunk {
    /// A payload, encoded under `fork`.
    Success { fork: ForkName, value: Value },
    /// An error, ending the response.
    Error { code: ResponseCode, message: String },
}

#[derive(Debug, Clone)]
enum ChunkState {
    /// Waiting for the status byte of the next chunk.
    WaitingForStatus,
    /// Waiting for the fork digest of a success chunk.
    WaitingForContext,
    /// Waiting for the framed payload of a success chunk.
    WaitingForPayload { fork: ForkName, ty: TypeDescriptor },
    /// Waiting for the framed message of an error chunk.
    WaitingForErrorMessage(ResponseCode),
}

/// The tokio-codec for the response chunks of a single message type.
///
/// Success payloads are resolved against the fork in their context bytes, or `fork` if the
/// message type has none.
#[derive(Debug, Clone)]
pub struct ResponseChunkCodec {
    state: ChunkState,
    registry: Arc<SchemaRegistry>,
    message_type: MessageType,
    fork: ForkName,
}

impl ResponseChunkCodec {
    pub fn new(registry: Arc<SchemaRegistry>, message_type: MessageType, fork: ForkName) -> Self {
        Self {
            state: ChunkState::WaitingForStatus,
            registry,
            message_type,
            fork,
        }
    }

    fn context_bytes(&self) -> bool {
        self.registry.policy(self.message_type).context_bytes
    }

    fn payload_limits(&self, ty: &TypeDescriptor) -> FrameLimits {
        let max_chunk = u64_to_usize(self.registry.config().max_chunk_size);
        FrameLimits::new(ty.min_size(), ty.max_size().min(max_chunk))
    }
}

impl Decoder for ResponseChunkCodec {
    type Item = ResponseChunk;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match &self.state {
                ChunkState::WaitingForStatus => {
                    let Some(&status) = src.first() else {
                        return Ok(None);
                    };
                    let code = ResponseCode::try_from(status)?;
                    src.advance(1);

                    self.state = match (code, self.context_bytes()) {
                        (ResponseCode::Success, true) => ChunkState::WaitingForContext,
                        (ResponseCode::Success, false) => {
                            let ty = self
                                .registry
                                .resolve_response_for(self.message_type, self.fork)?;
                            ChunkState::WaitingForPayload {
                                fork: self.fork,
                                ty,
                            }
                        }
                        (code, _) => ChunkState::WaitingForErrorMessage(code),
                    };
                }
                ChunkState::WaitingForContext => {
                    if src.len() < FORK_DIGEST_LEN {
                        return Ok(None);
                    }
                    let mut digest = [0; FORK_DIGEST_LEN];
                    src.copy_to_slice(&mut digest);
                    let digest = ForkDigest(digest);

                    let Some(fork) = self.registry.fork_schedule().fork_by_digest(&digest) else {
                        tracing::trace!(%digest, "chunk under an unknown fork digest");
                        return Err(WireError::UnknownForkDigest(digest));
                    };
                    let fork = fork.name;
                    // The peer picked the fork, a fork without this type is its fault.
                    let ty = self
                        .registry
                        .resolve_response_for(self.message_type, fork)
                        .map_err(|e| match e {
                            WireError::UnsupportedFork { message_type, fork } => {
                                tracing::trace!(%message_type, ?fork, "chunk under a fork without its type");
                                WireError::UnexpectedFork { message_type, fork }
                            }
                            e => e,
                        })?;

                    self.state = ChunkState::WaitingForPayload { fork, ty };
                }
                ChunkState::WaitingForPayload { fork, ty } => {
                    let Some(bytes) = decode_frame(src, self.payload_limits(ty))? else {
                        return Ok(None);
                    };
                    let value = beacon_ssz::decode(&bytes, ty)?;
                    let fork = *fork;

                    self.state = ChunkState::WaitingForStatus;
                    return Ok(Some(ResponseChunk::Success { fork, value }));
                }
                ChunkState::WaitingForErrorMessage(code) => {
                    let limits = FrameLimits::new(0, MAX_ERROR_MESSAGE_LEN);
                    let Some(bytes) = decode_frame(src, limits)? else {
                        return Ok(None);
                    };
                    let code = *code;

                    self.state = ChunkState::WaitingForStatus;
                    return Ok(Some(ResponseChunk::Error {
                        code,
                        message: String::from_utf8_lossy(&bytes).into_owned(),
                    }));
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(chunk) = self.decode(src)? {
            return Ok(Some(chunk));
        }

        if src.is_empty() && matches!(self.state, ChunkState::WaitingForStatus) {
            Ok(None)
        } else {
            Err(WireError::InvalidFrame("stream closed inside a chunk"))
        }
    }
}

impl Encoder<ResponseChunk> for ResponseChunkCodec {
    type Error = WireError;

    fn encode(&mut self, item: ResponseChunk, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            ResponseChunk::Success { fork, value } => {
                let ty = self.registry.resolve_response_for(self.message_type, fork)?;
                let bytes = beacon_ssz::encode(&value, &ty)?;

                dst.put_u8(ResponseCode::Success.into());
                if self.context_bytes() {
                    let digest = self
                        .registry
                        .fork_schedule()
                        .fork(fork)
                        .ok_or(WireError::UnsupportedFork {
                            message_type: self.message_type,
                            fork,
                        })?
                        .digest;
                    dst.put_slice(&digest.0);
                }
                encode_frame(&bytes, dst)
            }
            ResponseChunk::Error { code, message } => {
                if code.is_success() {
                    return Err(WireError::InvalidFrame("error chunk with a success code"));
                }

                let mut message = message.into_bytes();
                message.truncate(MAX_ERROR_MESSAGE_LEN);

                dst.put_u8(code.into());
                encode_frame(&message, dst)
            }
        }
    }
}
