use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use beacon_ssz::{TypeDescriptor, Value};

use crate::{
    codec::frame::{decode_frame, encode_frame, FrameLimits},
    ForkName, MessageType, SchemaRegistry, WireError,
};

/// The tokio-codec for a request body.
///
/// A request stream carries exactly one frame.
#[derive(Debug, Clone)]
pub struct RequestCodec {
    ty: TypeDescriptor,
}

impl RequestCodec {
    /// Creates the codec for `message_type` requests at `fork`.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::UnsupportedFork`] if the type does not exist at `fork`.
    pub fn new(
        registry: &SchemaRegistry,
        message_type: MessageType,
        fork: ForkName,
    ) -> Result<Self, WireError> {
        Ok(Self {
            ty: registry.resolve_request_for(message_type, fork)?,
        })
    }

    fn limits(&self) -> FrameLimits {
        FrameLimits::new(self.ty.min_size(), self.ty.max_size())
    }
}

impl Decoder for RequestCodec {
    type Item = Value;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(bytes) = decode_frame(src, self.limits())? else {
            return Ok(None);
        };
        Ok(Some(beacon_ssz::decode(&bytes, &self.ty)?))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(value) => Ok(Some(value)),
            None if src.is_empty() => Ok(None),
            None => Err(WireError::InvalidFrame("stream closed inside the request")),
        }
    }
}

impl Encoder<Value> for RequestCodec {
    type Error = WireError;

    fn encode(&mut self, item: Value, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = beacon_ssz::encode(&item, &self.ty)?;
        encode_frame(&bytes, dst)
    }
}
