//! Message types and their policies.
//!
//! Everything that differs between message types in how a request is sent or a response is
//! read is in the [`MessagePolicy`] table, call sites never branch on a [`MessageType`] directly.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{constants::PROTOCOL_PREFIX, ForkName, WireError};

/// A request/response protocol.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    BlocksByRange,
    BlocksByRoot,
    BlobSidecarsByRange,
    BlobSidecarsByRoot,
    ValidatorChangeBroadcast,
}

impl MessageType {
    /// Every message type.
    pub const ALL: [Self; 5] = [
        Self::BlocksByRange,
        Self::BlocksByRoot,
        Self::BlobSidecarsByRange,
        Self::BlobSidecarsByRoot,
        Self::ValidatorChangeBroadcast,
    ];

    /// The name of this protocol in its [`ProtocolId`].
    pub const fn protocol_name(self) -> &'static str {
        match self {
            Self::BlocksByRange => "beacon_blocks_by_range",
            Self::BlocksByRoot => "beacon_blocks_by_root",
            Self::BlobSidecarsByRange => "blob_sidecars_by_range",
            Self::BlobSidecarsByRoot => "blob_sidecars_by_root",
            Self::ValidatorChangeBroadcast => "bls_to_execution_change",
        }
    }

    /// Returns `true` if requests of this type name the items they want.
    pub const fn is_by_root(self) -> bool {
        matches!(self, Self::BlocksByRoot | Self::BlobSidecarsByRoot)
    }

    /// Returns `true` if requests of this type are a slot span.
    pub const fn is_by_range(self) -> bool {
        matches!(self, Self::BlocksByRange | Self::BlobSidecarsByRange)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.protocol_name())
    }
}

/// The status byte of a response chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResponseCode {
    Success = 0,
    InvalidRequest = 1,
    ServerError = 2,
    ResourceUnavailable = 3,
}

impl ResponseCode {
    /// Returns `true` for [`ResponseCode::Success`].
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl TryFrom<u8> for ResponseCode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Success,
            1 => Self::InvalidRequest,
            2 => Self::ServerError,
            3 => Self::ResourceUnavailable,
            _ => return Err(WireError::InvalidResponseCode(value)),
        })
    }
}

impl From<ResponseCode> for u8 {
    fn from(code: ResponseCode) -> Self {
        code as Self
    }
}

/// What happens to already received items when a response ends in an error chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialResponsePolicy {
    /// Items are only handed out once the response completed, an error discards all of them.
    AllOrNothing,
    /// Items are handed out as they arrive and kept if a later chunk is an error.
    BestEffort,
}

/// Config overrides of a [`MessagePolicy`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct PolicyOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial_response: Option<PartialResponsePolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_empty_response: Option<bool>,
}

/// How a [`MessageType`] behaves on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessagePolicy {
    /// The protocol version.
    pub version: u32,
    /// Whether success chunks carry the fork digest before their payload.
    pub context_bytes: bool,
    /// Whether a response without any chunk is valid.
    pub allow_empty_response: bool,
    /// What happens to received items on a later error chunk.
    pub partial_response: PartialResponsePolicy,
    /// The first fork this message type exists in.
    pub available_from: ForkName,
}

impl MessagePolicy {
    /// The default policy of `message_type`.
    ///
    /// By-root requests name exactly what they want, so an incomplete answer is useless to the
    /// caller and the response is all-or-nothing. A peer that has none of the roots answers
    /// with `ResourceUnavailable` instead of closing the stream.
    pub const fn default_for(message_type: MessageType) -> Self {
        use PartialResponsePolicy::{AllOrNothing, BestEffort};

        let (version, context_bytes, allow_empty_response, partial_response, available_from) =
            match message_type {
                MessageType::BlocksByRange => (2, true, true, BestEffort, ForkName::Phase0),
                MessageType::BlocksByRoot => (2, true, false, AllOrNothing, ForkName::Phase0),
                MessageType::BlobSidecarsByRange => (1, true, true, BestEffort, ForkName::Deneb),
                MessageType::BlobSidecarsByRoot => (1, true, false, AllOrNothing, ForkName::Deneb),
                MessageType::ValidatorChangeBroadcast => {
                    (1, false, true, AllOrNothing, ForkName::Phase0)
                }
            };

        Self {
            version,
            context_bytes,
            allow_empty_response,
            partial_response,
            available_from,
        }
    }

    /// Applies a config override to this policy.
    #[must_use]
    pub fn with_override(mut self, o: &PolicyOverride) -> Self {
        if let Some(partial) = o.partial_response {
            self.partial_response = partial;
        }
        if let Some(allow) = o.allow_empty_response {
            self.allow_empty_response = allow;
        }
        self
    }
}

/// The encoding of a protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    /// Canonical encoding, snappy frame compressed.
    SszSnappy,
}

impl Encoding {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SszSnappy => "ssz_snappy",
        }
    }
}

/// The identifier a stream is negotiated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolId {
    pub message_type: MessageType,
    pub version: u32,
    pub encoding: Encoding,
}

impl ProtocolId {
    /// The identifier of `message_type` under `policy`.
    pub const fn new(message_type: MessageType, policy: &MessagePolicy) -> Self {
        Self {
            message_type,
            version: policy.version,
            encoding: Encoding::SszSnappy,
        }
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{PROTOCOL_PREFIX}/{}/{}/{}",
            self.message_type.protocol_name(),
            self.version,
            self.encoding.as_str()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_id_string() {
        let id = ProtocolId::new(
            MessageType::BlobSidecarsByRoot,
            &MessagePolicy::default_for(MessageType::BlobSidecarsByRoot),
        );
        assert_eq!(
            id.to_string(),
            "/eth2/beacon_chain/req/blob_sidecars_by_root/1/ssz_snappy"
        );
    }

    #[test]
    fn response_codes() {
        for code in 0..4_u8 {
            assert_eq!(u8::from(ResponseCode::try_from(code).unwrap()), code);
        }
        assert!(matches!(
            ResponseCode::try_from(4),
            Err(WireError::InvalidResponseCode(4))
        ));
    }

    #[test]
    fn by_root_types_are_all_or_nothing() {
        for mt in MessageType::ALL {
            let policy = MessagePolicy::default_for(mt);
            if mt.is_by_root() {
                assert_eq!(policy.partial_response, PartialResponsePolicy::AllOrNothing);
                assert!(!policy.allow_empty_response);
            }
            if mt.is_by_range() {
                assert_eq!(policy.partial_response, PartialResponsePolicy::BestEffort);
            }
        }
    }

    #[test]
    fn overrides_apply() {
        let policy = MessagePolicy::default_for(MessageType::BlocksByRange).with_override(
            &PolicyOverride {
                partial_response: Some(PartialResponsePolicy::AllOrNothing),
                allow_empty_response: None,
            },
        );
        assert_eq!(policy.partial_response, PartialResponsePolicy::AllOrNothing);
        assert!(policy.allow_empty_response);
    }
}
