use beacon_ssz::{DecodeError, EncodeError};

use crate::{ForkDigest, ForkName, MessageType};

/// An error encoding, decoding or framing a message.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodeError),
    #[error("decoding error: {0}")]
    Decoding(#[from] DecodeError),
    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),
    #[error("invalid response code: {0}")]
    InvalidResponseCode(u8),
    #[error("declared size {declared} is outside the allowed range {min}..={max}")]
    InvalidLength {
        declared: usize,
        min: usize,
        max: usize,
    },
    #[error("chunk exceeded its size limit of {limit} bytes")]
    SizeLimitExceeded { limit: usize },
    #[error("unknown fork digest: {0}")]
    UnknownForkDigest(ForkDigest),
    #[error("{message_type:?} is not supported at fork {fork:?}")]
    UnsupportedFork {
        message_type: MessageType,
        fork: ForkName,
    },
    /// The context bytes of a response chunk name a fork the message type does not exist at.
    #[error("peer sent a {message_type:?} chunk under fork {fork:?}, which has no such type")]
    UnexpectedFork {
        message_type: MessageType,
        fork: ForkName,
    },
    #[error("value does not have the shape of a {0}")]
    UnexpectedShape(&'static str),
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
    #[error("request names {count} items, at most {max} are allowed")]
    TooManyItems { count: u64, max: u64 },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl WireError {
    /// Returns `true` if this error means the remote sent bytes that break the protocol.
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::Decoding(_)
                | Self::InvalidFrame(_)
                | Self::InvalidResponseCode(_)
                | Self::InvalidLength { .. }
                | Self::SizeLimitExceeded { .. }
                | Self::UnknownForkDigest(_)
                | Self::UnexpectedFork { .. }
        )
    }
}

/// An error in a [`ChainConfig`](crate::ChainConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("the fork schedule is empty")]
    EmptyForkSchedule,
    #[error("the first fork must activate at epoch 0")]
    GenesisForkNotAtZero,
    #[error("forks must be listed in order of activation")]
    ForksOutOfOrder,
    #[error("fork digest could not be computed: {0}")]
    ForkDigest(#[from] EncodeError),
    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),
}
