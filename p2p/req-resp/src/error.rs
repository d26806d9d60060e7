use std::{io, time::Duration};

use beacon_rate_limiter::RateLimitError;
use beacon_ssz::EncodeError;
use beacon_wire::{ForkName, MessageType, ResponseCode, WireError};

/// How the sync layer should react to a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Transient, try another peer.
    Retry,
    /// The peer broke the protocol, try another peer and never use this one again.
    RetryAndPenalize,
    /// We are over quota or the peer is busy, slow down without blaming anyone.
    Backoff,
    /// The request itself is wrong, retrying can't help.
    Fatal,
    /// The request was cancelled locally.
    Cancelled,
}

/// An error from an outbound request.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("failed to encode the request: {0}")]
    Encoding(#[from] EncodeError),
    #[error("peer sent bytes that failed to decode: {0}")]
    Decoding(WireError),
    #[error("peer sent an invalid response: {0}")]
    InvalidResponse(&'static str),
    #[error("peer sent a chunk over its size limit of {limit} bytes")]
    SizeLimitExceeded { limit: usize },
    #[error("could not open a stream to the peer: {0}")]
    PeerUnreachable(#[source] io::Error),
    #[error("failed to write the request: {0}")]
    WriteError(#[source] io::Error),
    #[error("the stream failed: {0}")]
    Io(#[source] io::Error),
    #[error("the request timed out")]
    TimedOut,
    #[error("the peer does not have the requested resource: {0}")]
    ResourceUnavailable(String),
    #[error("the request is invalid: {0}")]
    InvalidRequest(String),
    /// The peer answered a request we consider valid with an `InvalidRequest` chunk.
    #[error("the peer rejected the request: {0}")]
    RejectedByPeer(String),
    #[error("the peer failed to serve the request: {0}")]
    ServerError(String),
    #[error("{message_type} is not supported at fork {fork:?}")]
    UnsupportedFork {
        message_type: MessageType,
        fork: ForkName,
    },
    #[error("rate limited: {0}")]
    RateLimited(#[from] RateLimitError),
    #[error("the request was cancelled")]
    Cancelled,
}

impl RequestError {
    /// Classifies this error for the sync layer.
    pub const fn class(&self) -> FailureClass {
        match self {
            Self::PeerUnreachable(_)
            | Self::WriteError(_)
            | Self::Io(_)
            | Self::TimedOut
            | Self::ServerError(_) => FailureClass::Retry,
            Self::Decoding(_)
            | Self::InvalidResponse(_)
            | Self::SizeLimitExceeded { .. }
            | Self::RejectedByPeer(_) => FailureClass::RetryAndPenalize,
            Self::ResourceUnavailable(_) | Self::RateLimited(_) => FailureClass::Backoff,
            Self::Encoding(_) | Self::InvalidRequest(_) | Self::UnsupportedFork { .. } => {
                FailureClass::Fatal
            }
            Self::Cancelled => FailureClass::Cancelled,
        }
    }

    /// How long until the local quota covers the request, if that is why it failed.
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited(RateLimitError::Exhausted { retry_after }) => Some(*retry_after),
            _ => None,
        }
    }

    /// Builds the error for an error chunk sent by the peer.
    pub(crate) fn from_error_chunk(code: ResponseCode, message: String) -> Self {
        match code {
            ResponseCode::InvalidRequest => Self::RejectedByPeer(message),
            ResponseCode::ResourceUnavailable => Self::ResourceUnavailable(message),
            ResponseCode::ServerError | ResponseCode::Success => Self::ServerError(message),
        }
    }
}

impl From<WireError> for RequestError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Encoding(e) => Self::Encoding(e),
            WireError::SizeLimitExceeded { limit } => Self::SizeLimitExceeded { limit },
            WireError::UnsupportedFork { message_type, fork } => {
                Self::UnsupportedFork { message_type, fork }
            }
            WireError::InvalidRequest(_) | WireError::TooManyItems { .. } => {
                Self::InvalidRequest(e.to_string())
            }
            WireError::Io(e) => Self::Io(e),
            e => Self::Decoding(e),
        }
    }
}
