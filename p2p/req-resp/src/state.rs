use std::fmt;

/// The state of an outbound request.
///
/// ```text
/// Idle -> Dialing -> Writing -> AwaitingChunk <-> ReadingChunk -> Completed
/// ```
///
/// Any non-terminal state can move to `Failed`, `TimedOut` or `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    /// Constructed, not dispatched yet.
    Idle,
    /// Opening a stream to the peer.
    Dialing,
    /// Sending the request.
    Writing,
    /// Waiting for the next chunk or the end of the stream.
    AwaitingChunk,
    /// Decoding a chunk.
    ReadingChunk,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl RequestState {
    /// Returns `true` if the request is over.
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
