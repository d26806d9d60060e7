use tokio::io::{AsyncRead, AsyncWrite};

use beacon_wire::{PeerId, ProtocolId};

/// An abstraction over the stream multiplexing layer.
///
/// The engine only needs a bidirectional byte stream to a peer, negotiated for a [`ProtocolId`].
/// Connection management, multiplexing and protocol negotiation are the implementor's job.
#[async_trait::async_trait]
pub trait Transport<P: PeerId>: Clone + Send + Sync + 'static {
    /// An open stream to a peer.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Opens a new stream to `peer` for `protocol`.
    async fn open_stream(
        &self,
        peer: &P,
        protocol: &ProtocolId,
    ) -> Result<Self::Stream, std::io::Error>;
}
