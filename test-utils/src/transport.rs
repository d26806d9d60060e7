//! An in-memory [`Transport`].
//!
//! Every opened stream is one half of a [`tokio::io::duplex`] pipe, the other half is served by
//! a task acting as the remote peer.
use std::{fmt, io, sync::Arc, time::Duration};

use bytes::BytesMut;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_util::codec::Encoder;

use beacon_rate_limiter::{RateLimiter, RateLimiterConfig};
use beacon_req_resp::{handle_inbound_stream, EngineConfig, InboundContext, Transport};
use beacon_wire::{
    codec::{ResponseChunk, ResponseChunkCodec},
    ForkContext, MessageType, ProtocolId, SchemaRegistry,
};

use crate::MockStore;

const DUPLEX_BUFFER: usize = 1 << 16;

/// A mock peer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MockPeer(pub u32);

impl fmt::Debug for MockPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// How a mock peer answers a stream.
#[derive(Clone)]
pub enum Behaviour {
    /// Serves requests from the store through the real inbound responder.
    Serve(Arc<MockStore>),
    /// Refuses every stream.
    Unreachable,
    /// Waits before acting out the inner behaviour.
    Delayed(Duration, Box<Behaviour>),
    /// Reads the request, sends the steps in order, then closes the stream.
    Script(Vec<ScriptStep>),
}

/// A step of a [`Behaviour::Script`].
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// A chunk, encoded like a well behaved peer would.
    Chunk(ResponseChunk),
    /// Raw bytes.
    Raw(Vec<u8>),
    Sleep(Duration),
    /// Keeps the stream open forever.
    Hang,
}

struct Inner {
    behaviours: DashMap<MockPeer, Behaviour>,
    dials: DashMap<MockPeer, usize>,
    inbound: InboundContext<MockPeer>,
}

/// The in-memory transport, cheap to clone.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<Inner>,
}

impl MockTransport {
    /// Creates a transport without peers, served requests use the default inbound quotas.
    pub fn new(registry: Arc<SchemaRegistry>, fork: ForkContext) -> Self {
        Self::with_inbound(InboundContext {
            registry,
            fork,
            limiter: RateLimiter::new(RateLimiterConfig::default()),
            config: EngineConfig::default(),
        })
    }

    /// Creates a transport whose peers serve requests with `inbound`.
    ///
    /// Each mock peer keeps the quota of the local node under its own id.
    pub fn with_inbound(inbound: InboundContext<MockPeer>) -> Self {
        Self {
            inner: Arc::new(Inner {
                behaviours: DashMap::new(),
                dials: DashMap::new(),
                inbound,
            }),
        }
    }

    /// Sets how `peer` answers new streams.
    pub fn set_behaviour(&self, peer: MockPeer, behaviour: Behaviour) {
        self.inner.behaviours.insert(peer, behaviour);
    }

    /// The amount of streams opened to `peer`, including refused ones.
    pub fn dials(&self, peer: MockPeer) -> usize {
        self.inner.dials.get(&peer).map_or(0, |d| *d)
    }
}

#[async_trait::async_trait]
impl Transport<MockPeer> for MockTransport {
    type Stream = DuplexStream;

    async fn open_stream(
        &self,
        peer: &MockPeer,
        protocol: &ProtocolId,
    ) -> Result<DuplexStream, io::Error> {
        *self.inner.dials.entry(*peer).or_insert(0) += 1;

        let behaviour = match self.inner.behaviours.get(peer) {
            Some(b) if !matches!(b.value(), Behaviour::Unreachable) => b.value().clone(),
            _ => return Err(io::ErrorKind::ConnectionRefused.into()),
        };

        let (local, remote) = tokio::io::duplex(DUPLEX_BUFFER);
        tokio::spawn(serve(
            Arc::clone(&self.inner),
            *peer,
            protocol.message_type,
            behaviour,
            remote,
        ));
        Ok(local)
    }
}

async fn serve(
    inner: Arc<Inner>,
    peer: MockPeer,
    message_type: MessageType,
    mut behaviour: Behaviour,
    mut stream: DuplexStream,
) {
    loop {
        match behaviour {
            Behaviour::Delayed(delay, next) => {
                tokio::time::sleep(delay).await;
                behaviour = *next;
            }
            Behaviour::Unreachable => return,
            Behaviour::Serve(store) => {
                if let Err(e) =
                    handle_inbound_stream(&inner.inbound, store.as_ref(), &peer, message_type, stream)
                        .await
                {
                    tracing::debug!(?peer, error = %e, "mock peer failed to serve");
                }
                return;
            }
            Behaviour::Script(steps) => {
                let mut request = Vec::new();
                if let Err(e) = stream.read_to_end(&mut request).await {
                    tracing::debug!(?peer, error = %e, "mock peer failed to read the request");
                    return;
                }

                let fork = inner.inbound.fork.current_fork().name;
                let mut codec =
                    ResponseChunkCodec::new(Arc::clone(&inner.inbound.registry), message_type, fork);

                for step in steps {
                    let res = match step {
                        ScriptStep::Chunk(chunk) => {
                            let mut buf = BytesMut::new();
                            match codec.encode(chunk, &mut buf) {
                                Ok(()) => stream.write_all(&buf).await,
                                Err(e) => Err(io::Error::other(e)),
                            }
                        }
                        ScriptStep::Raw(bytes) => stream.write_all(&bytes).await,
                        ScriptStep::Sleep(duration) => {
                            tokio::time::sleep(duration).await;
                            Ok(())
                        }
                        ScriptStep::Hang => {
                            std::future::pending::<()>().await;
                            Ok(())
                        }
                    };

                    if let Err(e) = res {
                        tracing::debug!(?peer, error = %e, "mock peer script failed");
                        return;
                    }
                }
                return;
            }
        }
    }
}
