//! The inbound responder.
//!
//! [`handle_inbound_stream`] serves one stream a peer opened to us: it reads the request,
//! applies the inbound quota and the configured bounds, then writes whatever the
//! [`RequestHandler`] answers and closes the stream.
use std::{io, sync::Arc};

use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf},
    time::timeout,
};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::instrument;

use beacon_rate_limiter::RateLimiter;
use beacon_wire::{
    codec::{RequestCodec, ResponseChunk, ResponseChunkCodec},
    ForkContext, ForkName, MessageType, PeerId, RequestBody, ResponseCode, SchemaRegistry,
    WireError,
};

use crate::EngineConfig;

/// Produces the response to a valid, admitted request.
#[async_trait::async_trait]
pub trait RequestHandler<P: PeerId>: Send + Sync + 'static {
    /// Returns the chunks to send back, in order.
    ///
    /// An error chunk ends the response, chunks after it are not sent.
    async fn handle(&self, peer: &P, request: RequestBody) -> Vec<ResponseChunk>;
}

/// What the inbound responder shares with the outbound side.
#[derive(Clone)]
pub struct InboundContext<P: PeerId> {
    pub registry: Arc<SchemaRegistry>,
    pub fork: ForkContext,
    pub limiter: RateLimiter<P>,
    pub config: EngineConfig,
}

/// Serves a stream `peer` opened for `message_type`.
///
/// # Errors
///
/// Returns an error if writing the response fails or the peer did not send its request in time.
/// Rejected requests are answered with an error chunk and are not an error here.
#[instrument(level = "debug", name = "inbound", skip_all, fields(peer = ?peer, protocol = %message_type))]
pub async fn handle_inbound_stream<P, S, H>(
    ctx: &InboundContext<P>,
    handler: &H,
    peer: &P,
    message_type: MessageType,
    stream: S,
) -> Result<(), WireError>
where
    P: PeerId,
    S: AsyncRead + AsyncWrite + Unpin,
    H: RequestHandler<P> + ?Sized,
{
    let fork = ctx.fork.current_fork().name;
    let (read, write) = tokio::io::split(stream);
    let mut writer = FramedWrite::new(
        write,
        ResponseChunkCodec::new(Arc::clone(&ctx.registry), message_type, fork),
    );

    let chunks = match read_request(ctx, peer, message_type, fork, read).await? {
        Ok(request) => handler.handle(peer, request).await,
        Err(rejection) => vec![rejection],
    };

    for chunk in chunks {
        let is_error = matches!(chunk, ResponseChunk::Error { .. });
        writer.feed(chunk).await?;
        if is_error {
            break;
        }
    }
    writer.flush().await?;
    writer.get_mut().shutdown().await?;

    Ok(())
}

/// Reads and admits the request on `read`.
///
/// The inner `Err` is the error chunk rejecting the request.
async fn read_request<P: PeerId, R: AsyncRead>(
    ctx: &InboundContext<P>,
    peer: &P,
    message_type: MessageType,
    fork: ForkName,
    read: ReadHalf<R>,
) -> Result<Result<RequestBody, ResponseChunk>, WireError> {
    // An empty bucket is rejected before the body is read.
    if !ctx.limiter.has_tokens(peer, message_type) {
        tracing::debug!("rejecting request, out of quota");
        return Ok(Err(rejection(ResponseCode::ResourceUnavailable, "rate limited")));
    }

    let codec = match RequestCodec::new(&ctx.registry, message_type, fork) {
        Ok(codec) => codec,
        Err(e) => return Ok(Err(rejection(ResponseCode::InvalidRequest, &e.to_string()))),
    };
    let mut reader = FramedRead::new(read, codec);

    let value = match timeout(ctx.config.inbound_read_timeout, reader.next()).await {
        Err(_) => {
            return Err(WireError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "peer did not send its request in time",
            )))
        }
        Ok(None) => {
            return Err(WireError::Io(io::ErrorKind::UnexpectedEof.into()));
        }
        Ok(Some(Err(WireError::Io(e)))) => return Err(WireError::Io(e)),
        Ok(Some(Err(e))) => {
            return Ok(Err(rejection(ResponseCode::InvalidRequest, &e.to_string())));
        }
        Ok(Some(Ok(value))) => value,
    };

    let request = match RequestBody::from_value(message_type, &value)
        .and_then(|request| request.validate(ctx.registry.config()).map(|()| request))
    {
        Ok(request) => request,
        Err(e) => return Ok(Err(rejection(ResponseCode::InvalidRequest, &e.to_string()))),
    };

    if let Err(e) = ctx
        .limiter
        .inbound_admit(peer, message_type, request.item_count())
    {
        tracing::debug!(error = %e, "rejecting request, over quota");
        return Ok(Err(rejection(ResponseCode::ResourceUnavailable, "rate limited")));
    }

    Ok(Ok(request))
}

fn rejection(code: ResponseCode, message: &str) -> ResponseChunk {
    ResponseChunk::Error {
        code,
        message: message.to_owned(),
    }
}
