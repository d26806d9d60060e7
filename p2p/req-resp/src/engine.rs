//! The outbound request state machine.
//!
//! Every call to [`RequestEngine::request`] spawns one task that drives a single exchange with a
//! peer and hands the decoded items to a [`ResponseStream`]. The task is bounded by two timers:
//! the request deadline, covering the whole exchange, and the idle timeout, covering the wait for
//! each chunk. Both live inside the task and go away with it.
use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
};

use futures::{SinkExt, Stream, StreamExt};
use tokio::{
    io::AsyncWriteExt,
    sync::{mpsc, oneshot, watch},
    time::{timeout, timeout_at, Instant},
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::{CancellationToken, DropGuard},
};
use tracing::{instrument, Instrument, Span};

use beacon_rate_limiter::RateLimiter;
use beacon_wire::{
    codec::{RequestCodec, ResponseChunk, ResponseChunkCodec},
    ForkContext, PartialResponsePolicy, PeerId, ProtocolId, RequestBody, ResponseItem,
    SchemaRegistry, WireError,
};

use crate::{
    validate::ResponseValidator, EngineConfig, RequestError, RequestState, Transport,
};

/// Drives outbound requests, cheap to clone.
#[derive(Clone)]
pub struct RequestEngine<P: PeerId, T: Transport<P>> {
    transport: T,
    registry: Arc<SchemaRegistry>,
    fork: ForkContext,
    limiter: RateLimiter<P>,
    config: EngineConfig,
    /// The parent of every request's cancellation token.
    shutdown: CancellationToken,
}

impl<P: PeerId, T: Transport<P>> RequestEngine<P, T> {
    pub fn new(
        transport: T,
        registry: Arc<SchemaRegistry>,
        fork: ForkContext,
        limiter: RateLimiter<P>,
        config: EngineConfig,
    ) -> Self {
        Self {
            transport,
            registry,
            fork,
            limiter,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    pub const fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub const fn fork_context(&self) -> &ForkContext {
        &self.fork
    }

    pub const fn rate_limiter(&self) -> &RateLimiter<P> {
        &self.limiter
    }

    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Sends `body` to `peer`, the response is read from the returned [`ResponseStream`].
    ///
    /// If `deadline` is [`None`] the request gets [`EngineConfig::request_timeout`].
    /// Dropping the stream cancels the request.
    pub fn request(&self, peer: P, body: RequestBody, deadline: Option<Instant>) -> ResponseStream {
        let token = self.shutdown.child_token();
        let (items_tx, items_rx) = mpsc::channel(self.config.response_buffer.max(1));
        let (error_tx, error_rx) = oneshot::channel();
        let (state_tx, state_rx) = watch::channel(RequestState::Idle);

        let deadline = deadline.unwrap_or_else(|| Instant::now() + self.config.request_timeout);

        let exchange = Exchange {
            engine: self.clone(),
            peer,
            body,
            deadline,
            token: token.clone(),
            items: items_tx,
            error: error_tx,
            state: state_tx,
        };
        tokio::spawn(exchange.run().instrument(Span::current()));

        ResponseStream {
            items: items_rx,
            error: Some(error_rx),
            state: state_rx,
            token: token.clone(),
            _guard: token.drop_guard(),
        }
    }

    /// Cancels every in-flight request of this engine and its clones.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// One outbound exchange, owned by its task.
struct Exchange<P: PeerId, T: Transport<P>> {
    engine: RequestEngine<P, T>,
    peer: P,
    body: RequestBody,
    deadline: Instant,
    token: CancellationToken,
    items: mpsc::Sender<ResponseItem>,
    /// Takes the error ending the request, sending never waits on the item buffer.
    error: oneshot::Sender<RequestError>,
    state: watch::Sender<RequestState>,
}

impl<P: PeerId, T: Transport<P>> Exchange<P, T> {
    #[instrument(
        level = "debug",
        name = "request",
        skip_all,
        fields(peer = ?self.peer, protocol = %self.body.message_type())
    )]
    async fn run(self) {
        let token = self.token.clone();
        let deadline = self.deadline;

        let res = tokio::select! {
            biased;
            () = token.cancelled() => Err(RequestError::Cancelled),
            res = timeout_at(deadline, self.exchange()) => res.unwrap_or(Err(RequestError::TimedOut)),
        };

        let res = match res {
            Ok(buffered) => self.flush(buffered).await,
            Err(e) => Err(e),
        };

        match res {
            Ok(()) => self.set_state(RequestState::Completed),
            Err(e) => {
                self.set_state(match e {
                    RequestError::TimedOut => RequestState::TimedOut,
                    RequestError::Cancelled => RequestState::Cancelled,
                    _ => RequestState::Failed,
                });
                tracing::debug!(error = %e, "request failed");

                if self.error.send(e).is_err() {
                    tracing::trace!("response stream dropped");
                }
            }
        }
    }

    fn set_state(&self, state: RequestState) {
        let old = self.state.send_replace(state);
        tracing::trace!(from = %old, to = %state, "request state");
    }

    async fn emit(&self, item: ResponseItem) -> Result<(), RequestError> {
        self.items
            .send(item)
            .await
            .map_err(|_| RequestError::Cancelled)
    }

    /// Hands out the items an all-or-nothing response held back.
    async fn flush(&self, buffered: Vec<ResponseItem>) -> Result<(), RequestError> {
        for item in buffered {
            if self.token.is_cancelled() {
                return Err(RequestError::Cancelled);
            }
            self.emit(item).await?;
        }
        Ok(())
    }

    /// Runs the exchange up to the end of the response.
    ///
    /// Returns the items held back by an all-or-nothing policy.
    async fn exchange(&self) -> Result<Vec<ResponseItem>, RequestError> {
        let registry = Arc::clone(&self.engine.registry);
        let message_type = self.body.message_type();
        let policy = *registry.policy(message_type);

        self.body.validate(registry.config())?;
        let fork = self.engine.fork.current_fork().name;
        let request_codec = RequestCodec::new(&registry, message_type, fork)?;

        let permit = self
            .engine
            .limiter
            .acquire(
                &self.peer,
                message_type,
                self.body.item_count(),
                self.engine.config.outbound_policy,
            )
            .await?;

        self.set_state(RequestState::Dialing);
        let protocol = ProtocolId::new(message_type, &policy);
        // On failure the permit drops here and the quota is refunded.
        let stream = self
            .engine
            .transport
            .open_stream(&self.peer, &protocol)
            .await
            .map_err(RequestError::PeerUnreachable)?;

        self.set_state(RequestState::Writing);
        permit.dispatched();
        let (read, write) = tokio::io::split(stream);
        let mut writer = FramedWrite::new(write, request_codec);
        writer
            .send(self.body.to_value())
            .await
            .map_err(write_error)?;
        writer
            .get_mut()
            .shutdown()
            .await
            .map_err(RequestError::WriteError)?;

        self.set_state(RequestState::AwaitingChunk);
        let mut reader = FramedRead::new(
            read,
            ResponseChunkCodec::new(Arc::clone(&registry), message_type, fork),
        );
        let mut validator = ResponseValidator::new(
            &self.body,
            self.body.max_response_items(registry.config()),
            policy.allow_empty_response,
        );
        let mut buffered = Vec::new();

        loop {
            let Some(chunk) = timeout(self.engine.config.idle_timeout, reader.next())
                .await
                .map_err(|_| RequestError::TimedOut)?
            else {
                break;
            };

            self.set_state(RequestState::ReadingChunk);
            match chunk? {
                ResponseChunk::Success { fork, value } => {
                    let key = registry.item_key(message_type, fork, &value)?;
                    let item = ResponseItem { fork, value, key };
                    validator.check(&item)?;

                    match policy.partial_response {
                        PartialResponsePolicy::AllOrNothing => buffered.push(item),
                        PartialResponsePolicy::BestEffort => self.emit(item).await?,
                    }
                }
                ResponseChunk::Error { code, message } => {
                    tracing::debug!(?code, %message, "peer sent an error chunk");
                    return Err(RequestError::from_error_chunk(code, message));
                }
            }
            self.set_state(RequestState::AwaitingChunk);
        }

        validator.finish()?;
        Ok(buffered)
    }
}

fn write_error(e: WireError) -> RequestError {
    match e {
        WireError::Io(e) => RequestError::WriteError(e),
        e => e.into(),
    }
}

/// The response to an outbound request.
///
/// Yields the decoded items in arrival order. A failed request ends with one `Err`.
pub struct ResponseStream {
    items: mpsc::Receiver<ResponseItem>,
    /// [`None`] once the end of the request was yielded.
    error: Option<oneshot::Receiver<RequestError>>,
    state: watch::Receiver<RequestState>,
    token: CancellationToken,
    /// Cancels the request when the stream is dropped.
    _guard: DropGuard,
}

impl ResponseStream {
    /// Cancels the request, calling this more than once has no further effect.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The current state of the request.
    pub fn state(&self) -> RequestState {
        *self.state.borrow()
    }

    /// Returns `true` once the task driving the request has exited.
    pub fn is_finished(&self) -> bool {
        self.state.has_changed().is_err()
    }

    /// Waits for the request to end and returns what it produced.
    pub async fn collect_all(mut self) -> CollectedResponse {
        let mut items = Vec::new();
        while let Some(res) = self.next().await {
            match res {
                Ok(item) => items.push(item),
                Err(e) => {
                    return CollectedResponse {
                        items,
                        error: Some(e),
                    }
                }
            }
        }

        CollectedResponse { items, error: None }
    }
}

impl Stream for ResponseStream {
    type Item = Result<ResponseItem, RequestError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(item) = ready!(self.items.poll_recv(cx)) {
            return Poll::Ready(Some(Ok(item)));
        }

        // The item channel closes when the task exits, the error was sent before that.
        let Some(error) = self.error.as_mut() else {
            return Poll::Ready(None);
        };
        let res = ready!(Pin::new(error).poll(cx));
        self.error = None;
        Poll::Ready(res.ok().map(Err))
    }
}

/// Everything a request produced.
#[derive(Debug)]
pub struct CollectedResponse {
    /// The items handed out, under a best-effort policy these survive a later error.
    pub items: Vec<ResponseItem>,
    pub error: Option<RequestError>,
}
