//! # Beacon Req/Resp
//!
//! The request/response layer on top of a stream [`Transport`].
//!
//! Outbound, the [`RequestEngine`] drives each request through a [`RequestState`] machine: it
//! takes quota from the shared [`RateLimiter`](beacon_rate_limiter::RateLimiter), opens a stream,
//! writes the request and reads chunks until the peer closes the stream, the request times out
//! or it is cancelled. Received items are checked against the request before they are handed out,
//! and whether earlier items survive a later error chunk is decided by the message type's
//! [`PartialResponsePolicy`](beacon_wire::PartialResponsePolicy).
//!
//! Inbound, [`handle_inbound_stream`] serves a stream opened by a peer with a [`RequestHandler`].
//!
//! Failed requests carry a [`FailureClass`] telling the caller whether to retry, and whether the
//! peer is to blame.
mod config;
mod engine;
mod error;
mod inbound;
mod state;
mod transport;
mod validate;

pub use config::EngineConfig;
pub use engine::{CollectedResponse, RequestEngine, ResponseStream};
pub use error::{FailureClass, RequestError};
pub use inbound::{handle_inbound_stream, InboundContext, RequestHandler};
pub use state::RequestState;
pub use transport::Transport;
