//! # Beacon Sync
//!
//! Fetches blocks and blob sidecars from a set of peers, on top of a
//! [`RequestEngine`](beacon_req_resp::RequestEngine).
//!
//! A fetch is split into batches no bigger than the chain's request bounds. Batches are sent
//! to peers picked by a [`PeerSelector`], at most [`SyncConfig::max_concurrent_requests`] at a
//! time over all running fetches. A failed batch is narrowed down to what is still missing and
//! sent to another peer, peers that broke the protocol are never picked again. A busy peer or an
//! empty quota delays the retry by [`SyncConfig::backoff`] at least. A batch in flight for longer than
//! [`SyncConfig::hedge_timeout`] is also sent to a second peer, the first response wins.
//!
//! The [`ClaimRegistry`] makes sure every item is handed out exactly once. Items a batch still
//! misses after [`SyncConfig::max_attempts`] requests are reported as [`Unresolved`].
mod batch;
mod claims;
mod config;
mod orchestrator;
mod peers;
mod selector;

pub use claims::ClaimRegistry;
pub use config::{PeerSelection, SyncConfig};
pub use orchestrator::{FetchOutcome, SyncError, SyncOrchestrator, Unresolved, UnresolvedReason};
pub use peers::{Candidate, PeerSet, PeerStatus};
pub use selector::{LeastRecentlyUsed, PeerSelector, Shuffled};
