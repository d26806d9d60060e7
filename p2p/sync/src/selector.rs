//! Peer selection strategies.
use std::sync::Arc;

use rand::seq::SliceRandom;

use beacon_wire::PeerId;

use crate::{peers::Candidate, PeerSelection};

/// Picks the peer a request is sent to.
pub trait PeerSelector<P: PeerId>: Send + Sync + 'static {
    /// Picks one of `candidates`, or [`None`] if it is empty.
    fn select(&self, candidates: &[Candidate<P>]) -> Option<P>;
}

/// Prefers peers advertising the requested span, then the peer idle the longest.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeastRecentlyUsed;

impl<P: PeerId> PeerSelector<P> for LeastRecentlyUsed {
    fn select(&self, candidates: &[Candidate<P>]) -> Option<P> {
        candidates
            .iter()
            .min_by_key(|c| (!c.has_span, c.last_used))
            .map(|c| c.peer.clone())
    }
}

/// Picks a random peer, among those advertising the requested span if there are any.
#[derive(Debug, Clone, Copy, Default)]
pub struct Shuffled;

impl<P: PeerId> PeerSelector<P> for Shuffled {
    fn select(&self, candidates: &[Candidate<P>]) -> Option<P> {
        let preferred = candidates.iter().filter(|c| c.has_span).collect::<Vec<_>>();
        let pool = if preferred.is_empty() {
            candidates.iter().collect()
        } else {
            preferred
        };

        pool.choose(&mut rand::thread_rng()).map(|c| c.peer.clone())
    }
}

impl PeerSelection {
    pub(crate) fn selector<P: PeerId>(self) -> Arc<dyn PeerSelector<P>> {
        match self {
            Self::LeastRecentlyUsed => Arc::new(LeastRecentlyUsed),
            Self::Shuffled => Arc::new(Shuffled),
        }
    }
}
