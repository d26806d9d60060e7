//! The set of peers a [`SyncOrchestrator`](crate::SyncOrchestrator) can dispatch to.
use std::collections::HashSet;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::warn;

use beacon_wire::PeerId;

/// What a peer last told us about its chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerStatus {
    /// The slot of the peer's head block.
    pub head_slot: u64,
    /// The first slot the peer still serves.
    pub earliest_available_slot: u64,
}

impl PeerStatus {
    /// Returns `true` if the peer should hold every slot of `[start, end)`.
    pub const fn has_span(&self, start: u64, end: u64) -> bool {
        start >= self.earliest_available_slot && end <= self.head_slot.saturating_add(1)
    }
}

#[derive(Debug)]
struct PeerEntry {
    status: PeerStatus,
    penalized: bool,
    last_used: Option<Instant>,
}

/// A peer a request could be sent to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate<P> {
    pub peer: P,
    /// Whether the peer's status covers the requested span, always `true` for by-root requests.
    pub has_span: bool,
    /// When a request was last dispatched to the peer.
    pub last_used: Option<Instant>,
}

/// The known peers, with their status and penalization.
#[derive(Debug)]
pub struct PeerSet<P: PeerId> {
    peers: DashMap<P, PeerEntry>,
}

impl<P: PeerId> Default for PeerSet<P> {
    fn default() -> Self {
        Self {
            peers: DashMap::new(),
        }
    }
}

impl<P: PeerId> PeerSet<P> {
    /// Adds a peer, a known peer only has its status updated.
    pub fn add(&self, peer: P, status: PeerStatus) {
        self.peers
            .entry(peer)
            .and_modify(|entry| entry.status = status)
            .or_insert(PeerEntry {
                status,
                penalized: false,
                last_used: None,
            });
    }

    /// Updates the status of a known peer, returns `false` if the peer is unknown.
    pub fn update_status(&self, peer: &P, status: PeerStatus) -> bool {
        match self.peers.get_mut(peer) {
            Some(mut entry) => {
                entry.status = status;
                true
            }
            None => false,
        }
    }

    /// Removes a peer, returns `false` if the peer is unknown.
    pub fn remove(&self, peer: &P) -> bool {
        self.peers.remove(peer).is_some()
    }

    /// Stops selecting `peer` for any future request.
    pub fn penalize(&self, peer: &P, reason: &dyn std::fmt::Display) {
        if let Some(mut entry) = self.peers.get_mut(peer) {
            if !entry.penalized {
                warn!(?peer, %reason, "Penalizing peer.");
            }
            entry.penalized = true;
        }
    }

    pub fn is_penalized(&self, peer: &P) -> bool {
        self.peers.get(peer).is_some_and(|entry| entry.penalized)
    }

    pub fn status(&self, peer: &P) -> Option<PeerStatus> {
        self.peers.get(peer).map(|entry| entry.status)
    }

    pub(crate) fn mark_used(&self, peer: &P) {
        if let Some(mut entry) = self.peers.get_mut(peer) {
            entry.last_used = Some(Instant::now());
        }
    }

    /// The peers that are not penalized or in `exclude`.
    ///
    /// `span` is the `[start, end)` slot span of a range request.
    pub fn candidates(&self, exclude: &HashSet<P>, span: Option<(u64, u64)>) -> Vec<Candidate<P>> {
        self.peers
            .iter()
            .filter(|entry| !entry.penalized && !exclude.contains(entry.key()))
            .map(|entry| Candidate {
                peer: entry.key().clone(),
                has_span: span.is_none_or(|(start, end)| entry.status.has_span(start, end)),
                last_used: entry.last_used,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
