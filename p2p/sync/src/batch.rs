//! Splitting fetches into requests and tracking their retries.
use std::collections::HashSet;

use tokio::time::Instant;

use beacon_req_resp::{FailureClass, RequestError};
use beacon_wire::{
    BlobIdentifier, ContentKey, MessageType, PeerId, RangeRequest, RequestBody, Root,
};

use crate::ClaimRegistry;

/// Splits `roots` into requests of at most `max` roots.
pub(crate) fn split_roots(roots: &[Root], max: u64) -> Vec<RequestBody> {
    roots
        .chunks(chunk_len(max))
        .map(|chunk| RequestBody::BlocksByRoot(chunk.to_vec()))
        .collect()
}

/// Splits `ids` into requests of at most `max` identifiers.
pub(crate) fn split_blob_ids(ids: &[BlobIdentifier], max: u64) -> Vec<RequestBody> {
    ids.chunks(chunk_len(max))
        .map(|chunk| RequestBody::BlobSidecarsByRoot(chunk.to_vec()))
        .collect()
}

/// Splits `range` into consecutive sub-ranges of at most `max` slots with the same step.
pub(crate) fn split_range(
    message_type: MessageType,
    range: RangeRequest,
    max: u64,
) -> Vec<RequestBody> {
    let max = max.max(1);
    let mut bodies = Vec::new();

    let mut done = 0;
    while done < range.count {
        let count = (range.count - done).min(max);
        let sub = RangeRequest {
            start_slot: range
                .start_slot
                .saturating_add(done.saturating_mul(range.step)),
            count,
            step: range.step,
        };
        bodies.push(range_body(message_type, sub));
        done += count;
    }

    bodies
}

fn range_body(message_type: MessageType, range: RangeRequest) -> RequestBody {
    if message_type == MessageType::BlobSidecarsByRange {
        RequestBody::BlobSidecarsByRange(range)
    } else {
        RequestBody::BlocksByRange(range)
    }
}

fn chunk_len(max: u64) -> usize {
    usize::try_from(max.max(1)).unwrap_or(usize::MAX)
}

/// Why the last attempt of a batch failed.
#[derive(Debug, Clone)]
pub(crate) struct LastFailure {
    pub class: FailureClass,
    pub error: String,
}

impl From<&RequestError> for LastFailure {
    fn from(e: &RequestError) -> Self {
        Self {
            class: e.class(),
            error: e.to_string(),
        }
    }
}

/// One request of a fetch, possibly sent more than once.
#[derive(Debug)]
pub(crate) struct Batch<P> {
    /// What is still wanted from this batch.
    pub body: RequestBody,
    /// Requests dispatched for this batch so far.
    pub attempts: u32,
    /// Requests of this batch still running.
    pub in_flight: u32,
    /// Peers this batch was sent to.
    pub tried: HashSet<P>,
    /// When the last request was dispatched.
    pub dispatched_at: Option<Instant>,
    /// The highest slot received for a range batch.
    pub progress: Option<u64>,
    pub last_failure: Option<LastFailure>,
}

impl<P: PeerId> Batch<P> {
    pub fn new(body: RequestBody) -> Self {
        Self {
            body,
            attempts: 0,
            in_flight: 0,
            tried: HashSet::new(),
            dispatched_at: None,
            progress: None,
            last_failure: None,
        }
    }

    /// The slot span of a range batch, as `[start, end)`.
    pub fn span(&self) -> Option<(u64, u64)> {
        self.body.range().map(|r| (r.start_slot, r.end_slot()))
    }

    /// Narrows the body down to what is still missing.
    ///
    /// By-root batches drop fulfilled keys. Range batches restart from the highest received
    /// slot, inclusive as a slot can hold more than one blob sidecar.
    ///
    /// Returns `false` once nothing is missing.
    pub fn narrow(&mut self, claims: &ClaimRegistry<ContentKey>) -> bool {
        match &mut self.body {
            RequestBody::BlocksByRoot(roots) => {
                roots.retain(|root| !claims.is_fulfilled(&ContentKey::Root(*root)));
                !roots.is_empty()
            }
            RequestBody::BlobSidecarsByRoot(ids) => {
                ids.retain(|id| !claims.is_fulfilled(&ContentKey::Blob(*id)));
                !ids.is_empty()
            }
            RequestBody::BlocksByRange(range) | RequestBody::BlobSidecarsByRange(range) => {
                let Some(progress) = self.progress else {
                    return true;
                };
                let end = range.end_slot();
                if progress < range.start_slot || range.step == 0 {
                    return true;
                }
                if progress >= end {
                    return false;
                }

                // Snap to the step grid, the last slot is always on it.
                let offset = (progress - range.start_slot) / range.step * range.step;
                range.start_slot += offset;
                range.count = (end - range.start_slot).div_ceil(range.step);
                range.count != 0
            }
            RequestBody::ValidatorChangeBroadcast(_) => false,
        }
    }

    /// The keys this batch still wants, slots for range batches.
    pub fn missing_keys(&self) -> Vec<ContentKey> {
        if let Some(keys) = self.body.requested_keys() {
            return keys;
        }

        self.body.range().map_or_else(Vec::new, |range| {
            let step = usize::try_from(range.step.max(1)).unwrap_or(usize::MAX);
            (range.start_slot..range.end_slot())
                .step_by(step)
                .map(ContentKey::Slot)
                .collect()
        })
    }
}
