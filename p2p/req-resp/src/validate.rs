//! Checks a response against the request it answers.
use std::collections::HashSet;

use beacon_wire::{ContentKey, RangeRequest, RequestBody, ResponseItem};

use crate::RequestError;

/// Checks each received item against the request.
///
/// By-root responses are matched by content, never by position: every item must be one the
/// request named and no item may come twice. Range responses must stay inside the requested
/// span, on its step grid, in non-decreasing slot order.
#[derive(Debug)]
pub(crate) struct ResponseValidator {
    /// The keys a by-root response may still contain.
    requested: Option<HashSet<ContentKey>>,
    range: Option<RangeRequest>,
    seen: HashSet<ContentKey>,
    last_slot: Option<u64>,
    max_items: u64,
    received: u64,
    allow_empty: bool,
}

impl ResponseValidator {
    pub(crate) fn new(body: &RequestBody, max_items: u64, allow_empty: bool) -> Self {
        Self {
            requested: body
                .requested_keys()
                .map(|keys| keys.into_iter().collect()),
            range: body.range().copied(),
            seen: HashSet::new(),
            last_slot: None,
            max_items,
            received: 0,
            allow_empty,
        }
    }

    /// Checks the next item of the response.
    pub(crate) fn check(&mut self, item: &ResponseItem) -> Result<(), RequestError> {
        self.received += 1;
        if self.received > self.max_items {
            return Err(RequestError::InvalidResponse("more items than requested"));
        }

        if let Some(requested) = &self.requested {
            if !requested.contains(&item.key) {
                return Err(RequestError::InvalidResponse("item was not requested"));
            }
        }

        if let Some(range) = &self.range {
            let slot = item
                .key
                .slot()
                .ok_or(RequestError::InvalidResponse("range item without a slot"))?;
            if !range.contains(slot) {
                return Err(RequestError::InvalidResponse("item outside the requested range"));
            }
            if self.last_slot.is_some_and(|last| slot < last) {
                return Err(RequestError::InvalidResponse("range items out of order"));
            }
            self.last_slot = Some(slot);
        }

        if !self.seen.insert(item.key) {
            return Err(RequestError::InvalidResponse("duplicate item"));
        }

        Ok(())
    }

    /// Checks the response once the peer closed the stream.
    pub(crate) fn finish(&self) -> Result<(), RequestError> {
        if self.received == 0 && !self.allow_empty {
            return Err(RequestError::InvalidResponse("empty response"));
        }
        Ok(())
    }
}
