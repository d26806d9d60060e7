use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use beacon_wire::MessageType;

/// The token bucket of one message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Quota {
    /// The most tokens a bucket holds, also the largest allowed request cost.
    pub capacity: u64,
    /// Tokens added per second.
    pub refill_per_second: u64,
}

impl Quota {
    pub const fn new(capacity: u64, refill_per_second: u64) -> Self {
        Self {
            capacity,
            refill_per_second,
        }
    }
}

/// The [`crate::RateLimiter`] config.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct RateLimiterConfig {
    /// The quota of every message type, types not listed use their default.
    pub quotas: BTreeMap<MessageType, Quota>,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            quotas: MessageType::ALL
                .into_iter()
                .map(|mt| (mt, default_quota(mt)))
                .collect(),
        }
    }
}

impl RateLimiterConfig {
    /// Returns the quota of `message_type`.
    pub fn quota(&self, message_type: MessageType) -> Quota {
        self.quotas
            .get(&message_type)
            .copied()
            .unwrap_or_else(|| default_quota(message_type))
    }
}

/// Roughly one full request per ten seconds.
const fn default_quota(message_type: MessageType) -> Quota {
    match message_type {
        MessageType::BlocksByRange => Quota::new(1024, 103),
        MessageType::BlobSidecarsByRange => Quota::new(768, 77),
        MessageType::BlocksByRoot
        | MessageType::BlobSidecarsByRoot
        | MessageType::ValidatorChangeBroadcast => Quota::new(128, 13),
    }
}
