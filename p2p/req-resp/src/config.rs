use std::time::Duration;

use serde::{Deserialize, Serialize};

use beacon_rate_limiter::OutboundPolicy;

/// The [`RequestEngine`](crate::RequestEngine) and inbound responder config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct EngineConfig {
    /// The longest we wait between two chunks, or for the first one.
    pub idle_timeout: Duration,
    /// The deadline of a request that was not given one.
    pub request_timeout: Duration,
    /// The longest an inbound stream may take to send its request.
    pub inbound_read_timeout: Duration,
    /// What an outbound request does when it's over quota.
    pub outbound_policy: OutboundPolicy,
    /// The amount of items buffered between a request task and its [`ResponseStream`](crate::ResponseStream).
    pub response_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            inbound_read_timeout: Duration::from_secs(5),
            outbound_policy: OutboundPolicy::FailFast,
            response_buffer: 32,
        }
    }
}
