use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The peer selection strategy of a [`SyncOrchestrator`](crate::SyncOrchestrator).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerSelection {
    /// [`LeastRecentlyUsed`](crate::LeastRecentlyUsed).
    #[default]
    LeastRecentlyUsed,
    /// [`Shuffled`](crate::Shuffled).
    Shuffled,
}

/// The [`SyncOrchestrator`](crate::SyncOrchestrator) config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct SyncConfig {
    /// The most requests in flight, shared by every fetch of an orchestrator and its clones.
    pub max_concurrent_requests: usize,
    /// The most requests made for a single item, hedged ones included.
    pub max_attempts: u32,
    /// How long a batch may be in flight before it is also requested from another peer.
    ///
    /// [`None`] disables hedging.
    pub hedge_timeout: Option<Duration>,
    /// The deadline of every request, from dispatch.
    pub request_timeout: Duration,
    /// The least a batch waits before it is retried after a busy peer or an empty local quota.
    pub backoff: Duration,
    pub peer_selection: PeerSelection,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 8,
            max_attempts: 3,
            hedge_timeout: Some(Duration::from_secs(5)),
            request_timeout: Duration::from_secs(15),
            backoff: Duration::from_secs(1),
            peer_selection: PeerSelection::LeastRecentlyUsed,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn partial_toml() {
        let config: SyncConfig = toml::from_str(
            r#"
            max_attempts = 5
            peer_selection = "shuffled"
            request_timeout = { secs = 3, nanos = 0 }
            "#,
        )
        .unwrap();

        assert_eq!(
            config,
            SyncConfig {
                max_attempts: 5,
                peer_selection: PeerSelection::Shuffled,
                request_timeout: Duration::from_secs(3),
                ..SyncConfig::default()
            }
        );
        assert!(toml::from_str::<SyncConfig>("hedge = true").is_err());
    }
}
