use std::{sync::Arc, time::Duration};

use pretty_assertions::assert_eq;
use tokio::time::Instant;

use beacon_rate_limiter::{Quota, RateLimiter, RateLimiterConfig};
use beacon_req_resp::{EngineConfig, FailureClass, RequestEngine, RequestError};
use beacon_ssz::Value;
use beacon_sync::{
    Candidate, FetchOutcome, PeerSelector, PeerStatus, SyncConfig, SyncError, SyncOrchestrator,
    Unresolved, UnresolvedReason,
};
use beacon_test_utils::{
    fixtures::{blob_id, blob_sidecar, block_root, fork_context, registry, signed_block, test_config},
    Behaviour, MockPeer, MockStore, MockTransport, ScriptStep,
};
use beacon_wire::{
    codec::ResponseChunk, ChainConfig, ContentKey, ForkConfig, ForkName, MessageType,
    RangeRequest, ResponseCode, Root, SchemaRegistry,
};

const CAPACITY: u64 = 1_000;
const STATUS: PeerStatus = PeerStatus {
    head_slot: 1_000,
    earliest_available_slot: 0,
};

/// Picks the given peer while it is a candidate, else the lowest one.
struct Prefer(MockPeer);

impl PeerSelector<MockPeer> for Prefer {
    fn select(&self, candidates: &[Candidate<MockPeer>]) -> Option<MockPeer> {
        let mut peers = candidates.iter().map(|c| c.peer);
        if peers.clone().any(|p| p == self.0) {
            Some(self.0)
        } else {
            peers.min()
        }
    }
}

struct Harness {
    registry: Arc<SchemaRegistry>,
    transport: MockTransport,
    sync: SyncOrchestrator<MockPeer, MockTransport>,
}

impl Harness {
    fn new(config: SyncConfig) -> Self {
        Self::with(test_config(), config)
    }

    fn with(chain: ChainConfig, config: SyncConfig) -> Self {
        Self::with_quota(chain, config, Quota::new(CAPACITY, 0))
    }

    fn with_quota(chain: ChainConfig, config: SyncConfig, quota: Quota) -> Self {
        let registry = registry(&chain);
        let fork = fork_context(&registry);
        let transport = MockTransport::new(Arc::clone(&registry), fork.clone());

        let limiter = RateLimiter::new(RateLimiterConfig {
            quotas: MessageType::ALL.into_iter().map(|mt| (mt, quota)).collect(),
        });
        let engine = RequestEngine::new(
            transport.clone(),
            Arc::clone(&registry),
            fork,
            limiter,
            EngineConfig::default(),
        );

        Self {
            registry,
            transport,
            sync: SyncOrchestrator::new(engine, config).with_selector(Arc::new(Prefer(MockPeer(1)))),
        }
    }

    fn block(&self, slot: u64) -> Value {
        signed_block(&self.registry, ForkName::Deneb, slot, 0)
    }

    fn root(&self, block: &Value) -> Root {
        block_root(&self.registry, ForkName::Deneb, block)
    }

    fn store(&self, blocks: &[Value]) -> Arc<MockStore> {
        Arc::new(
            blocks
                .iter()
                .fold(MockStore::new(Arc::clone(&self.registry)), |store, b| {
                    store.with_block(ForkName::Deneb, b.clone())
                }),
        )
    }

    fn peer(&self, id: u32, behaviour: Behaviour) -> MockPeer {
        let peer = MockPeer(id);
        self.transport.set_behaviour(peer, behaviour);
        self.sync.add_peer(peer, STATUS);
        peer
    }
}

fn keys(outcome: &FetchOutcome) -> Vec<ContentKey> {
    outcome.items.iter().map(|i| i.key).collect()
}

fn slots(outcome: &FetchOutcome) -> Vec<u64> {
    outcome.items.iter().filter_map(|i| i.key.slot()).collect()
}

#[tokio::test]
async fn blob_ids_are_split_into_bounded_batches() {
    let mut chain = test_config();
    chain.max_request_blob_sidecars = 2;
    let h = Harness::with(chain, SyncConfig::default());

    let sidecars = (0..3)
        .map(|index| blob_sidecar(&h.registry, 1, index, 9))
        .collect::<Vec<_>>();
    let ids = sidecars
        .iter()
        .map(|s| blob_id(&h.registry, s))
        .collect::<Vec<_>>();
    let store = sidecars
        .iter()
        .fold(MockStore::new(Arc::clone(&h.registry)), |store, s| {
            store.with_blob_sidecar(s.clone())
        });
    let peer = h.peer(1, Behaviour::Serve(Arc::new(store)));

    // Duplicates in the input are only fetched once.
    let mut wanted = ids.clone();
    wanted.push(ids[0]);
    let outcome = h.sync.fetch_blob_sidecars_by_root(&wanted).await.unwrap();

    assert!(outcome.is_complete());
    assert_eq!(
        keys(&outcome),
        ids.iter().copied().map(ContentKey::Blob).collect::<Vec<_>>()
    );
    assert_eq!(h.transport.dials(peer), 2);
}

#[tokio::test(start_paused = true)]
async fn timed_out_batch_moves_to_another_peer() {
    let h = Harness::new(SyncConfig {
        request_timeout: Duration::from_secs(5),
        hedge_timeout: None,
        ..SyncConfig::default()
    });
    let block = h.block(4);
    let slow = h.peer(1, Behaviour::Script(vec![ScriptStep::Hang]));
    let good = h.peer(2, Behaviour::Serve(h.store(&[block.clone()])));

    let start = Instant::now();
    let outcome = h.sync.fetch_blocks_by_root(&[h.root(&block)]).await.unwrap();

    assert!(outcome.is_complete());
    assert_eq!(outcome.items[0].value, block);
    assert!(start.elapsed() >= Duration::from_secs(5));
    assert_eq!((h.transport.dials(slow), h.transport.dials(good)), (1, 1));
    // Timing out is not the peer's fault.
    assert!(!h.sync.peers().is_penalized(&slow));
}

#[tokio::test(start_paused = true)]
async fn slow_batch_is_hedged_and_the_first_response_wins() {
    let h = Harness::new(SyncConfig {
        hedge_timeout: Some(Duration::from_secs(1)),
        request_timeout: Duration::from_secs(30),
        ..SyncConfig::default()
    });
    let blocks = [h.block(1), h.block(2)];
    let store = h.store(&blocks);
    let slow = h.peer(
        1,
        Behaviour::Delayed(
            Duration::from_secs(10),
            Box::new(Behaviour::Serve(Arc::clone(&store))),
        ),
    );
    let fast = h.peer(2, Behaviour::Serve(store));

    let start = Instant::now();
    let roots = blocks.iter().map(|b| h.root(b)).collect::<Vec<_>>();
    let outcome = h.sync.fetch_blocks_by_root(&roots).await.unwrap();

    assert!(start.elapsed() < Duration::from_secs(10));
    assert_eq!(
        keys(&outcome),
        roots.into_iter().map(ContentKey::Root).collect::<Vec<_>>()
    );
    assert_eq!((h.transport.dials(slow), h.transport.dials(fast)), (1, 1));
}

#[tokio::test]
async fn range_items_come_back_in_slot_order() {
    let mut chain = test_config();
    chain.max_request_blocks = 2;
    let h = Harness::with(chain, SyncConfig::default());

    let store = h.store(&[h.block(7), h.block(3), h.block(6), h.block(5)]);
    h.peer(1, Behaviour::Serve(Arc::clone(&store)));
    h.peer(2, Behaviour::Serve(store));

    let outcome = h
        .sync
        .fetch_by_range(MessageType::BlocksByRange, RangeRequest::new(3, 6))
        .await
        .unwrap();

    assert!(outcome.is_complete());
    assert_eq!(slots(&outcome), vec![3, 5, 6, 7]);
}

#[tokio::test]
async fn blob_ranges_are_ordered_by_slot_and_index() {
    let mut chain = test_config();
    chain.max_blobs_per_block = 2;
    chain.max_request_blob_sidecars = 4;
    let h = Harness::with(chain, SyncConfig::default());

    let store = [(3, 1), (1, 0), (3, 0), (2, 0), (1, 1)]
        .into_iter()
        .fold(MockStore::new(Arc::clone(&h.registry)), |store, (slot, index)| {
            store.with_blob_sidecar(blob_sidecar(&h.registry, slot, index, 1))
        });
    let peer = h.peer(1, Behaviour::Serve(Arc::new(store)));

    let outcome = h
        .sync
        .fetch_by_range(MessageType::BlobSidecarsByRange, RangeRequest::new(1, 3))
        .await
        .unwrap();

    assert_eq!(
        keys(&outcome),
        [(1, 0), (1, 1), (2, 0), (3, 0), (3, 1)]
            .into_iter()
            .map(|(slot, index)| ContentKey::SlotIndex { slot, index })
            .collect::<Vec<_>>()
    );
    // Two slots per request.
    assert_eq!(h.transport.dials(peer), 2);
}

#[tokio::test]
async fn failing_batches_are_reported_after_max_attempts() {
    let h = Harness::new(SyncConfig {
        max_attempts: 2,
        ..SyncConfig::default()
    });
    let peer = h.peer(1, Behaviour::Unreachable);
    let root = [5; 32];

    let outcome = h.sync.fetch_blocks_by_root(&[root]).await.unwrap();

    assert!(outcome.items.is_empty());
    assert_eq!(outcome.unresolved.len(), 1);
    assert_eq!(outcome.unresolved[0].key, ContentKey::Root(root));
    assert!(matches!(
        outcome.unresolved[0].reason,
        UnresolvedReason::Failed {
            attempts: 2,
            class: FailureClass::Retry,
            ..
        }
    ));
    assert_eq!(h.transport.dials(peer), 2);
}

#[tokio::test(start_paused = true)]
async fn partial_answers_keep_what_arrived() {
    let h = Harness::new(SyncConfig {
        max_attempts: 2,
        ..SyncConfig::default()
    });
    let (a, b) = (h.block(1), h.block(2));
    h.peer(1, Behaviour::Serve(h.store(&[a.clone()])));

    let outcome = h
        .sync
        .fetch_blocks_by_root(&[h.root(&a), h.root(&b)])
        .await
        .unwrap();

    assert_eq!(keys(&outcome), vec![ContentKey::Root(h.root(&a))]);
    assert_eq!(outcome.unresolved.len(), 1);
    assert_eq!(outcome.unresolved[0].key, ContentKey::Root(h.root(&b)));
    // The retry only names the missing root, which the peer does not have.
    assert!(matches!(
        outcome.unresolved[0].reason,
        UnresolvedReason::Failed {
            attempts: 2,
            class: FailureClass::Backoff,
            ..
        }
    ));
}

#[tokio::test]
async fn without_peers_every_slot_is_unresolved() {
    let h = Harness::new(SyncConfig::default());

    let outcome = h
        .sync
        .fetch_by_range(
            MessageType::BlocksByRange,
            RangeRequest {
                start_slot: 10,
                count: 3,
                step: 2,
            },
        )
        .await
        .unwrap();

    assert_eq!(
        outcome.unresolved,
        [10, 12, 14]
            .into_iter()
            .map(|slot| Unresolved {
                key: ContentKey::Slot(slot),
                reason: UnresolvedReason::NoPeers,
            })
            .collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn invalid_responses_penalize_the_peer() {
    let h = Harness::new(SyncConfig::default());
    let (wanted, other) = (h.block(1), h.block(2));

    let bad = h.peer(
        1,
        Behaviour::Script(vec![ScriptStep::Chunk(ResponseChunk::Success {
            fork: ForkName::Deneb,
            value: other,
        })]),
    );
    h.peer(2, Behaviour::Serve(h.store(&[wanted.clone()])));

    let outcome = h
        .sync
        .fetch_blocks_by_root(&[h.root(&wanted)])
        .await
        .unwrap();
    assert!(outcome.is_complete());
    assert!(h.sync.peers().is_penalized(&bad));

    // Penalized peers are never picked again.
    h.sync.fetch_blocks_by_root(&[h.root(&wanted)]).await.unwrap();
    assert_eq!(h.transport.dials(bad), 1);
}

#[tokio::test]
async fn rejected_requests_move_to_another_peer() {
    let h = Harness::new(SyncConfig::default());
    let block = h.block(1);
    let picky = h.peer(
        1,
        Behaviour::Script(vec![ScriptStep::Chunk(ResponseChunk::Error {
            code: ResponseCode::InvalidRequest,
            message: "bad request".to_string(),
        })]),
    );
    let good = h.peer(2, Behaviour::Serve(h.store(&[block.clone()])));

    let outcome = h.sync.fetch_blocks_by_root(&[h.root(&block)]).await.unwrap();

    assert!(outcome.is_complete());
    assert_eq!(outcome.items[0].value, block);
    assert!(h.sync.peers().is_penalized(&picky));
    assert_eq!((h.transport.dials(picky), h.transport.dials(good)), (1, 1));
}

#[tokio::test]
async fn chunks_under_a_fork_without_the_type_penalize_the_peer() {
    let h = Harness::new(SyncConfig::default());
    let sidecar = blob_sidecar(&h.registry, 1, 0, 9);
    let id = blob_id(&h.registry, &sidecar);
    let store = MockStore::new(Arc::clone(&h.registry)).with_blob_sidecar(sidecar.clone());

    // Blob sidecars do not exist at Capella.
    let capella = h
        .registry
        .fork_schedule()
        .fork(ForkName::Capella)
        .unwrap()
        .digest;
    let mut raw = vec![u8::from(ResponseCode::Success)];
    raw.extend_from_slice(&capella.0);
    raw.push(0);
    let bad = h.peer(1, Behaviour::Script(vec![ScriptStep::Raw(raw)]));
    h.peer(2, Behaviour::Serve(Arc::new(store)));

    let outcome = h.sync.fetch_blob_sidecars_by_root(&[id]).await.unwrap();

    assert!(outcome.is_complete());
    assert_eq!(outcome.items[0].value, sidecar);
    assert!(h.sync.peers().is_penalized(&bad));
}

#[tokio::test]
async fn local_fork_errors_end_the_fetch() {
    let mut chain = test_config();
    chain.forks = chain
        .forks
        .iter()
        .map(|f| ForkConfig {
            epoch: if f.name == ForkName::Deneb { 100 } else { 0 },
            ..f.clone()
        })
        .collect();
    let h = Harness::with(chain, SyncConfig::default());
    h.peer(1, Behaviour::Serve(h.store(&[])));

    let res = h
        .sync
        .fetch_by_range(MessageType::BlobSidecarsByRange, RangeRequest::new(0, 1))
        .await;

    assert!(
        matches!(
            res,
            Err(SyncError::Request(RequestError::UnsupportedFork {
                fork: ForkName::Capella,
                ..
            }))
        ),
        "{res:?}"
    );
}

#[tokio::test]
async fn range_give_ups_skip_delivered_slots() {
    let h = Harness::new(SyncConfig {
        max_attempts: 1,
        ..SyncConfig::default()
    });
    h.peer(
        1,
        Behaviour::Script(vec![
            ScriptStep::Chunk(ResponseChunk::Success {
                fork: ForkName::Deneb,
                value: h.block(5),
            }),
            ScriptStep::Chunk(ResponseChunk::Error {
                code: ResponseCode::ServerError,
                message: "disk on fire".to_string(),
            }),
        ]),
    );

    let outcome = h
        .sync
        .fetch_by_range(MessageType::BlocksByRange, RangeRequest::new(5, 3))
        .await
        .unwrap();

    assert_eq!(slots(&outcome), vec![5]);
    assert_eq!(
        outcome
            .unresolved
            .iter()
            .map(|u| u.key)
            .collect::<Vec<_>>(),
        vec![ContentKey::Slot(6), ContentKey::Slot(7)]
    );
    assert!(matches!(
        outcome.unresolved[0].reason,
        UnresolvedReason::Failed {
            attempts: 1,
            class: FailureClass::Retry,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn concurrent_fetches_share_the_request_limit() {
    let h = Harness::new(SyncConfig {
        max_concurrent_requests: 1,
        hedge_timeout: None,
        ..SyncConfig::default()
    });
    let (a, b) = (h.block(1), h.block(2));
    let peer = h.peer(
        1,
        Behaviour::Delayed(
            Duration::from_secs(2),
            Box::new(Behaviour::Serve(h.store(&[a.clone(), b.clone()]))),
        ),
    );

    let other = h.sync.clone();
    let root_a = [h.root(&a)];
    let root_b = [h.root(&b)];
    let start = Instant::now();
    let (first, second) = tokio::join!(
        h.sync.fetch_blocks_by_root(&root_a),
        other.fetch_blocks_by_root(&root_b),
    );

    assert!(first.unwrap().is_complete());
    assert!(second.unwrap().is_complete());
    // One request at a time, each taking two seconds.
    assert!(start.elapsed() >= Duration::from_secs(4));
    assert_eq!(h.transport.dials(peer), 2);
}

#[tokio::test(start_paused = true)]
async fn exhausted_quota_is_waited_out() {
    let h = Harness::with_quota(
        test_config(),
        SyncConfig {
            backoff: Duration::from_millis(100),
            ..SyncConfig::default()
        },
        Quota::new(1, 1),
    );
    let (a, b) = (h.block(1), h.block(2));
    let peer = h.peer(1, Behaviour::Serve(h.store(&[a.clone(), b.clone()])));

    h.sync.fetch_blocks_by_root(&[h.root(&a)]).await.unwrap();

    // The bucket is empty and refills a token per second.
    let start = Instant::now();
    let outcome = h.sync.fetch_blocks_by_root(&[h.root(&b)]).await.unwrap();

    assert!(outcome.is_complete());
    assert!(start.elapsed() >= Duration::from_secs(1));
    assert_eq!(h.transport.dials(peer), 2);
}

#[tokio::test(start_paused = true)]
async fn busy_peers_are_retried_after_a_backoff() {
    let h = Harness::new(SyncConfig {
        backoff: Duration::from_secs(2),
        max_attempts: 2,
        hedge_timeout: None,
        ..SyncConfig::default()
    });
    let busy = h.peer(
        1,
        Behaviour::Script(vec![ScriptStep::Chunk(ResponseChunk::Error {
            code: ResponseCode::ResourceUnavailable,
            message: "busy".to_string(),
        })]),
    );

    let start = Instant::now();
    let outcome = h.sync.fetch_blocks_by_root(&[[1; 32]]).await.unwrap();

    assert!(matches!(
        outcome.unresolved[0].reason,
        UnresolvedReason::Failed {
            attempts: 2,
            class: FailureClass::Backoff,
            ..
        }
    ));
    assert!(start.elapsed() >= Duration::from_secs(2));
    assert_eq!(h.transport.dials(busy), 2);
    // Being busy is not the peer's fault.
    assert!(!h.sync.peers().is_penalized(&busy));
}

#[tokio::test]
async fn invalid_fetches_are_rejected() {
    let h = Harness::new(SyncConfig::default());

    assert!(matches!(
        h.sync
            .fetch_by_range(MessageType::BlocksByRoot, RangeRequest::new(0, 1))
            .await,
        Err(SyncError::NotARange(MessageType::BlocksByRoot))
    ));
    assert!(matches!(
        h.sync
            .fetch_by_range(
                MessageType::BlobSidecarsByRange,
                RangeRequest {
                    start_slot: 0,
                    count: 4,
                    step: 2
                }
            )
            .await,
        Err(SyncError::InvalidRequest(_))
    ));

    let outcome = h.sync.fetch_blocks_by_root(&[]).await.unwrap();
    assert!(outcome.items.is_empty() && outcome.is_complete());
}

#[tokio::test(start_paused = true)]
async fn shutdown_ends_running_fetches() {
    let h = Harness::new(SyncConfig::default());
    h.peer(1, Behaviour::Script(vec![ScriptStep::Hang]));

    let sync = h.sync.clone();
    let fetch = tokio::spawn(async move { sync.fetch_blocks_by_root(&[[1; 32]]).await });

    tokio::time::sleep(Duration::from_secs(1)).await;
    h.sync.shutdown();

    assert!(matches!(fetch.await.unwrap(), Err(SyncError::Shutdown)));
    assert!(matches!(
        h.sync.fetch_blocks_by_root(&[[1; 32]]).await,
        Err(SyncError::Shutdown)
    ));
}

#[tokio::test]
async fn removing_a_peer_drops_its_quota() {
    let h = Harness::new(SyncConfig::default());
    let block = h.block(1);
    let peer = h.peer(1, Behaviour::Serve(h.store(&[block.clone()])));
    let limiter = h.sync.engine().rate_limiter();

    h.sync.fetch_blocks_by_root(&[h.root(&block)]).await.unwrap();
    assert_eq!(limiter.available(&peer, MessageType::BlocksByRoot), CAPACITY - 1);

    assert!(h.sync.remove_peer(&peer));
    assert!(!h.sync.remove_peer(&peer));
    assert_eq!(limiter.available(&peer, MessageType::BlocksByRoot), CAPACITY);

    // Nobody left to ask.
    let outcome = h.sync.fetch_blocks_by_root(&[h.root(&block)]).await.unwrap();
    assert_eq!(outcome.unresolved[0].reason, UnresolvedReason::NoPeers);
}

#[tokio::test]
async fn status_updates_steer_range_requests() {
    let h = Harness::with(test_config(), SyncConfig::default());
    let sync = &h.sync;
    let store = h.store(&[h.block(50)]);

    // Peer 1 is preferred but does not hold the span once its status says so.
    let behind = h.peer(1, Behaviour::Serve(Arc::clone(&store)));
    let ahead = h.peer(2, Behaviour::Serve(store));
    assert!(sync.update_peer_status(
        &behind,
        PeerStatus {
            head_slot: 10,
            earliest_available_slot: 0,
        }
    ));

    let sync = sync
        .clone()
        .with_selector(Arc::new(beacon_sync::LeastRecentlyUsed));
    let outcome = sync
        .fetch_by_range(MessageType::BlocksByRange, RangeRequest::new(50, 1))
        .await
        .unwrap();

    assert_eq!(slots(&outcome), vec![50]);
    assert_eq!((h.transport.dials(behind), h.transport.dials(ahead)), (0, 1));
}

#[tokio::test(start_paused = true)]
async fn late_responses_are_discarded() {
    let mut chain = test_config();
    chain.max_request_blocks = 1;
    let mut h = Harness::with(
        chain,
        SyncConfig {
            hedge_timeout: Some(Duration::from_secs(1)),
            ..SyncConfig::default()
        },
    );
    h.sync = h
        .sync
        .clone()
        .with_selector(Arc::new(beacon_sync::LeastRecentlyUsed));

    let both = h.store(&[h.block(1), h.block(2)]);
    let delayed = |secs, store: &Arc<MockStore>| {
        Behaviour::Delayed(
            Duration::from_secs(secs),
            Box::new(Behaviour::Serve(Arc::clone(store))),
        )
    };
    let status = |earliest_available_slot, head_slot| PeerStatus {
        head_slot,
        earliest_available_slot,
    };

    // Slot 1 goes to peer 1 and slot 2 to peer 3, the only peers holding them. After a second
    // both batches are hedged: slot 1 to peer 2 which answers at once, slot 2 to peer 1.
    let (p1, p2, p3) = (MockPeer(1), MockPeer(2), MockPeer(3));
    h.transport.set_behaviour(p1, delayed(3, &both));
    h.transport
        .set_behaviour(p2, Behaviour::Serve(h.store(&[h.block(1)])));
    h.transport.set_behaviour(p3, delayed(5, &both));
    h.sync.add_peer(p1, status(0, 1));
    h.sync.add_peer(p2, status(500, 1_000));
    h.sync.add_peer(p3, status(2, 1_000));

    let start = Instant::now();
    let outcome = h
        .sync
        .fetch_by_range(MessageType::BlocksByRange, RangeRequest::new(1, 2))
        .await
        .unwrap();

    // Peer 1 answers slot 1 again at 3s while slot 2 is still in flight, that copy is dropped.
    assert_eq!(slots(&outcome), vec![1, 2]);
    assert!(start.elapsed() >= Duration::from_secs(4));
    assert_eq!(
        [p1, p2, p3].map(|p| h.transport.dials(p)),
        [2, 1, 1]
    );
}
