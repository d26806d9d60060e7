use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use pretty_assertions::assert_eq;
use tokio::time::Instant;

use beacon_rate_limiter::{Quota, RateLimiter, RateLimiterConfig};
use beacon_req_resp::{
    CollectedResponse, EngineConfig, FailureClass, RequestEngine, RequestError, RequestState,
};
use beacon_ssz::Value;
use beacon_test_utils::{
    fixtures::{block_root, fork_context, registry, signed_block, test_config},
    Behaviour, MockPeer, MockStore, MockTransport, ScriptStep,
};
use beacon_wire::{
    codec::{write_varint, ResponseChunk},
    ChainConfig, ContentKey, ForkConfig, ForkName, MessageType, RangeRequest, RequestBody,
    ResponseCode, SchemaRegistry,
};

const PEER: MockPeer = MockPeer(1);
const CAPACITY: u64 = 100;

struct Harness {
    registry: Arc<SchemaRegistry>,
    transport: MockTransport,
    engine: RequestEngine<MockPeer, MockTransport>,
}

impl Harness {
    fn new() -> Self {
        Self::with(test_config(), EngineConfig::default())
    }

    fn with(config: ChainConfig, engine_config: EngineConfig) -> Self {
        let registry = registry(&config);
        let fork = fork_context(&registry);
        let transport = MockTransport::new(Arc::clone(&registry), fork.clone());

        // Quotas never refill so tests can observe refunds.
        let limiter = RateLimiter::new(RateLimiterConfig {
            quotas: MessageType::ALL
                .into_iter()
                .map(|mt| (mt, Quota::new(CAPACITY, 0)))
                .collect(),
        });

        let engine = RequestEngine::new(
            transport.clone(),
            Arc::clone(&registry),
            fork,
            limiter,
            engine_config,
        );

        Self {
            registry,
            transport,
            engine,
        }
    }

    fn block(&self, slot: u64) -> Value {
        signed_block(&self.registry, ForkName::Deneb, slot, 0)
    }

    fn root(&self, block: &Value) -> [u8; 32] {
        block_root(&self.registry, ForkName::Deneb, block)
    }

    fn serve(&self, blocks: &[Value]) {
        let store = blocks
            .iter()
            .fold(MockStore::new(Arc::clone(&self.registry)), |store, b| {
                store.with_block(ForkName::Deneb, b.clone())
            });
        self.transport
            .set_behaviour(PEER, Behaviour::Serve(Arc::new(store)));
    }

    fn script(&self, steps: Vec<ScriptStep>) {
        self.transport.set_behaviour(PEER, Behaviour::Script(steps));
    }

    async fn request(&self, body: RequestBody) -> CollectedResponse {
        self.engine.request(PEER, body, None).collect_all().await
    }
}

fn success(value: Value) -> ScriptStep {
    ScriptStep::Chunk(ResponseChunk::Success {
        fork: ForkName::Deneb,
        value,
    })
}

fn error(code: ResponseCode, message: &str) -> ScriptStep {
    ScriptStep::Chunk(ResponseChunk::Error {
        code,
        message: message.to_string(),
    })
}

fn slots(res: &CollectedResponse) -> Vec<u64> {
    res.items.iter().filter_map(|i| i.key.slot()).collect()
}

#[tokio::test]
async fn blocks_by_root_from_store() {
    let h = Harness::new();
    let blocks = (0..3).map(|s| h.block(s)).collect::<Vec<_>>();
    h.serve(&blocks);

    let roots = blocks.iter().map(|b| h.root(b)).collect::<Vec<_>>();
    let res = h.request(RequestBody::BlocksByRoot(roots.clone())).await;

    assert!(res.error.is_none());
    assert_eq!(
        res.items.iter().map(|i| i.key).collect::<Vec<_>>(),
        roots.into_iter().map(ContentKey::Root).collect::<Vec<_>>()
    );
    assert_eq!(res.items[0].value, blocks[0]);
}

#[tokio::test]
async fn range_is_returned_in_slot_order() {
    let h = Harness::new();
    h.serve(&[h.block(7), h.block(5), h.block(6)]);

    let res = h
        .request(RequestBody::BlocksByRange(RangeRequest::new(5, 3)))
        .await;

    assert!(res.error.is_none());
    assert_eq!(slots(&res), vec![5, 6, 7]);
}

#[tokio::test]
async fn all_or_nothing_discards_on_error_chunk() {
    let h = Harness::new();
    let blocks = (0..3).map(|s| h.block(s)).collect::<Vec<_>>();
    h.script(vec![
        success(blocks[0].clone()),
        success(blocks[1].clone()),
        error(ResponseCode::ServerError, "disk on fire"),
    ]);

    let stream = h.engine.request(
        PEER,
        RequestBody::BlocksByRoot(blocks.iter().map(|b| h.root(b)).collect()),
        None,
    );
    let res = stream.collect_all().await;

    assert!(res.items.is_empty());
    let Some(RequestError::ServerError(message)) = res.error else {
        panic!("expected a server error, got {:?}", res.error);
    };
    assert_eq!(message, "disk on fire");
}

#[tokio::test]
async fn best_effort_keeps_items_on_error_chunk() {
    let h = Harness::new();
    h.script(vec![
        success(h.block(5)),
        success(h.block(6)),
        error(ResponseCode::ResourceUnavailable, "pruned"),
    ]);

    let res = h
        .request(RequestBody::BlocksByRange(RangeRequest::new(5, 3)))
        .await;

    assert_eq!(slots(&res), vec![5, 6]);
    let err = res.error.unwrap();
    assert!(matches!(err, RequestError::ResourceUnavailable(_)));
    assert_eq!(err.class(), FailureClass::Backoff);
}

#[tokio::test]
async fn by_root_cross_checks_content() {
    let h = Harness::new();
    let a = h.block(1);
    let b = h.block(2);

    // Reordered is fine.
    h.script(vec![success(b.clone()), success(a.clone())]);
    let res = h
        .request(RequestBody::BlocksByRoot(vec![h.root(&a), h.root(&b)]))
        .await;
    assert!(res.error.is_none());
    assert_eq!(res.items.len(), 2);

    // Unrequested is not.
    h.script(vec![success(h.block(3))]);
    let res = h.request(RequestBody::BlocksByRoot(vec![h.root(&a)])).await;
    assert!(res.items.is_empty());
    let err = res.error.unwrap();
    assert!(matches!(err, RequestError::InvalidResponse(_)));
    assert_eq!(err.class(), FailureClass::RetryAndPenalize);

    // Neither is a duplicate.
    h.script(vec![success(a.clone()), success(a.clone())]);
    let res = h
        .request(RequestBody::BlocksByRoot(vec![h.root(&a), h.root(&b)]))
        .await;
    assert!(res.items.is_empty());
    assert!(matches!(
        res.error,
        Some(RequestError::InvalidResponse(_))
    ));
}

#[tokio::test]
async fn range_items_must_be_in_span_and_order() {
    let h = Harness::new();

    h.script(vec![success(h.block(6)), success(h.block(5))]);
    let res = h
        .request(RequestBody::BlocksByRange(RangeRequest::new(5, 3)))
        .await;
    assert_eq!(slots(&res), vec![6]);
    assert!(matches!(res.error, Some(RequestError::InvalidResponse(_))));

    h.script(vec![success(h.block(9))]);
    let res = h
        .request(RequestBody::BlocksByRange(RangeRequest::new(5, 3)))
        .await;
    assert!(matches!(res.error, Some(RequestError::InvalidResponse(_))));
}

#[tokio::test]
async fn empty_response_depends_on_message_type() {
    let h = Harness::new();

    h.script(vec![]);
    let res = h
        .request(RequestBody::BlocksByRange(RangeRequest::new(5, 3)))
        .await;
    assert!(res.error.is_none());
    assert!(res.items.is_empty());

    h.script(vec![]);
    let res = h.request(RequestBody::BlocksByRoot(vec![[1; 32]])).await;
    assert!(matches!(res.error, Some(RequestError::InvalidResponse(_))));
}

#[tokio::test]
async fn empty_response_policy_can_be_overridden() {
    let mut config = test_config();
    config.policy_overrides.insert(
        MessageType::BlocksByRoot,
        beacon_wire::PolicyOverride {
            partial_response: None,
            allow_empty_response: Some(true),
        },
    );
    let h = Harness::with(config, EngineConfig::default());

    h.script(vec![]);
    let res = h.request(RequestBody::BlocksByRoot(vec![[1; 32]])).await;
    assert!(res.error.is_none());
}

#[tokio::test(start_paused = true)]
async fn idle_timeout() {
    let h = Harness::new();
    h.script(vec![ScriptStep::Hang]);

    let start = Instant::now();
    let mut stream = h.engine.request(
        PEER,
        RequestBody::BlocksByRange(RangeRequest::new(0, 1)),
        None,
    );
    let err = stream.next().await.unwrap().unwrap_err();

    assert!(matches!(err, RequestError::TimedOut));
    assert_eq!(err.class(), FailureClass::Retry);
    let idle = EngineConfig::default().idle_timeout;
    assert!(start.elapsed() >= idle && start.elapsed() < idle + Duration::from_secs(1));
    assert_eq!(stream.state(), RequestState::TimedOut);
}

#[tokio::test(start_paused = true)]
async fn overall_deadline() {
    let h = Harness::new();
    // Every chunk arrives within the idle timeout, the whole response does not.
    h.script(vec![
        success(h.block(0)),
        ScriptStep::Sleep(Duration::from_secs(4)),
        success(h.block(1)),
        ScriptStep::Sleep(Duration::from_secs(4)),
        success(h.block(2)),
    ]);

    let deadline = Instant::now() + Duration::from_secs(6);
    let res = h
        .engine
        .request(
            PEER,
            RequestBody::BlocksByRange(RangeRequest::new(0, 3)),
            Some(deadline),
        )
        .collect_all()
        .await;

    assert_eq!(slots(&res), vec![0, 1]);
    assert!(matches!(res.error, Some(RequestError::TimedOut)));
    assert!(Instant::now() >= deadline && Instant::now() < deadline + Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn cancel_is_prompt_and_idempotent() {
    let h = Harness::new();
    h.script(vec![ScriptStep::Hang]);

    let mut stream = h.engine.request(
        PEER,
        RequestBody::BlocksByRange(RangeRequest::new(0, 1)),
        None,
    );

    let mut next = tokio_test::task::spawn(stream.next());
    tokio_test::assert_pending!(next.poll());
    drop(next);

    let start = Instant::now();
    stream.cancel();
    stream.cancel();
    let err = stream.next().await.unwrap().unwrap_err();

    assert!(matches!(err, RequestError::Cancelled));
    assert_eq!(err.class(), FailureClass::Cancelled);
    assert!(start.elapsed() < EngineConfig::default().idle_timeout);
    assert_eq!(stream.state(), RequestState::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn cancelled_request_exits_while_its_buffer_is_full() {
    let h = Harness::with(
        test_config(),
        EngineConfig {
            response_buffer: 1,
            ..EngineConfig::default()
        },
    );
    h.script(vec![
        success(h.block(0)),
        success(h.block(1)),
        success(h.block(2)),
        ScriptStep::Hang,
    ]);

    let stream = h.engine.request(
        PEER,
        RequestBody::BlocksByRange(RangeRequest::new(0, 3)),
        None,
    );

    // Nobody reads, the task is stuck handing out the second block.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!stream.is_finished());

    stream.cancel();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(stream.is_finished());
    assert_eq!(stream.state(), RequestState::Cancelled);

    let res = stream.collect_all().await;
    assert_eq!(slots(&res), vec![0]);
    assert!(matches!(res.error, Some(RequestError::Cancelled)));
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_in_flight_requests() {
    let h = Harness::new();
    h.script(vec![ScriptStep::Hang]);

    let streams = (0..3)
        .map(|i| {
            h.engine.request(
                PEER,
                RequestBody::BlocksByRange(RangeRequest::new(i, 1)),
                None,
            )
        })
        .collect::<Vec<_>>();

    tokio::task::yield_now().await;
    h.engine.shutdown();

    for stream in streams {
        let res = stream.collect_all().await;
        assert!(matches!(res.error, Some(RequestError::Cancelled)));
    }
}

#[tokio::test]
async fn unreachable_peer_refunds_quota() {
    let h = Harness::new();

    let res = h.request(RequestBody::BlocksByRoot(vec![[1; 32], [2; 32]])).await;

    let err = res.error.unwrap();
    assert!(matches!(err, RequestError::PeerUnreachable(_)));
    assert_eq!(err.class(), FailureClass::Retry);
    assert_eq!(
        h.engine
            .rate_limiter()
            .available(&PEER, MessageType::BlocksByRoot),
        CAPACITY
    );
}

#[tokio::test]
async fn dispatched_requests_spend_quota() {
    let h = Harness::new();
    h.serve(&[]);

    let res = h.request(RequestBody::BlocksByRoot(vec![[1; 32], [2; 32]])).await;

    // The peer had nothing, the tokens are still spent.
    assert!(matches!(
        res.error,
        Some(RequestError::ResourceUnavailable(_))
    ));
    assert_eq!(
        h.engine
            .rate_limiter()
            .available(&PEER, MessageType::BlocksByRoot),
        CAPACITY - 2
    );
}

#[tokio::test]
async fn over_quota_fails_fast() {
    let h = Harness::new();
    h.serve(&[]);

    let res = h
        .request(RequestBody::BlocksByRange(RangeRequest::new(0, CAPACITY + 1)))
        .await;

    let err = res.error.unwrap();
    assert!(matches!(err, RequestError::RateLimited(_)));
    assert_eq!(err.class(), FailureClass::Backoff);
    assert_eq!(h.transport.dials(PEER), 0);
}

#[tokio::test]
async fn invalid_requests_are_fatal() {
    let mut config = test_config();
    config.max_request_blocks = 2;
    let h = Harness::with(config, EngineConfig::default());
    h.serve(&[]);

    for body in [
        RequestBody::BlocksByRoot(vec![]),
        RequestBody::BlocksByRoot(vec![[1; 32], [2; 32], [3; 32]]),
        RequestBody::BlocksByRange(RangeRequest {
            start_slot: 0,
            count: 1,
            step: 0,
        }),
    ] {
        let err = h.request(body).await.error.unwrap();
        assert!(matches!(err, RequestError::InvalidRequest(_)), "{err:?}");
        assert_eq!(err.class(), FailureClass::Fatal);
    }
    assert_eq!(h.transport.dials(PEER), 0);
}

#[tokio::test]
async fn unsupported_fork() {
    let mut config = test_config();
    config.forks = config
        .forks
        .iter()
        .map(|f| ForkConfig {
            epoch: if f.name == ForkName::Deneb { 100 } else { 0 },
            ..f.clone()
        })
        .collect();
    let h = Harness::with(config, EngineConfig::default());

    let err = h
        .request(RequestBody::BlobSidecarsByRange(RangeRequest::new(0, 1)))
        .await
        .error
        .unwrap();

    assert!(matches!(
        err,
        RequestError::UnsupportedFork {
            message_type: MessageType::BlobSidecarsByRange,
            fork: ForkName::Capella,
        }
    ));
    assert_eq!(err.class(), FailureClass::Fatal);
}

#[tokio::test]
async fn oversized_chunk_is_rejected() {
    let h = Harness::new();
    let digest = h
        .registry
        .fork_schedule()
        .fork(ForkName::Deneb)
        .unwrap()
        .digest;

    let limit = test_config().max_chunk_size;
    let mut raw = vec![u8::from(ResponseCode::Success)];
    raw.extend_from_slice(&digest.0);
    write_varint(limit + 1, &mut raw);
    h.script(vec![ScriptStep::Raw(raw), ScriptStep::Hang]);

    let err = h
        .request(RequestBody::BlocksByRange(RangeRequest::new(0, 1)))
        .await
        .error
        .unwrap();

    assert!(
        matches!(err, RequestError::SizeLimitExceeded { limit: l } if u64::try_from(l) == Ok(limit)),
        "{err:?}"
    );
    assert_eq!(err.class(), FailureClass::RetryAndPenalize);
}

#[tokio::test]
async fn truncated_chunk_is_a_decoding_error() {
    let h = Harness::new();
    h.script(vec![ScriptStep::Raw(vec![u8::from(ResponseCode::Success), 0xAB])]);

    let err = h
        .request(RequestBody::BlocksByRange(RangeRequest::new(0, 1)))
        .await
        .error
        .unwrap();

    assert!(matches!(err, RequestError::Decoding(_)), "{err:?}");
    assert_eq!(err.class(), FailureClass::RetryAndPenalize);
}
