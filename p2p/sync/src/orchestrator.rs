use std::{
    collections::{HashMap, HashSet, VecDeque},
    future::poll_fn,
    sync::Arc,
    time::Duration,
};

use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    task::JoinSet,
    time::{interval, Instant, Interval, MissedTickBehavior},
};
use tokio_util::{sync::CancellationToken, time::DelayQueue};
use tracing::{debug, instrument, warn};

use beacon_req_resp::{
    CollectedResponse, FailureClass, RequestEngine, RequestError, ResponseStream, Transport,
};
use beacon_wire::{
    BlobIdentifier, ContentKey, MessageType, PeerId, RangeRequest, RequestBody, ResponseItem,
    Root, WireError,
};

use crate::{
    batch::{split_blob_ids, split_range, split_roots, Batch, LastFailure},
    ClaimRegistry, PeerSelector, PeerSet, PeerStatus, SyncConfig,
};

/// An error that ends a whole fetch.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("invalid fetch: {0}")]
    InvalidRequest(#[from] WireError),
    #[error("{0} is not a range request")]
    NotARange(MessageType),
    /// A request failed in a way retrying can't fix.
    #[error("request failed: {0}")]
    Request(RequestError),
    #[error("the sync orchestrator was shut down")]
    Shutdown,
}

/// Why an item was not fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnresolvedReason {
    /// No peer was available to ask.
    NoPeers,
    /// Every attempt failed, the last with this error.
    Failed {
        attempts: u32,
        class: FailureClass,
        error: String,
    },
    /// The peers asked answered without the item.
    NotServed { attempts: u32 },
}

/// An item a fetch gave up on.
///
/// Range fetches report every slot left unfetched as a [`ContentKey::Slot`]. A slot that
/// delivered any item is not reported, even if some of its blob sidecars are missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unresolved {
    pub key: ContentKey,
    pub reason: UnresolvedReason,
}

/// The result of a fetch.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    /// Every fetched item exactly once.
    ///
    /// By-root items come in request order, range items in slot order.
    pub items: Vec<ResponseItem>,
    pub unresolved: Vec<Unresolved>,
}

impl FetchOutcome {
    /// Returns `true` if nothing was left unresolved.
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// Fetches items from a set of peers.
///
/// Each fetch is split into requests no bigger than the configured maximums, which are
/// dispatched concurrently and retried on other peers when they fail. Every item is handed
/// out once, no matter how many peers send it.
///
/// Clones share their peers and the [`SyncConfig::max_concurrent_requests`] limit.
#[derive(Clone)]
pub struct SyncOrchestrator<P: PeerId, T: Transport<P>> {
    engine: RequestEngine<P, T>,
    peers: Arc<PeerSet<P>>,
    selector: Arc<dyn PeerSelector<P>>,
    /// One permit per request in flight.
    permits: Arc<Semaphore>,
    config: SyncConfig,
    shutdown: CancellationToken,
}

impl<P: PeerId, T: Transport<P>> SyncOrchestrator<P, T> {
    pub fn new(engine: RequestEngine<P, T>, config: SyncConfig) -> Self {
        Self {
            engine,
            peers: Arc::new(PeerSet::default()),
            selector: config.peer_selection.selector(),
            permits: Arc::new(Semaphore::new(config.max_concurrent_requests.max(1))),
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Replaces the selector picked by [`SyncConfig::peer_selection`].
    #[must_use]
    pub fn with_selector(mut self, selector: Arc<dyn PeerSelector<P>>) -> Self {
        self.selector = selector;
        self
    }

    pub const fn engine(&self) -> &RequestEngine<P, T> {
        &self.engine
    }

    pub fn peers(&self) -> &PeerSet<P> {
        &self.peers
    }

    pub fn add_peer(&self, peer: P, status: PeerStatus) {
        debug!(?peer, ?status, "Adding peer.");
        self.peers.add(peer, status);
    }

    /// Returns `false` if `peer` is unknown.
    pub fn update_peer_status(&self, peer: &P, status: PeerStatus) -> bool {
        self.peers.update_status(peer, status)
    }

    /// Removes `peer`, dropping its quota buckets too.
    ///
    /// Requests already sent to the peer are left to finish.
    pub fn remove_peer(&self, peer: &P) -> bool {
        debug!(?peer, "Removing peer.");
        self.engine.rate_limiter().evict_peer(peer);
        self.peers.remove(peer)
    }

    /// Fails every running fetch with [`SyncError::Shutdown`] and cancels their requests.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.engine.shutdown();
    }

    /// Fetches blocks by the root of their message.
    pub async fn fetch_blocks_by_root(&self, roots: &[Root]) -> Result<FetchOutcome, SyncError> {
        let mut seen = HashSet::new();
        let roots = roots
            .iter()
            .copied()
            .filter(|root| seen.insert(*root))
            .collect::<Vec<_>>();

        let max = RequestBody::max_item_count(
            MessageType::BlocksByRoot,
            self.engine.registry().config(),
        );
        self.fetch(MessageType::BlocksByRoot, split_roots(&roots, max))
            .await
    }

    /// Fetches blob sidecars by their identifier.
    pub async fn fetch_blob_sidecars_by_root(
        &self,
        ids: &[BlobIdentifier],
    ) -> Result<FetchOutcome, SyncError> {
        let mut seen = HashSet::new();
        let ids = ids
            .iter()
            .copied()
            .filter(|id| seen.insert(*id))
            .collect::<Vec<_>>();

        let max = RequestBody::max_item_count(
            MessageType::BlobSidecarsByRoot,
            self.engine.registry().config(),
        );
        self.fetch(MessageType::BlobSidecarsByRoot, split_blob_ids(&ids, max))
            .await
    }

    /// Fetches every block or blob sidecar in `range`.
    ///
    /// Slots without content are not errors, the items of a range come back in slot order.
    pub async fn fetch_by_range(
        &self,
        message_type: MessageType,
        range: RangeRequest,
    ) -> Result<FetchOutcome, SyncError> {
        if !message_type.is_by_range() {
            return Err(SyncError::NotARange(message_type));
        }

        let max = RequestBody::max_item_count(message_type, self.engine.registry().config());
        self.fetch(message_type, split_range(message_type, range, max))
            .await
    }

    async fn fetch(
        &self,
        message_type: MessageType,
        bodies: Vec<RequestBody>,
    ) -> Result<FetchOutcome, SyncError> {
        if self.shutdown.is_cancelled() {
            return Err(SyncError::Shutdown);
        }

        let chain_config = self.engine.registry().config();
        for body in &bodies {
            body.validate(chain_config)?;
        }

        let mut fetch = Fetch {
            orchestrator: self,
            message_type,
            claims: ClaimRegistry::new(),
            batches: HashMap::new(),
            ready: VecDeque::new(),
            backoff: DelayQueue::new(),
            spare: None,
            tasks: JoinSet::new(),
            delivered_slots: HashSet::new(),
            order: HashMap::new(),
            outcome: FetchOutcome::default(),
        };
        for (id, body) in (0_u64..).zip(bodies) {
            for key in body.requested_keys().unwrap_or_default() {
                fetch.order.insert(key, fetch.order.len());
                fetch.claims.register(key);
            }
            fetch.batches.insert(id, Batch::new(body));
            fetch.ready.push_back(id);
        }

        fetch.run().await
    }
}

/// The result of one request of a batch.
struct AttemptResult<P> {
    batch: u64,
    peer: P,
    items: Vec<ResponseItem>,
    error: Option<RequestError>,
}

/// Runs one request, holding `_permit` until it ends.
#[instrument(level = "debug", name = "attempt", skip_all, fields(batch = batch, peer = ?peer, attempt))]
async fn attempt<P: PeerId>(
    batch: u64,
    peer: P,
    attempt: u32,
    response: ResponseStream,
    _permit: OwnedSemaphorePermit,
) -> AttemptResult<P> {
    let CollectedResponse { items, error } = response.collect_all().await;
    debug!(items = items.len(), failed = error.is_some(), "Attempt finished.");

    AttemptResult {
        batch,
        peer,
        items,
        error,
    }
}

/// Resolves when `interval` ticks, never if there is no interval.
async fn tick(interval: Option<&mut Interval>) -> Instant {
    match interval {
        Some(interval) => interval.tick().await,
        None => std::future::pending().await,
    }
}

/// The state of one running fetch.
struct Fetch<'a, P: PeerId, T: Transport<P>> {
    orchestrator: &'a SyncOrchestrator<P, T>,
    message_type: MessageType,

    claims: ClaimRegistry<ContentKey>,
    batches: HashMap<u64, Batch<P>>,
    /// Batches waiting for a peer.
    ready: VecDeque<u64>,
    /// Batches waiting out a backoff before they are ready again.
    backoff: DelayQueue<u64>,
    /// A permit taken while waiting for the concurrency limit, used by the next dispatch.
    spare: Option<OwnedSemaphorePermit>,
    tasks: JoinSet<AttemptResult<P>>,

    /// Slots that delivered at least one item, for range fetches.
    delivered_slots: HashSet<u64>,

    /// The position of each by-root key in the caller's request.
    order: HashMap<ContentKey, usize>,
    outcome: FetchOutcome,
}

impl<P: PeerId, T: Transport<P>> Fetch<'_, P, T> {
    #[instrument(level = "debug", name = "fetch", skip_all, fields(message_type = %self.message_type, batches = self.batches.len()))]
    async fn run(mut self) -> Result<FetchOutcome, SyncError> {
        let orchestrator = self.orchestrator;

        let mut hedge_interval = orchestrator.config.hedge_timeout.map(|period| {
            let mut hedge_interval = interval(period);
            hedge_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            hedge_interval
        });

        loop {
            self.dispatch_ready();
            if self.tasks.is_empty() && self.ready.is_empty() && self.backoff.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                () = orchestrator.shutdown.cancelled() => {
                    debug!("Shutting down, abandoning fetch.");
                    return Err(SyncError::Shutdown);
                }
                Some(res) = self.tasks.join_next() => {
                    match res {
                        Ok(res) => self.handle_attempt(res)?,
                        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                        Err(e) => debug!(error = %e, "Attempt task cancelled."),
                    }
                }
                Some(expired) = poll_fn(|cx| self.backoff.poll_expired(cx)), if !self.backoff.is_empty() => {
                    self.ready.push_back(expired.into_inner());
                }
                Ok(permit) = Arc::clone(&orchestrator.permits).acquire_owned(), if !self.ready.is_empty() => {
                    self.spare = Some(permit);
                }
                _ = tick(hedge_interval.as_mut()) => self.hedge(),
            }

            if self.batches.is_empty() {
                break;
            }
        }

        let left = self.batches.keys().copied().collect::<Vec<_>>();
        for id in left {
            self.give_up(id);
        }

        let mut outcome = self.outcome;
        if self.message_type.is_by_range() {
            outcome.items.sort_by_key(|item| item.key);
        } else {
            let order = &self.order;
            outcome
                .items
                .sort_by_key(|item| order.get(&item.key).copied().unwrap_or(usize::MAX));
        }

        Ok(outcome)
    }

    /// Sends ready batches to peers, up to the concurrency limit.
    fn dispatch_ready(&mut self) {
        while let Some(&id) = self.ready.front() {
            let Some(batch) = self.batches.get(&id) else {
                self.ready.pop_front();
                continue;
            };
            let Some(peer) = self.select_peer(batch, true) else {
                self.ready.pop_front();
                self.give_up(id);
                continue;
            };
            let Some(permit) = self.spare.take().or_else(|| self.try_permit()) else {
                break;
            };

            self.ready.pop_front();
            self.dispatch(id, peer, permit);
        }

        self.spare = None;
    }

    fn try_permit(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.orchestrator.permits)
            .try_acquire_owned()
            .ok()
    }

    /// Picks a peer `batch` was not sent to yet, or any peer if `allow_tried`.
    fn select_peer(&self, batch: &Batch<P>, allow_tried: bool) -> Option<P> {
        let peers = &self.orchestrator.peers;
        let selector = &self.orchestrator.selector;
        let span = batch.span();

        selector
            .select(&peers.candidates(&batch.tried, span))
            .or_else(|| {
                allow_tried
                    .then(|| selector.select(&peers.candidates(&HashSet::new(), span)))
                    .flatten()
            })
    }

    fn dispatch(&mut self, id: u64, peer: P, permit: OwnedSemaphorePermit) {
        let orchestrator = self.orchestrator;
        let Some(batch) = self.batches.get_mut(&id) else {
            return;
        };

        let now = Instant::now();
        batch.attempts += 1;
        batch.in_flight += 1;
        batch.tried.insert(peer.clone());
        batch.dispatched_at = Some(now);
        orchestrator.peers.mark_used(&peer);

        let response = orchestrator.engine.request(
            peer.clone(),
            batch.body.clone(),
            Some(now + orchestrator.config.request_timeout),
        );
        self.tasks
            .spawn(attempt(id, peer, batch.attempts, response, permit));
    }

    /// Sends batches that have been in flight for too long to a second peer.
    fn hedge(&mut self) {
        let config = self.orchestrator.config;
        let Some(hedge_timeout) = config.hedge_timeout else {
            return;
        };

        let mut due = self
            .batches
            .iter()
            .filter(|(_, batch)| {
                batch.in_flight == 1
                    && batch.attempts < config.max_attempts
                    && batch
                        .dispatched_at
                        .is_some_and(|at| at.elapsed() >= hedge_timeout)
            })
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        due.sort_unstable();

        for id in due {
            let Some(peer) = self
                .batches
                .get(&id)
                .and_then(|batch| self.select_peer(batch, false))
            else {
                continue;
            };
            let Some(permit) = self.try_permit() else {
                break;
            };

            debug!(batch = id, ?peer, "Batch is slow, hedging with another peer.");
            self.dispatch(id, peer, permit);
        }
    }

    fn handle_attempt(&mut self, res: AttemptResult<P>) -> Result<(), SyncError> {
        let AttemptResult {
            batch: id,
            peer,
            items,
            error,
        } = res;
        let by_range = self.message_type.is_by_range();

        let mut progress = None;
        for item in items {
            progress = progress.max(item.key.slot());

            let won = if by_range {
                self.claims.fulfill_or_insert(item.key)
            } else {
                self.claims.fulfill(&item.key)
            };
            if won {
                if by_range {
                    self.delivered_slots.extend(item.key.slot());
                }
                self.outcome.items.push(item);
            } else {
                debug!(?peer, key = ?item.key, "Already received item, discarding.");
            }
        }

        let Some(batch) = self.batches.get_mut(&id) else {
            debug!(?peer, batch = id, "Response for a finished batch, discarding.");
            return Ok(());
        };
        batch.in_flight = batch.in_flight.saturating_sub(1);
        batch.progress = batch.progress.max(progress);

        let config = self.orchestrator.config;
        let mut backoff = None;
        let failure = match error {
            None => None,
            Some(e) => {
                match e.class() {
                    FailureClass::Fatal => return Err(SyncError::Request(e)),
                    FailureClass::Cancelled => return Err(SyncError::Shutdown),
                    FailureClass::RetryAndPenalize => self.orchestrator.peers.penalize(&peer, &e),
                    FailureClass::Retry => {
                        debug!(?peer, batch = id, error = %e, "Batch attempt failed.");
                    }
                    FailureClass::Backoff => {
                        let delay = e.retry_after().map_or(config.backoff, |retry_after| {
                            retry_after.min(config.request_timeout).max(config.backoff)
                        });
                        debug!(?peer, batch = id, error = %e, ?delay, "Batch attempt failed, backing off.");
                        backoff = Some(delay);
                    }
                }
                Some(LastFailure::from(&e))
            }
        };

        // A range answered without error holds every slot the peer has.
        let missing = if by_range && failure.is_none() {
            false
        } else {
            batch.narrow(&self.claims)
        };
        if !missing {
            self.batches.remove(&id);
            return Ok(());
        }

        if failure.is_some() {
            batch.last_failure = failure;
        }
        if batch.in_flight > 0 {
            // The hedged request decides what happens next.
            return Ok(());
        }

        if batch.attempts >= config.max_attempts {
            self.give_up(id);
        } else {
            debug!(batch = id, attempts = batch.attempts, "Retrying batch.");
            self.requeue(id, backoff);
        }

        Ok(())
    }

    fn requeue(&mut self, id: u64, backoff: Option<Duration>) {
        match backoff {
            Some(delay) => {
                self.backoff.insert(id, delay);
            }
            None => self.ready.push_back(id),
        }
    }

    /// Reports what is left of a batch as unresolved, skipping anything already delivered.
    fn give_up(&mut self, id: u64) {
        let Some(batch) = self.batches.remove(&id) else {
            return;
        };

        let reason = match &batch.last_failure {
            Some(failure) => UnresolvedReason::Failed {
                attempts: batch.attempts,
                class: failure.class,
                error: failure.error.clone(),
            },
            None if batch.attempts == 0 => UnresolvedReason::NoPeers,
            None => UnresolvedReason::NotServed {
                attempts: batch.attempts,
            },
        };
        warn!(batch = id, ?reason, "Giving up on batch.");

        let (claims, delivered_slots) = (&self.claims, &self.delivered_slots);
        let missing = batch.missing_keys().into_iter().filter(|key| match key {
            ContentKey::Slot(slot) => !delivered_slots.contains(slot),
            key => !claims.is_fulfilled(key),
        });
        self.outcome
            .unresolved
            .extend(missing.map(|key| Unresolved {
                key,
                reason: reason.clone(),
            }));
    }
}
