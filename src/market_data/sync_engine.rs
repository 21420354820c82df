//! Per-market snapshot-then-delta synchronization.
//!
//! A [`SyncEngine`] walks `NotStarted -> Syncing -> Subscribing -> Live`:
//! it asks the hub for a full snapshot, folds it into its [`ReplicaStore`],
//! then subscribes to the market's delta stream. A failed snapshot parks the
//! engine in `Failed` for good; a failed subscribe re-arms it so `start()`
//! can be called again.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, instrument, trace, warn};

use crate::engine::book::ReplicaStore;
use crate::engine::types::{Delta, DeltaPolicy, Rate, Side, Snapshot, SyncState};
use crate::error::{SyncError, SyncResult};
use crate::market_data::adapters::Transport;

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique engine identity used for delta routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EngineId(u64);

impl EngineId {
    fn next() -> Self {
        EngineId(NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "engine-{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    Started,
    Error(SyncError),
    Update(Arc<Delta>),
}

/// Hub method names and delta handling shared by every engine of a hub.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub hub: String,
    pub snapshot_method: String,
    pub subscribe_method: String,
    pub delta_policy: DeltaPolicy,
    pub event_capacity: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            hub: "CoreHub".into(),
            snapshot_method: "QueryExchangeState".into(),
            subscribe_method: "SubscribeToExchangeDeltas".into(),
            delta_policy: DeltaPolicy::Buffer,
            event_capacity: 1024,
        }
    }
}

struct Replica {
    book: ReplicaStore,
    // true only between arming and the snapshot landing
    buffering: bool,
    pending: Vec<Arc<Delta>>,
    last_error: Option<SyncError>,
    // delta feed gone; the replica no longer tracks the exchange
    stale: bool,
}

pub struct SyncEngine {
    id: EngineId,
    market: String,
    transport: Arc<dyn Transport>,
    settings: Arc<SyncSettings>,
    state: watch::Sender<SyncState>,
    replica: Mutex<Replica>,
    events: broadcast::Sender<EngineEvent>,
}

impl fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncEngine")
            .field("id", &self.id)
            .field("market", &self.market)
            .field("state", &self.state())
            .finish()
    }
}

impl SyncEngine {
    pub fn new(market: &str, transport: Arc<dyn Transport>, settings: Arc<SyncSettings>) -> Self {
        let (state, _) = watch::channel(SyncState::NotStarted);
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        Self {
            id: EngineId::next(),
            market: market.to_string(),
            transport,
            settings,
            state,
            replica: Mutex::new(Replica {
                book: ReplicaStore::new(),
                buffering: false,
                pending: Vec::new(),
                last_error: None,
                stale: false,
            }),
            events,
        }
    }

    pub fn id(&self) -> EngineId {
        self.id
    }

    pub fn market(&self) -> &str {
        &self.market
    }

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    pub fn last_error(&self) -> Option<SyncError> {
        self.replica.lock().last_error.clone()
    }

    /// Run the snapshot/subscribe sequence.
    ///
    /// Returns immediately with `Ok(())` unless the engine is `NotStarted`.
    /// The returned error is also broadcast as [`EngineEvent::Error`].
    #[instrument(skip(self), fields(market = %self.market, engine = %self.id))]
    pub async fn start(&self) -> SyncResult<()> {
        let armed = self.state.send_if_modified(|state| {
            if *state == SyncState::NotStarted {
                *state = SyncState::Syncing;
                true
            } else {
                false
            }
        });
        if !armed {
            debug!(state = ?self.state(), "Start ignored, engine already started");
            return Ok(());
        }

        if self.settings.delta_policy == DeltaPolicy::Buffer {
            self.replica.lock().buffering = true;
        }

        info!("Requesting exchange snapshot");
        let snapshot = match self.query_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Snapshot failed, engine is now Failed");
                metrics::counter!("lobx_snapshot_failures_total").increment(1);
                self.fail(e.clone());
                return Err(e);
            }
        };

        self.install_snapshot(&snapshot);
        self.state.send_replace(SyncState::Subscribing);

        info!("Subscribing to exchange deltas");
        match self.subscribe_deltas().await {
            Ok(()) => {
                self.state.send_replace(SyncState::Live);
                metrics::gauge!("lobx_engines_live").increment(1.0);
                info!("Engine live");
                self.emit(EngineEvent::Started);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Subscribe failed, engine re-armed");
                metrics::counter!("lobx_subscribe_failures_total").increment(1);
                self.replica.lock().last_error = Some(e.clone());
                self.state.send_replace(SyncState::NotStarted);
                self.emit(EngineEvent::Error(e.clone()));
                Err(e)
            }
        }
    }

    /// Resolve once the engine is `Live`, or with its error once it is `Failed`.
    pub async fn wait_live(&self) -> SyncResult<()> {
        let mut rx = self.state.subscribe();
        let state = *rx
            .wait_for(|s| matches!(s, SyncState::Live | SyncState::Failed))
            .await
            .map_err(|_| SyncError::Transport("engine dropped".into()))?;
        match state {
            SyncState::Live => Ok(()),
            _ => Err(self
                .last_error()
                .unwrap_or_else(|| SyncError::Protocol("snapshot failed".into()))),
        }
    }

    async fn query_snapshot(&self) -> SyncResult<Snapshot> {
        let result = self
            .transport
            .call(&self.settings.hub, &self.settings.snapshot_method, vec![Value::String(self.market.clone())])
            .await?;
        let snapshot: Snapshot = serde_json::from_value(result)?;
        debug!(buys = snapshot.buys.len(), sells = snapshot.sells.len(), "Snapshot received");
        Ok(snapshot)
    }

    async fn subscribe_deltas(&self) -> SyncResult<()> {
        let result = self
            .transport
            .call(&self.settings.hub, &self.settings.subscribe_method, vec![Value::String(self.market.clone())])
            .await?;
        match result {
            Value::Bool(true) => Ok(()),
            other => {
                debug!(result = %other, "Subscribe not acknowledged");
                Err(SyncError::SubscriptionRejected { market: self.market.clone() })
            }
        }
    }

    fn install_snapshot(&self, snapshot: &Snapshot) {
        let mut replica = self.replica.lock();
        match self.settings.delta_policy {
            DeltaPolicy::Buffer => replica.book.apply_full(snapshot),
            DeltaPolicy::ApplyImmediately => replica.book.merge_full(snapshot),
        }
        replica.buffering = false;
        let pending = std::mem::take(&mut replica.pending);
        if !pending.is_empty() {
            debug!(count = pending.len(), "Replaying buffered deltas");
        }
        for delta in pending {
            replica.book.apply_delta(&delta);
            self.emit(EngineEvent::Update(delta));
        }
    }

    fn fail(&self, error: SyncError) {
        {
            let mut replica = self.replica.lock();
            if !replica.pending.is_empty() {
                warn!(count = replica.pending.len(), "Discarding deltas buffered for a failed snapshot");
            }
            replica.pending.clear();
            replica.buffering = false;
            replica.last_error = Some(error.clone());
        }
        self.state.send_replace(SyncState::Failed);
        self.emit(EngineEvent::Error(error));
    }

    /// Fold a delta into the replica. The whole payload is applied under one
    /// lock; while the snapshot is outstanding it may be buffered instead.
    pub fn apply_delta(&self, delta: Delta) {
        self.apply_shared(Arc::new(delta));
    }

    /// Routed delivery: ignored unless `target` is this engine.
    pub fn process_update(&self, target: EngineId, delta: Arc<Delta>) -> bool {
        if target != self.id {
            return false;
        }
        self.apply_shared(delta);
        true
    }

    fn apply_shared(&self, delta: Arc<Delta>) {
        if delta.market != self.market {
            warn!(engine = %self.id, market = %self.market, delta_market = %delta.market, "Ignoring delta for another market");
            return;
        }
        let mut replica = self.replica.lock();
        if replica.buffering {
            trace!(market = %self.market, pending = replica.pending.len() + 1, "Buffering delta until snapshot");
            replica.pending.push(delta);
            return;
        }
        replica.book.apply_delta(&delta);
        metrics::counter!("lobx_deltas_applied_total").increment(1);
        self.emit(EngineEvent::Update(delta));
    }

    /// Record a market-scoped error that leaves the state machine alone,
    /// such as a delta that could not be decoded.
    pub fn report_error(&self, error: SyncError) {
        warn!(market = %self.market, engine = %self.id, error = %error, "Market error");
        self.replica.lock().last_error = Some(error.clone());
        self.emit(EngineEvent::Error(error));
    }

    /// The delta feed behind this engine is gone. The replica keeps its last
    /// contents but [`is_stale`](Self::is_stale) reports true from now on.
    pub fn connection_lost(&self, error: SyncError) {
        {
            let mut replica = self.replica.lock();
            replica.stale = true;
            replica.last_error = Some(error.clone());
        }
        warn!(market = %self.market, engine = %self.id, state = ?self.state(), "Delta feed lost, replica is stale");
        self.emit(EngineEvent::Error(error));
    }

    pub fn is_stale(&self) -> bool {
        self.replica.lock().stale
    }

    fn emit(&self, event: EngineEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn pending_deltas(&self) -> usize {
        self.replica.lock().pending.len()
    }

    /// Run `f` against a consistent view of the replica.
    pub fn with_book<R>(&self, f: impl FnOnce(&ReplicaStore) -> R) -> R {
        f(&self.replica.lock().book)
    }

    pub fn book(&self) -> ReplicaStore {
        self.with_book(|b| b.clone())
    }

    pub fn asks_volume(&self) -> Decimal {
        self.with_book(|b| b.volume(Side::SELL))
    }

    pub fn bids_volume(&self) -> Decimal {
        self.with_book(|b| b.volume(Side::BUY))
    }

    /// Asks volume in quote currency (`rate * quantity`).
    pub fn quote_asks_volume(&self) -> Decimal {
        self.with_book(|b| b.quote_volume(Side::SELL))
    }

    pub fn quote_bids_volume(&self) -> Decimal {
        self.with_book(|b| b.quote_volume(Side::BUY))
    }

    // BTC was the exchange's quote currency for most markets
    pub fn btc_asks_volume(&self) -> Decimal {
        self.quote_asks_volume()
    }

    pub fn btc_bids_volume(&self) -> Decimal {
        self.quote_bids_volume()
    }

    pub fn best_bid(&self) -> Option<(Rate, Decimal)> {
        self.with_book(ReplicaStore::best_bid)
    }

    pub fn best_ask(&self) -> Option<(Rate, Decimal)> {
        self.with_book(ReplicaStore::best_ask)
    }

    pub fn spread(&self) -> Option<Decimal> {
        self.with_book(ReplicaStore::spread)
    }

    pub fn depth(&self, n: usize) -> (Vec<(Rate, Decimal)>, Vec<(Rate, Decimal)>) {
        self.with_book(|b| b.depth(n))
    }
}
