//! Fans the sync engine out over every listed market.
//!
//! The coordinator lists markets, builds one engine per unique market,
//! starts them all at once and counts engines that reach `Live`. When the
//! count equals the market count it emits [`CoordinatorEvent::AllReady`]
//! exactly once. A market whose snapshot fails never reaches `Live`, so in
//! that case `AllReady` never fires; [`Coordinator::wait_ready_timeout`]
//! reports partial readiness instead.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::types::SyncState;
use crate::error::{SyncError, SyncResult};
use crate::market_data::adapters::MarketLister;
use crate::market_data::hub::MarketHub;
use crate::market_data::sync_engine::SyncEngine;

pub type EngineMap = BTreeMap<String, Arc<SyncEngine>>;

#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    EngineReady { market: String, engine: Arc<SyncEngine>, ready_count: usize },
    AllReady(Arc<EngineMap>),
    Error { market: Option<String>, error: SyncError },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorPhase {
    Idle,
    Discovering,
    Starting,
    AllReady,
}

#[derive(Debug, Clone)]
pub enum Readiness {
    All(Arc<EngineMap>),
    Partial { ready: usize, total: usize, failed: Vec<String> },
}

impl Readiness {
    pub fn is_complete(&self) -> bool {
        matches!(self, Readiness::All(_))
    }
}

struct Inner {
    hub: Arc<MarketHub>,
    lister: Arc<dyn MarketLister>,
    engines: RwLock<Arc<EngineMap>>,
    total: AtomicUsize,
    ready: watch::Sender<usize>,
    phase: watch::Sender<CoordinatorPhase>,
    initialized: AtomicBool,
    events: broadcast::Sender<CoordinatorEvent>,
}

pub struct Coordinator {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn new(hub: Arc<MarketHub>, lister: Arc<dyn MarketLister>) -> Self {
        let (ready, _) = watch::channel(0);
        let (phase, _) = watch::channel(CoordinatorPhase::Idle);
        let (events, _) = broadcast::channel(hub.settings().event_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                hub,
                lister,
                engines: RwLock::new(Arc::new(EngineMap::new())),
                total: AtomicUsize::new(0),
                ready,
                phase,
                initialized: AtomicBool::new(false),
                events,
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.inner.events.subscribe()
    }

    /// Discover markets and launch every engine. Returns the number of unique
    /// markets. Calls after the first return the known total.
    pub async fn start(&self) -> SyncResult<usize> {
        let began = self.inner.phase.send_if_modified(|phase| {
            if *phase == CoordinatorPhase::Idle {
                *phase = CoordinatorPhase::Discovering;
                true
            } else {
                false
            }
        });
        if !began {
            return Ok(self.total());
        }

        info!("Listing markets");
        let records = match self.inner.lister.list().await {
            Ok(records) => records,
            Err(error) => {
                warn!(error = %error, "Market discovery failed");
                self.inner.phase.send_replace(CoordinatorPhase::Idle);
                self.inner.emit(CoordinatorEvent::Error { market: None, error: error.clone() });
                return Err(error);
            }
        };

        let markets: Vec<String> = records.into_iter().map(|r| r.market_name).unique().collect();
        let engines: EngineMap = markets
            .iter()
            .map(|market| (market.clone(), self.inner.hub.sync_engine(market)))
            .collect();
        let total = engines.len();
        let snapshot = Arc::new(engines);
        *self.inner.engines.write() = Arc::clone(&snapshot);
        self.inner.total.store(total, Ordering::SeqCst);
        self.inner.phase.send_replace(CoordinatorPhase::Starting);
        metrics::gauge!("lobx_markets_total").set(total as f64);
        info!(markets = total, "Starting sync engines");

        if total == 0 {
            self.inner.all_initialized();
            return Ok(0);
        }

        let mut tasks = self.tasks.lock();
        for engine in snapshot.values() {
            let inner = Arc::clone(&self.inner);
            let watched = Arc::clone(engine);
            tasks.push(tokio::spawn(async move {
                if watched.wait_live().await.is_ok() {
                    inner.on_engine_live(watched);
                }
            }));

            let inner = Arc::clone(&self.inner);
            let engine = Arc::clone(engine);
            tasks.push(tokio::spawn(async move {
                if let Err(error) = engine.start().await {
                    inner.emit(CoordinatorEvent::Error { market: Some(engine.market().to_string()), error });
                }
            }));
        }
        Ok(total)
    }

    /// Engines that reached `Live` so far.
    pub fn count(&self) -> usize {
        *self.inner.ready.borrow()
    }

    pub fn total(&self) -> usize {
        self.inner.total.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> CoordinatorPhase {
        *self.inner.phase.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    pub fn engines(&self) -> Arc<EngineMap> {
        self.inner.engines.read().clone()
    }

    pub fn engine(&self, market: &str) -> Option<Arc<SyncEngine>> {
        self.inner.engines.read().get(market).cloned()
    }

    pub fn failed_markets(&self) -> Vec<String> {
        self.engines()
            .values()
            .filter(|e| e.state() == SyncState::Failed)
            .map(|e| e.market().to_string())
            .collect()
    }

    pub fn watch_count(&self) -> watch::Receiver<usize> {
        self.inner.ready.subscribe()
    }

    /// Wait for the terminal readiness signal. Never resolves while a market
    /// is stuck or failed.
    pub async fn wait_all_ready(&self) -> Arc<EngineMap> {
        let mut rx = self.inner.phase.subscribe();
        // the sender lives in `inner`, which we hold
        let _ = rx.wait_for(|phase| *phase == CoordinatorPhase::AllReady).await;
        self.engines()
    }

    /// Like [`wait_all_ready`](Self::wait_all_ready) but gives up after
    /// `deadline` and reports how far start-up got.
    pub async fn wait_ready_timeout(&self, deadline: Duration) -> Readiness {
        match tokio::time::timeout(deadline, self.wait_all_ready()).await {
            Ok(engines) => Readiness::All(engines),
            Err(_) => Readiness::Partial {
                ready: self.count(),
                total: self.total(),
                failed: self.failed_markets(),
            },
        }
    }

    /// Abort in-flight start and watch tasks. Engines keep their replicas.
    pub fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        debug!(tasks = tasks.len(), "Aborting coordinator tasks");
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn on_engine_live(&self, engine: Arc<SyncEngine>) {
        let market = engine.market().to_string();
        let mut ready_count = 0;
        // emitted under the watch lock so subscribers see counts in order
        self.ready.send_modify(|count| {
            *count += 1;
            ready_count = *count;
            self.emit(CoordinatorEvent::EngineReady { market: market.clone(), engine, ready_count });
        });
        let total = self.total.load(Ordering::SeqCst);
        metrics::gauge!("lobx_markets_ready").set(ready_count as f64);
        info!(%market, ready = ready_count, total, "Order book ready");

        if ready_count == total {
            self.all_initialized();
        }
    }

    fn all_initialized(&self) {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("All order books ready");
        self.phase.send_replace(CoordinatorPhase::AllReady);
        let engines = self.engines.read().clone();
        self.emit(CoordinatorEvent::AllReady(engines));
    }

    fn emit(&self, event: CoordinatorEvent) {
        let _ = self.events.send(event);
    }
}
