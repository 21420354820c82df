// In-memory transport and lister for unit tests
use std::collections::VecDeque;
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Notify;

use crate::error::{SyncError, SyncResult};
use crate::market_data::adapters::{MarketLister, MarketRecord, Transport};
use crate::market_data::sync_engine::SyncSettings;

/// Answers snapshot and subscribe calls from a per-market script.
///
/// Unscripted markets get an empty snapshot and a `true` subscribe ack.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    snapshots: Mutex<AHashMap<String, SyncResult<Value>>>,
    subscribes: Mutex<AHashMap<String, VecDeque<SyncResult<Value>>>>,
    gates: Mutex<AHashMap<String, Arc<Notify>>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_snapshot(&self, market: &str, result: SyncResult<Value>) {
        self.snapshots.lock().insert(market.to_string(), result);
    }

    pub(crate) fn push_subscribe(&self, market: &str, result: SyncResult<Value>) {
        self.subscribes.lock().entry(market.to_string()).or_default().push_back(result);
    }

    /// Block the snapshot reply for `market` until the returned handle is notified.
    pub(crate) fn hold_snapshot(&self, market: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates.lock().insert(market.to_string(), Arc::clone(&gate));
        gate
    }

    pub(crate) fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().clone()
    }
}

#[async_trait::async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self) -> SyncResult<()> {
        Ok(())
    }

    async fn call(&self, _hub: &str, method: &str, args: Vec<Value>) -> SyncResult<Value> {
        let market = args.first().and_then(Value::as_str).unwrap_or_default().to_string();
        self.calls.lock().push((method.to_string(), market.clone()));

        let defaults = SyncSettings::default();
        if method == defaults.snapshot_method {
            let gate = self.gates.lock().remove(&market);
            if let Some(gate) = gate {
                gate.notified().await;
            }
            self.snapshots
                .lock()
                .get(&market)
                .cloned()
                .unwrap_or_else(|| Ok(json!({"Buys": [], "Sells": []})))
        } else if method == defaults.subscribe_method {
            self.subscribes
                .lock()
                .get_mut(&market)
                .and_then(VecDeque::pop_front)
                .unwrap_or(Ok(Value::Bool(true)))
        } else {
            Err(SyncError::Transport(format!("unexpected method {method}")))
        }
    }
}

pub(crate) struct StaticRecords(pub(crate) SyncResult<Vec<MarketRecord>>);

#[async_trait::async_trait]
impl MarketLister for StaticRecords {
    async fn list(&self) -> SyncResult<Vec<MarketRecord>> {
        self.0.clone()
    }
}
