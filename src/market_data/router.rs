// Router hands decoded deltas to the engines registered for their market
use std::sync::{Arc, Weak};

use ahash::AHashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::engine::types::Delta;
use crate::error::SyncError;
use crate::market_data::sync_engine::{EngineId, SyncEngine};

struct Route {
    id: EngineId,
    engine: Weak<SyncEngine>,
}

/// Market -> engines registry.
///
/// Routes are keyed by market and engine id, so a stale engine and a fresh
/// one for the same market each receive only what is addressed to them.
/// Dropped engines are pruned lazily.
#[derive(Default)]
pub struct DeltaRouter {
    routes: RwLock<AHashMap<String, SmallVec<[Route; 1]>>>,
}

impl DeltaRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, engine: &Arc<SyncEngine>) {
        let route = Route { id: engine.id(), engine: Arc::downgrade(engine) };
        let mut routes = self.routes.write();
        let entries = routes.entry(engine.market().to_string()).or_default();
        entries.push(route);
        debug!(market = engine.market(), engine = %engine.id(), routes = entries.len(), "Registered engine");
    }

    pub fn unregister(&self, market: &str, id: EngineId) -> bool {
        let mut routes = self.routes.write();
        let Some(entries) = routes.get_mut(market) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|r| r.id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            routes.remove(market);
        }
        removed
    }

    /// Deliver `delta` to every live engine for its market. Returns the number
    /// of engines that accepted it.
    pub fn dispatch(&self, delta: Delta) -> usize {
        let delta = Arc::new(delta);
        let targets = self.targets(&delta.market);
        if targets.is_empty() {
            trace!(market = %delta.market, "No engine registered for delta");
            metrics::counter!("lobx_deltas_unrouted_total").increment(1);
            return 0;
        }

        targets
            .into_iter()
            .filter(|(id, engine)| engine.process_update(*id, Arc::clone(&delta)))
            .count()
    }

    /// Hand a market-scoped error to the engines of `market`.
    pub fn report(&self, market: &str, error: SyncError) -> usize {
        let targets = self.targets(market);
        for (_, engine) in &targets {
            engine.report_error(error.clone());
        }
        targets.len()
    }

    /// The delta feed is gone: mark every registered engine stale.
    pub fn disconnect_all(&self, error: SyncError) -> usize {
        let engines: Vec<Arc<SyncEngine>> = self
            .routes
            .read()
            .values()
            .flat_map(|entries| entries.iter().filter_map(|r| r.engine.upgrade()))
            .collect();
        for engine in &engines {
            engine.connection_lost(error.clone());
        }
        engines.len()
    }

    fn targets(&self, market: &str) -> SmallVec<[(EngineId, Arc<SyncEngine>); 1]> {
        let mut stale = false;
        let targets = {
            let routes = self.routes.read();
            match routes.get(market) {
                Some(entries) => entries
                    .iter()
                    .filter_map(|r| {
                        let engine = r.engine.upgrade();
                        stale |= engine.is_none();
                        engine.map(|e| (r.id, e))
                    })
                    .collect(),
                None => SmallVec::new(),
            }
        };
        if stale {
            self.prune(market);
        }
        targets
    }

    fn prune(&self, market: &str) {
        let mut routes = self.routes.write();
        if let Some(entries) = routes.get_mut(market) {
            entries.retain(|r| r.engine.strong_count() > 0);
            if entries.is_empty() {
                routes.remove(market);
            }
        }
    }

    pub fn route_count(&self, market: &str) -> usize {
        self.routes.read().get(market).map_or(0, |entries| entries.len())
    }

    pub fn markets(&self) -> Vec<String> {
        self.routes.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::OrderOp;
    use crate::market_data::sync_engine::SyncSettings;
    use crate::market_data::testing::ScriptedTransport;
    use rust_decimal_macros::dec;

    fn engine(market: &str) -> Arc<SyncEngine> {
        let transport = Arc::new(ScriptedTransport::new());
        Arc::new(SyncEngine::new(market, transport, Arc::new(SyncSettings::default())))
    }

    fn live_engine(market: &str) -> Arc<SyncEngine> {
        let settings = SyncSettings { delta_policy: crate::engine::types::DeltaPolicy::ApplyImmediately, ..Default::default() };
        Arc::new(SyncEngine::new(market, Arc::new(ScriptedTransport::new()), Arc::new(settings)))
    }

    #[test]
    fn test_dispatch_by_market() {
        let router = DeltaRouter::new();
        let a = live_engine("BTC-ETH");
        let b = live_engine("BTC-LTC");
        router.register(&a);
        router.register(&b);

        let delivered = router.dispatch(Delta::new("BTC-ETH").with_buy(OrderOp::Add, dec!(1), dec!(2)));
        assert_eq!(delivered, 1);
        assert_eq!(a.bids_volume(), dec!(2));
        assert_eq!(b.bids_volume(), dec!(0));
    }

    #[test]
    fn test_unknown_market_is_dropped() {
        let router = DeltaRouter::new();
        router.register(&engine("BTC-ETH"));
        assert_eq!(router.dispatch(Delta::new("BTC-XRP")), 0);
    }

    #[test]
    fn test_two_instances_same_market() {
        let router = DeltaRouter::new();
        let stale = live_engine("BTC-ETH");
        let fresh = live_engine("BTC-ETH");
        router.register(&stale);
        router.register(&fresh);
        assert_eq!(router.route_count("BTC-ETH"), 2);

        assert!(router.unregister("BTC-ETH", stale.id()));
        router.dispatch(Delta::new("BTC-ETH").with_sell(OrderOp::Add, dec!(3), dec!(1)));
        assert_eq!(fresh.asks_volume(), dec!(1));
        assert_eq!(stale.asks_volume(), dec!(0));
        assert!(!router.unregister("BTC-ETH", stale.id()));
    }

    #[test]
    fn test_dropped_engine_pruned() {
        let router = DeltaRouter::new();
        let kept = live_engine("BTC-ETH");
        router.register(&kept);
        router.register(&engine("BTC-ETH"));

        assert_eq!(router.dispatch(Delta::new("BTC-ETH")), 1);
        assert_eq!(router.route_count("BTC-ETH"), 1);

        drop(kept);
        assert_eq!(router.dispatch(Delta::new("BTC-ETH")), 0);
        assert!(router.markets().is_empty());
    }

    #[test]
    fn test_report_reaches_only_its_market() {
        let router = DeltaRouter::new();
        let eth = live_engine("BTC-ETH");
        let ltc = live_engine("BTC-LTC");
        router.register(&eth);
        router.register(&ltc);

        let error = SyncError::Protocol("unknown order op tag 9".into());
        assert_eq!(router.report("BTC-LTC", error.clone()), 1);
        assert_eq!(ltc.last_error(), Some(error));
        assert_eq!(eth.last_error(), None);
        assert_eq!(router.report("BTC-XRP", SyncError::NotConnected), 0);
    }

    #[test]
    fn test_disconnect_all_marks_every_engine() {
        let router = DeltaRouter::new();
        let eth = live_engine("BTC-ETH");
        let ltc = live_engine("BTC-LTC");
        router.register(&eth);
        router.register(&ltc);
        router.register(&engine("BTC-XRP"));

        assert_eq!(router.disconnect_all(SyncError::Transport("gone".into())), 2);
        assert!(eth.is_stale());
        assert!(ltc.is_stale());
    }
}
