use std::sync::Arc;

use tracing::debug;

use crate::error::SyncResult;
use crate::market_data::adapters::{MarketLister, Transport};
use crate::market_data::coordinator::Coordinator;
use crate::market_data::router::DeltaRouter;
use crate::market_data::sync_engine::{SyncEngine, SyncSettings};

/// Binds one transport and one router; every engine it creates is
/// registered for delta delivery before it is returned.
pub struct MarketHub {
    transport: Arc<dyn Transport>,
    router: Arc<DeltaRouter>,
    settings: Arc<SyncSettings>,
}

impl MarketHub {
    pub fn new(transport: Arc<dyn Transport>, router: Arc<DeltaRouter>, settings: SyncSettings) -> Self {
        Self { transport, router, settings: Arc::new(settings) }
    }

    pub async fn connect(&self) -> SyncResult<()> {
        self.transport.connect().await
    }

    /// New engine for `market`, already routable. Registration happens
    /// before `start()`, so deltas may reach it while it is still syncing.
    pub fn sync_engine(&self, market: &str) -> Arc<SyncEngine> {
        let engine = Arc::new(SyncEngine::new(market, Arc::clone(&self.transport), Arc::clone(&self.settings)));
        self.router.register(&engine);
        debug!(market, engine = %engine.id(), "Created sync engine");
        engine
    }

    pub fn coordinator(self: &Arc<Self>, lister: Arc<dyn MarketLister>) -> Coordinator {
        Coordinator::new(Arc::clone(self), lister)
    }

    pub fn router(&self) -> &Arc<DeltaRouter> {
        &self.router
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }
}
