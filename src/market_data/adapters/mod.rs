// Shared traits for the collaborators the sync engines talk to

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncResult;

/// Request/response half of the streaming hub connection.
///
/// One transport is shared by every engine. Pushed deltas travel on a
/// separate path (see `DeltaRouter`), not through `call`.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Establish the connection. Repeated calls return without reconnecting.
    async fn connect(&self) -> SyncResult<()>;

    /// Invoke `method` on `hub` and wait for its result. No timeout is applied.
    async fn call(&self, hub: &str, method: &str, args: Vec<Value>) -> SyncResult<Value>;
}

/// One row of the exchange's market listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketRecord {
    #[serde(rename = "MarketName", alias = "market")]
    pub market_name: String,
    #[serde(rename = "IsActive", alias = "is_active", default)]
    pub is_active: Option<bool>,
}

impl MarketRecord {
    pub fn new(market_name: impl Into<String>) -> Self {
        Self { market_name: market_name.into(), is_active: None }
    }
}

#[async_trait::async_trait]
pub trait MarketLister: Send + Sync {
    /// All tradeable markets. May contain duplicates.
    async fn list(&self) -> SyncResult<Vec<MarketRecord>>;
}

pub mod hub_types;
pub mod rest;
pub mod ws_hub;
