pub mod config;
pub mod engine;
pub mod error;
pub mod market_data;
pub mod telemetry;

pub use engine::book::ReplicaStore;
pub use error::{SyncError, SyncResult};
pub use market_data::coordinator::{Coordinator, CoordinatorEvent, Readiness};
pub use market_data::hub::MarketHub;
pub use market_data::sync_engine::{SyncEngine, SyncSettings};
