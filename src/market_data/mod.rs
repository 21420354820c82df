// Market data module entrypoint
pub mod adapters;     // transport + market lister traits and their implementations
pub mod coordinator;  // starts every market and aggregates readiness
pub mod decoder;      // raw hub frames -> typed messages
pub mod hub;          // engine factory bound to one transport and router
pub mod router;       // delivers deltas to the engines of a market
pub mod sync_engine;  // per-market snapshot-then-delta state machine

#[cfg(test)]
pub(crate) mod testing;
