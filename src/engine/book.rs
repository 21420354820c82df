use std::collections::BTreeMap;

use rust_decimal::Decimal;
use tracing::{debug, instrument, trace};

use crate::engine::types::{Delta, DeltaEntry, Level, OrderOp, Rate, Side, Snapshot};

/// Local replica of one market's price ladder.
///
/// Each side maps rate -> aggregate quantity. A level whose quantity drops to
/// zero or below is removed, never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaStore {
    pub bids: BTreeMap<Rate, Decimal>, // highest rate = best bid
    pub asks: BTreeMap<Rate, Decimal>, // lowest rate  = best ask
}

impl ReplicaStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn side_mut(&mut self, side: Side) -> &mut BTreeMap<Rate, Decimal> {
        match side {
            Side::BUY => &mut self.bids,
            Side::SELL => &mut self.asks,
        }
    }

    fn side(&self, side: Side) -> &BTreeMap<Rate, Decimal> {
        match side {
            Side::BUY => &self.bids,
            Side::SELL => &self.asks,
        }
    }

    /// Insert or overwrite the level at `rate`. Quantity is replaced, not summed.
    pub fn upsert(&mut self, side: Side, rate: Rate, quantity: Decimal) {
        let levels = self.side_mut(side);
        if quantity <= Decimal::ZERO {
            levels.remove(&rate);
        } else {
            levels.insert(rate, quantity);
        }
    }

    /// Drop the level at `rate`. Missing levels are ignored.
    pub fn remove(&mut self, side: Side, rate: Rate) -> Option<Decimal> {
        self.side_mut(side).remove(&rate)
    }

    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
    }

    /// Replace the whole book with a fresh snapshot.
    #[instrument(level = "debug", skip_all, fields(buys = snapshot.buys.len(), sells = snapshot.sells.len()))]
    pub fn apply_full(&mut self, snapshot: &Snapshot) {
        self.clear();
        self.merge_full(snapshot);
    }

    /// Upsert every snapshot entry on top of whatever is already held.
    pub fn merge_full(&mut self, snapshot: &Snapshot) {
        for &Level { rate, quantity } in &snapshot.buys {
            self.upsert(Side::BUY, rate, quantity);
        }
        for &Level { rate, quantity } in &snapshot.sells {
            self.upsert(Side::SELL, rate, quantity);
        }
        debug!(bid_levels = self.bids.len(), ask_levels = self.asks.len(), "Snapshot applied");
    }

    /// Fold one delta payload into the book, buys first, each side in array order.
    pub fn apply_delta(&mut self, delta: &Delta) {
        for entry in &delta.buys {
            self.apply_entry(Side::BUY, entry);
        }
        for entry in &delta.sells {
            self.apply_entry(Side::SELL, entry);
        }
    }

    fn apply_entry(&mut self, side: Side, entry: &DeltaEntry) {
        trace!(?side, op = ?entry.op, rate = %entry.rate, qty = %entry.quantity, "Applying delta entry");
        match entry.op {
            OrderOp::Add | OrderOp::Update => self.upsert(side, entry.rate, entry.quantity),
            OrderOp::Delete => {
                self.remove(side, entry.rate);
            }
        }
    }

    pub fn quantity_at(&self, side: Side, rate: Rate) -> Option<Decimal> {
        self.side(side).get(&rate).copied()
    }

    /// Sum of quantity on one side, in base currency. Saturates at
    /// `Decimal::MAX`.
    pub fn volume(&self, side: Side) -> Decimal {
        self.side(side).values().fold(Decimal::ZERO, |acc, qty| acc.saturating_add(*qty))
    }

    /// Sum of `rate * quantity` on one side, in quote currency. Saturates at
    /// `Decimal::MAX`.
    pub fn quote_volume(&self, side: Side) -> Decimal {
        self.side(side)
            .iter()
            .fold(Decimal::ZERO, |acc, (rate, qty)| acc.saturating_add(rate.saturating_mul(*qty)))
    }

    pub fn best_bid(&self) -> Option<(Rate, Decimal)> {
        self.bids.iter().next_back().map(|(r, q)| (*r, *q))
    }

    pub fn best_ask(&self) -> Option<(Rate, Decimal)> {
        self.asks.iter().next().map(|(r, q)| (*r, *q))
    }

    pub fn spread(&self) -> Option<Decimal> {
        let (bid, _) = self.best_bid()?;
        let (ask, _) = self.best_ask()?;
        Some(ask.saturating_sub(bid))
    }

    /// Top `n` levels per side, best first.
    pub fn depth(&self, n: usize) -> (Vec<(Rate, Decimal)>, Vec<(Rate, Decimal)>) {
        let bids = self.bids.iter().rev().take(n).map(|(r, q)| (*r, *q)).collect();
        let asks = self.asks.iter().take(n).map(|(r, q)| (*r, *q)).collect();
        (bids, asks)
    }

    pub fn level_count(&self) -> (usize, usize) {
        (self.bids.len(), self.asks.len())
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}
