use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Price level key. Decimal keeps `0.010` and `0.01` on the same level.
pub type Rate = Decimal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    BUY,
    SELL,
}

// Wire tags: 0 = add, 1 = update, 2 = delete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum OrderOp {
    Add,
    Update,
    Delete,
}

impl TryFrom<u8> for OrderOp {
    type Error = String;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(OrderOp::Add),
            1 => Ok(OrderOp::Update),
            2 => Ok(OrderOp::Delete),
            other => Err(format!("unknown order op tag {other}")),
        }
    }
}

impl From<OrderOp> for u8 {
    fn from(op: OrderOp) -> u8 {
        match op {
            OrderOp::Add => 0,
            OrderOp::Update => 1,
            OrderOp::Delete => 2,
        }
    }
}

/// One `(rate, quantity)` pair of a snapshot side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level {
    #[serde(rename = "Rate", alias = "rate")]
    pub rate: Rate,
    #[serde(rename = "Quantity", alias = "quantity")]
    pub quantity: Decimal,
}

/// Full point-in-time dump returned by the snapshot call.
///
/// Entries carry no operation tag; any `Type` field on the wire is ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(rename = "Buys", alias = "buys", default)]
    pub buys: Vec<Level>,
    #[serde(rename = "Sells", alias = "sells", default)]
    pub sells: Vec<Level>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaEntry {
    #[serde(rename = "Type", alias = "op")]
    pub op: OrderOp,
    #[serde(rename = "Rate", alias = "rate")]
    pub rate: Rate,
    #[serde(rename = "Quantity", alias = "quantity")]
    pub quantity: Decimal,
}

impl DeltaEntry {
    pub fn new(op: OrderOp, rate: Rate, quantity: Decimal) -> Self {
        Self { op, rate, quantity }
    }
}

/// Incremental update pushed for one market.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    #[serde(rename = "MarketName", alias = "market")]
    pub market: String,
    // exchange spelling
    #[serde(rename = "Nounce", alias = "nonce", default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<u64>,
    #[serde(rename = "Buys", alias = "buys", default)]
    pub buys: Vec<DeltaEntry>,
    #[serde(rename = "Sells", alias = "sells", default)]
    pub sells: Vec<DeltaEntry>,
}

impl Delta {
    pub fn new(market: impl Into<String>) -> Self {
        Self { market: market.into(), ..Default::default() }
    }

    pub fn with_buy(mut self, op: OrderOp, rate: Rate, quantity: Decimal) -> Self {
        self.buys.push(DeltaEntry::new(op, rate, quantity));
        self
    }

    pub fn with_sell(mut self, op: OrderOp, rate: Rate, quantity: Decimal) -> Self {
        self.sells.push(DeltaEntry::new(op, rate, quantity));
        self
    }

    pub fn len(&self) -> usize {
        self.buys.len() + self.sells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    NotStarted,
    Syncing,
    Subscribing,
    Live,
    Failed,
}

impl SyncState {
    pub fn is_live(&self) -> bool {
        matches!(self, SyncState::Live)
    }

    /// True once a snapshot has been folded into the replica.
    pub fn has_snapshot(&self) -> bool {
        matches!(self, SyncState::Subscribing | SyncState::Live)
    }
}

/// What an engine does with deltas that arrive before its snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaPolicy {
    /// Hold them, replay after the snapshot replaces the replica.
    #[default]
    Buffer,
    /// Apply on arrival and merge the snapshot on top when it lands.
    ApplyImmediately,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_delta_from_exchange_json() {
        let raw = r#"{
            "MarketName": "BTC-ETH",
            "Nounce": 42,
            "Buys": [{"Type": 0, "Rate": 0.01, "Quantity": 5}],
            "Sells": [{"Type": 2, "Rate": 0.02, "Quantity": 0}],
            "Fills": []
        }"#;
        let delta: Delta = serde_json::from_str(raw).unwrap();
        assert_eq!(delta.market, "BTC-ETH");
        assert_eq!(delta.nonce, Some(42));
        assert_eq!(delta.buys, vec![DeltaEntry::new(OrderOp::Add, dec!(0.01), dec!(5))]);
        assert_eq!(delta.sells[0].op, OrderOp::Delete);
    }

    #[test]
    fn test_unknown_op_tag_rejected() {
        let raw = r#"{"MarketName": "X", "Buys": [{"Type": 7, "Rate": 1, "Quantity": 1}]}"#;
        assert!(serde_json::from_str::<Delta>(raw).is_err());
    }

    #[test]
    fn test_snapshot_ignores_type_field() {
        let raw = r#"{"buys": [{"Type": 2, "rate": "0.5", "quantity": "1.25"}], "sells": []}"#;
        let snap: Snapshot = serde_json::from_str(raw).unwrap();
        assert_eq!(snap.buys, vec![Level { rate: dec!(0.5), quantity: dec!(1.25) }]);
    }

    #[test]
    fn test_sync_state_predicates() {
        assert!(SyncState::Live.is_live());
        assert!(!SyncState::Subscribing.is_live());
        assert!(SyncState::Subscribing.has_snapshot());
        assert!(!SyncState::Syncing.has_snapshot());
        assert!(!SyncState::Failed.has_snapshot());
    }
}
