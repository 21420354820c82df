// Turns raw hub frames into typed messages for the router and pending calls.
use serde_json::Value;

use crate::engine::types::Delta;
use crate::error::{SyncError, SyncResult};
use crate::market_data::adapters::hub_types::{HubFrame, HubInvocation};

pub const EXCHANGE_DELTA_METHOD: &str = "updateExchangeState";
pub const SUMMARY_METHOD: &str = "updateSummaryState";

#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    ExchangeDelta(Delta),
    SummaryState(Vec<Value>),
    Response { id: u64, result: Result<Value, String> },
    Other { method: String, args: Vec<Value> },
    /// One part of a frame that could not be decoded. The rest of the frame
    /// is still delivered. `market` is set when the payload named one.
    Malformed { market: Option<String>, error: SyncError },
    /// The hub connection is gone; no more frames will follow.
    Disconnected { reason: String },
}

/// Decode one text frame. Keep-alive frames (`{}`) decode to nothing.
///
/// Only a frame that is not a hub frame at all is an error. A bad invocation
/// id or a bad pushed message becomes [`HubMessage::Malformed`] next to the
/// parts that did decode.
pub fn decode_frame(raw: &str) -> SyncResult<Vec<HubMessage>> {
    let frame: HubFrame = serde_json::from_str(raw)?;
    let mut out = Vec::new();

    if let Some(id) = frame.invocation_id {
        match id.parse::<u64>() {
            Ok(id) => {
                let result = match frame.error {
                    Some(error) => Err(error),
                    None => Ok(frame.result.unwrap_or(Value::Null)),
                };
                out.push(HubMessage::Response { id, result });
            }
            Err(_) => out.push(HubMessage::Malformed {
                market: None,
                error: SyncError::Protocol(format!("non-numeric invocation id {id:?}")),
            }),
        }
    }

    out.extend(frame.messages.unwrap_or_default().into_iter().filter_map(decode_invocation));
    Ok(out)
}

fn decode_invocation(invocation: HubInvocation) -> Option<HubMessage> {
    let HubInvocation { method, mut args, .. } = invocation;
    match method.as_str() {
        EXCHANGE_DELTA_METHOD => {
            if args.is_empty() {
                return None;
            }
            let payload = args.swap_remove(0);
            let market = market_name(&payload);
            match serde_json::from_value::<Delta>(payload) {
                Ok(delta) if delta.market.is_empty() => None,
                Ok(delta) => Some(HubMessage::ExchangeDelta(delta)),
                Err(e) => Some(HubMessage::Malformed { market, error: e.into() }),
            }
        }
        SUMMARY_METHOD => Some(HubMessage::SummaryState(args)),
        _ => Some(HubMessage::Other { method, args }),
    }
}

// best effort, so a bad delta can still be blamed on its market
fn market_name(payload: &Value) -> Option<String> {
    payload
        .get("MarketName")
        .or_else(|| payload.get("market"))
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::OrderOp;
    use rust_decimal_macros::dec;

    #[test]
    fn test_decode_exchange_delta() {
        let raw = r#"{"C":"d-1","M":[{"H":"CoreHub","M":"updateExchangeState","A":[
            {"MarketName":"BTC-ETH","Nounce":7,
             "Buys":[{"Type":1,"Rate":0.05,"Quantity":2.5}],
             "Sells":[],"Fills":[]}
        ]}]}"#;
        let messages = decode_frame(raw).unwrap();
        let expected = Delta { nonce: Some(7), ..Delta::new("BTC-ETH").with_buy(OrderOp::Update, dec!(0.05), dec!(2.5)) };
        assert_eq!(messages, vec![HubMessage::ExchangeDelta(expected)]);
    }

    #[test]
    fn test_decode_responses() {
        assert_eq!(
            decode_frame(r#"{"I":"3","R":true}"#).unwrap(),
            vec![HubMessage::Response { id: 3, result: Ok(Value::Bool(true)) }]
        );
        assert_eq!(
            decode_frame(r#"{"I":"4","E":"no such market"}"#).unwrap(),
            vec![HubMessage::Response { id: 4, result: Err("no such market".into()) }]
        );
        assert_eq!(
            decode_frame(r#"{"I":"5"}"#).unwrap(),
            vec![HubMessage::Response { id: 5, result: Ok(Value::Null) }]
        );
    }

    #[test]
    fn test_keepalive_and_other_methods() {
        assert!(decode_frame("{}").unwrap().is_empty());

        let messages = decode_frame(r#"{"M":[
            {"H":"CoreHub","M":"updateSummaryState","A":[{"Nounce":1,"Deltas":[]}]},
            {"H":"CoreHub","M":"updateOrderState","A":[]},
            {"H":"CoreHub","M":"updateExchangeState","A":[]}
        ]}"#)
        .unwrap();
        assert_eq!(messages.len(), 2);
        assert!(matches!(&messages[0], HubMessage::SummaryState(args) if args.len() == 1));
        assert!(matches!(&messages[1], HubMessage::Other { method, .. } if method == "updateOrderState"));
    }

    #[test]
    fn test_malformed_frames() {
        assert!(matches!(decode_frame("not json"), Err(SyncError::Protocol(_))));
        assert!(matches!(
            decode_frame(r#"{"I":"abc","R":1}"#).unwrap().as_slice(),
            [HubMessage::Malformed { market: None, error: SyncError::Protocol(_) }]
        ));
    }

    #[test]
    fn test_bad_delta_does_not_drop_its_neighbours() {
        let raw = r#"{"I":"2","R":true,"M":[
            {"H":"CoreHub","M":"updateExchangeState","A":[{"MarketName":"BTC-ETH","Buys":[{"Type":0,"Rate":0.1,"Quantity":4}],"Sells":[]}]},
            {"H":"CoreHub","M":"updateExchangeState","A":[{"MarketName":"BTC-LTC","Buys":[{"Type":9,"Rate":1,"Quantity":1}],"Sells":[]}]},
            {"H":"CoreHub","M":"updateExchangeState","A":[{"Buys":"nope"}]}
        ]}"#;
        let messages = decode_frame(raw).unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0], HubMessage::Response { id: 2, result: Ok(Value::Bool(true)) });
        assert_eq!(
            messages[1],
            HubMessage::ExchangeDelta(Delta::new("BTC-ETH").with_buy(OrderOp::Add, dec!(0.1), dec!(4)))
        );
        assert!(matches!(
            &messages[2],
            HubMessage::Malformed { market: Some(m), error: SyncError::Protocol(_) } if m == "BTC-LTC"
        ));
        assert!(matches!(&messages[3], HubMessage::Malformed { market: None, .. }));
    }
}
