// Wire shapes of the streaming hub (SignalR-style JSON frames)
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::MarketRecord;

/// Everything the server pushes on the socket.
///
/// Pushed invocations arrive under `M`; replies to our calls carry the
/// invocation id in `I` and either a result in `R` or an error in `E`.
#[derive(Debug, Default, Deserialize)]
pub struct HubFrame {
    #[serde(rename = "C", default)]
    pub cursor: Option<String>,
    #[serde(rename = "M", default)]
    pub messages: Option<Vec<HubInvocation>>,
    #[serde(rename = "I", default)]
    pub invocation_id: Option<String>,
    #[serde(rename = "R", default)]
    pub result: Option<Value>,
    #[serde(rename = "E", default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HubInvocation {
    #[serde(rename = "H", default)]
    pub hub: Option<String>,
    #[serde(rename = "M")]
    pub method: String,
    #[serde(rename = "A", default)]
    pub args: Vec<Value>,
}

/// Client -> server method invocation.
#[derive(Debug, Serialize)]
pub struct OutboundCall<'a> {
    #[serde(rename = "H")]
    pub hub: &'a str,
    #[serde(rename = "M")]
    pub method: &'a str,
    #[serde(rename = "A")]
    pub args: &'a [Value],
    #[serde(rename = "I")]
    pub invocation_id: String,
}

// REST GET /public/getmarkets
#[derive(Debug, Deserialize)]
pub struct MarketsResponse {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub result: Option<Vec<MarketRecord>>,
}
