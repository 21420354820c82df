// Market discovery over the exchange's public REST API

use tracing::{debug, instrument};

use super::hub_types::MarketsResponse;
use super::{MarketLister, MarketRecord};
use crate::error::{SyncError, SyncResult};

pub const DEFAULT_MARKETS_URL: &str = "https://bittrex.com/api/v1.1/public/getmarkets";

pub struct HttpMarketLister {
    client: reqwest::Client,
    pub url: String,
}

impl HttpMarketLister {
    pub fn new(url: &str) -> Self {
        Self { client: reqwest::Client::new(), url: url.to_string() }
    }
}

impl Default for HttpMarketLister {
    fn default() -> Self {
        Self::new(DEFAULT_MARKETS_URL)
    }
}

#[async_trait::async_trait]
impl MarketLister for HttpMarketLister {
    #[instrument(skip(self), fields(url = %self.url))]
    async fn list(&self) -> SyncResult<Vec<MarketRecord>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| SyncError::Discovery(e.to_string()))?;

        let body: MarketsResponse = response
            .json()
            .await
            .map_err(|e| SyncError::Discovery(format!("bad markets payload: {e}")))?;
        parse_markets(body)
    }
}

fn parse_markets(body: MarketsResponse) -> SyncResult<Vec<MarketRecord>> {
    if !body.success {
        let message = body.message.unwrap_or_else(|| "request unsuccessful".into());
        return Err(SyncError::Discovery(message));
    }
    let markets = body.result.unwrap_or_default();
    debug!(markets = markets.len(), "Fetched market list");
    Ok(markets)
}

/// Fixed market list, for pinning a run to a few markets.
pub struct StaticMarketLister {
    markets: Vec<String>,
}

impl StaticMarketLister {
    pub fn new<I, S>(markets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { markets: markets.into_iter().map(Into::into).collect() }
    }
}

#[async_trait::async_trait]
impl MarketLister for StaticMarketLister {
    async fn list(&self) -> SyncResult<Vec<MarketRecord>> {
        Ok(self.markets.iter().map(|m| MarketRecord::new(m.as_str())).collect())
    }
}
