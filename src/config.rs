//! Layered runtime configuration.
//!
//! Layers, lowest priority first:
//! 1. Compiled-in defaults
//! 2. TOML file (if given)
//! 3. `LOBX_`-prefixed environment variables, nested with `__`
//!    (e.g. `LOBX_SYNC__DELTA_POLICY=apply_immediately`)

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::engine::types::DeltaPolicy;
use crate::market_data::adapters::rest::DEFAULT_MARKETS_URL;
use crate::market_data::adapters::ws_hub::{HubHeaders, DEFAULT_WS_URL};
use crate::market_data::sync_engine::SyncSettings;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub hub: HubConfig,
    pub markets: MarketsConfig,
    pub sync: SyncConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    pub ws_url: String,
    pub hub_name: String,
    pub snapshot_method: String,
    pub subscribe_method: String,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub cookie: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketsConfig {
    pub list_url: String,
    /// Skip discovery and sync only these markets.
    #[serde(default)]
    pub fixed: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    pub delta_policy: DeltaPolicy,
    /// Give up waiting for every market after this long (0 = wait forever).
    pub ready_timeout_secs: u64,
    pub event_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    pub log_filter: String,
    pub report_interval_secs: u64,
    pub metrics_port: u16,
}

impl Settings {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = SyncSettings::default();
        let mut builder = Config::builder()
            .set_default("hub.ws_url", DEFAULT_WS_URL)?
            .set_default("hub.hub_name", defaults.hub.as_str())?
            .set_default("hub.snapshot_method", defaults.snapshot_method.as_str())?
            .set_default("hub.subscribe_method", defaults.subscribe_method.as_str())?
            .set_default("markets.list_url", DEFAULT_MARKETS_URL)?
            .set_default("markets.fixed", Vec::<String>::new())?
            .set_default("sync.delta_policy", "buffer")?
            .set_default("sync.ready_timeout_secs", 0i64)?
            .set_default("sync.event_capacity", defaults.event_capacity as i64)?
            .set_default("telemetry.log_filter", "info")?
            .set_default("telemetry.report_interval_secs", 10i64)?
            .set_default("telemetry.metrics_port", 9000i64)?;

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("LOBX")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("markets.fixed"),
        );

        builder
            .build()
            .context("failed to build configuration")?
            .try_deserialize()
            .context("failed to deserialize configuration")
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            hub: self.hub.hub_name.clone(),
            snapshot_method: self.hub.snapshot_method.clone(),
            subscribe_method: self.hub.subscribe_method.clone(),
            delta_policy: self.sync.delta_policy,
            event_capacity: self.sync.event_capacity,
        }
    }

    pub fn hub_headers(&self) -> HubHeaders {
        HubHeaders { user_agent: self.hub.user_agent.clone(), cookie: self.hub.cookie.clone() }
    }

    pub fn ready_timeout(&self) -> Option<Duration> {
        (self.sync.ready_timeout_secs > 0).then(|| Duration::from_secs(self.sync.ready_timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = Settings::load(None).unwrap();
        assert_eq!(settings.hub.ws_url, DEFAULT_WS_URL);
        assert_eq!(settings.hub.hub_name, "CoreHub");
        assert_eq!(settings.sync.delta_policy, DeltaPolicy::Buffer);
        assert!(settings.markets.fixed.is_empty());
        assert_eq!(settings.ready_timeout(), None);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let path = std::env::temp_dir().join(format!("lobx-sync-config-{}.toml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[markets]
fixed = ["BTC-ETH", "BTC-LTC"]

[sync]
delta_policy = "apply_immediately"
ready_timeout_secs = 30
"#
        )
        .unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(settings.markets.fixed, vec!["BTC-ETH", "BTC-LTC"]);
        assert_eq!(settings.sync_settings().delta_policy, DeltaPolicy::ApplyImmediately);
        assert_eq!(settings.ready_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(settings.telemetry.report_interval_secs, 10);
    }

    #[test]
    fn test_env_uses_single_underscore_prefix() {
        std::env::set_var("LOBX_HUB__COOKIE", "cf_clearance=abc");
        std::env::set_var("LOBX__HUB__USER_AGENT", "ignored");
        let settings = Settings::load(None).unwrap();
        std::env::remove_var("LOBX_HUB__COOKIE");
        std::env::remove_var("LOBX__HUB__USER_AGENT");

        assert_eq!(settings.hub_headers().cookie.as_deref(), Some("cf_clearance=abc"));
        assert_eq!(settings.hub.user_agent, None);
    }
}
