use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use lobx_sync::config::Settings;
use lobx_sync::market_data::adapters::rest::{HttpMarketLister, StaticMarketLister};
use lobx_sync::market_data::adapters::ws_hub::{LinkState, WsHubTransport};
use lobx_sync::market_data::adapters::MarketLister;
use lobx_sync::market_data::coordinator::{Coordinator, CoordinatorEvent, Readiness};
use lobx_sync::market_data::hub::MarketHub;
use lobx_sync::market_data::router::DeltaRouter;
use lobx_sync::telemetry;

/// Keep local replicas of every exchange order book in sync.
#[derive(Debug, Parser)]
#[command(name = "lobx-sync", version)]
struct Cli {
    /// TOML config file, layered over defaults and under LOBX_* env vars
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Sync only this market (repeatable). Skips REST discovery.
    #[arg(short, long = "market")]
    markets: Vec<String>,

    /// Seconds to wait for every market before reporting partial readiness
    #[arg(long)]
    ready_timeout: Option<u64>,

    /// Seconds between volume reports
    #[arg(long)]
    report_interval: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok(); // load .env
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref())?;
    if !cli.markets.is_empty() {
        settings.markets.fixed = cli.markets.clone();
    }
    if let Some(secs) = cli.ready_timeout {
        settings.sync.ready_timeout_secs = secs;
    }
    if let Some(secs) = cli.report_interval {
        settings.telemetry.report_interval_secs = secs;
    }

    telemetry::init_tracing(&settings.telemetry.log_filter);
    telemetry::init_metrics(settings.telemetry.metrics_port)?;

    let router = Arc::new(DeltaRouter::new());
    let transport = Arc::new(WsHubTransport::new(&settings.hub.ws_url, settings.hub_headers(), Arc::clone(&router)));
    let mut link = transport.link_state();
    let hub = Arc::new(MarketHub::new(transport, router, settings.sync_settings()));
    hub.connect().await.context("connecting to market hub")?;

    let lister: Arc<dyn MarketLister> = if settings.markets.fixed.is_empty() {
        Arc::new(HttpMarketLister::new(&settings.markets.list_url))
    } else {
        info!(markets = ?settings.markets.fixed, "Using fixed market list");
        Arc::new(StaticMarketLister::new(settings.markets.fixed.clone()))
    };

    let coordinator = hub.coordinator(lister);
    let events = coordinator.subscribe();
    tokio::spawn(log_events(events));

    let total = coordinator.start().await.context("starting market sync")?;
    info!(total, "Started market sync");

    match settings.ready_timeout() {
        Some(deadline) => match coordinator.wait_ready_timeout(deadline).await {
            Readiness::All(engines) => info!(markets = engines.len(), "All markets live"),
            Readiness::Partial { ready, total, failed } => {
                warn!(ready, total, ?failed, "Markets not all live before deadline, continuing")
            }
        },
        None => {
            let engines = coordinator.wait_all_ready().await;
            info!(markets = engines.len(), "All markets live");
        }
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(settings.telemetry.report_interval_secs.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => report(&coordinator),
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
            // no reconnect: replicas stop tracking the exchange from here
            _ = link.wait_for(|state| *state == LinkState::Lost) => {
                coordinator.shutdown();
                anyhow::bail!("hub connection lost");
            }
        }
    }

    coordinator.shutdown();
    Ok(())
}

async fn log_events(mut events: tokio::sync::broadcast::Receiver<CoordinatorEvent>) {
    use tokio::sync::broadcast::error::RecvError;
    loop {
        match events.recv().await {
            Ok(CoordinatorEvent::EngineReady { market, ready_count, .. }) => {
                info!(%market, ready_count, "Market live")
            }
            Ok(CoordinatorEvent::AllReady(engines)) => info!(markets = engines.len(), "All markets ready"),
            Ok(CoordinatorEvent::Error { market, error }) => warn!(?market, %error, "Sync error"),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Coordinator event log lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn report(coordinator: &Coordinator) {
    let engines = coordinator.engines();
    for (market, engine) in engines.iter().filter(|(_, e)| e.state().is_live()) {
        info!(
            %market,
            bids = %engine.bids_volume(),
            asks = %engine.asks_volume(),
            quote_bids = %engine.quote_bids_volume(),
            quote_asks = %engine.quote_asks_volume(),
            spread = ?engine.spread(),
            "Book volumes"
        );
    }
    info!(live = coordinator.count(), total = coordinator.total(), "Sync status");
}
