use tracing_subscriber::EnvFilter;

/// Compact fmt subscriber. `RUST_LOG` wins over `default_filter`.
pub fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

#[cfg(feature = "metrics-exporter")]
pub fn init_metrics(port: u16) -> anyhow::Result<()> {
    use anyhow::Context;
    use metrics_exporter_prometheus::PrometheusBuilder;

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("prometheus exporter install")?;

    tracing::info!(port, "Prometheus exporter listening on /metrics");
    metrics::gauge!("lobx_up").set(1.0);
    Ok(())
}

#[cfg(not(feature = "metrics-exporter"))]
pub fn init_metrics(_port: u16) -> anyhow::Result<()> {
    Ok(())
}
