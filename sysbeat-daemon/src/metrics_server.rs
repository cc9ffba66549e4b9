//! Prometheus exposition for the collector counters.
//!
//! The `metrics-exporter-prometheus` HTTP listener serves every series
//! declared in `sysbeat_core::metrics` at `/metrics`.

use std::net::{IpAddr, SocketAddr};

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use sysbeat_core::config::MetricsConfig;

/// The only path the built-in listener serves.
const SUPPORTED_ENDPOINT: &str = "/metrics";

/// Resolve the socket address the exporter should bind.
///
/// `listen_addr` must be a literal IPv4 or IPv6 address; host names are not
/// resolved.
pub fn listen_addr(config: &MetricsConfig) -> Result<SocketAddr> {
    if config.endpoint != SUPPORTED_ENDPOINT {
        return Err(anyhow::anyhow!(
            "unsupported metrics endpoint '{}', the exporter only serves '{}'",
            config.endpoint,
            SUPPORTED_ENDPOINT
        ));
    }

    let ip: IpAddr = config.listen_addr.parse().map_err(|e| {
        anyhow::anyhow!("invalid metrics listen address '{}': {}", config.listen_addr, e)
    })?;
    Ok(SocketAddr::new(ip, config.port))
}

/// Install the global metrics recorder and start the HTTP listener.
///
/// Call at most once per process, before collectors start.
pub fn install_metrics_recorder(config: &MetricsConfig) -> Result<()> {
    let addr = listen_addr(config)?;

    if addr.ip().is_unspecified() {
        tracing::warn!(
            listen_addr = %addr,
            "metrics endpoint is exposed on all interfaces"
        );
    }

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("failed to install metrics recorder on {}: {}", addr, e))?;

    sysbeat_core::metrics::describe_all();

    tracing::info!(listen_addr = %addr, endpoint = SUPPORTED_ENDPOINT, "prometheus exporter listening");
    Ok(())
}
