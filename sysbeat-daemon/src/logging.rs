//! Logging initialization for sysbeat-daemon.
//!
//! Installs a `tracing-subscriber` registry from the `[general]` section:
//! an [`EnvFilter`] built from `log_level` (or `RUST_LOG`) and a JSON or
//! pretty formatting layer. Audit records emitted by collectors use the
//! `audit` target and can be filtered separately, e.g. `RUST_LOG=info,audit=warn`.

use anyhow::Result;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use sysbeat_core::config::GeneralConfig;

/// Directives appended to the configured level.
const QUIET_DEPENDENCIES: &str = "hyper=warn,hyper_util=warn";

/// Initialize the global tracing subscriber.
///
/// Must be called exactly once, before any tracing macros are used.
/// `RUST_LOG` takes precedence over `general.log_level`.
pub fn init_tracing(config: &GeneralConfig) -> Result<()> {
    let filter = build_filter(&config.log_level)?;

    let format_layer = match config.log_format.as_str() {
        "json" => fmt::layer()
            .json()
            .with_current_span(false)
            .with_target(true)
            .boxed(),
        "pretty" => fmt::layer().pretty().boxed(),
        other => {
            return Err(anyhow::anyhow!(
                "unknown log format '{}', expected 'json' or 'pretty'",
                other
            ));
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(format_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing subscriber: {}", e))
}

/// Build the level filter, preferring `RUST_LOG` when it is set and valid.
pub fn build_filter(log_level: &str) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(format!("{log_level},{QUIET_DEPENDENCIES}"))
        .map_err(|e| anyhow::anyhow!("invalid log level '{}': {}", log_level, e))
}
