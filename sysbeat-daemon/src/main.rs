use anyhow::Result;
use clap::Parser;

use sysbeat_core::SysbeatConfig;
use sysbeat_daemon::cli::DaemonCli;
use sysbeat_daemon::logging;
use sysbeat_daemon::orchestrator::Orchestrator;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = DaemonCli::parse();

    // Config is loaded before tracing so the log level can come from it
    let mut config = SysbeatConfig::load(&cli.config)
        .await
        .map_err(|e| anyhow::anyhow!("failed to load config {}: {}", cli.config.display(), e))?;
    cli.apply_overrides(&mut config);
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("config validation failed: {}", e))?;

    if cli.validate {
        println!(
            "configuration OK: {} ({} winlog, {} dns collectors)",
            cli.config.display(),
            config.winlog.len(),
            config.dns.len()
        );
        return Ok(());
    }

    logging::init_tracing(&config.general)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "sysbeat-daemon starting"
    );

    let mut orchestrator =
        Orchestrator::build_from_config_with_path(config, Some(cli.config.clone())).await?;
    orchestrator.run().await?;

    tracing::info!("sysbeat-daemon shut down");
    Ok(())
}
