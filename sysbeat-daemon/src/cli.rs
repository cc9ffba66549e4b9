//! CLI argument definitions for sysbeat-daemon.
//!
//! Uses `clap` v4 derive macros to parse command-line arguments.

use std::path::PathBuf;

use clap::Parser;

/// sysbeat host telemetry daemon.
///
/// Runs the Windows event log and DNS packet collectors declared in
/// `sysbeat.toml` and reloads them on SIGHUP.
#[derive(Parser, Debug)]
#[command(name = "sysbeat-daemon")]
#[command(version, about, long_about = None)]
pub struct DaemonCli {
    /// Path to sysbeat.toml configuration file.
    #[arg(short, long, default_value = "/etc/sysbeat/sysbeat.toml")]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    ///
    /// Takes precedence over the config file and environment variables.
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override log format (json, pretty).
    ///
    /// Takes precedence over the config file and environment variables.
    #[arg(long)]
    pub log_format: Option<String>,

    /// Validate configuration file and exit without starting the daemon.
    #[arg(long)]
    pub validate: bool,

    /// Override PID file path (takes precedence over config file).
    #[arg(long)]
    pub pid_file: Option<String>,
}

impl DaemonCli {
    /// Apply command-line overrides to a loaded configuration.
    pub fn apply_overrides(&self, config: &mut sysbeat_core::SysbeatConfig) {
        if let Some(level) = &self.log_level {
            config.general.log_level = level.clone();
        }
        if let Some(format) = &self.log_format {
            config.general.log_format = format.clone();
        }
        if let Some(pid_file) = &self.pid_file {
            config.general.pid_file = pid_file.clone();
        }
    }
}
