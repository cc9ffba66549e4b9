//! Collector orchestration -- assembly, reload, and lifecycle management.
//!
//! The [`Orchestrator`] is the central coordinator of `sysbeat-daemon`.
//! It opens the shared checkpoint store and audit sink, turns every
//! configured section into a collector through the [`CollectorRegistry`],
//! and runs the main signal loop.
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: close every collector and exit
//! - `SIGHUP`: reload the configuration file and reconfigure collectors in
//!   place; sections that disappeared are removed
//!
//! A failed reload never stops the daemon. Collectors whose new section
//! could not be applied keep running with their previous configuration.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::broadcast;

use sysbeat_collector::winlog::platform_event_log;
use sysbeat_collector::{CollectorEnv, CollectorRegistry, CollectorSpec, ReconfigureOutcome};
use sysbeat_core::audit::{AUDIT_KIND_CHECKPOINT, AuditRecord, AuditSink, TracingAuditSink};
use sysbeat_core::checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
use sysbeat_core::config::SysbeatConfig;
use sysbeat_core::event::NodeIdentity;

use crate::health::{CollectorHealth, DaemonHealth, aggregate_status};
use crate::metrics_server;
use crate::modules::{self, AssemblyContext};

/// Interval between periodic health log lines.
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Outcome of applying a configuration to the running registry.
#[derive(Debug, Default, Clone)]
pub struct ApplyReport {
    /// Collectors created, updated, or replaced.
    pub applied: Vec<(String, ReconfigureOutcome)>,
    /// Sections that could not be applied, with the error text.
    pub failed: Vec<(String, String)>,
    /// Collectors removed because their section disappeared.
    pub removed: Vec<String>,
}

impl ApplyReport {
    /// Returns `true` if every section was applied.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// The main daemon orchestrator.
pub struct Orchestrator {
    /// Active configuration (replaced on successful reload).
    config: SysbeatConfig,
    /// File the configuration was loaded from, if any (needed for SIGHUP).
    config_path: Option<PathBuf>,
    /// Running collectors keyed by name.
    registry: CollectorRegistry,
    /// Shared collaborators for dispatcher assembly.
    assembly: AssemblyContext,
    /// Shutdown broadcast sender (signals all background tasks).
    shutdown_tx: broadcast::Sender<()>,
    /// Daemon start time (for uptime reporting).
    start_time: Instant,
}

impl Orchestrator {
    /// Load configuration and build the orchestrator.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file cannot be read or parsed
    /// - Configuration validation fails
    /// - The checkpoint store cannot be opened
    pub async fn build(config_path: &Path) -> Result<Self> {
        let config = SysbeatConfig::load(config_path)
            .await
            .map_err(|e| anyhow::anyhow!("failed to load config: {}", e))?;
        Self::build_from_config_with_path(config, Some(config_path.to_path_buf())).await
    }

    /// Build from an already-loaded configuration.
    ///
    /// Without a config path, SIGHUP reloads are logged and ignored.
    pub async fn build_from_config(config: SysbeatConfig) -> Result<Self> {
        Self::build_from_config_with_path(config, None).await
    }

    /// Build from an already-loaded configuration that came from `config_path`.
    pub async fn build_from_config_with_path(
        config: SysbeatConfig,
        config_path: Option<PathBuf>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("config validation failed: {}", e))?;

        // Install metrics recorder before any collector records a counter
        if config.metrics.enabled {
            metrics_server::install_metrics_recorder(&config.metrics)?;
            tracing::info!(port = config.metrics.port, "metrics endpoint enabled");
        }

        let audit: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);
        let checkpoints = open_checkpoint_store(&config, audit.as_ref())?;

        let mut env = CollectorEnv::new(Arc::clone(&checkpoints), Arc::clone(&audit));
        match platform_event_log() {
            Some(api) => env = env.with_event_log(api),
            None => {
                if !config.winlog.is_empty() {
                    tracing::warn!(
                        sections = config.winlog.len(),
                        "no event log backend on this platform, winlog collectors will fail to start"
                    );
                }
            }
        }

        let node = NodeIdentity::new(config.general.node_id.clone(), local_addr());
        tracing::debug!(node_id = %node.node_id, addr = %node.addr, "node identity resolved");

        let (shutdown_tx, _) = broadcast::channel(16);

        Ok(Self {
            config,
            config_path,
            registry: CollectorRegistry::new(env),
            assembly: AssemblyContext {
                node,
                checkpoints,
                audit,
            },
            shutdown_tx,
            start_time: Instant::now(),
        })
    }

    /// Create and start every configured collector.
    ///
    /// Startup is all-or-nothing: if any collector fails, the ones already
    /// started are closed and the error is returned.
    pub async fn start_collectors(&mut self) -> Result<()> {
        let specs = modules::collector_specs(&self.config, &self.assembly)?;

        for spec in specs {
            let name = spec.name().to_owned();
            if let Err(e) = self.registry.reconfigure(spec).await {
                tracing::warn!(collector = %name, "startup failed, rolling back already-started collectors");
                self.registry.close_all().await;
                return Err(anyhow::anyhow!("failed to start collector '{}': {}", name, e));
            }
        }

        tracing::info!(total_collectors = self.registry.len(), "all collectors started");
        Ok(())
    }

    /// Start all collectors and enter the main signal loop.
    ///
    /// Blocks until `SIGTERM` or `SIGINT` is received.
    pub async fn run(&mut self) -> Result<()> {
        let pid_file = self.pid_file();
        if let Some(path) = &pid_file {
            write_pid_file(path)?;
        }

        if let Err(e) = self.start_collectors().await {
            if let Some(path) = &pid_file {
                remove_pid_file(path);
            }
            return Err(e);
        }

        if self.config.metrics.enabled {
            record_daemon_metrics(self.registry.len());
        }

        let mut uptime_updater_task = if self.config.metrics.enabled {
            let shutdown_rx = self.shutdown_tx.subscribe();
            Some(spawn_uptime_updater(self.start_time, shutdown_rx))
        } else {
            None
        };

        let mut signals = match SignalListener::install() {
            Ok(signals) => signals,
            Err(e) => {
                self.shutdown().await;
                if let Some(path) = &pid_file {
                    remove_pid_file(path);
                }
                return Err(e);
            }
        };

        let mut health_tick = tokio::time::interval(HEALTH_LOG_INTERVAL);
        health_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // the first tick completes immediately
        health_tick.tick().await;

        tracing::info!("entering main event loop");
        loop {
            tokio::select! {
                signal = signals.recv() => match signal {
                    DaemonSignal::Shutdown(name) => {
                        tracing::info!(signal = name, "shutdown signal received");
                        break;
                    }
                    DaemonSignal::Reload => {
                        tracing::info!(signal = "SIGHUP", "reload signal received");
                        match self.reload().await {
                            Ok(report) => log_apply_report(&report),
                            Err(e) => tracing::error!(error = %e, "reload failed, keeping current configuration"),
                        }
                    }
                },
                _ = health_tick.tick() => {
                    let health = self.health().await;
                    if health.status.is_healthy() {
                        tracing::debug!(uptime_secs = health.uptime_secs, "daemon healthy");
                    } else {
                        tracing::warn!(status = %health.status, uptime_secs = health.uptime_secs, "daemon health degraded");
                    }
                }
            }
        }

        tracing::info!("broadcasting shutdown signal to all tasks");
        let _ = self.shutdown_tx.send(());
        if let Some(task) = uptime_updater_task.take() {
            let _ = task.await;
        }

        self.shutdown().await;

        if let Some(path) = &pid_file {
            remove_pid_file(path);
        }
        Ok(())
    }

    /// Reload the configuration file and apply it.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no config path or the file fails to load
    /// or validate. Per-collector failures are reported in [`ApplyReport`].
    pub async fn reload(&mut self) -> Result<ApplyReport> {
        let path = self
            .config_path
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no configuration file to reload from"))?;
        let config = SysbeatConfig::load(&path)
            .await
            .map_err(|e| anyhow::anyhow!("failed to reload config {}: {}", path.display(), e))?;
        Ok(self.apply_config(config).await)
    }

    /// Apply a new configuration to the running registry.
    ///
    /// Only the collector sections take effect. `[general]`, `[metrics]`, and
    /// `[checkpoint]` changes need a restart.
    pub async fn apply_config(&mut self, config: SysbeatConfig) -> ApplyReport {
        if config.checkpoint.backend != self.config.checkpoint.backend
            || config.checkpoint_path() != self.config.checkpoint_path()
        {
            tracing::warn!("checkpoint settings changed, restart the daemon to apply them");
        }

        let mut report = ApplyReport::default();
        let mut declared = BTreeSet::new();

        let specs = config
            .winlog
            .iter()
            .map(|s| (s.name.clone(), modules::winlog::spec(s, &self.assembly)))
            .chain(
                config
                    .dns
                    .iter()
                    .map(|s| (s.name.clone(), modules::dns::spec(s, &self.assembly))),
            )
            .collect::<Vec<(String, Result<CollectorSpec>)>>();

        for (name, spec) in specs {
            declared.insert(name.clone());
            let result = match spec {
                Ok(spec) => self
                    .registry
                    .reconfigure(spec)
                    .await
                    .map_err(anyhow::Error::from),
                Err(e) => Err(e),
            };
            match result {
                Ok(outcome) => report.applied.push((name, outcome)),
                Err(e) => {
                    tracing::error!(collector = %name, error = %e, "failed to apply collector section");
                    report.failed.push((name, e.to_string()));
                }
            }
        }

        report.removed = self.registry.retain(&declared).await;

        // Keep the running process settings; only the collector sections move.
        let mut next = config;
        next.general = self.config.general.clone();
        next.metrics = self.config.metrics.clone();
        next.checkpoint = self.config.checkpoint.clone();
        self.config = next;

        report
    }

    /// Close every collector.
    pub async fn shutdown(&mut self) {
        tracing::info!("stopping all collectors");
        self.registry.close_all().await;
    }

    /// Get the current aggregated health status.
    pub async fn health(&self) -> DaemonHealth {
        let collectors: Vec<CollectorHealth> = self
            .registry
            .health()
            .await
            .into_iter()
            .map(CollectorHealth::from)
            .collect();

        let status = aggregate_status(&collectors);
        let uptime_secs = self.start_time.elapsed().as_secs();

        if self.config.metrics.enabled {
            use sysbeat_core::metrics as m;
            #[allow(clippy::cast_precision_loss)]
            metrics::gauge!(m::DAEMON_UPTIME_SECONDS).set(uptime_secs as f64);
        }

        DaemonHealth {
            status,
            uptime_secs,
            collectors,
        }
    }

    /// Get a reference to the active configuration.
    pub fn config(&self) -> &SysbeatConfig {
        &self.config
    }

    /// Get a reference to the collector registry.
    pub fn registry(&self) -> &CollectorRegistry {
        &self.registry
    }

    fn pid_file(&self) -> Option<PathBuf> {
        if self.config.general.pid_file.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.config.general.pid_file))
        }
    }
}

fn log_apply_report(report: &ApplyReport) {
    for (name, outcome) in &report.applied {
        tracing::info!(collector = %name, outcome = ?outcome, "collector section applied");
    }
    for name in &report.removed {
        tracing::info!(collector = %name, "collector section removed");
    }
    if report.is_clean() {
        tracing::info!(
            applied = report.applied.len(),
            removed = report.removed.len(),
            "configuration reloaded"
        );
    } else {
        tracing::warn!(
            applied = report.applied.len(),
            failed = report.failed.len(),
            removed = report.removed.len(),
            "configuration reloaded with failures"
        );
    }
}

/// Open the checkpoint store selected by `[checkpoint].backend`.
/// Open the configured checkpoint store.
///
/// A corrupted store file is moved aside and audited; collectors then
/// subscribe from their oldest records.
fn open_checkpoint_store(
    config: &SysbeatConfig,
    audit: &dyn AuditSink,
) -> Result<Arc<dyn CheckpointStore>> {
    match config.checkpoint.backend.as_str() {
        "memory" => {
            tracing::warn!("using in-memory checkpoint store, progress is lost on restart");
            Ok(Arc::new(MemoryCheckpointStore::new()))
        }
        "file" => {
            let path = config.checkpoint_path();
            let (store, reset) = FileCheckpointStore::open_or_reset(&path).map_err(|e| {
                anyhow::anyhow!("failed to open checkpoint store {}: {}", path.display(), e)
            })?;
            if let Some(reset) = reset {
                let moved_to = reset
                    .moved_to
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                audit.emit(
                    AuditRecord::new(
                        AUDIT_KIND_CHECKPOINT,
                        path.display().to_string(),
                        "corrupted checkpoint store reset",
                    )
                    .with_origin(moved_to)
                    .with_error(&reset.reason),
                );
            }
            tracing::info!(path = %path.display(), "checkpoint store opened");
            Ok(Arc::new(store))
        }
        other => Err(anyhow::anyhow!("unknown checkpoint backend '{}'", other)),
    }
}

/// Best-effort primary address of this host for the export `addr` field.
///
/// Connecting a UDP socket sends nothing; it only selects the outbound
/// interface.
fn local_addr() -> String {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("192.0.2.1:9")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_owned())
}

enum DaemonSignal {
    Shutdown(&'static str),
    Reload,
}

#[cfg(unix)]
struct SignalListener {
    sigterm: tokio::signal::unix::Signal,
    sigint: tokio::signal::unix::Signal,
    sighup: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl SignalListener {
    fn install() -> Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        let sigterm = signal(SignalKind::terminate())
            .map_err(|e| anyhow::anyhow!("failed to install SIGTERM handler: {}", e))?;
        let sigint = signal(SignalKind::interrupt())
            .map_err(|e| anyhow::anyhow!("failed to install SIGINT handler: {}", e))?;
        let sighup = signal(SignalKind::hangup())
            .map_err(|e| anyhow::anyhow!("failed to install SIGHUP handler: {}", e))?;
        Ok(Self {
            sigterm,
            sigint,
            sighup,
        })
    }

    async fn recv(&mut self) -> DaemonSignal {
        tokio::select! {
            _ = self.sigterm.recv() => DaemonSignal::Shutdown("SIGTERM"),
            _ = self.sigint.recv() => DaemonSignal::Shutdown("SIGINT"),
            _ = self.sighup.recv() => DaemonSignal::Reload,
        }
    }
}

#[cfg(not(unix))]
struct SignalListener;

#[cfg(not(unix))]
impl SignalListener {
    fn install() -> Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> DaemonSignal {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
        }
        DaemonSignal::Shutdown("CTRL-C")
    }
}

/// Write the current process PID to a file.
///
/// Used to prevent duplicate daemon instances.
///
/// # Security
///
/// - Uses `create_new(true)` to atomically create file (prevents TOCTOU races)
/// - Verifies the created file is a regular file
/// - Creates parent directory with restrictive permissions (0o700)
///
/// # Errors
///
/// Returns an error if the PID file exists or cannot be written.
pub fn write_pid_file(path: &Path) -> Result<()> {
    use std::fs::{self, OpenOptions};
    use std::io::{ErrorKind, Write};

    if let Some(parent) = path.parent() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            let mut builder = fs::DirBuilder::new();
            builder.mode(0o700).recursive(true);
            builder.create(parent)?;
        }
        #[cfg(not(unix))]
        {
            fs::create_dir_all(parent)?;
        }
    }

    let pid = std::process::id();

    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            let existing_pid = fs::read_to_string(path).unwrap_or_else(|_| "unknown".to_owned());
            return Err(anyhow::anyhow!(
                "PID file {} already exists with PID: {}. Is another instance running?",
                path.display(),
                existing_pid.trim()
            ));
        }
        Err(e) => return Err(e.into()),
    };

    let metadata = file.metadata()?;
    if !metadata.is_file() {
        let _ = fs::remove_file(path);
        return Err(anyhow::anyhow!(
            "PID file {} is not a regular file",
            path.display()
        ));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }

    writeln!(file, "{}", pid)?;

    tracing::info!(pid = pid, path = %path.display(), "PID file written");
    Ok(())
}

/// Remove the PID file on daemon shutdown.
///
/// Logs a warning but does not fail if the file cannot be removed.
pub fn remove_pid_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        tracing::warn!(
            path = %path.display(),
            error = %e,
            "failed to remove PID file"
        );
    } else {
        tracing::info!(path = %path.display(), "PID file removed");
    }
}

/// Record daemon-level metrics (build info, collectors registered).
fn record_daemon_metrics(collector_count: usize) {
    use sysbeat_core::metrics as m;

    metrics::gauge!(m::DAEMON_BUILD_INFO, "version" => env!("CARGO_PKG_VERSION")).set(1.0);

    #[allow(clippy::cast_precision_loss)]
    metrics::gauge!(m::DAEMON_COLLECTORS_REGISTERED).set(collector_count as f64);

    tracing::debug!(
        collector_count = collector_count,
        version = env!("CARGO_PKG_VERSION"),
        "daemon metrics recorded"
    );
}

/// Spawn a background task that periodically updates the uptime metric.
fn spawn_uptime_updater(
    start_time: Instant,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    use sysbeat_core::metrics as m;

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let uptime_secs = start_time.elapsed().as_secs();
                    #[allow(clippy::cast_precision_loss)]
                    metrics::gauge!(m::DAEMON_UPTIME_SECONDS).set(uptime_secs as f64);
                }
                _ = shutdown_rx.recv() => {
                    tracing::debug!("uptime updater shutting down");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sysbeat_core::audit::MemoryAuditSink;

    fn memory_config() -> SysbeatConfig {
        let mut config = SysbeatConfig::default();
        config.checkpoint.backend = "memory".to_owned();
        config.general.pid_file = String::new();
        config
    }

    #[test]
    fn test_local_addr_is_an_ip() {
        let addr = local_addr();
        assert!(addr.parse::<std::net::IpAddr>().is_ok(), "got: {}", addr);
    }

    #[test]
    fn test_open_checkpoint_store_rejects_unknown_backend() {
        // Given: a config with an unsupported backend
        let mut config = memory_config();
        config.checkpoint.backend = "redis".to_owned();

        // When / Then
        let err = open_checkpoint_store(&config, &MemoryAuditSink::new())
            .err()
            .map(|e| e.to_string());
        assert!(err.is_some_and(|e| e.contains("redis")));
    }

    #[test]
    fn test_open_checkpoint_store_file_backend() {
        // Given: a file backend under a temp dir
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = memory_config();
        config.checkpoint.backend = "file".to_owned();
        config.checkpoint.path = dir.path().join("cp.json").display().to_string();

        // Then
        let audit = MemoryAuditSink::new();
        assert!(open_checkpoint_store(&config, &audit).is_ok());
        assert!(audit.records().is_empty());
    }

    #[test]
    fn test_open_checkpoint_store_resets_corrupted_file() {
        // Given: a truncated store document
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cp.json");
        std::fs::write(&path, br#"{"winlog": {"Secu"#).expect("write store");
        let mut config = memory_config();
        config.checkpoint.backend = "file".to_owned();
        config.checkpoint.path = path.display().to_string();

        // When
        let audit = MemoryAuditSink::new();
        let store = open_checkpoint_store(&config, &audit).expect("corruption is not fatal");

        // Then: the store starts empty, the file is kept aside, and the reset is audited
        let key = sysbeat_core::checkpoint::CheckpointKey::new("winlog", "Security");
        assert!(store.get(&key).expect("get").is_none());
        assert!(dir.path().join("cp.json.corrupt").exists());

        let records = audit.records_of(AUDIT_KIND_CHECKPOINT);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "corrupted checkpoint store reset");
        assert!(records[0].origin.ends_with("cp.json.corrupt"));
        assert!(records[0].error.is_some());
    }

    #[tokio::test]
    async fn test_spawn_uptime_updater_stops_on_shutdown() {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = spawn_uptime_updater(Instant::now(), shutdown_rx);

        let _ = shutdown_tx.send(());

        let result = tokio::time::timeout(Duration::from_millis(200), task).await;
        assert!(result.is_ok(), "uptime updater should stop within timeout");
    }

    #[tokio::test]
    async fn test_reload_without_path_fails() {
        let mut orchestrator = Orchestrator::build_from_config(memory_config())
            .await
            .expect("build");
        let err = orchestrator.reload().await.err().map(|e| e.to_string());
        assert!(err.is_some_and(|e| e.contains("no configuration file")));
    }
}
