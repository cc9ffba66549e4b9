//! Orchestrator integration tests.
//!
//! Tests the flow: config -> build -> start collectors -> health -> reload ->
//! shutdown. Collectors that need privileged sockets or the native event log
//! are exercised in the collector crate with test doubles; here the daemon
//! paths that do not depend on them are covered.

use std::path::PathBuf;

use sysbeat_core::SysbeatConfig;
use sysbeat_daemon::orchestrator::Orchestrator;

fn memory_config(extra: &str) -> SysbeatConfig {
    let toml_str = format!(
        r#"
[general]
log_level = "info"
pid_file = ""
node_id = "test-node"

[checkpoint]
backend = "memory"
{extra}
"#
    );
    SysbeatConfig::parse(&toml_str).expect("failed to parse test config")
}

fn write_config(dir: &tempfile::TempDir, config: &str) -> PathBuf {
    let path = dir.path().join("sysbeat.toml");
    std::fs::write(&path, config).expect("should write config");
    path
}

const WINLOG_SECTION: &str = r#"
[[winlog]]
name = "security"
channels = ["Security"]
"#;

#[tokio::test]
async fn test_build_with_no_collectors() {
    // Given: A config without collector sections
    let config = memory_config("");

    // When: Building and starting
    let mut orchestrator = Orchestrator::build_from_config(config)
        .await
        .expect("should build");
    orchestrator.start_collectors().await.expect("nothing to start");

    // Then: Registry is empty and the daemon is healthy
    assert!(orchestrator.registry().is_empty());
    let health = orchestrator.health().await;
    assert!(health.status.is_healthy());
    assert!(health.collectors.is_empty());
    assert_eq!(orchestrator.config().general.node_id, "test-node");

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_build_rejects_invalid_config() {
    // Given: An invalid log level
    let mut config = memory_config("");
    config.general.log_level = "verbose".to_owned();

    // When / Then
    let result = Orchestrator::build_from_config(config).await;
    assert!(result.is_err(), "invalid config should be rejected");
}

#[tokio::test]
async fn test_build_opens_file_checkpoint_store() {
    // Given: A file backend under a temp dir
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = memory_config("");
    config.checkpoint.backend = "file".to_owned();
    config.general.data_dir = dir.path().display().to_string();

    // When / Then
    let orchestrator = Orchestrator::build_from_config(config).await;
    assert!(orchestrator.is_ok(), "file checkpoint store should open");
}

#[tokio::test]
async fn test_build_survives_corrupted_checkpoint_store() {
    // Given: A truncated checkpoint document where the file backend expects it
    let dir = tempfile::tempdir().expect("tempdir");
    let store_path = dir.path().join("checkpoints.json");
    std::fs::write(&store_path, br#"{"winlog": {"Secu"#).expect("write store");
    let mut config = memory_config("");
    config.checkpoint.backend = "file".to_owned();
    config.general.data_dir = dir.path().display().to_string();

    // When: Building and starting
    let mut orchestrator = Orchestrator::build_from_config(config)
        .await
        .expect("a corrupted checkpoint store must not abort startup");
    orchestrator.start_collectors().await.expect("nothing to start");

    // Then: The damaged file is kept for inspection
    assert!(dir.path().join("checkpoints.json.corrupt").exists());
    assert!(!store_path.exists());

    orchestrator.shutdown().await;
}

#[cfg(not(windows))]
#[tokio::test]
async fn test_start_fails_without_event_log_backend() {
    // Given: A winlog section on a platform without the native event log
    let config = memory_config(WINLOG_SECTION);
    let mut orchestrator = Orchestrator::build_from_config(config)
        .await
        .expect("should build");

    // When: Starting collectors
    let err = orchestrator
        .start_collectors()
        .await
        .expect_err("winlog needs the native backend");

    // Then: Startup is rolled back
    let msg = err.to_string();
    assert!(msg.contains("security"), "got: {}", msg);
    assert!(msg.contains("no event log backend"), "got: {}", msg);
    assert!(orchestrator.registry().is_empty());
}

#[tokio::test]
async fn test_start_fails_on_unknown_hook() {
    // Given: A section that validates but names a hook that does not exist
    let config = memory_config(
        r#"
[[winlog]]
name = "security"
channels = ["Security"]

[winlog.pipeline.hooks]
"4624" = "nope"
"#,
    );
    let mut orchestrator = Orchestrator::build_from_config(config)
        .await
        .expect("should build");

    // When / Then
    let err = orchestrator.start_collectors().await.expect_err("should fail");
    assert!(err.to_string().contains("unknown hook"), "got: {}", err);
    assert!(orchestrator.registry().is_empty());
}

#[cfg(not(windows))]
#[tokio::test]
async fn test_apply_config_reports_failures_and_keeps_running() {
    // Given: A running daemon with no collectors
    let mut orchestrator = Orchestrator::build_from_config(memory_config(""))
        .await
        .expect("should build");
    orchestrator.start_collectors().await.expect("should start");

    // When: Applying a config whose only section cannot start here
    let report = orchestrator.apply_config(memory_config(WINLOG_SECTION)).await;

    // Then: The failure is reported, nothing is registered, and the new
    // sections are now the active configuration
    assert!(!report.is_clean());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "security");
    assert!(report.applied.is_empty());
    assert!(report.removed.is_empty());
    assert_eq!(orchestrator.config().winlog.len(), 1);
}

#[tokio::test]
async fn test_apply_config_keeps_process_settings() {
    // Given: A running daemon
    let mut orchestrator = Orchestrator::build_from_config(memory_config(""))
        .await
        .expect("should build");

    // When: The new file changes node id and checkpoint backend
    let mut next = memory_config("");
    next.general.node_id = "renamed".to_owned();
    next.checkpoint.backend = "file".to_owned();
    let report = orchestrator.apply_config(next).await;

    // Then: Those need a restart and stay as they were
    assert!(report.is_clean());
    assert_eq!(orchestrator.config().general.node_id, "test-node");
    assert_eq!(orchestrator.config().checkpoint.backend, "memory");
}

#[tokio::test]
async fn test_reload_reads_config_file() {
    // Given: A daemon built from a file
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_config(
        &dir,
        "[general]\npid_file = \"\"\n[checkpoint]\nbackend = \"memory\"\n",
    );
    let mut orchestrator = Orchestrator::build(&path).await.expect("should build");

    // When: The file becomes invalid and a reload is requested
    std::fs::write(&path, "[general\nbroken").expect("should rewrite");
    let result = orchestrator.reload().await;

    // Then: The reload fails and the daemon keeps its configuration
    assert!(result.is_err());
    assert!(orchestrator.registry().is_empty());

    // When: The file is fixed again
    std::fs::write(
        &path,
        "[general]\npid_file = \"\"\n[checkpoint]\nbackend = \"memory\"\n",
    )
    .expect("should rewrite");
    let report = orchestrator.reload().await.expect("reload should succeed");

    // Then
    assert!(report.is_clean());
}

#[tokio::test]
async fn test_build_missing_config_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let result = Orchestrator::build(&dir.path().join("absent.toml")).await;
    let err = result.err().map(|e| e.to_string()).unwrap_or_default();
    assert!(err.contains("failed to load config"), "got: {}", err);
}
