//! Collector assembly tests.
//!
//! Tests how `[[winlog]]` / `[[dns]]` sections and their pipeline blocks are
//! turned into collector specs and dispatchers.

use std::collections::BTreeMap;
use std::sync::Arc;

use sysbeat_collector::CollectorSpec;
use sysbeat_collector::dispatch::HookOutcome;
use sysbeat_collector::winlog::LOGON_BUCKET;
use sysbeat_core::audit::{AUDIT_KIND_LOGON, MemoryAuditSink};
use sysbeat_core::checkpoint::MemoryCheckpointStore;
use sysbeat_core::config::{
    DnsSection, PipelineSection, SinkSection, SysbeatConfig, WinlogSection,
};
use sysbeat_core::event::{Event, LogEvent, NodeIdentity};
use sysbeat_daemon::modules::{self, AssemblyContext, build_dispatcher};

struct Harness {
    ctx: AssemblyContext,
    checkpoints: Arc<MemoryCheckpointStore>,
    audit: Arc<MemoryAuditSink>,
}

fn harness() -> Harness {
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let audit = Arc::new(MemoryAuditSink::new());
    let ctx = AssemblyContext {
        node: NodeIdentity::new("edge-01", "10.0.0.5"),
        checkpoints: checkpoints.clone(),
        audit: audit.clone(),
    };
    Harness {
        ctx,
        checkpoints,
        audit,
    }
}

fn hooks(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}

fn logon_event(collector: &str) -> Event {
    let mut ev = LogEvent::new(collector, "Security");
    ev.event_id = 4624;
    ev.message = "An account was successfully logged on.".to_owned();
    ev.xml = concat!(
        "<Event><EventData>",
        "<Data Name='TargetUserName'>alice</Data>",
        "<Data Name='TargetDomainName'>CORP</Data>",
        "<Data Name='IpAddress'>10.1.2.3</Data>",
        "<Data Name='IpPort'>51000</Data>",
        "</EventData></Event>"
    )
    .to_owned();
    Event::Log(ev)
}

#[test]
fn test_empty_pipeline_builds_bare_dispatcher() {
    let h = harness();

    let dispatcher =
        build_dispatcher("security", &PipelineSection::default(), &h.ctx).expect("should build");

    assert_eq!(dispatcher.source(), "security");
    assert_eq!(dispatcher.stage_count(), 0);
    assert!(dispatcher.hooks().is_empty());
}

#[test]
fn test_sinks_become_stages_in_order() {
    // Given: Two sinks
    let h = harness();
    let pipeline = PipelineSection {
        sinks: vec![SinkSection::Tracing, SinkSection::Stdout],
        hooks: BTreeMap::new(),
    };

    // When
    let dispatcher = build_dispatcher("security", &pipeline, &h.ctx).expect("should build");

    // Then
    assert_eq!(dispatcher.stage_count(), 2);
}

#[test]
fn test_file_sink_writes_json_lines_with_node_identity() {
    // Given: A file sink in a directory that does not exist yet
    let h = harness();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("out").join("security.jsonl");
    let pipeline = PipelineSection {
        sinks: vec![SinkSection::File {
            path: path.display().to_string(),
        }],
        hooks: BTreeMap::new(),
    };
    let dispatcher = build_dispatcher("security", &pipeline, &h.ctx).expect("should build");

    // When: Dispatching two events
    let mut ev = LogEvent::new("security", "Security");
    ev.event_id = 4688;
    let event = Event::Log(ev);
    assert!(dispatcher.dispatch(&event).is_clean());
    assert!(dispatcher.dispatch(&event).is_clean());

    // Then: One JSON object per line, stamped with the node
    let content = std::fs::read_to_string(&path).expect("sink file should exist");
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 2);
    let record: serde_json::Value = serde_json::from_str(lines[0]).expect("valid json");
    assert_eq!(record["node_id"], "edge-01");
    assert_eq!(record["event_id"], 4688);
}

#[test]
fn test_hooks_resolve_by_id_and_fallback() {
    // Given: A logon hook on 4624 and a trace fallback
    let h = harness();
    let pipeline = PipelineSection {
        sinks: Vec::new(),
        hooks: hooks(&[("4624", "logon"), ("default", "trace")]),
    };

    // When
    let dispatcher = build_dispatcher("security", &pipeline, &h.ctx).expect("should build");

    // Then
    let table = dispatcher.hooks();
    assert_eq!(table.len(), 1);
    assert!(table.has_fallback());
    assert_eq!(table.resolve(Some(4624)).map(|hook| hook.name()), Some("logon"));
    assert_eq!(table.resolve(Some(1)).map(|hook| hook.name()), Some("trace"));
}

#[test]
fn test_unknown_hook_name_is_rejected() {
    let h = harness();
    let pipeline = PipelineSection {
        sinks: Vec::new(),
        hooks: hooks(&[("4624", "nonexistent")]),
    };

    let err = build_dispatcher("security", &pipeline, &h.ctx).expect_err("should fail");

    let msg = err.to_string();
    assert!(msg.contains("unknown hook"), "got: {}", msg);
    assert!(msg.contains("security"), "got: {}", msg);
}

#[test]
fn test_non_numeric_hook_key_is_rejected() {
    let h = harness();
    let pipeline = PipelineSection {
        sinks: Vec::new(),
        hooks: hooks(&[("logon", "logon")]),
    };

    let err = build_dispatcher("security", &pipeline, &h.ctx).expect_err("should fail");
    assert!(err.to_string().contains("hook key 'logon'"), "got: {}", err);
}

#[test]
fn test_assembled_logon_hook_audits_and_records() {
    // Given: A dispatcher with the logon hook on 4624
    let h = harness();
    let pipeline = PipelineSection {
        sinks: Vec::new(),
        hooks: hooks(&[("4624", "logon")]),
    };
    let dispatcher = build_dispatcher("security", &pipeline, &h.ctx).expect("should build");

    // When: A logon event passes through
    let report = dispatcher.dispatch(&logon_event("security"));

    // Then: The hook succeeded, audited the logon, and stored a record
    assert_eq!(report.hook, HookOutcome::Succeeded);
    let records = h.audit.records_of(AUDIT_KIND_LOGON);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].subject, "logon success");
    assert_eq!(records[0].user.as_deref(), Some("alice"));
    assert_eq!(records[0].remote_port, Some(51000));
    assert_eq!(h.checkpoints.keys_of(LOGON_BUCKET).len(), 1);
}

#[test]
fn test_winlog_spec_rejects_section_without_channels() {
    let h = harness();
    let section = WinlogSection {
        name: "security".to_owned(),
        ..WinlogSection::default()
    };

    let err = modules::winlog::spec(&section, &h.ctx).expect_err("should fail");
    assert!(err.to_string().contains("channels"), "got: {}", err);
}

#[test]
fn test_dns_spec_rejects_tcp_bind() {
    let h = harness();
    let section = DnsSection {
        name: "dns-edge".to_owned(),
        bind: "tcp://0.0.0.0/?port=53".to_owned(),
        ..DnsSection::default()
    };

    let err = modules::dns::spec(&section, &h.ctx).expect_err("should fail");
    assert!(err.to_string().contains("dns-edge"), "got: {}", err);
}

#[test]
fn test_collector_specs_winlog_first_in_file_order() {
    // Given: Two winlog and one dns section
    let h = harness();
    let config = SysbeatConfig::parse(
        r#"
[[dns]]
name = "dns-edge"
bind = "udp://127.0.0.1/?port=53"

[[winlog]]
name = "security"
channels = ["Security"]

[[winlog]]
name = "system"
channels = ["System"]
"#,
    )
    .expect("should parse");

    // When
    let specs = modules::collector_specs(&config, &h.ctx).expect("should build");

    // Then
    let names: Vec<(&str, &str)> = specs.iter().map(|s| (s.name(), s.kind())).collect();
    assert_eq!(
        names,
        vec![("security", "winlog"), ("system", "winlog"), ("dns-edge", "dns")]
    );
    assert!(matches!(specs[2], CollectorSpec::Dns { .. }));
}
