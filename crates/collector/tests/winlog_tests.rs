//! 통합 테스트 -- 이벤트 로그 수집기 구독, 재개, 재조정
//!
//! 메모리 이벤트 로그 위에서 수집기를 실제로 시작하고, 디스패처의 채널 싱크로
//! 전달된 이벤트와 체크포인트 저장소의 북마크를 검증합니다.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use sysbeat_collector::dispatch::{ChannelSink, Dispatcher};
use sysbeat_collector::winlog::{MemoryEventLog, MemoryRecord, WinlogCollector};
use sysbeat_collector::{WinlogConfig, WinlogConfigBuilder};
use sysbeat_core::audit::{AUDIT_KIND_WINLOG, MemoryAuditSink};
use sysbeat_core::checkpoint::{CheckpointKey, CheckpointStore, MemoryCheckpointStore};
use sysbeat_core::collector::{Collector, HealthStatus};
use sysbeat_core::error::CheckpointError;
use sysbeat_core::event::{Event, LogEvent};

const COLLECTOR: &str = "winlog-test";
const WAIT: Duration = Duration::from_secs(2);

struct Harness {
    log: Arc<MemoryEventLog>,
    store: Arc<MemoryCheckpointStore>,
    audit: Arc<MemoryAuditSink>,
    events: mpsc::Receiver<Event>,
    dispatcher: Arc<Dispatcher>,
}

fn harness() -> Harness {
    let (tx, events) = mpsc::channel(256);
    let dispatcher =
        Arc::new(Dispatcher::new(COLLECTOR).with_stage(Arc::new(ChannelSink::new("capture", tx))));
    Harness {
        log: Arc::new(MemoryEventLog::new()),
        store: Arc::new(MemoryCheckpointStore::new()),
        audit: Arc::new(MemoryAuditSink::new()),
        events,
        dispatcher,
    }
}

fn config(channels: &[&str]) -> WinlogConfig {
    WinlogConfigBuilder::new(COLLECTOR)
        .channels(channels.iter().copied())
        .build()
        .expect("valid config")
}

fn collector(h: &Harness, config: WinlogConfig) -> WinlogCollector {
    WinlogCollector::builder(config, h.log.clone())
        .dispatcher(h.dispatcher.clone())
        .checkpoints(h.store.clone())
        .audit(h.audit.clone())
        .build()
        .expect("collector builds")
}

async fn next_log(events: &mut mpsc::Receiver<Event>) -> LogEvent {
    match tokio::time::timeout(WAIT, events.recv()).await {
        Ok(Some(Event::Log(ev))) => ev,
        other => panic!("expected a log event, got {other:?}"),
    }
}

async fn assert_quiet(events: &mut mpsc::Receiver<Event>) {
    let extra = tokio::time::timeout(Duration::from_millis(150), events.recv()).await;
    assert!(extra.is_err(), "unexpected event: {extra:?}");
}

/// 체크포인트가 기대값이 될 때까지 기다립니다 (디스패치 후 기록되므로).
async fn wait_for_checkpoint(store: &MemoryCheckpointStore, channel: &str, expected: &str) {
    let key = CheckpointKey::new(COLLECTOR, channel);
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let current = store.get(&key).expect("memory store never fails");
        if current.as_deref() == Some(expected.as_bytes()) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "checkpoint for {channel} never reached {expected}, last {:?}",
            current.map(String::from_utf8)
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn append_n(log: &MemoryEventLog, channel: &str, n: u64) {
    for i in 0..n {
        log.append(channel, MemoryRecord::new("Service Control Manager", 7000 + i));
    }
}

#[tokio::test]
async fn test_checkpoint_tracks_last_delivered_event() {
    let mut h = harness();
    append_n(&h.log, "Application", 3);

    let mut c = collector(&h, config(&["Application"]));
    c.start().await.unwrap();

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(next_log(&mut h.events).await.record_id);
    }
    assert_eq!(ids, vec![1, 2, 3]);

    wait_for_checkpoint(
        &h.store,
        "Application",
        &MemoryEventLog::bookmark_token("Application", 3),
    )
    .await;

    // 실행 중 도착한 레코드도 같은 경로로 전달됩니다.
    let id = h
        .log
        .append("Application", MemoryRecord::new("Application Error", 1000));
    assert_eq!(next_log(&mut h.events).await.record_id, id);
    wait_for_checkpoint(
        &h.store,
        "Application",
        &MemoryEventLog::bookmark_token("Application", id),
    )
    .await;

    c.close().await;
}

#[tokio::test]
async fn test_backlog_larger_than_queue_is_delivered_in_full() {
    let mut h = harness();
    let backlog = 200;
    append_n(&h.log, "Security", backlog);

    let cfg = config(&["Security"]);
    assert!(cfg.queue_capacity < backlog as usize);
    let mut c = collector(&h, cfg);
    c.start().await.unwrap();

    for expected in 1..=backlog {
        assert_eq!(next_log(&mut h.events).await.record_id, expected);
    }
    wait_for_checkpoint(
        &h.store,
        "Security",
        &MemoryEventLog::bookmark_token("Security", backlog),
    )
    .await;

    let id = h.log.append("Security", MemoryRecord::new("Microsoft-Windows-Security-Auditing", 4624));
    assert_eq!(next_log(&mut h.events).await.record_id, id);
    wait_for_checkpoint(
        &h.store,
        "Security",
        &MemoryEventLog::bookmark_token("Security", id),
    )
    .await;

    c.close().await;
}

#[tokio::test]
async fn test_resume_from_bookmark_skips_delivered_records() {
    let mut h = harness();
    append_n(&h.log, "Application", 3);
    h.store
        .put(
            &CheckpointKey::new(COLLECTOR, "Application"),
            MemoryEventLog::bookmark_token("Application", 2).as_bytes(),
        )
        .unwrap();

    let mut c = collector(&h, config(&["Application"]));
    c.start().await.unwrap();

    assert_eq!(next_log(&mut h.events).await.record_id, 3);
    assert_quiet(&mut h.events).await;

    let audits = h.audit.records_of(AUDIT_KIND_WINLOG);
    assert!(
        audits
            .iter()
            .any(|r| r.subject == "Application last bookmark"),
        "resume must be audited: {audits:?}"
    );

    c.close().await;
}

#[tokio::test]
async fn test_corrupt_bookmark_falls_back_to_oldest() {
    let mut h = harness();
    append_n(&h.log, "System", 2);
    h.store
        .put(&CheckpointKey::new(COLLECTOR, "System"), b"not a bookmark")
        .unwrap();

    let mut c = collector(&h, config(&["System"]));
    c.start().await.expect("corrupt bookmark is not fatal");

    assert_eq!(next_log(&mut h.events).await.record_id, 1);
    assert_eq!(next_log(&mut h.events).await.record_id, 2);
    assert!(c.health_check().await.is_healthy());

    let audits = h.audit.records_of(AUDIT_KIND_WINLOG);
    assert!(audits.iter().any(|r| r.subject == "System last bookmark"));

    c.close().await;
}

#[tokio::test]
async fn test_missing_bookmark_subscribes_from_oldest_without_audit() {
    let mut h = harness();
    append_n(&h.log, "System", 2);

    let mut c = collector(&h, config(&["System"]));
    c.start().await.unwrap();

    assert_eq!(next_log(&mut h.events).await.record_id, 1);
    assert_eq!(next_log(&mut h.events).await.record_id, 2);
    assert!(
        !h.audit
            .records_of(AUDIT_KIND_WINLOG)
            .iter()
            .any(|r| r.subject.ends_with("last bookmark"))
    );

    c.close().await;
}

#[tokio::test]
async fn test_begin_ignores_stored_bookmark() {
    let mut h = harness();
    append_n(&h.log, "Application", 2);
    h.store
        .put(
            &CheckpointKey::new(COLLECTOR, "Application"),
            MemoryEventLog::bookmark_token("Application", 2).as_bytes(),
        )
        .unwrap();

    let cfg = WinlogConfigBuilder::new(COLLECTOR)
        .channels(["Application"])
        .begin(true)
        .build()
        .unwrap();
    let mut c = collector(&h, cfg);
    c.start().await.unwrap();

    assert_eq!(next_log(&mut h.events).await.record_id, 1);
    assert_eq!(next_log(&mut h.events).await.record_id, 2);

    c.close().await;
}

#[tokio::test]
async fn test_reconfigure_keeps_overlapping_subscriptions() {
    let h = harness();
    let mut c = collector(&h, config(&["Application", "System"]));
    c.start().await.unwrap();

    let before = c.watcher().unwrap().handles("Application").unwrap();

    let report = c
        .reconfigure(config(&["Application", "Security"]), h.dispatcher.clone())
        .unwrap();
    assert_eq!(report.added, vec!["Security"]);
    assert_eq!(report.removed, vec!["System"]);
    assert!(report.failed.is_empty());

    let after = c.watcher().unwrap().handles("Application").unwrap();
    assert_eq!(before, after);
    assert_eq!(c.channels(), vec!["Application", "Security"]);
    assert_eq!(h.log.subscriber_count("System"), 0);
    assert_eq!(h.log.subscriber_count("Application"), 1);

    // 같은 설정으로 다시 적용하면 아무것도 바뀌지 않습니다.
    let report = c
        .reconfigure(config(&["Application", "Security"]), h.dispatcher.clone())
        .unwrap();
    assert!(report.is_unchanged());

    c.close().await;
}

#[tokio::test]
async fn test_health_degraded_without_subscriptions() {
    let h = harness();
    h.log.fail_subscribe("Security", true);

    let mut c = collector(&h, config(&["Security"]));
    assert!(c.health_check().await.is_unhealthy());

    c.start().await.expect("subscribe failure is reported, not fatal");
    assert!(matches!(c.health_check().await, HealthStatus::Degraded(_)));

    let audits = h.audit.records_of(AUDIT_KIND_WINLOG);
    assert!(audits.iter().any(|r| r.message == "subscribe Security failed"));

    // 채널이 다시 사용 가능해지면 재조정으로 복구됩니다.
    h.log.fail_subscribe("Security", false);
    let report = c.reload_channels().unwrap();
    assert_eq!(report.added, vec!["Security"]);
    assert!(c.health_check().await.is_healthy());

    c.close().await;
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let h = harness();
    let mut c = collector(&h, config(&["Application"]));
    c.start().await.unwrap();
    assert!(c.start().await.is_err());
    c.close().await;
}

#[tokio::test]
async fn test_start_fails_when_render_context_unavailable() {
    let h = harness();
    h.log.fail_render_context(true);

    let mut c = collector(&h, config(&["Application"]));
    assert!(c.start().await.is_err());
    assert!(
        h.audit
            .records_of(AUDIT_KIND_WINLOG)
            .iter()
            .any(|r| r.message == "event log open failed")
    );
}

#[tokio::test]
async fn test_close_releases_native_handles() {
    let h = harness();
    let mut c = collector(&h, config(&["Application", "System"]));
    c.start().await.unwrap();
    assert!(h.log.open_handle_count() > 0);

    c.close().await;
    assert_eq!(h.log.open_handle_count(), 0);
    assert!(matches!(c.health_check().await, HealthStatus::Unhealthy(_)));

    // 두 번째 close는 아무것도 하지 않습니다.
    c.close().await;
}

struct FailingStore;

impl CheckpointStore for FailingStore {
    fn get(&self, _key: &CheckpointKey) -> Result<Option<Vec<u8>>, CheckpointError> {
        Ok(None)
    }

    fn put(&self, key: &CheckpointKey, _value: &[u8]) -> Result<(), CheckpointError> {
        Err(CheckpointError::Write {
            key: key.to_string(),
            reason: "disk full".to_owned(),
        })
    }
}

#[tokio::test]
async fn test_checkpoint_write_failure_is_audited() {
    let mut h = harness();
    append_n(&h.log, "Application", 1);

    let mut c = WinlogCollector::builder(config(&["Application"]), h.log.clone())
        .dispatcher(h.dispatcher.clone())
        .checkpoints(Arc::new(FailingStore))
        .audit(h.audit.clone())
        .build()
        .unwrap();
    c.start().await.unwrap();

    // 이벤트는 체크포인트 실패와 관계없이 전달됩니다.
    assert_eq!(next_log(&mut h.events).await.record_id, 1);

    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let failed = h
            .audit
            .records_of(AUDIT_KIND_WINLOG)
            .into_iter()
            .find(|r| r.message == "checkpoint write failed");
        if let Some(record) = failed {
            assert_eq!(record.origin, "Application");
            assert!(record.error.unwrap().contains("disk full"));
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "failure never audited");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    c.close().await;
}

/// 쓰기마다 지연되는 저장소. 기록 순서를 남깁니다.
#[derive(Default)]
struct SlowStore {
    writes: std::sync::Mutex<Vec<Vec<u8>>>,
}

impl CheckpointStore for SlowStore {
    fn get(&self, _key: &CheckpointKey) -> Result<Option<Vec<u8>>, CheckpointError> {
        Ok(None)
    }

    fn put(&self, _key: &CheckpointKey, value: &[u8]) -> Result<(), CheckpointError> {
        std::thread::sleep(Duration::from_millis(5));
        self.writes.lock().unwrap().push(value.to_vec());
        Ok(())
    }
}

#[tokio::test]
async fn test_slow_checkpoint_writes_keep_delivery_order() {
    let mut h = harness();
    append_n(&h.log, "System", 5);
    let store = Arc::new(SlowStore::default());

    let mut c = WinlogCollector::builder(config(&["System"]), h.log.clone())
        .dispatcher(h.dispatcher.clone())
        .checkpoints(store.clone())
        .audit(h.audit.clone())
        .build()
        .unwrap();
    c.start().await.unwrap();

    for expected in 1..=5 {
        assert_eq!(next_log(&mut h.events).await.record_id, expected);
    }

    let deadline = tokio::time::Instant::now() + WAIT;
    while store.writes.lock().unwrap().len() < 5 {
        assert!(tokio::time::Instant::now() < deadline, "checkpoint writes never finished");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let expected: Vec<Vec<u8>> = (1..=5)
        .map(|id| MemoryEventLog::bookmark_token("System", id).into_bytes())
        .collect();
    assert_eq!(*store.writes.lock().unwrap(), expected);

    c.close().await;
}
