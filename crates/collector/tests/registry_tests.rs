//! 통합 테스트 -- 수집기 레지스트리 생성, 갱신, 교체, 제거

use std::collections::BTreeSet;
use std::sync::Arc;

use sysbeat_collector::dispatch::Dispatcher;
use sysbeat_collector::dns::{DatagramReader, DnsCollector};
use sysbeat_collector::winlog::MemoryEventLog;
use sysbeat_collector::{
    CollectorEnv, CollectorRegistry, CollectorSpec, DnsConfigBuilder, ManagedCollector,
    ReconfigureOutcome, WinlogConfigBuilder,
};
use sysbeat_core::collector::{Collector, HealthStatus};

fn env(log: &Arc<MemoryEventLog>) -> CollectorEnv {
    CollectorEnv::default().with_event_log(log.clone())
}

fn winlog_spec(name: &str, channels: &[&str]) -> CollectorSpec {
    CollectorSpec::Winlog {
        config: WinlogConfigBuilder::new(name)
            .channels(channels.iter().copied())
            .build()
            .unwrap(),
        dispatcher: Arc::new(Dispatcher::new(name)),
    }
}

fn dns_spec(name: &str, bind: &str) -> CollectorSpec {
    CollectorSpec::Dns {
        config: DnsConfigBuilder::new(name).bind(bind).build().unwrap(),
        dispatcher: Arc::new(Dispatcher::new(name)),
    }
}

/// raw 소켓 대신 재생 채널을 읽는 DNS 수집기
fn replay_dns(name: &str) -> ManagedCollector {
    let (_feed, reader) = DatagramReader::channel(1);
    let config = DnsConfigBuilder::new(name)
        .bind("udp://0.0.0.0:53")
        .build()
        .unwrap();
    ManagedCollector::Dns(DnsCollector::builder(config).reader(reader).build().unwrap())
}

#[tokio::test]
async fn test_reconfigure_creates_then_updates() {
    let log = Arc::new(MemoryEventLog::new());
    let mut registry = CollectorRegistry::new(env(&log));

    let outcome = registry
        .reconfigure(winlog_spec("security", &["Security"]))
        .await
        .unwrap();
    assert_eq!(outcome, ReconfigureOutcome::Created);
    assert_eq!(registry.names(), vec!["security"]);
    assert_eq!(log.subscriber_count("Security"), 1);

    let outcome = registry
        .reconfigure(winlog_spec("security", &["Security", "System"]))
        .await
        .unwrap();
    assert_eq!(outcome, ReconfigureOutcome::Updated);
    assert_eq!(registry.len(), 1);
    assert_eq!(log.subscriber_count("Security"), 1);
    assert_eq!(log.subscriber_count("System"), 1);

    match registry.get("security") {
        Some(ManagedCollector::Winlog(c)) => {
            assert_eq!(c.channels(), vec!["Security", "System"]);
        }
        _ => panic!("security must stay a winlog collector"),
    }

    registry.close_all().await;
    assert!(registry.is_empty());
    assert_eq!(log.open_handle_count(), 0);
}

#[tokio::test]
async fn test_dns_update_keeps_running_instance() {
    let log = Arc::new(MemoryEventLog::new());
    let mut registry = CollectorRegistry::new(env(&log));
    registry.insert(replay_dns("dns")).await.unwrap();

    let outcome = registry
        .reconfigure(dns_spec("dns", "udp://0.0.0.0/?port=53,5353"))
        .await
        .unwrap();
    assert_eq!(outcome, ReconfigureOutcome::Updated);

    let Some(ManagedCollector::Dns(c)) = registry.get("dns") else {
        panic!("dns collector missing");
    };
    assert_eq!(c.config().config.bind.ports, vec![53, 5353]);
    assert!(c.health_check().await.is_healthy());

    registry.close_all().await;
}

#[tokio::test]
async fn test_kind_change_replaces_instance() {
    let log = Arc::new(MemoryEventLog::new());
    let mut registry = CollectorRegistry::new(env(&log));
    registry.insert(replay_dns("edge")).await.unwrap();

    let outcome = registry
        .reconfigure(winlog_spec("edge", &["Application"]))
        .await
        .unwrap();
    assert_eq!(outcome, ReconfigureOutcome::Replaced);
    assert!(matches!(
        registry.get("edge"),
        Some(ManagedCollector::Winlog(_))
    ));
    assert_eq!(log.subscriber_count("Application"), 1);

    registry.close_all().await;
}

#[tokio::test]
async fn test_failed_start_is_not_registered() {
    let log = Arc::new(MemoryEventLog::new());
    log.fail_render_context(true);
    let mut registry = CollectorRegistry::new(env(&log));

    assert!(
        registry
            .reconfigure(winlog_spec("app", &["Application"]))
            .await
            .is_err()
    );
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_winlog_requires_event_log_backend() {
    let mut registry = CollectorRegistry::new(CollectorEnv::default());
    let err = registry
        .reconfigure(winlog_spec("app", &["Application"]))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no event log backend"));
    assert!(registry.get("app").is_none());
}

#[tokio::test]
async fn test_retain_removes_undeclared_collectors() {
    let log = Arc::new(MemoryEventLog::new());
    let mut registry = CollectorRegistry::new(env(&log));
    registry
        .reconfigure(winlog_spec("app", &["Application"]))
        .await
        .unwrap();
    registry
        .reconfigure(winlog_spec("sys", &["System"]))
        .await
        .unwrap();
    registry.insert(replay_dns("dns")).await.unwrap();

    let keep: BTreeSet<String> = ["app".to_owned(), "dns".to_owned()].into();
    let removed = registry.retain(&keep).await;
    assert_eq!(removed, vec!["sys"]);
    assert_eq!(registry.names(), vec!["app", "dns"]);
    assert_eq!(log.subscriber_count("System"), 0);

    assert!(registry.remove("dns").await);
    assert!(!registry.remove("dns").await);

    registry.close_all().await;
}

#[tokio::test]
async fn test_health_reports_every_collector() {
    let log = Arc::new(MemoryEventLog::new());
    log.fail_subscribe("Security", true);
    let mut registry = CollectorRegistry::new(env(&log));
    registry
        .reconfigure(winlog_spec("app", &["Application"]))
        .await
        .unwrap();
    registry
        .reconfigure(winlog_spec("sec", &["Security"]))
        .await
        .unwrap();

    let health = registry.health().await;
    assert_eq!(health.len(), 2);
    assert_eq!(health[0].0, "app");
    assert!(health[0].1.is_healthy());
    assert_eq!(health[1].0, "sec");
    assert!(matches!(health[1].1, HealthStatus::Degraded(_)));

    registry.close_all().await;
}
