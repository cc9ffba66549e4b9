//! 통합 테스트 -- DNS 수집기 수신 루프
//!
//! raw 소켓은 관리자 권한이 필요하므로 재생 채널 리더로 UDP 세그먼트를 주입합니다.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use sysbeat_collector::dispatch::{ChannelSink, Dispatcher, FnSink};
use sysbeat_collector::dns::{
    DatagramReader, Datagram, DnsCollector, DnsDecoder, MessageDecoder, RegionTable,
};
use sysbeat_collector::{CollectorError, DnsConfig, DnsConfigBuilder};
use sysbeat_core::collector::{Collector, HealthStatus};
use sysbeat_core::event::{Event, Transaction};
use sysbeat_core::types::{DnsMessage, RecordData, Region};

const WAIT: Duration = Duration::from_secs(2);

/// 디코딩 호출 횟수를 세는 디코더
#[derive(Default)]
struct CountingDecoder {
    calls: AtomicUsize,
}

impl MessageDecoder for CountingDecoder {
    fn decode(&self, payload: &[u8]) -> Result<DnsMessage, CollectorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        DnsDecoder::new().decode(payload)
    }
}

/// `example.com A` 응답 (10.9.8.7, TTL 300)
fn response_payload(id: u16) -> Vec<u8> {
    let mut p = Vec::new();
    p.extend_from_slice(&id.to_be_bytes());
    p.extend_from_slice(&[0x81, 0x80]); // QR RD RA
    p.extend_from_slice(&[0, 1, 0, 1, 0, 0, 0, 0]);
    p.extend_from_slice(b"\x07example\x03com\x00");
    p.extend_from_slice(&[0, 1, 0, 1]);
    p.extend_from_slice(&[0xc0, 0x0c]); // 질의 이름 포인터
    p.extend_from_slice(&[0, 1, 0, 1]);
    p.extend_from_slice(&300u32.to_be_bytes());
    p.extend_from_slice(&[0, 4, 10, 9, 8, 7]);
    p
}

fn segment(source_port: u16, destination_port: u16, payload: &[u8]) -> Bytes {
    let mut s = Vec::with_capacity(8 + payload.len());
    s.extend_from_slice(&source_port.to_be_bytes());
    s.extend_from_slice(&destination_port.to_be_bytes());
    s.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    s.extend_from_slice(&[0, 0]);
    s.extend_from_slice(payload);
    Bytes::from(s)
}

fn datagram(remote: &str, source_port: u16, payload: &[u8]) -> Datagram {
    let ip: IpAddr = remote.parse().unwrap();
    (segment(source_port, 40000, payload), SocketAddr::new(ip, 0))
}

fn config(bind: &str, regions: RegionTable) -> DnsConfig {
    DnsConfigBuilder::new("dns-test")
        .bind(bind)
        .regions(regions)
        .build()
        .expect("valid config")
}

struct Harness {
    collector: DnsCollector,
    feed: mpsc::Sender<Datagram>,
    events: mpsc::Receiver<Event>,
    decoder: Arc<CountingDecoder>,
}

async fn started(config: DnsConfig) -> Harness {
    let (tx, events) = mpsc::channel(64);
    let dispatcher = Arc::new(
        Dispatcher::new("dns-test").with_stage(Arc::new(ChannelSink::new("capture", tx))),
    );
    let decoder = Arc::new(CountingDecoder::default());
    let (feed, reader) = DatagramReader::channel(64);

    let mut collector = DnsCollector::builder(config)
        .dispatcher(dispatcher)
        .decoder(decoder.clone())
        .reader(reader)
        .build()
        .unwrap();
    collector.start().await.unwrap();

    Harness {
        collector,
        feed,
        events,
        decoder,
    }
}

async fn next_tx(events: &mut mpsc::Receiver<Event>) -> Transaction {
    match tokio::time::timeout(WAIT, events.recv()).await {
        Ok(Some(Event::Dns(tx))) => tx,
        other => panic!("expected a dns transaction, got {other:?}"),
    }
}

async fn assert_quiet(events: &mut mpsc::Receiver<Event>) {
    let extra = tokio::time::timeout(Duration::from_millis(150), events.recv()).await;
    assert!(extra.is_err(), "unexpected event: {extra:?}");
}

#[tokio::test]
async fn test_admitted_datagram_becomes_one_transaction() {
    let mut h = started(config("udp://0.0.0.0:53", RegionTable::new())).await;

    h.feed
        .send(datagram("192.0.2.10", 53, &response_payload(0x1234)))
        .await
        .unwrap();

    let tx = next_tx(&mut h.events).await;
    assert_eq!(tx.collector, "dns-test");
    assert_eq!(tx.host, "0.0.0.0");
    assert_eq!(tx.remote, "192.0.2.10".parse::<IpAddr>().unwrap());
    assert_eq!(tx.source_port, 53);
    assert_eq!(tx.destination_port, 40000);
    assert_eq!(tx.message.header.id, 0x1234);
    assert!(tx.message.header.response);
    assert_eq!(tx.message.questions[0].name, "example.com");
    assert_eq!(
        tx.message.answers[0].data,
        RecordData::A("10.9.8.7".parse().unwrap())
    );
    assert!(tx.message.compressed);
    assert_eq!(tx.payload(), response_payload(0x1234).as_slice());
    assert!(tx.region.is_none());

    assert_quiet(&mut h.events).await;
    h.collector.close().await;
}

#[tokio::test]
async fn test_acl_miss_skips_decoder() {
    let mut h = started(config("udp://0.0.0.0/?port=53,5353", RegionTable::new())).await;

    h.feed
        .send(datagram("192.0.2.10", 443, &response_payload(1)))
        .await
        .unwrap();
    h.feed
        .send(datagram("192.0.2.10", 5353, &response_payload(2)))
        .await
        .unwrap();

    // 같은 채널에서 순서대로 처리되므로 두 번째가 도착하면 첫 번째는 이미 걸러졌습니다.
    let tx = next_tx(&mut h.events).await;
    assert_eq!(tx.message.header.id, 2);
    assert_eq!(h.decoder.calls.load(Ordering::SeqCst), 1);

    assert_quiet(&mut h.events).await;
    h.collector.close().await;
}

#[tokio::test]
async fn test_single_port_overrides_port_list() {
    let mut h = started(config("udp://0.0.0.0:53/?port=5353", RegionTable::new())).await;

    h.feed
        .send(datagram("192.0.2.10", 5353, &response_payload(1)))
        .await
        .unwrap();
    h.feed
        .send(datagram("192.0.2.10", 53, &response_payload(2)))
        .await
        .unwrap();

    assert_eq!(next_tx(&mut h.events).await.message.header.id, 2);
    assert_eq!(h.decoder.calls.load(Ordering::SeqCst), 1);
    h.collector.close().await;
}

#[tokio::test]
async fn test_decode_errors_do_not_stop_the_loop() {
    let mut h = started(config("udp://0.0.0.0:53", RegionTable::new())).await;

    // 헤더보다 짧은 세그먼트, 잘린 DNS 헤더
    h.feed
        .send((Bytes::from_static(b"\x00\x35"), "192.0.2.1:0".parse().unwrap()))
        .await
        .unwrap();
    h.feed
        .send(datagram("192.0.2.1", 53, &[0x12, 0x34, 0x81]))
        .await
        .unwrap();
    h.feed
        .send(datagram("192.0.2.1", 53, &response_payload(7)))
        .await
        .unwrap();

    assert_eq!(next_tx(&mut h.events).await.message.header.id, 7);
    assert_eq!(h.decoder.calls.load(Ordering::SeqCst), 2);
    assert!(h.collector.health_check().await.is_healthy());
    h.collector.close().await;
}

#[tokio::test]
async fn test_region_lookup_uses_longest_prefix() {
    let mut regions = RegionTable::new();
    regions
        .insert(
            "10.0.0.0/8",
            Region {
                country: "internal".to_owned(),
                ..Default::default()
            },
        )
        .unwrap();
    regions
        .insert(
            "10.20.0.0/16",
            Region {
                country: "internal".to_owned(),
                city: "lab".to_owned(),
                ..Default::default()
            },
        )
        .unwrap();

    let mut h = started(config("udp://0.0.0.0:53", regions)).await;
    for remote in ["10.20.1.1", "10.30.1.1", "203.0.113.5"] {
        h.feed
            .send(datagram(remote, 53, &response_payload(1)))
            .await
            .unwrap();
    }

    let lab = next_tx(&mut h.events).await;
    assert_eq!(lab.region.unwrap().city, "lab");
    let internal = next_tx(&mut h.events).await;
    let internal = internal.region.unwrap();
    assert_eq!(internal.country, "internal");
    assert!(internal.city.is_empty());
    assert!(next_tx(&mut h.events).await.region.is_none());

    h.collector.close().await;
}

#[tokio::test]
async fn test_stage_failure_does_not_block_later_stages() {
    let (tx, mut events) = mpsc::channel(8);
    let dispatcher = Arc::new(
        Dispatcher::new("dns-test")
            .with_stage(Arc::new(FnSink::new("broken", |_: &Event| {
                Err(CollectorError::sink("broken", "unavailable"))
            })))
            .with_stage(Arc::new(FnSink::new("panics", |_: &Event| -> Result<(), CollectorError> {
                panic!("stage bug")
            })))
            .with_stage(Arc::new(ChannelSink::new("capture", tx))),
    );
    let (feed, reader) = DatagramReader::channel(8);
    let mut collector = DnsCollector::builder(config("udp://0.0.0.0:53", RegionTable::new()))
        .dispatcher(dispatcher)
        .reader(reader)
        .build()
        .unwrap();
    collector.start().await.unwrap();

    feed.send(datagram("192.0.2.1", 53, &response_payload(3)))
        .await
        .unwrap();
    assert_eq!(next_tx(&mut events).await.message.header.id, 3);
    assert!(collector.health_check().await.is_healthy());

    collector.close().await;
}

#[tokio::test]
async fn test_reconfigure_updates_acl_and_regions_in_place() {
    let mut h = started(config("udp://0.0.0.0:53", RegionTable::new())).await;

    let mut regions = RegionTable::new();
    regions
        .insert(
            "192.0.2.0/24",
            Region {
                country: "doc".to_owned(),
                ..Default::default()
            },
        )
        .unwrap();

    let (tx, mut events) = mpsc::channel(8);
    let dispatcher = Arc::new(
        Dispatcher::new("dns-test").with_stage(Arc::new(ChannelSink::new("capture-2", tx))),
    );
    h.collector
        .reconfigure(config("udp://0.0.0.0:5353", regions), dispatcher)
        .await
        .unwrap();

    // 바인드 호스트가 같으므로 재생 리더(워커)가 그대로 유지됩니다.
    assert!(h.collector.health_check().await.is_healthy());

    h.feed
        .send(datagram("192.0.2.1", 53, &response_payload(1)))
        .await
        .unwrap();
    h.feed
        .send(datagram("192.0.2.1", 5353, &response_payload(2)))
        .await
        .unwrap();

    let tx = next_tx(&mut events).await;
    assert_eq!(tx.message.header.id, 2);
    assert_eq!(tx.region.unwrap().country, "doc");
    assert!(h.events.try_recv().is_err());

    h.collector.close().await;
}

#[tokio::test]
async fn test_lifecycle_health() {
    let (_feed, reader) = DatagramReader::channel(1);
    let mut collector = DnsCollector::builder(config("udp://0.0.0.0:53", RegionTable::new()))
        .reader(reader)
        .build()
        .unwrap();

    assert!(matches!(collector.health_check().await, HealthStatus::Unhealthy(_)));
    collector.start().await.unwrap();
    assert!(collector.health_check().await.is_healthy());
    assert!(collector.start().await.is_err());

    collector.close().await;
    assert!(collector.health_check().await.is_unhealthy());
    collector.close().await;
}
