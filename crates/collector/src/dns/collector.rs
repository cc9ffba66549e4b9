//! DNS 패킷 수집기
//!
//! # 수신 루프
//! ```text
//! recv -> UDP 헤더 -> ACL(출발지 포트) -> 스크래치 버퍼 복사 -> decode
//!      -> Transaction(+지역) -> Dispatcher -> 스크래치 버퍼 반환
//! ```
//!
//! - ACL은 디코딩 전에 평가합니다. 걸러진 데이터그램은 디코더를 호출하지 않습니다.
//! - 수신 에러, 헤더 에러, 디코딩 에러는 루프를 멈추지 않습니다.
//! - 종료는 워커 취소로 소켓을 닫아 대기 중인 수신을 풀어 줍니다.

use std::sync::Arc;

use metrics::counter;
use sysbeat_core::collector::{Collector, HealthStatus};
use sysbeat_core::error::{SourceError, SysbeatError};
use sysbeat_core::event::{Event, Transaction};
use sysbeat_core::filter::FilterPolicy;
use sysbeat_core::metrics as m;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::bind::BindSpec;
use super::decoder::{DnsDecoder, MessageDecoder};
use super::pool::BufferPool;
use super::reader::DatagramReader;
use super::region::GeoLookup;
use super::udp::UdpHeader;
use crate::config::DnsConfig;
use crate::dispatch::Dispatcher;
use crate::error::CollectorError;
use crate::supervisor::{CollectorStatus, LiveConfig, LiveReceiver, LiveSender, WorkerHandle};

/// 수집기 종류명
pub const DNS_KIND: &str = "dns";

/// DNS 패킷 수집기
pub struct DnsCollector {
    name: String,
    status: CollectorStatus,
    live: LiveSender<DnsConfig>,
    decoder: Arc<dyn MessageDecoder>,
    pool: Arc<BufferPool>,
    replay: Option<DatagramReader>,
    worker: Option<WorkerHandle>,
    bound: Option<BindSpec>,
}

impl DnsCollector {
    /// 빌더를 생성합니다.
    pub fn builder(config: DnsConfig) -> DnsCollectorBuilder {
        DnsCollectorBuilder::new(config)
    }

    /// 현재 상태
    pub fn status(&self) -> &CollectorStatus {
        &self.status
    }

    /// 현재 설정 스냅샷
    pub fn config(&self) -> Arc<LiveConfig<DnsConfig>> {
        self.live.borrow().clone()
    }

    /// 다음 `start()`에서 raw 소켓 대신 사용할 리더를 지정합니다.
    pub fn set_reader(&mut self, reader: DatagramReader) {
        self.replay = Some(reader);
    }

    /// 설정과 디스패처를 교체하고 실행 중인 소켓을 재조정합니다.
    ///
    /// 포트 목록과 지역 테이블, 디스패처는 워커의 다음 반복부터 반영됩니다.
    /// 바인드 호스트나 주소 패밀리가 바뀌면 소켓을 다시 엽니다.
    pub async fn reconfigure(
        &mut self,
        config: DnsConfig,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<(), CollectorError> {
        config.validate()?;
        self.live.send_replace(LiveConfig::new(config, dispatcher));
        self.rebind_if_needed().await
    }

    async fn rebind_if_needed(&mut self) -> Result<(), CollectorError> {
        if self.status != CollectorStatus::Running {
            return Ok(());
        }
        let desired = self.live.borrow().config.bind.clone();
        let unchanged = self.bound.as_ref().is_some_and(|b| b.host == desired.host);
        if unchanged {
            debug!(collector = %self.name, "bind host unchanged, keeping socket");
            return Ok(());
        }

        info!(collector = %self.name, bind = %desired, "bind host changed, reopening socket");
        self.stop_worker().await;
        self.spawn_worker()
    }

    fn spawn_worker(&mut self) -> Result<(), CollectorError> {
        let live = self.live.subscribe();
        let (bind, recv_buffer_size) = {
            let snapshot = live.borrow();
            (snapshot.config.bind.clone(), snapshot.config.recv_buffer_size)
        };

        let reader = match self.replay.take() {
            Some(reader) => reader,
            None => DatagramReader::open(&bind, recv_buffer_size).map_err(|e| {
                CollectorError::SourceOpen {
                    source_type: DNS_KIND.to_owned(),
                    reason: format!("{bind}: {e}"),
                }
            })?,
        };

        let cancel = CancellationToken::new();
        let worker = AcceptLoop {
            name: self.name.clone(),
            host: bind.host.to_string(),
            reader,
            live,
            decoder: Arc::clone(&self.decoder),
            pool: Arc::clone(&self.pool),
            buf: vec![0u8; recv_buffer_size],
        };
        let token = cancel.clone();
        self.worker = Some(WorkerHandle::spawn(self.name.clone(), cancel, async move {
            worker.run(token).await;
        }));
        self.bound = Some(bind);
        Ok(())
    }

    async fn stop_worker(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.shutdown().await;
        }
        self.bound = None;
    }
}

impl Collector for DnsCollector {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        DNS_KIND
    }

    async fn start(&mut self) -> Result<(), SysbeatError> {
        if self.status == CollectorStatus::Running {
            return Err(SourceError::AlreadyRunning {
                name: self.name.clone(),
            }
            .into());
        }

        self.spawn_worker()?;
        self.status = CollectorStatus::Running;
        info!(
            collector = %self.name,
            bind = ?self.bound.as_ref().map(ToString::to_string),
            "dns collector started"
        );
        Ok(())
    }

    async fn reload(&mut self) -> Result<(), SysbeatError> {
        self.rebind_if_needed().await.map_err(SysbeatError::from)
    }

    async fn close(&mut self) {
        if self.status != CollectorStatus::Running {
            return;
        }
        self.stop_worker().await;
        self.status = CollectorStatus::Stopped;
        info!(collector = %self.name, "dns collector stopped");
    }

    async fn health_check(&self) -> HealthStatus {
        match self.status {
            CollectorStatus::Running => match &self.worker {
                Some(worker) if worker.is_running() => HealthStatus::Healthy,
                _ => HealthStatus::Unhealthy("accept loop exited".to_owned()),
            },
            CollectorStatus::Idle => HealthStatus::Unhealthy("not started".to_owned()),
            CollectorStatus::Stopped => HealthStatus::Unhealthy("stopped".to_owned()),
        }
    }
}

/// DNS 수집기 빌더
pub struct DnsCollectorBuilder {
    config: DnsConfig,
    dispatcher: Option<Arc<Dispatcher>>,
    decoder: Option<Arc<dyn MessageDecoder>>,
    reader: Option<DatagramReader>,
}

impl DnsCollectorBuilder {
    /// 새 빌더를 생성합니다.
    pub fn new(config: DnsConfig) -> Self {
        Self {
            config,
            dispatcher: None,
            decoder: None,
            reader: None,
        }
    }

    /// 디스패처를 설정합니다. 설정하지 않으면 스테이지 없는 디스패처를 사용합니다.
    pub fn dispatcher(mut self, dispatcher: Arc<Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// 메시지 디코더를 설정합니다. 기본값은 [`DnsDecoder`]입니다.
    pub fn decoder(mut self, decoder: Arc<dyn MessageDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    /// raw 소켓 대신 사용할 리더를 설정합니다.
    pub fn reader(mut self, reader: DatagramReader) -> Self {
        self.reader = Some(reader);
        self
    }

    /// 설정을 검증하고 수집기를 생성합니다.
    pub fn build(self) -> Result<DnsCollector, CollectorError> {
        self.config.validate()?;

        let name = self.config.name.clone();
        let pool = Arc::new(BufferPool::new(
            self.config.pool_capacity,
            self.config.recv_buffer_size,
        ));
        let dispatcher = self
            .dispatcher
            .unwrap_or_else(|| Arc::new(Dispatcher::new(name.clone())));
        let (live, _) = watch::channel(LiveConfig::new(self.config, dispatcher));

        Ok(DnsCollector {
            name,
            status: CollectorStatus::Idle,
            live,
            decoder: self.decoder.unwrap_or_else(|| Arc::new(DnsDecoder::new())),
            pool,
            replay: self.reader,
            worker: None,
            bound: None,
        })
    }
}

struct AcceptLoop {
    name: String,
    host: String,
    reader: DatagramReader,
    live: LiveReceiver<DnsConfig>,
    decoder: Arc<dyn MessageDecoder>,
    pool: Arc<BufferPool>,
    buf: Vec<u8>,
}

impl AcceptLoop {
    async fn run(mut self, cancel: CancellationToken) {
        let mut snapshot = self.live.borrow().clone();
        let mut acl = snapshot.config.bind.acl();

        loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                r = self.reader.recv(&mut self.buf) => r,
            };

            if self.live.has_changed().unwrap_or(false) {
                snapshot = self.live.borrow_and_update().clone();
                acl = snapshot.config.bind.acl();
            }

            match received {
                Ok((n, remote)) => self.handle(&snapshot, &acl, n, remote),
                Err(e) => debug!(collector = %self.name, error = %e, "receive failed"),
            }
        }

        debug!(collector = %self.name, "accept loop exited");
    }

    fn handle(
        &self,
        snapshot: &LiveConfig<DnsConfig>,
        acl: &FilterPolicy,
        n: usize,
        remote: std::net::SocketAddr,
    ) {
        counter!(m::DNS_DATAGRAMS_TOTAL, m::LABEL_COLLECTOR => self.name.clone()).increment(1);

        let (header, payload) = match UdpHeader::parse(&self.buf[..n]) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(collector = %self.name, error = %e, "malformed udp header");
                return;
            }
        };

        if !acl.admits(u64::from(header.source_port)) {
            counter!(m::DNS_ADMISSION_MISSES_TOTAL, m::LABEL_COLLECTOR => self.name.clone())
                .increment(1);
            return;
        }

        let mut scratch = self.pool.acquire();
        scratch.extend_from_slice(payload);

        let message = match self.decoder.decode(&scratch) {
            Ok(message) => message,
            Err(e) => {
                counter!(m::DNS_DECODE_ERRORS_TOTAL, m::LABEL_COLLECTOR => self.name.clone())
                    .increment(1);
                debug!(collector = %self.name, remote = %remote, error = %e, "dns decode failed");
                self.pool.release(scratch);
                return;
            }
        };

        let region = snapshot.config.regions.lookup(remote.ip());
        let tx = Transaction::new(
            self.name.clone(),
            self.host.clone(),
            remote.ip(),
            header.source_port,
            header.destination_port,
            message,
        )
        .with_region(region)
        .with_scratch(scratch);

        let event = Event::Dns(tx);
        let report = snapshot.dispatcher.dispatch(&event);
        counter!(m::DNS_TRANSACTIONS_TOTAL, m::LABEL_COLLECTOR => self.name.clone()).increment(1);
        if !report.is_clean() {
            warn!(
                collector = %self.name,
                stage_failures = report.stage_failures,
                "dns transaction dispatched with failures"
            );
        }

        if let Event::Dns(mut tx) = event {
            if let Some(scratch) = tx.take_scratch() {
                self.pool.release(scratch);
            }
        }
    }
}
