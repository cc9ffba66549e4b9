//! 이벤트 로그 수집기
//!
//! # 구독 알고리즘 (채널마다)
//! 1. `begin = true`이거나 체크포인트가 없으면 가장 오래된 레코드부터 구독
//! 2. 체크포인트가 있으면 북마크 토큰으로 재개. 로드나 재개에 실패하면 1로 대체
//! 3. 이미 구독 중인 채널은 `SubscriptionConflict`
//!
//! # 워커
//! ```text
//! select! { cancel | events.recv() | errors.recv() | sleep(backoff) }
//!   event -> Dispatcher -> 체크포인트(수집기, 채널) <- 이벤트의 북마크 토큰
//! ```
//! 체크포인트는 디스패치가 끝난 뒤에만 기록하므로 전달되지 않은 이벤트를 앞지르지 않습니다.
//! 파일 저장소의 쓰기와 fsync는 `spawn_blocking`에서 실행하고, 완료를 기다린 뒤 다음
//! 이벤트를 받습니다.

use std::collections::BTreeSet;
use std::sync::Arc;

use metrics::counter;
use sysbeat_core::audit::{AUDIT_KIND_WINLOG, AuditRecord, AuditSink, TracingAuditSink};
use sysbeat_core::checkpoint::{CheckpointKey, CheckpointStore, MemoryCheckpointStore};
use sysbeat_core::collector::{Collector, HealthStatus};
use sysbeat_core::error::{CheckpointError, SourceError, SysbeatError};
use sysbeat_core::event::{Event, LogEvent};
use sysbeat_core::metrics as m;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::native::EventLogApi;
use super::watcher::Watcher;
use crate::config::WinlogConfig;
use crate::dispatch::Dispatcher;
use crate::error::CollectorError;
use crate::supervisor::{
    Backoff, CollectorStatus, LiveConfig, LiveReceiver, LiveSender, WorkerHandle,
};

/// 수집기 종류명
pub const WINLOG_KIND: &str = "winlog";

/// 소스 수준 에러 큐 용량
const ERROR_QUEUE_CAPACITY: usize = 64;

/// 채널 재조정 결과
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadReport {
    /// 새로 구독한 채널
    pub added: Vec<String>,
    /// 구독 해제한 채널
    pub removed: Vec<String>,
    /// 구독에 실패한 채널
    pub failed: Vec<String>,
}

impl ReloadReport {
    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.failed.is_empty()
    }
}

/// 이벤트 로그 수집기
pub struct WinlogCollector {
    name: String,
    status: CollectorStatus,
    live: LiveSender<WinlogConfig>,
    api: Arc<dyn EventLogApi>,
    checkpoints: Arc<dyn CheckpointStore>,
    audit: Arc<dyn AuditSink>,
    watcher: Option<Watcher>,
    worker: Option<WorkerHandle>,
}

impl WinlogCollector {
    /// 빌더를 생성합니다.
    pub fn builder(config: WinlogConfig, api: Arc<dyn EventLogApi>) -> WinlogCollectorBuilder {
        WinlogCollectorBuilder::new(config, api)
    }

    pub fn status(&self) -> &CollectorStatus {
        &self.status
    }

    /// 현재 설정 스냅샷
    pub fn config(&self) -> Arc<LiveConfig<WinlogConfig>> {
        self.live.borrow().clone()
    }

    /// 실행 중일 때의 watcher
    pub fn watcher(&self) -> Option<&Watcher> {
        self.watcher.as_ref()
    }

    /// 구독 중인 채널 목록
    pub fn channels(&self) -> Vec<String> {
        self.watcher.as_ref().map(Watcher::channels).unwrap_or_default()
    }

    /// 설정과 디스패처를 교체하고 채널을 재조정합니다.
    pub fn reconfigure(
        &mut self,
        config: WinlogConfig,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<ReloadReport, CollectorError> {
        config.validate()?;
        self.live.send_replace(LiveConfig::new(config, dispatcher));
        self.reload_channels()
    }

    /// 원하는 채널 집합 D와 활성 집합 A를 맞춥니다.
    ///
    /// A\D를 해제하고 D\A를 구독합니다. A∩D의 구독은 건드리지 않습니다.
    /// 실행 중이 아니면 아무것도 하지 않습니다.
    pub fn reload_channels(&self) -> Result<ReloadReport, CollectorError> {
        let mut report = ReloadReport::default();
        let Some(watcher) = &self.watcher else {
            return Ok(report);
        };

        let snapshot = self.live.borrow().clone();
        let desired = snapshot.config.desired_channels();
        let active: BTreeSet<String> = watcher.channels().into_iter().collect();

        for channel in active.difference(&desired) {
            if watcher.remove(channel) {
                report.removed.push(channel.clone());
            }
        }
        for channel in desired.difference(&active) {
            match self.subscribe_channel(watcher, &snapshot.config, channel) {
                Ok(()) => report.added.push(channel.clone()),
                Err(e @ CollectorError::SubscriptionConflict { .. }) => return Err(e),
                Err(e) => {
                    self.report_subscribe_failure(channel, &e);
                    report.failed.push(channel.clone());
                }
            }
        }

        info!(
            collector = %self.name,
            added = ?report.added,
            removed = ?report.removed,
            failed = ?report.failed,
            "channels reconciled"
        );
        Ok(report)
    }

    fn subscribe_channel(
        &self,
        watcher: &Watcher,
        config: &WinlogConfig,
        channel: &str,
    ) -> Result<(), CollectorError> {
        if !config.begin {
            if let Some(token) = self.load_bookmark(channel) {
                self.audit.emit(
                    AuditRecord::new(AUDIT_KIND_WINLOG, format!("{channel} last bookmark"), token.as_str())
                        .with_origin(self.name.as_str()),
                );
                match watcher.subscribe_from_bookmark(channel, &config.query, &token) {
                    Ok(()) => return Ok(()),
                    Err(e @ CollectorError::SubscriptionConflict { .. }) => return Err(e),
                    Err(e) => warn!(
                        collector = %self.name,
                        channel,
                        error = %e,
                        "bookmark unusable, subscribing from oldest record"
                    ),
                }
            }
        }
        watcher.subscribe_from_beginning(channel, &config.query)
    }

    fn load_bookmark(&self, channel: &str) -> Option<String> {
        let key = CheckpointKey::new(self.name.as_str(), channel);
        match self.checkpoints.get(&key) {
            Ok(Some(bytes)) => match String::from_utf8(bytes) {
                Ok(token) if !token.trim().is_empty() => Some(token),
                Ok(_) => None,
                Err(e) => {
                    warn!(collector = %self.name, channel, error = %e, "checkpoint is not valid utf-8");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(collector = %self.name, channel, error = %e, "checkpoint read failed");
                None
            }
        }
    }

    fn report_subscribe_failure(&self, channel: &str, error: &CollectorError) {
        warn!(collector = %self.name, channel, error = %error, "channel subscribe failed");
        self.audit.emit(
            AuditRecord::new(AUDIT_KIND_WINLOG, self.name.as_str(), format!("subscribe {channel} failed"))
                .with_origin(channel)
                .with_error(error),
        );
    }

    fn spawn_worker(
        &self,
        events: mpsc::Receiver<LogEvent>,
        errors: mpsc::Receiver<CollectorError>,
    ) -> WorkerHandle {
        let cancel = CancellationToken::new();
        let worker = DeliveryLoop {
            name: self.name.clone(),
            live: self.live.subscribe(),
            checkpoints: Arc::clone(&self.checkpoints),
            audit: Arc::clone(&self.audit),
            events,
            errors,
        };
        let token = cancel.clone();
        WorkerHandle::spawn(self.name.clone(), cancel, async move {
            worker.run(token).await;
        })
    }
}

impl Collector for WinlogCollector {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        WINLOG_KIND
    }

    async fn start(&mut self) -> Result<(), SysbeatError> {
        if self.status == CollectorStatus::Running {
            return Err(SourceError::AlreadyRunning {
                name: self.name.clone(),
            }
            .into());
        }

        let snapshot = self.live.borrow().clone();
        let (events_tx, events_rx) = mpsc::channel(snapshot.config.queue_capacity);
        let (errors_tx, errors_rx) = mpsc::channel(ERROR_QUEUE_CAPACITY);

        let watcher = match Watcher::open(
            Arc::clone(&self.api),
            self.name.as_str(),
            self.live.subscribe(),
            events_tx,
            errors_tx,
        ) {
            Ok(watcher) => watcher,
            Err(e) => {
                self.audit.emit(
                    AuditRecord::new(AUDIT_KIND_WINLOG, self.name.as_str(), "event log open failed")
                        .with_error(&e),
                );
                return Err(e.into());
            }
        };

        let worker = self.spawn_worker(events_rx, errors_rx);
        for channel in snapshot.config.desired_channels() {
            match self.subscribe_channel(&watcher, &snapshot.config, &channel) {
                Ok(()) => {}
                Err(e @ CollectorError::SubscriptionConflict { .. }) => {
                    watcher.shutdown();
                    let mut worker = worker;
                    worker.shutdown().await;
                    return Err(e.into());
                }
                Err(e) => self.report_subscribe_failure(&channel, &e),
            }
        }

        info!(
            collector = %self.name,
            channels = ?watcher.channels(),
            "winlog collector started"
        );
        self.watcher = Some(watcher);
        self.worker = Some(worker);
        self.status = CollectorStatus::Running;
        Ok(())
    }

    async fn reload(&mut self) -> Result<(), SysbeatError> {
        let report = self.reload_channels()?;
        if !report.is_unchanged() {
            debug!(collector = %self.name, report = ?report, "reload applied");
        }
        Ok(())
    }

    async fn close(&mut self) {
        if self.status != CollectorStatus::Running {
            return;
        }
        if let Some(watcher) = self.watcher.take() {
            watcher.shutdown();
        }
        if let Some(mut worker) = self.worker.take() {
            worker.shutdown().await;
        }
        self.status = CollectorStatus::Stopped;
        info!(collector = %self.name, "winlog collector stopped");
    }

    async fn health_check(&self) -> HealthStatus {
        match self.status {
            CollectorStatus::Running => {
                if !self.worker.as_ref().is_some_and(WorkerHandle::is_running) {
                    return HealthStatus::Unhealthy("delivery loop exited".to_owned());
                }
                match &self.watcher {
                    Some(watcher) if !watcher.is_empty() => HealthStatus::Healthy,
                    _ => HealthStatus::Degraded("no active subscriptions".to_owned()),
                }
            }
            CollectorStatus::Idle => HealthStatus::Unhealthy("not started".to_owned()),
            CollectorStatus::Stopped => HealthStatus::Unhealthy("stopped".to_owned()),
        }
    }
}

/// 이벤트 로그 수집기 빌더
pub struct WinlogCollectorBuilder {
    config: WinlogConfig,
    api: Arc<dyn EventLogApi>,
    dispatcher: Option<Arc<Dispatcher>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl WinlogCollectorBuilder {
    pub fn new(config: WinlogConfig, api: Arc<dyn EventLogApi>) -> Self {
        Self {
            config,
            api,
            dispatcher: None,
            checkpoints: None,
            audit: None,
        }
    }

    /// 디스패처를 설정합니다.
    pub fn dispatcher(mut self, dispatcher: Arc<Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// 체크포인트 저장소를 설정합니다. 기본값은 메모리 저장소입니다.
    pub fn checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// 감사 수신자를 설정합니다. 기본값은 tracing 수신자입니다.
    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// 설정을 검증하고 수집기를 생성합니다.
    pub fn build(self) -> Result<WinlogCollector, CollectorError> {
        self.config.validate()?;

        let name = self.config.name.clone();
        let dispatcher = self
            .dispatcher
            .unwrap_or_else(|| Arc::new(Dispatcher::new(name.clone())));
        let (live, _) = watch::channel(LiveConfig::new(self.config, dispatcher));

        Ok(WinlogCollector {
            name,
            status: CollectorStatus::Idle,
            live,
            api: self.api,
            checkpoints: self
                .checkpoints
                .unwrap_or_else(|| Arc::new(MemoryCheckpointStore::new())),
            audit: self.audit.unwrap_or_else(|| Arc::new(TracingAuditSink)),
            watcher: None,
            worker: None,
        })
    }
}

struct DeliveryLoop {
    name: String,
    live: LiveReceiver<WinlogConfig>,
    checkpoints: Arc<dyn CheckpointStore>,
    audit: Arc<dyn AuditSink>,
    events: mpsc::Receiver<LogEvent>,
    errors: mpsc::Receiver<CollectorError>,
}

impl DeliveryLoop {
    async fn run(mut self, cancel: CancellationToken) {
        let mut snapshot = self.live.borrow_and_update().clone();
        let mut backoff = Backoff::from_config(&snapshot.config.backoff);

        loop {
            if self.live.has_changed().unwrap_or(false) {
                snapshot = self.live.borrow_and_update().clone();
                backoff = Backoff::from_config(&snapshot.config.backoff);
            }
            let idle = backoff.next_delay();

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(ev) = self.events.recv() => {
                    backoff.reset();
                    self.deliver(&snapshot, ev).await;
                }
                Some(err) = self.errors.recv() => {
                    warn!(collector = %self.name, error = %err, "event log source error");
                    self.audit.emit(
                        AuditRecord::new(AUDIT_KIND_WINLOG, self.name.as_str(), "source error")
                            .with_error(&err),
                    );
                }
                _ = tokio::time::sleep(idle) => {}
            }
        }

        debug!(collector = %self.name, "delivery loop exited");
    }

    async fn deliver(&self, snapshot: &LiveConfig<WinlogConfig>, ev: LogEvent) {
        let channel = ev.subscribed_channel.clone();
        let token = ev.bookmark.clone();

        let event = Event::Log(ev);
        let report = snapshot.dispatcher.dispatch(&event);
        if !report.is_clean() {
            debug!(
                collector = %self.name,
                channel = %channel,
                stage_failures = report.stage_failures,
                "event dispatched with failures"
            );
        }

        if token.is_empty() {
            return;
        }
        let key = CheckpointKey::new(self.name.as_str(), channel.as_str());
        let store = Arc::clone(&self.checkpoints);
        let written = {
            let key = key.clone();
            tokio::task::spawn_blocking(move || store.put(&key, token.as_bytes())).await
        };
        let result = written.unwrap_or_else(|e| {
            Err(CheckpointError::Write {
                key: key.to_string(),
                reason: e.to_string(),
            })
        });
        match result {
            Ok(()) => {
                counter!(m::CHECKPOINT_WRITES_TOTAL, m::LABEL_COLLECTOR => self.name.clone())
                    .increment(1);
            }
            Err(e) => {
                counter!(m::CHECKPOINT_WRITE_FAILURES_TOTAL, m::LABEL_COLLECTOR => self.name.clone())
                    .increment(1);
                warn!(collector = %self.name, channel = %channel, error = %e, "checkpoint write failed");
                self.audit.emit(
                    AuditRecord::new(AUDIT_KIND_WINLOG, self.name.as_str(), "checkpoint write failed")
                        .with_origin(channel)
                        .with_error(&e),
                );
            }
        }
    }
}
