//! 수집기 레지스트리
//!
//! 수집기 이름 -> 소유 인스턴스 맵입니다. 전역 상태 없이 `reconfigure`와
//! `remove`로만 바뀝니다.
//!
//! # reconfigure 규칙
//! - 같은 이름, 같은 종류: 실행 중인 인스턴스의 설정과 디스패처를 교체하고 재조정
//! - 같은 이름, 다른 종류: 기존 인스턴스를 닫고 새로 생성
//! - 없는 이름: 생성 후 시작. 시작에 실패하면 등록하지 않습니다.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use metrics::gauge;
use sysbeat_core::audit::{AuditSink, TracingAuditSink};
use sysbeat_core::checkpoint::{CheckpointStore, MemoryCheckpointStore};
use sysbeat_core::collector::{Collector, HealthStatus};
use sysbeat_core::error::SysbeatError;
use sysbeat_core::metrics as m;
use tracing::info;

use crate::config::{DnsConfig, WinlogConfig};
use crate::dispatch::Dispatcher;
use crate::dns::{DNS_KIND, DnsCollector};
use crate::error::CollectorError;
use crate::winlog::{EventLogApi, WINLOG_KIND, WinlogCollector};

/// 수집기 생성에 필요한 공유 협력자
#[derive(Clone)]
pub struct CollectorEnv {
    /// 체크포인트 저장소
    pub checkpoints: Arc<dyn CheckpointStore>,
    /// 감사 수신자
    pub audit: Arc<dyn AuditSink>,
    /// 이벤트 로그 백엔드. 없으면 winlog 수집기를 만들 수 없습니다.
    pub event_log: Option<Arc<dyn EventLogApi>>,
}

impl CollectorEnv {
    pub fn new(checkpoints: Arc<dyn CheckpointStore>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            checkpoints,
            audit,
            event_log: None,
        }
    }

    /// 이벤트 로그 백엔드를 설정합니다.
    pub fn with_event_log(mut self, api: Arc<dyn EventLogApi>) -> Self {
        self.event_log = Some(api);
        self
    }
}

impl Default for CollectorEnv {
    fn default() -> Self {
        Self::new(Arc::new(MemoryCheckpointStore::new()), Arc::new(TracingAuditSink))
    }
}

/// 레지스트리가 관리하는 수집기
pub enum ManagedCollector {
    Winlog(WinlogCollector),
    Dns(DnsCollector),
}

impl Collector for ManagedCollector {
    fn name(&self) -> &str {
        match self {
            Self::Winlog(c) => c.name(),
            Self::Dns(c) => c.name(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Winlog(c) => c.kind(),
            Self::Dns(c) => c.kind(),
        }
    }

    async fn start(&mut self) -> Result<(), SysbeatError> {
        match self {
            Self::Winlog(c) => c.start().await,
            Self::Dns(c) => c.start().await,
        }
    }

    async fn reload(&mut self) -> Result<(), SysbeatError> {
        match self {
            Self::Winlog(c) => c.reload().await,
            Self::Dns(c) => c.reload().await,
        }
    }

    async fn close(&mut self) {
        match self {
            Self::Winlog(c) => c.close().await,
            Self::Dns(c) => c.close().await,
        }
    }

    async fn health_check(&self) -> HealthStatus {
        match self {
            Self::Winlog(c) => c.health_check().await,
            Self::Dns(c) => c.health_check().await,
        }
    }
}

/// 수집기 명세 (설정 + 디스패처)
#[derive(Debug, Clone)]
pub enum CollectorSpec {
    Winlog {
        config: WinlogConfig,
        dispatcher: Arc<Dispatcher>,
    },
    Dns {
        config: DnsConfig,
        dispatcher: Arc<Dispatcher>,
    },
}

impl CollectorSpec {
    pub fn name(&self) -> &str {
        match self {
            Self::Winlog { config, .. } => &config.name,
            Self::Dns { config, .. } => &config.name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Winlog { .. } => WINLOG_KIND,
            Self::Dns { .. } => DNS_KIND,
        }
    }
}

/// reconfigure 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconfigureOutcome {
    /// 새로 생성하고 시작함
    Created,
    /// 실행 중인 인스턴스를 갱신함
    Updated,
    /// 종류가 달라 교체함
    Replaced,
}

/// 수집기 레지스트리
pub struct CollectorRegistry {
    env: CollectorEnv,
    collectors: BTreeMap<String, ManagedCollector>,
}

impl CollectorRegistry {
    pub fn new(env: CollectorEnv) -> Self {
        Self {
            env,
            collectors: BTreeMap::new(),
        }
    }

    pub fn env(&self) -> &CollectorEnv {
        &self.env
    }

    /// 명세대로 수집기를 생성하거나 갱신합니다.
    pub async fn reconfigure(
        &mut self,
        spec: CollectorSpec,
    ) -> Result<ReconfigureOutcome, SysbeatError> {
        let name = spec.name().to_owned();

        let existing_kind = self.collectors.get(&name).map(|c| c.kind());
        if existing_kind == Some(spec.kind()) {
            match (self.collectors.get_mut(&name), spec) {
                (
                    Some(ManagedCollector::Winlog(c)),
                    CollectorSpec::Winlog { config, dispatcher },
                ) => {
                    let report = c.reconfigure(config, dispatcher)?;
                    info!(collector = %name, report = ?report, "winlog collector updated");
                }
                (Some(ManagedCollector::Dns(c)), CollectorSpec::Dns { config, dispatcher }) => {
                    c.reconfigure(config, dispatcher).await?;
                    info!(collector = %name, "dns collector updated");
                }
                _ => {
                    return Err(CollectorError::State {
                        name,
                        state: "of a mismatched kind",
                    }
                    .into());
                }
            }
            return Ok(ReconfigureOutcome::Updated);
        }

        let replaced = existing_kind.is_some();
        if replaced {
            self.remove(&name).await;
        }

        let mut collector = self.build(spec)?;
        collector.start().await?;
        info!(collector = %name, kind = collector.kind(), "collector registered");
        self.collectors.insert(name, collector);
        self.record_count();

        Ok(if replaced {
            ReconfigureOutcome::Replaced
        } else {
            ReconfigureOutcome::Created
        })
    }

    fn build(&self, spec: CollectorSpec) -> Result<ManagedCollector, CollectorError> {
        match spec {
            CollectorSpec::Winlog { config, dispatcher } => {
                let api = self.env.event_log.clone().ok_or_else(|| CollectorError::SourceOpen {
                    source_type: WINLOG_KIND.to_owned(),
                    reason: "no event log backend on this platform".to_owned(),
                })?;
                let collector = WinlogCollector::builder(config, api)
                    .dispatcher(dispatcher)
                    .checkpoints(Arc::clone(&self.env.checkpoints))
                    .audit(Arc::clone(&self.env.audit))
                    .build()?;
                Ok(ManagedCollector::Winlog(collector))
            }
            CollectorSpec::Dns { config, dispatcher } => {
                let collector = DnsCollector::builder(config).dispatcher(dispatcher).build()?;
                Ok(ManagedCollector::Dns(collector))
            }
        }
    }

    /// 이미 만들어진 수집기를 시작하고 등록합니다.
    ///
    /// 같은 이름이 있으면 기존 인스턴스를 닫고 교체합니다.
    pub async fn insert(&mut self, mut collector: ManagedCollector) -> Result<(), SysbeatError> {
        let name = collector.name().to_owned();
        self.remove(&name).await;
        collector.start().await?;
        self.collectors.insert(name, collector);
        self.record_count();
        Ok(())
    }

    /// 수집기를 닫고 제거합니다. 있었으면 `true`를 반환합니다.
    pub async fn remove(&mut self, name: &str) -> bool {
        let Some(mut collector) = self.collectors.remove(name) else {
            return false;
        };
        collector.close().await;
        self.record_count();
        info!(collector = %name, "collector removed");
        true
    }

    /// `keep`에 없는 수집기를 모두 제거하고 제거한 이름을 반환합니다.
    pub async fn retain(&mut self, keep: &BTreeSet<String>) -> Vec<String> {
        let stale: Vec<String> = self
            .collectors
            .keys()
            .filter(|name| !keep.contains(*name))
            .cloned()
            .collect();
        for name in &stale {
            self.remove(name).await;
        }
        stale
    }

    /// 모든 수집기를 닫고 비웁니다.
    pub async fn close_all(&mut self) {
        let collectors = std::mem::take(&mut self.collectors);
        for (name, mut collector) in collectors {
            collector.close().await;
            info!(collector = %name, "collector closed");
        }
        self.record_count();
    }

    /// 등록된 이름 (정렬됨)
    pub fn names(&self) -> Vec<String> {
        self.collectors.keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<&ManagedCollector> {
        self.collectors.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ManagedCollector> {
        self.collectors.get_mut(name)
    }

    pub fn len(&self) -> usize {
        self.collectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }

    /// 수집기별 건강 상태
    pub async fn health(&self) -> Vec<(String, HealthStatus)> {
        let mut statuses = Vec::with_capacity(self.collectors.len());
        for (name, collector) in &self.collectors {
            statuses.push((name.clone(), collector.health_check().await));
        }
        statuses
    }

    fn record_count(&self) {
        gauge!(m::DAEMON_COLLECTORS_REGISTERED).set(self.collectors.len() as f64);
    }
}
