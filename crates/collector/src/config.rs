//! 수집기 설정
//!
//! [`WinlogConfig`]와 [`DnsConfig`]는 core의 설정 섹션
//! ([`WinlogSection`], [`DnsSection`])을 기반으로 수집기 내부에서 사용하는
//! 타입화된 설정을 제공합니다.
//!
//! # 사용 예시
//! ```ignore
//! use sysbeat_core::config::SysbeatConfig;
//! use sysbeat_collector::config::{DnsConfig, WinlogConfig};
//!
//! let core_config = SysbeatConfig::load("sysbeat.toml").await?;
//! let winlog = WinlogConfig::from_core(&core_config.winlog[0]);
//! let dns = DnsConfig::from_core(&core_config.dns[0])?;
//! ```

use std::collections::BTreeSet;
use std::time::Duration;

use sysbeat_core::config::{DnsSection, RenderSection, WinlogSection};
use sysbeat_core::filter::FilterPolicy;

use crate::dns::bind::{BindSpec, Transport};
use crate::dns::region::RegionTable;
use crate::error::CollectorError;

/// 큐 용량 상한
const MAX_QUEUE_CAPACITY: usize = 1_000_000;

/// 지역화 텍스트 렌더링 옵션
///
/// 게시자 메시지 포맷은 레코드당 네이티브 호출이 여러 번 필요하므로
/// 필요한 필드만 켭니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderOptions {
    pub message: bool,
    pub level: bool,
    pub task: bool,
    pub opcode: bool,
    pub keywords: bool,
    pub channel: bool,
    pub provider: bool,
    pub id: bool,
    /// 원본 XML 렌더링
    pub xml: bool,
}

impl RenderOptions {
    /// 모든 지역화 필드와 XML을 끈 옵션
    pub const NONE: Self = Self {
        message: false,
        level: false,
        task: false,
        opcode: false,
        keywords: false,
        channel: false,
        provider: false,
        id: false,
        xml: false,
    };

    /// core 설정 섹션에서 생성합니다.
    pub fn from_core(section: &RenderSection) -> Self {
        Self {
            message: section.message,
            level: section.level,
            task: section.task,
            opcode: section.opcode,
            keywords: section.keywords,
            channel: section.channel,
            provider: section.provider,
            id: section.id,
            xml: section.xml,
        }
    }

    /// 게시자 핸들이 필요한 필드가 하나라도 켜져 있는지 확인합니다.
    pub fn needs_publisher(&self) -> bool {
        self.message
            || self.level
            || self.task
            || self.opcode
            || self.keywords
            || self.channel
            || self.provider
            || self.id
    }
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self::from_core(&RenderSection::default())
    }
}

/// 유휴 대기 간격 설정
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// 최소 간격
    pub min: Duration,
    /// 최대 간격
    pub max: Duration,
    /// 유휴 반복마다 늘어나는 폭
    pub step: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(50),
            max: Duration::from_millis(1000),
            step: Duration::from_millis(10),
        }
    }
}

/// 이벤트 로그 수집기 설정
#[derive(Debug, Clone, PartialEq)]
pub struct WinlogConfig {
    /// 수집기 이름 (체크포인트 소스 ID)
    pub name: String,
    /// 체크포인트를 무시하고 항상 가장 오래된 레코드부터 구독
    pub begin: bool,
    /// 구독할 채널 목록
    pub channels: Vec<String>,
    /// 구독 쿼리
    pub query: String,
    /// 허용 이벤트 ID
    pub pass: Option<FilterPolicy>,
    /// 지역화 텍스트 렌더링 옵션
    pub render: RenderOptions,
    /// 콜백 -> 워커 이벤트 큐 용량
    pub queue_capacity: usize,
    /// 유휴 대기 간격
    pub backoff: BackoffConfig,
}

impl Default for WinlogConfig {
    fn default() -> Self {
        Self {
            name: "winlog".to_owned(),
            begin: false,
            channels: vec!["Application".to_owned()],
            query: "*".to_owned(),
            pass: None,
            render: RenderOptions::default(),
            queue_capacity: 64,
            backoff: BackoffConfig::default(),
        }
    }
}

impl WinlogConfig {
    /// core의 `WinlogSection`에서 수집기 설정을 생성합니다.
    pub fn from_core(section: &WinlogSection) -> Self {
        Self {
            name: section.name.clone(),
            begin: section.begin,
            channels: section.channels.clone(),
            query: section.query.clone(),
            pass: section.pass.clone(),
            render: RenderOptions::from_core(&section.render),
            queue_capacity: section.queue_capacity,
            backoff: BackoffConfig {
                min: Duration::from_millis(section.backoff_min_ms),
                max: Duration::from_millis(section.backoff_max_ms),
                step: Duration::from_millis(section.backoff_step_ms),
            },
        }
    }

    /// 구독해야 하는 채널 집합 (공백 제거, 중복 제거)
    pub fn desired_channels(&self) -> BTreeSet<String> {
        self.channels
            .iter()
            .map(|c| c.trim().to_owned())
            .filter(|c| !c.is_empty())
            .collect()
    }

    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), CollectorError> {
        if self.name.trim().is_empty() {
            return Err(CollectorError::config("name", "must not be empty"));
        }
        if self.desired_channels().is_empty() {
            return Err(CollectorError::config(
                "channels",
                "at least one channel is required",
            ));
        }
        if self.query.trim().is_empty() {
            return Err(CollectorError::config("query", "must not be empty"));
        }
        if self.queue_capacity == 0 || self.queue_capacity > MAX_QUEUE_CAPACITY {
            return Err(CollectorError::config(
                "queue_capacity",
                format!("must be 1-{MAX_QUEUE_CAPACITY}"),
            ));
        }
        if self.backoff.min.is_zero() || self.backoff.min > self.backoff.max {
            return Err(CollectorError::config(
                "backoff",
                "min must be greater than 0 and not exceed max",
            ));
        }
        Ok(())
    }
}

/// 이벤트 로그 수집기 설정 빌더
#[derive(Debug, Default)]
pub struct WinlogConfigBuilder {
    config: WinlogConfig,
}

impl WinlogConfigBuilder {
    /// 새 빌더를 생성합니다.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            config: WinlogConfig {
                name: name.into(),
                ..WinlogConfig::default()
            },
        }
    }

    /// 구독 채널 목록을 설정합니다.
    pub fn channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.channels = channels.into_iter().map(Into::into).collect();
        self
    }

    /// 구독 쿼리를 설정합니다.
    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.config.query = query.into();
        self
    }

    /// 항상 가장 오래된 레코드부터 구독할지 설정합니다.
    pub fn begin(mut self, begin: bool) -> Self {
        self.config.begin = begin;
        self
    }

    /// 허용 이벤트 ID를 설정합니다.
    pub fn pass(mut self, pass: FilterPolicy) -> Self {
        self.config.pass = Some(pass);
        self
    }

    /// 렌더링 옵션을 설정합니다.
    pub fn render(mut self, render: RenderOptions) -> Self {
        self.config.render = render;
        self
    }

    /// 이벤트 큐 용량을 설정합니다.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// 유휴 대기 간격을 설정합니다.
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.config.backoff = backoff;
        self
    }

    /// 설정을 검증하고 `WinlogConfig`를 생성합니다.
    pub fn build(self) -> Result<WinlogConfig, CollectorError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// DNS 수집기 설정
#[derive(Debug, Clone, PartialEq)]
pub struct DnsConfig {
    /// 수집기 이름
    pub name: String,
    /// 바인드 명세
    pub bind: BindSpec,
    /// 수신 버퍼 크기 (바이트)
    pub recv_buffer_size: usize,
    /// 스크래치 버퍼 풀 최대 보관 개수
    pub pool_capacity: usize,
    /// 원격 주소 지역 테이블
    pub regions: RegionTable,
}

impl DnsConfig {
    /// core의 `DnsSection`에서 수집기 설정을 생성합니다.
    ///
    /// 바인드 명세와 CIDR은 이 시점에 파싱되며, 실패는 설정 에러입니다.
    pub fn from_core(section: &DnsSection) -> Result<Self, CollectorError> {
        let config = Self {
            name: section.name.clone(),
            bind: BindSpec::parse(&section.bind)?,
            recv_buffer_size: section.recv_buffer_size,
            pool_capacity: section.pool_capacity,
            regions: RegionTable::from_sections(&section.regions)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), CollectorError> {
        if self.name.trim().is_empty() {
            return Err(CollectorError::config("name", "must not be empty"));
        }
        if self.bind.transport != Transport::Udp {
            return Err(CollectorError::config(
                "bind",
                format!("{} transport is not supported by the packet source", self.bind.transport),
            ));
        }
        if !(512..=65_535).contains(&self.recv_buffer_size) {
            return Err(CollectorError::config("recv_buffer_size", "must be 512-65535"));
        }
        Ok(())
    }
}

/// DNS 수집기 설정 빌더
#[derive(Debug)]
pub struct DnsConfigBuilder {
    name: String,
    bind: String,
    recv_buffer_size: usize,
    pool_capacity: usize,
    regions: RegionTable,
}

impl DnsConfigBuilder {
    /// 새 빌더를 생성합니다.
    pub fn new(name: impl Into<String>) -> Self {
        let defaults = DnsSection::default();
        Self {
            name: name.into(),
            bind: defaults.bind,
            recv_buffer_size: defaults.recv_buffer_size,
            pool_capacity: defaults.pool_capacity,
            regions: RegionTable::new(),
        }
    }

    /// 바인드 명세 문자열을 설정합니다.
    pub fn bind(mut self, bind: impl Into<String>) -> Self {
        self.bind = bind.into();
        self
    }

    /// 수신 버퍼 크기를 설정합니다.
    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size;
        self
    }

    /// 스크래치 버퍼 풀 크기를 설정합니다.
    pub fn pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    /// 지역 테이블을 설정합니다.
    pub fn regions(mut self, regions: RegionTable) -> Self {
        self.regions = regions;
        self
    }

    /// 바인드 명세를 파싱/검증하고 `DnsConfig`를 생성합니다.
    pub fn build(self) -> Result<DnsConfig, CollectorError> {
        let config = DnsConfig {
            name: self.name,
            bind: BindSpec::parse(&self.bind)?,
            recv_buffer_size: self.recv_buffer_size,
            pool_capacity: self.pool_capacity,
            regions: self.regions,
        };
        config.validate()?;
        Ok(config)
    }
}
