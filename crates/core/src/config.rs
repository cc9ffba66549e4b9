//! 설정 관리 -- sysbeat.toml 파싱 및 런타임 설정
//!
//! [`SysbeatConfig`]는 데몬과 모든 수집기의 설정을 담는 최상위 구조체입니다.
//!
//! # 설정 로딩 우선순위
//! 1. CLI 인자 (최고 우선)
//! 2. 환경변수 (`SYSBEAT_GENERAL_LOG_LEVEL=debug` 형식)
//! 3. 설정 파일 (`sysbeat.toml`)
//! 4. 기본값 (`Default` 구현)
//!
//! # 수집기 섹션
//! 수집기는 배열 테이블로 여러 개를 선언할 수 있습니다.
//! ```toml
//! [[winlog]]
//! name = "security"
//! channels = ["Security"]
//! pass = [4624, 4625, 4634]
//!
//! [winlog.pipeline]
//! sinks = [{ type = "stdout" }]
//!
//! [winlog.pipeline.hooks]
//! "4624" = "logon"
//! default = "trace"
//!
//! [[dns]]
//! name = "dns"
//! bind = "udp://0.0.0.0/?port=53,5353"
//! ```
//!
//! # 사용 예시
//! ```no_run
//! # async fn example() -> Result<(), sysbeat_core::error::SysbeatError> {
//! use sysbeat_core::config::SysbeatConfig;
//!
//! // 파일에서 로드 + 환경변수 오버라이드
//! let config = SysbeatConfig::load("sysbeat.toml").await?;
//!
//! // TOML 문자열에서 직접 파싱
//! let config = SysbeatConfig::parse("[general]\nlog_level = \"debug\"")?;
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, SysbeatError};
use crate::filter::FilterPolicy;

/// 훅 테이블의 기본 핸들러 키
pub const DEFAULT_HOOK_KEY: &str = "default";

/// sysbeat 통합 설정
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SysbeatConfig {
    /// 일반 설정
    #[serde(default)]
    pub general: GeneralConfig,
    /// 메트릭 엔드포인트 설정
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// 체크포인트 저장소 설정
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    /// 이벤트 로그 수집기 목록
    #[serde(default)]
    pub winlog: Vec<WinlogSection>,
    /// DNS 수집기 목록
    #[serde(default)]
    pub dns: Vec<DnsSection>,
}

impl SysbeatConfig {
    /// TOML 파일에서 설정을 로드하고 환경변수 오버라이드를 적용합니다.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, SysbeatError> {
        let mut config = Self::from_file(path).await?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// TOML 파일에서 설정을 로드합니다 (환경변수 오버라이드 없음).
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, SysbeatError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SysbeatError::Config(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                })
            } else {
                SysbeatError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    /// TOML 문자열에서 설정을 파싱합니다.
    pub fn parse(toml_str: &str) -> Result<Self, SysbeatError> {
        toml::from_str(toml_str).map_err(|e| {
            SysbeatError::Config(ConfigError::ParseFailed {
                reason: e.to_string(),
            })
        })
    }

    /// 환경변수로 설정값을 오버라이드합니다.
    ///
    /// 환경변수 네이밍 규칙: `SYSBEAT_{SECTION}_{FIELD}`
    /// 수집기 배열 섹션은 오버라이드 대상이 아닙니다.
    pub fn apply_env_overrides(&mut self) {
        // General
        override_string(&mut self.general.log_level, "SYSBEAT_GENERAL_LOG_LEVEL");
        override_string(&mut self.general.log_format, "SYSBEAT_GENERAL_LOG_FORMAT");
        override_string(&mut self.general.data_dir, "SYSBEAT_GENERAL_DATA_DIR");
        override_string(&mut self.general.pid_file, "SYSBEAT_GENERAL_PID_FILE");
        override_string(&mut self.general.node_id, "SYSBEAT_GENERAL_NODE_ID");

        // Metrics
        override_bool(&mut self.metrics.enabled, "SYSBEAT_METRICS_ENABLED");
        override_string(&mut self.metrics.listen_addr, "SYSBEAT_METRICS_LISTEN_ADDR");
        override_u16(&mut self.metrics.port, "SYSBEAT_METRICS_PORT");

        // Checkpoint
        override_string(&mut self.checkpoint.backend, "SYSBEAT_CHECKPOINT_BACKEND");
        override_string(&mut self.checkpoint.path, "SYSBEAT_CHECKPOINT_PATH");
    }

    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), SysbeatError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(invalid(
                "general.log_level",
                format!("must be one of: {}", valid_levels.join(", ")),
            ));
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.general.log_format.as_str()) {
            return Err(invalid(
                "general.log_format",
                format!("must be one of: {}", valid_formats.join(", ")),
            ));
        }

        if self.metrics.enabled && self.metrics.port == 0 {
            return Err(invalid("metrics.port", "must be greater than 0"));
        }

        let valid_backends = ["file", "memory"];
        if !valid_backends.contains(&self.checkpoint.backend.as_str()) {
            return Err(invalid(
                "checkpoint.backend",
                format!("must be one of: {}", valid_backends.join(", ")),
            ));
        }

        // 수집기 이름은 종류와 무관하게 유일해야 한다
        let mut names = HashSet::new();
        let all_names = self
            .winlog
            .iter()
            .map(|w| w.name.as_str())
            .chain(self.dns.iter().map(|d| d.name.as_str()));
        for name in all_names {
            if name.is_empty() {
                return Err(invalid("collector.name", "must not be empty"));
            }
            if !names.insert(name) {
                return Err(invalid(
                    "collector.name",
                    format!("duplicate collector name '{name}'"),
                ));
            }
        }

        for section in &self.winlog {
            section.validate()?;
        }
        for section in &self.dns {
            section.validate()?;
        }

        Ok(())
    }

    /// 파일 체크포인트 저장소의 경로를 반환합니다.
    ///
    /// `checkpoint.path`가 비어 있으면 `general.data_dir/checkpoints.json`입니다.
    pub fn checkpoint_path(&self) -> PathBuf {
        if self.checkpoint.path.is_empty() {
            Path::new(&self.general.data_dir).join("checkpoints.json")
        } else {
            PathBuf::from(&self.checkpoint.path)
        }
    }
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> SysbeatError {
    ConfigError::InvalidValue {
        field: field.into(),
        reason: reason.into(),
    }
    .into()
}

/// 일반 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// 로그 레벨 (trace, debug, info, warn, error)
    pub log_level: String,
    /// 로그 형식 (json, pretty)
    pub log_format: String,
    /// 데이터 디렉토리
    pub data_dir: String,
    /// PID 파일 경로
    pub pid_file: String,
    /// 내보내기 레코드에 포함되는 노드 ID
    pub node_id: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            log_format: "json".to_owned(),
            data_dir: "/var/lib/sysbeat".to_owned(),
            pid_file: "/var/run/sysbeat.pid".to_owned(),
            node_id: "local".to_owned(),
        }
    }
}

/// 메트릭 엔드포인트 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// 활성화 여부
    pub enabled: bool,
    /// 리슨 주소
    pub listen_addr: String,
    /// 리슨 포트
    pub port: u16,
    /// 엔드포인트 경로
    pub endpoint: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "127.0.0.1".to_owned(),
            port: 9105,
            endpoint: "/metrics".to_owned(),
        }
    }
}

/// 체크포인트 저장소 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// 저장소 종류 (file, memory)
    pub backend: String,
    /// 파일 저장소 경로. 비어 있으면 `data_dir/checkpoints.json`
    pub path: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            backend: "file".to_owned(),
            path: String::new(),
        }
    }
}

/// 이벤트 로그 수집기 섹션 (`[[winlog]]`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WinlogSection {
    /// 수집기 이름 (레지스트리 키, 체크포인트 소스 ID)
    pub name: String,
    /// true면 체크포인트를 무시하고 항상 가장 오래된 레코드부터 구독
    pub begin: bool,
    /// 구독할 채널 목록
    pub channels: Vec<String>,
    /// 구독 필터 쿼리 (XPath)
    pub query: String,
    /// 허용 이벤트 ID. 없으면 모두 허용
    pub pass: Option<FilterPolicy>,
    /// 지역화 텍스트 렌더링 여부
    pub render: RenderSection,
    /// 내부 이벤트 큐 용량
    pub queue_capacity: usize,
    /// 유휴 대기 최소 간격 (ms)
    pub backoff_min_ms: u64,
    /// 유휴 대기 최대 간격 (ms)
    pub backoff_max_ms: u64,
    /// 유휴 대기 증가폭 (ms)
    pub backoff_step_ms: u64,
    /// 디스패치 파이프라인
    pub pipeline: PipelineSection,
}

impl Default for WinlogSection {
    fn default() -> Self {
        Self {
            name: String::new(),
            begin: false,
            channels: Vec::new(),
            query: "*".to_owned(),
            pass: None,
            render: RenderSection::default(),
            queue_capacity: 64,
            backoff_min_ms: 50,
            backoff_max_ms: 1000,
            backoff_step_ms: 10,
            pipeline: PipelineSection::default(),
        }
    }
}

impl WinlogSection {
    fn validate(&self) -> Result<(), SysbeatError> {
        let field = |f: &str| format!("winlog[{}].{}", self.name, f);

        if self.channels.is_empty() {
            return Err(invalid(field("channels"), "at least one channel is required"));
        }
        if self.channels.iter().any(|c| c.trim().is_empty()) {
            return Err(invalid(field("channels"), "channel name must not be empty"));
        }
        if self.query.is_empty() {
            return Err(invalid(field("query"), "must not be empty"));
        }
        if self.queue_capacity == 0 {
            return Err(invalid(field("queue_capacity"), "must be greater than 0"));
        }
        if self.backoff_min_ms == 0 || self.backoff_min_ms > self.backoff_max_ms {
            return Err(invalid(
                field("backoff_min_ms"),
                "must be greater than 0 and not exceed backoff_max_ms",
            ));
        }
        self.pipeline.validate(&field("pipeline"))
    }
}

/// 지역화 텍스트 렌더링 스위치
///
/// 게시자 메시지 포맷은 비용이 크므로 필드별로 끌 수 있습니다.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSection {
    pub message: bool,
    pub level: bool,
    pub task: bool,
    pub opcode: bool,
    pub keywords: bool,
    pub channel: bool,
    pub provider: bool,
    pub id: bool,
    /// 원본 XML 렌더링 여부
    pub xml: bool,
}

impl Default for RenderSection {
    fn default() -> Self {
        Self {
            message: true,
            level: true,
            task: true,
            opcode: true,
            keywords: true,
            channel: false,
            provider: false,
            id: false,
            xml: true,
        }
    }
}

/// DNS 수집기 섹션 (`[[dns]]`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsSection {
    /// 수집기 이름
    pub name: String,
    /// 바인드 명세 (`udp://HOST[:PORT][/?port=P1,P2]`)
    pub bind: String,
    /// 수신 버퍼 크기 (바이트)
    pub recv_buffer_size: usize,
    /// 스크래치 버퍼 풀 최대 보관 개수
    pub pool_capacity: usize,
    /// IPv4 CIDR 지역 테이블
    pub regions: Vec<RegionSection>,
    /// 디스패치 파이프라인
    pub pipeline: PipelineSection,
}

impl Default for DnsSection {
    fn default() -> Self {
        Self {
            name: String::new(),
            bind: "udp://0.0.0.0/?port=53".to_owned(),
            recv_buffer_size: 4096,
            pool_capacity: 64,
            regions: Vec::new(),
            pipeline: PipelineSection::default(),
        }
    }
}

impl DnsSection {
    fn validate(&self) -> Result<(), SysbeatError> {
        let field = |f: &str| format!("dns[{}].{}", self.name, f);

        if self.bind.trim().is_empty() {
            return Err(invalid(field("bind"), "must not be empty"));
        }
        if !(512..=65_535).contains(&self.recv_buffer_size) {
            return Err(invalid(field("recv_buffer_size"), "must be 512-65535"));
        }
        if self.regions.iter().any(|r| r.cidr.is_empty()) {
            return Err(invalid(field("regions"), "cidr must not be empty"));
        }
        self.pipeline.validate(&field("pipeline"))
    }
}

/// CIDR -> 지역 매핑 엔트리
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionSection {
    /// IPv4 CIDR (예: "10.0.0.0/8")
    pub cidr: String,
    pub country: String,
    pub province: String,
    pub city: String,
    pub isp: String,
}

/// 디스패치 파이프라인 설명자
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    /// 선언 순서대로 실행되는 싱크 스테이지
    pub sinks: Vec<SinkSection>,
    /// 판별 ID -> 훅 이름. `default` 키는 기본 핸들러입니다.
    pub hooks: BTreeMap<String, String>,
}

impl PipelineSection {
    fn validate(&self, field: &str) -> Result<(), SysbeatError> {
        for key in self.hooks.keys() {
            if key != DEFAULT_HOOK_KEY && key.parse::<u64>().is_err() {
                return Err(invalid(
                    format!("{field}.hooks"),
                    format!("hook key '{key}' must be a numeric id or '{DEFAULT_HOOK_KEY}'"),
                ));
            }
        }
        for sink in &self.sinks {
            if let SinkSection::File { path } = sink {
                if path.is_empty() {
                    return Err(invalid(format!("{field}.sinks"), "file sink path is empty"));
                }
            }
        }
        Ok(())
    }
}

/// 싱크 스테이지 설명자
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkSection {
    /// 표준 출력에 JSON 한 줄씩 기록
    Stdout,
    /// 파일에 JSON 한 줄씩 추가
    File { path: String },
    /// tracing 이벤트로 요약 기록
    Tracing,
}

// --- 환경변수 오버라이드 헬퍼 ---

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_bool(target: &mut bool, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<bool>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse bool from env var, ignoring"
            ),
        }
    }
}

fn override_u16(target: &mut u16, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u16>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u16 from env var, ignoring"
            ),
        }
    }
}
