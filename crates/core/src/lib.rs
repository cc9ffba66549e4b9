//! sysbeat 공통 크레이트 -- 이벤트 모델, 설정, 에러, 체크포인트, 감사, 메트릭 상수
//!
//! 수집기 크레이트와 데몬이 공유하는 타입과 trait을 정의합니다.
//!
//! # 모듈 구성
//!
//! - [`event`]: 로그 이벤트 / DNS 트랜잭션 태그드 유니온과 내보내기 형식
//! - [`types`]: DNS 메시지 구조, 지역 정보
//! - [`filter`]: 디코딩 전 수용 필터
//! - [`checkpoint`]: 재개 토큰 저장소 trait과 메모리/파일 구현
//! - [`audit`]: 감사 레코드와 수신자
//! - [`collector`]: 수집기 생명주기 trait과 건강 상태
//! - [`config`]: `sysbeat.toml` 설정
//! - [`metrics`]: 메트릭 이름 상수

pub mod audit;
pub mod checkpoint;
pub mod collector;
pub mod config;
pub mod error;
pub mod event;
pub mod filter;
pub mod metrics;
pub mod types;

// --- 주요 타입 re-export ---

// 에러
pub use error::{CheckpointError, ConfigError, SourceError, SysbeatError};

// 설정
pub use config::SysbeatConfig;

// 이벤트
pub use event::{Event, LogEvent, NodeIdentity, Transaction};

// 수집기 trait
pub use collector::{BoxFuture, Collector, DynCollector, HealthStatus};

// 체크포인트
pub use checkpoint::{CheckpointKey, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};

// 감사
pub use audit::{AuditRecord, AuditSink, MemoryAuditSink, TracingAuditSink};

// 필터
pub use filter::FilterPolicy;

// 도메인 타입
pub use types::{DnsMessage, Region};
