//! sysbeat 수집기 -- Windows 이벤트 로그 구독과 DNS 패킷 수집
//!
//! 두 종류의 수집기가 이벤트를 만들고, 수집기별 [`Dispatcher`]가 훅과 싱크 스테이지로
//! 전달합니다. 데몬은 [`CollectorRegistry`]로 수집기 인스턴스를 관리합니다.
//!
//! # 모듈 구성
//!
//! - [`winlog`]: 채널 구독, 북마크 재개, 필드 렌더링, 로그온 감사 훅
//! - [`dns`]: raw UDP 수신, 포트 수용 필터, DNS 메시지 디코딩, 지역 조회
//! - [`dispatch`]: 훅 테이블과 싱크 스테이지 실행
//! - [`supervisor`]: 수집기 상태, 재시도 백오프, 워커 태스크 핸들
//! - [`registry`]: 이름 -> 수집기 인스턴스 관리
//! - [`config`]: 수집기 설정과 빌더
//! - [`error`]: 도메인 에러 타입
//!
//! # 아키텍처
//!
//! ```text
//! wevtapi callback -> Watcher -> mpsc -> DeliveryLoop -> Dispatcher -> checkpoint
//! raw socket -> AcceptLoop -> UdpHeader -> port ACL -> DnsDecoder -> Dispatcher
//!                                                                       |
//!                                                          HookTable + Sink stages
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod registry;
pub mod supervisor;

pub mod dns;
pub mod winlog;

// --- 주요 타입 re-export ---

// 설정
pub use config::{
    BackoffConfig, DnsConfig, DnsConfigBuilder, RenderOptions, WinlogConfig, WinlogConfigBuilder,
};

// 에러
pub use error::CollectorError;

// 디스패치
pub use dispatch::{DispatchReport, Dispatcher, Hook, HookOutcome, HookTable, Sink};

// 수집기
pub use dns::{DnsCollector, DnsCollectorBuilder};
pub use winlog::{ReloadReport, WinlogCollector, WinlogCollectorBuilder};

// 레지스트리
pub use registry::{
    CollectorEnv, CollectorRegistry, CollectorSpec, ManagedCollector, ReconfigureOutcome,
};

// 생명주기
pub use supervisor::{Backoff, CollectorStatus, WorkerHandle};
