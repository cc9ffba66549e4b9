//! 수집기 생명주기 trait -- 데몬이 수집기를 균일하게 관리하기 위한 확장 지점
//!
//! # 생명주기
//! ```text
//! Created -> start() -> Running -> reload()* -> close() -> Closed
//! ```
//!
//! `close()`는 멱등입니다. 몇 번을 호출해도 리소스는 정확히 한 번만 해제됩니다.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::Serialize;

use crate::error::SysbeatError;

/// `Send` 가능한 boxed future
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// 수집기 건강 상태
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum HealthStatus {
    /// 정상
    Healthy,
    /// 동작하지만 일부 기능 저하
    Degraded(String),
    /// 동작하지 않음
    Unhealthy(String),
}

impl HealthStatus {
    /// 정상 상태인지 확인합니다.
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// 비정상 상태인지 확인합니다.
    pub fn is_unhealthy(&self) -> bool {
        matches!(self, Self::Unhealthy(_))
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded(reason) => write!(f, "degraded: {reason}"),
            Self::Unhealthy(reason) => write!(f, "unhealthy: {reason}"),
        }
    }
}

/// 수집기 생명주기 trait
pub trait Collector: Send + Sync {
    /// 수집기 이름 (레지스트리 키)
    fn name(&self) -> &str;

    /// 수집기 종류 (예: "winlog", "dns")
    fn kind(&self) -> &'static str;

    /// 네이티브 리소스를 획득하고 백그라운드 워커를 시작합니다.
    ///
    /// 리소스 획득에 실패하면 즉시 에러를 반환합니다.
    fn start(&mut self) -> impl Future<Output = Result<(), SysbeatError>> + Send;

    /// 현재 설정에 맞게 실행 중인 리소스를 재조정합니다.
    fn reload(&mut self) -> impl Future<Output = Result<(), SysbeatError>> + Send;

    /// 워커를 중지하고 모든 리소스를 해제합니다. 멱등입니다.
    fn close(&mut self) -> impl Future<Output = ()> + Send;

    /// 건강 상태를 확인합니다.
    fn health_check(&self) -> impl Future<Output = HealthStatus> + Send;
}

/// dyn-compatible 수집기 trait
///
/// `Collector`는 RPITIT를 사용하므로 `dyn Collector`가 불가합니다.
/// `DynCollector`는 `BoxFuture`를 반환하여 `&mut dyn DynCollector`로
/// 종류가 다른 수집기를 같은 방식으로 다룰 수 있게 합니다.
pub trait DynCollector: Send + Sync {
    /// 수집기 이름
    fn name(&self) -> &str;

    /// 수집기 종류
    fn kind(&self) -> &'static str;

    /// 수집기를 시작합니다.
    fn start(&mut self) -> BoxFuture<'_, Result<(), SysbeatError>>;

    /// 수집기를 재조정합니다.
    fn reload(&mut self) -> BoxFuture<'_, Result<(), SysbeatError>>;

    /// 수집기를 닫습니다.
    fn close(&mut self) -> BoxFuture<'_, ()>;

    /// 건강 상태를 확인합니다.
    fn health_check(&self) -> BoxFuture<'_, HealthStatus>;
}

/// Collector를 구현한 타입은 자동으로 DynCollector도 구현됩니다.
impl<T: Collector> DynCollector for T {
    fn name(&self) -> &str {
        Collector::name(self)
    }

    fn kind(&self) -> &'static str {
        Collector::kind(self)
    }

    fn start(&mut self) -> BoxFuture<'_, Result<(), SysbeatError>> {
        Box::pin(Collector::start(self))
    }

    fn reload(&mut self) -> BoxFuture<'_, Result<(), SysbeatError>> {
        Box::pin(Collector::reload(self))
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(Collector::close(self))
    }

    fn health_check(&self) -> BoxFuture<'_, HealthStatus> {
        Box::pin(Collector::health_check(self))
    }
}
