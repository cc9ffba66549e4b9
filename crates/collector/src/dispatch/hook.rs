//! 판별 ID별 훅 테이블
//!
//! 로그 이벤트는 이벤트 ID, DNS 트랜잭션은 첫 질의의 QTYPE으로 훅을 찾습니다.
//! 테이블에 없는 ID는 기본 핸들러(fallback)로 갑니다.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use sysbeat_core::event::Event;
use tracing::info;

use crate::error::CollectorError;

/// 이벤트 훅
pub trait Hook: Send + Sync {
    /// 훅 이름 (로그용)
    fn name(&self) -> &str;

    /// 이벤트를 처리합니다.
    fn call(&self, event: &Event) -> Result<(), CollectorError>;
}

/// 판별 ID -> 훅 매핑과 기본 핸들러
#[derive(Clone, Default)]
pub struct HookTable {
    by_id: HashMap<u64, Arc<dyn Hook>>,
    fallback: Option<Arc<dyn Hook>>,
}

impl HookTable {
    /// 빈 테이블을 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    /// ID에 훅을 등록합니다. 기존 훅은 교체됩니다.
    pub fn insert(&mut self, id: u64, hook: Arc<dyn Hook>) {
        self.by_id.insert(id, hook);
    }

    /// 기본 핸들러를 설정합니다.
    pub fn set_fallback(&mut self, hook: Arc<dyn Hook>) {
        self.fallback = Some(hook);
    }

    /// ID에 해당하는 훅을 찾습니다. 없으면 기본 핸들러를 반환합니다.
    pub fn resolve(&self, id: Option<u64>) -> Option<&Arc<dyn Hook>> {
        id.and_then(|id| self.by_id.get(&id))
            .or(self.fallback.as_ref())
    }

    /// ID별 훅 수 (기본 핸들러 제외)
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// 훅과 기본 핸들러가 모두 없는지 확인합니다.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty() && self.fallback.is_none()
    }

    /// 기본 핸들러가 있는지 확인합니다.
    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }
}

impl fmt::Debug for HookTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<(&u64, &str)> = self.by_id.iter().map(|(id, h)| (id, h.name())).collect();
        ids.sort_unstable();
        f.debug_struct("HookTable")
            .field("by_id", &ids)
            .field("fallback", &self.fallback.as_ref().map(|h| h.name()))
            .finish()
    }
}

/// 클로저 훅
pub struct FnHook<F> {
    name: String,
    f: F,
}

impl<F> FnHook<F>
where
    F: Fn(&Event) -> Result<(), CollectorError> + Send + Sync,
{
    /// 클로저로 훅을 생성합니다.
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> Hook for FnHook<F>
where
    F: Fn(&Event) -> Result<(), CollectorError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, event: &Event) -> Result<(), CollectorError> {
        (self.f)(event)
    }
}

/// 이벤트 요약을 `hook` tracing 타깃에 남기는 훅
#[derive(Debug, Default, Clone, Copy)]
pub struct TraceHook;

impl Hook for TraceHook {
    fn name(&self) -> &str {
        "trace"
    }

    fn call(&self, event: &Event) -> Result<(), CollectorError> {
        info!(
            target: "hook",
            collector = event.collector(),
            kind = event.kind(),
            id = ?event.discriminant_id(),
            event = event.id(),
            "event observed"
        );
        Ok(())
    }
}
