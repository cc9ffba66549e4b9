//! 디스패처 -- 이벤트당 한 번 실행되는 훅과 싱크 스테이지
//!
//! # 실행 순서
//! ```text
//! Event -> HookTable.resolve(discriminant id) -> hook.call()
//!       -> stage[0].consume() -> stage[1].consume() -> ...
//! ```
//!
//! 장애 격리는 이벤트 x 스테이지 단위입니다.
//! - 훅 실패는 로그로 남기고 스테이지 목록은 그대로 실행합니다.
//! - 스테이지 실패(패닉 포함)는 로그로 남기고 다음 스테이지를 실행합니다.
//! - 어떤 실패도 호출자에게 전파하지 않습니다.
//!
//! 디스패치는 수집기 워커 태스크 안에서 동기적으로 실행됩니다.

pub mod hook;
pub mod sink;

pub use hook::{FnHook, Hook, HookTable, TraceHook};
pub use sink::{ChannelSink, FnSink, JsonLinesSink, Sink, TracingSink};

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use metrics::counter;
use sysbeat_core::event::Event;
use sysbeat_core::metrics as m;
use tracing::warn;

use crate::error::CollectorError;

/// 훅 실행 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    /// 등록된 훅이 없음
    NotRegistered,
    /// 훅 성공
    Succeeded,
    /// 훅 실패 (스테이지는 계속 실행됨)
    Failed,
}

/// 디스패치 결과 요약
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    /// 실행된 스테이지 수
    pub stages_run: usize,
    /// 실패한 스테이지 수
    pub stage_failures: usize,
    /// 훅 실행 결과
    pub hook: HookOutcome,
}

impl DispatchReport {
    /// 실패가 하나도 없었는지 확인합니다.
    pub fn is_clean(&self) -> bool {
        self.stage_failures == 0 && self.hook != HookOutcome::Failed
    }
}

/// 디스패처
pub struct Dispatcher {
    source: String,
    hooks: HookTable,
    stages: Vec<Arc<dyn Sink>>,
}

impl Dispatcher {
    /// 스테이지와 훅이 없는 디스패처를 생성합니다.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            hooks: HookTable::new(),
            stages: Vec::new(),
        }
    }

    /// 스테이지를 추가합니다. 선언 순서대로 실행됩니다.
    pub fn with_stage(mut self, stage: Arc<dyn Sink>) -> Self {
        self.stages.push(stage);
        self
    }

    /// 훅 테이블을 설정합니다.
    pub fn with_hooks(mut self, hooks: HookTable) -> Self {
        self.hooks = hooks;
        self
    }

    /// 소스(수집기) 이름
    pub fn source(&self) -> &str {
        &self.source
    }

    /// 스테이지 수
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// 훅 테이블
    pub fn hooks(&self) -> &HookTable {
        &self.hooks
    }

    /// 이벤트 하나를 디스패치합니다.
    pub fn dispatch(&self, event: &Event) -> DispatchReport {
        counter!(m::DISPATCH_EVENTS_TOTAL, m::LABEL_COLLECTOR => self.source.clone()).increment(1);

        let event_id = event.discriminant_id();
        let hook = match self.hooks.resolve(event_id) {
            None => HookOutcome::NotRegistered,
            Some(hook) => match isolate(|| hook.call(event)) {
                Ok(()) => HookOutcome::Succeeded,
                Err(e) => {
                    counter!(m::DISPATCH_HOOK_FAILURES_TOTAL, m::LABEL_COLLECTOR => self.source.clone())
                        .increment(1);
                    warn!(
                        collector = %self.source,
                        event_id = ?event_id,
                        event = event.id(),
                        hook = hook.name(),
                        error = %e,
                        "hook failed"
                    );
                    HookOutcome::Failed
                }
            },
        };

        let mut stage_failures = 0;
        for stage in &self.stages {
            if let Err(e) = isolate(|| stage.consume(event)) {
                stage_failures += 1;
                counter!(
                    m::DISPATCH_STAGE_FAILURES_TOTAL,
                    m::LABEL_COLLECTOR => self.source.clone(),
                    m::LABEL_STAGE => stage.name().to_owned()
                )
                .increment(1);
                warn!(
                    collector = %self.source,
                    event_id = ?event_id,
                    event = event.id(),
                    stage = stage.name(),
                    error = %e,
                    "sink stage failed"
                );
            }
        }

        DispatchReport {
            stages_run: self.stages.len(),
            stage_failures,
            hook,
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stages: Vec<&str> = self.stages.iter().map(|s| s.name()).collect();
        f.debug_struct("Dispatcher")
            .field("source", &self.source)
            .field("stages", &stages)
            .field("hooks", &self.hooks)
            .finish()
    }
}

/// 패닉을 스테이지 에러로 바꿉니다.
fn isolate<F>(f: F) -> Result<(), CollectorError>
where
    F: FnOnce() -> Result<(), CollectorError>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_owned());
            Err(CollectorError::sink("panic", reason))
        }
    }
}
