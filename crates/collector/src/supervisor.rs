//! 수집기 감독 -- 워커 태스크 핸들, 유휴 대기, 설정 교체
//!
//! 각 수집기는 정확히 하나의 tokio 태스크를 실행합니다. 태스크는
//! [`CancellationToken`]을 매 반복마다 관찰하며, 설정은 [`LiveConfig`]를
//! `watch` 채널로 교체해 다음 반복부터 반영됩니다.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::BackoffConfig;
use crate::dispatch::Dispatcher;

/// 수집기 상태
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectorStatus {
    /// 생성됨, 아직 시작하지 않음
    Idle,
    /// 실행 중
    Running,
    /// 정지됨
    Stopped,
}

impl CollectorStatus {
    /// 상태 이름을 반환합니다.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }
}

/// 워커가 매 반복마다 읽는 설정 스냅샷
#[derive(Debug)]
pub struct LiveConfig<C> {
    /// 수집기 설정
    pub config: C,
    /// 디스패처
    pub dispatcher: Arc<Dispatcher>,
}

impl<C> LiveConfig<C> {
    /// 새 스냅샷을 생성합니다.
    pub fn new(config: C, dispatcher: Arc<Dispatcher>) -> Arc<Self> {
        Arc::new(Self { config, dispatcher })
    }
}

/// 설정 스냅샷 송신측
pub type LiveSender<C> = watch::Sender<Arc<LiveConfig<C>>>;

/// 설정 스냅샷 수신측
pub type LiveReceiver<C> = watch::Receiver<Arc<LiveConfig<C>>>;

/// 유휴 대기 간격
///
/// 활동이 없을 때마다 `step`씩 늘어나며 `max`를 넘지 않습니다.
/// 이벤트가 전달되면 즉시 `min`으로 돌아갑니다.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    step: Duration,
    current: Duration,
}

impl Backoff {
    /// 새 대기 간격을 생성합니다. `max < min`이면 `max = min`으로 보정합니다.
    pub fn new(min: Duration, max: Duration, step: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            step,
            current: min,
        }
    }

    /// 설정에서 생성합니다.
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.min, config.max, config.step)
    }

    /// 이번 유휴 대기 간격을 반환하고 다음 간격을 늘립니다.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_add(self.step).min(self.max);
        delay
    }

    /// 최소 간격으로 되돌립니다.
    pub fn reset(&mut self) {
        self.current = self.min;
    }

    /// 다음에 반환될 간격
    pub fn current(&self) -> Duration {
        self.current
    }

    /// 상한
    pub fn ceiling(&self) -> Duration {
        self.max
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&BackoffConfig::default())
    }
}

/// 백그라운드 워커 핸들
///
/// `shutdown`은 멱등입니다.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// 워커 태스크를 스폰합니다. 태스크는 `cancel`을 관찰해야 합니다.
    pub fn spawn<F>(name: impl Into<String>, cancel: CancellationToken, worker: F) -> Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        Self {
            name: name.into(),
            cancel,
            task: Some(tokio::spawn(worker)),
        }
    }

    /// 워커가 아직 실행 중인지 확인합니다.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// 워커를 취소하고 종료를 기다립니다.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        let Some(task) = self.task.take() else {
            return;
        };
        match task.await {
            Ok(()) => debug!(collector = %self.name, "worker stopped"),
            Err(e) if e.is_panic() => warn!(collector = %self.name, "worker panicked"),
            Err(e) => debug!(collector = %self.name, error = %e, "worker join failed"),
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
