//! 네이티브 이벤트 로그 경계
//!
//! [`EventLogApi`]는 구독, 렌더링, 북마크, 게시자 메시지 포맷 호출을 추상화합니다.
//! 핸들은 불투명한 [`RawHandle`]이며, 획득한 쪽이 [`OwnedHandle`]로 감싸 소유합니다.
//!
//! 구현:
//! - `wevtapi` (Windows 전용)
//! - [`MemoryEventLog`](super::memory::MemoryEventLog) (테스트, 재생, 임베딩)

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use sysbeat_core::event::LogEvent;
use tracing::debug;

use crate::error::CollectorError;

/// 불투명 네이티브 핸들
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawHandle(pub u64);

impl fmt::Display for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// 구독 시작 위치
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartAt {
    /// 채널의 가장 오래된 레코드부터
    Oldest,
    /// 구독 이후 도착하는 레코드만
    Future,
    /// 북마크가 가리키는 레코드 다음부터
    AfterBookmark(RawHandle),
}

/// 게시자 메시지 포맷 대상 필드
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageField {
    Event,
    Level,
    Task,
    Opcode,
    /// 여러 값은 `'\0'`으로 구분됩니다.
    Keyword,
    Channel,
    Provider,
    Id,
}

/// 렌더링된 시스템 속성
///
/// 추출에 실패한 필드는 `None`입니다.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemValues {
    pub provider_name: Option<String>,
    pub event_id: Option<u64>,
    pub qualifiers: Option<u64>,
    pub level: Option<u64>,
    pub task: Option<u64>,
    pub opcode: Option<u64>,
    pub created: Option<DateTime<Utc>>,
    pub record_id: Option<u64>,
    pub process_id: Option<u64>,
    pub thread_id: Option<u64>,
    pub channel: Option<String>,
    pub computer: Option<String>,
    pub version: Option<u64>,
}

impl SystemValues {
    /// 이벤트에 값을 채우고, 비어 있던 필드 이름을 반환합니다.
    pub fn apply(self, ev: &mut LogEvent) -> Vec<&'static str> {
        let mut missing = Vec::new();

        fn take<T: Default>(value: Option<T>, name: &'static str, missing: &mut Vec<&'static str>) -> T {
            value.unwrap_or_else(|| {
                missing.push(name);
                T::default()
            })
        }

        ev.provider_name = take(self.provider_name, "provider_name", &mut missing);
        ev.event_id = take(self.event_id, "event_id", &mut missing);
        ev.qualifiers = take(self.qualifiers, "qualifiers", &mut missing);
        ev.level = take(self.level, "level", &mut missing);
        ev.task = take(self.task, "task", &mut missing);
        ev.opcode = take(self.opcode, "opcode", &mut missing);
        ev.record_id = take(self.record_id, "record_id", &mut missing);
        ev.process_id = take(self.process_id, "process_id", &mut missing);
        ev.thread_id = take(self.thread_id, "thread_id", &mut missing);
        ev.channel = take(self.channel, "channel", &mut missing);
        ev.computer = take(self.computer, "computer", &mut missing);
        ev.version = take(self.version, "version", &mut missing);
        if self.created.is_none() {
            missing.push("created");
        }
        ev.created = self.created;

        missing
    }

    /// 이름으로 필드를 비웁니다. 알 수 없는 이름은 무시합니다.
    pub fn clear(&mut self, name: &str) {
        match name {
            "provider_name" => self.provider_name = None,
            "event_id" => self.event_id = None,
            "qualifiers" => self.qualifiers = None,
            "level" => self.level = None,
            "task" => self.task = None,
            "opcode" => self.opcode = None,
            "created" => self.created = None,
            "record_id" => self.record_id = None,
            "process_id" => self.process_id = None,
            "thread_id" => self.thread_id = None,
            "channel" => self.channel = None,
            "computer" => self.computer = None,
            "version" => self.version = None,
            _ => {}
        }
    }
}

/// 구독 콜백 수신자
///
/// 네이티브 콜백 스레드에서 호출됩니다. 하류 큐가 가득 차면 `deliver`가 슬롯이 날 때까지
/// 블로킹할 수 있으므로, 구현체는 비동기 런타임 스레드에서 콜백을 호출하면 안 됩니다.
/// `deliver`에 전달된 레코드 핸들은 호출이 끝나면 무효가 됩니다.
pub trait RecordSink: Send + Sync {
    /// 레코드 하나를 전달합니다.
    fn deliver(&self, record: RawHandle);

    /// 구독 수준의 에러를 전달합니다.
    fn fail(&self, error: CollectorError);
}

/// 네이티브 이벤트 로그 API
pub trait EventLogApi: Send + Sync {
    /// 시스템 속성 렌더링 컨텍스트를 생성합니다.
    fn create_render_context(&self) -> Result<RawHandle, CollectorError>;

    /// 북마크를 생성합니다. `xml`이 있으면 그 위치에서 시작합니다.
    fn create_bookmark(&self, xml: Option<&str>) -> Result<RawHandle, CollectorError>;

    /// 채널을 구독합니다.
    fn subscribe(
        &self,
        channel: &str,
        query: &str,
        start: StartAt,
        sink: Arc<dyn RecordSink>,
    ) -> Result<RawHandle, CollectorError>;

    /// 시스템 속성을 렌더링합니다.
    fn render_values(
        &self,
        context: RawHandle,
        record: RawHandle,
    ) -> Result<SystemValues, CollectorError>;

    /// 레코드의 원본 XML을 렌더링합니다.
    fn render_xml(&self, record: RawHandle) -> Result<String, CollectorError>;

    /// 북마크를 레코드 위치로 옮깁니다.
    fn update_bookmark(&self, bookmark: RawHandle, record: RawHandle)
    -> Result<(), CollectorError>;

    /// 북마크를 XML 토큰으로 렌더링합니다.
    fn render_bookmark(&self, bookmark: RawHandle) -> Result<String, CollectorError>;

    /// 게시자 메타데이터를 엽니다.
    fn open_publisher(&self, provider: &str) -> Result<RawHandle, CollectorError>;

    /// 게시자 메타데이터로 지역화 텍스트를 포맷합니다.
    fn format_message(
        &self,
        publisher: RawHandle,
        record: RawHandle,
        field: MessageField,
    ) -> Result<String, CollectorError>;

    /// 핸들을 닫습니다. 구독 핸들은 진행 중인 콜백이 끝난 뒤에 닫힙니다.
    fn close(&self, handle: RawHandle) -> Result<(), CollectorError>;
}

/// 소유 핸들
///
/// 드롭되거나 `close()`가 처음 호출될 때 정확히 한 번 닫힙니다.
pub struct OwnedHandle {
    raw: RawHandle,
    api: Arc<dyn EventLogApi>,
    closed: AtomicBool,
}

impl OwnedHandle {
    /// 획득한 핸들을 감쌉니다.
    pub fn new(raw: RawHandle, api: Arc<dyn EventLogApi>) -> Self {
        Self {
            raw,
            api,
            closed: AtomicBool::new(false),
        }
    }

    pub fn raw(&self) -> RawHandle {
        self.raw
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 핸들을 닫습니다. 두 번째 호출부터는 아무것도 하지 않습니다.
    pub fn close(&self) -> Result<(), CollectorError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.api.close(self.raw)
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!(handle = %self.raw, error = %e, "failed to close native handle");
        }
    }
}

impl fmt::Debug for OwnedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedHandle")
            .field("raw", &self.raw)
            .field("closed", &self.is_closed())
            .finish()
    }
}
