//! Windows 이벤트 로그 네이티브 소스
//!
//! - [`native`]: 네이티브 API trait, 소유 핸들
//! - [`memory`]: 프로세스 내 이벤트 로그
//! - `wevtapi`: Windows Event Log 바인딩 (Windows 전용)
//! - [`watcher`]: 채널 구독과 레코드 변환
//! - [`collector`]: 구독 알고리즘, 재조정, 전달 루프
//! - [`event_data`], [`logon`]: EventData 추출과 로그온 감사 훅

use std::sync::Arc;

pub mod collector;
pub mod event_data;
pub mod logon;
pub mod memory;
pub mod native;
pub mod watcher;
#[cfg(windows)]
pub mod wevtapi;

pub use collector::{ReloadReport, WINLOG_KIND, WinlogCollector, WinlogCollectorBuilder};
pub use event_data::{DataItem, EventData};
pub use logon::{LOGON_BUCKET, LogonHook, LogonRecord};
pub use memory::{MemoryEventLog, MemoryRecord};
pub use native::{EventLogApi, MessageField, OwnedHandle, RawHandle, RecordSink, StartAt, SystemValues};
pub use watcher::Watcher;

/// 현재 플랫폼의 네이티브 이벤트 로그 백엔드
///
/// Windows가 아니면 `None`입니다.
pub fn platform_event_log() -> Option<Arc<dyn EventLogApi>> {
    #[cfg(windows)]
    {
        Some(Arc::new(wevtapi::WevtApi::new()))
    }
    #[cfg(not(windows))]
    {
        None
    }
}
