//! Windows Event Log (wevtapi) 백엔드
//!
//! 구독 콜백 컨텍스트는 `Box<Arc<dyn RecordSink>>`의 원시 포인터입니다.
//! 구독 핸들이 닫힌 뒤에만 해제합니다.

use std::collections::HashMap;
use std::ffi::c_void;
use std::io;
use std::iter::once;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use windows_sys::Win32::Foundation::ERROR_INSUFFICIENT_BUFFER;
use windows_sys::Win32::System::EventLog::{
    EVT_HANDLE, EVT_SUBSCRIBE_NOTIFY_ACTION, EVT_VARIANT, EvtClose, EvtCreateBookmark,
    EvtCreateRenderContext, EvtFormatMessage, EvtFormatMessageChannel, EvtFormatMessageEvent,
    EvtFormatMessageId, EvtFormatMessageKeyword, EvtFormatMessageLevel, EvtFormatMessageOpcode,
    EvtFormatMessageProvider, EvtFormatMessageTask, EvtOpenPublisherMetadata, EvtRender,
    EvtRenderBookmark, EvtRenderContextSystem, EvtRenderEventValues, EvtRenderEventXml,
    EvtSubscribe, EvtSubscribeActionDeliver, EvtSubscribeStartAfterBookmark,
    EvtSubscribeStartAtOldestRecord, EvtSubscribeToFutureEvents, EvtUpdateBookmark,
    EvtVarTypeByte, EvtVarTypeFileTime, EvtVarTypeHexInt32, EvtVarTypeHexInt64, EvtVarTypeInt16,
    EvtVarTypeInt32, EvtVarTypeInt64, EvtVarTypeSByte, EvtVarTypeString, EvtVarTypeUInt16,
    EvtVarTypeUInt32, EvtVarTypeUInt64,
};

use super::native::{EventLogApi, MessageField, RawHandle, RecordSink, StartAt, SystemValues};
use crate::error::CollectorError;

// EVT_SYSTEM_PROPERTY_ID
const PROP_PROVIDER_NAME: usize = 0;
const PROP_EVENT_ID: usize = 2;
const PROP_QUALIFIERS: usize = 3;
const PROP_LEVEL: usize = 4;
const PROP_TASK: usize = 5;
const PROP_OPCODE: usize = 6;
const PROP_TIME_CREATED: usize = 8;
const PROP_RECORD_ID: usize = 9;
const PROP_PROCESS_ID: usize = 12;
const PROP_THREAD_ID: usize = 13;
const PROP_CHANNEL: usize = 14;
const PROP_COMPUTER: usize = 15;
const PROP_VERSION: usize = 17;

/// 1601-01-01부터 1970-01-01까지의 초
const FILETIME_UNIX_OFFSET_SECS: i64 = 11_644_473_600;

type SinkBox = Arc<dyn RecordSink>;

/// wevtapi 백엔드
#[derive(Default)]
pub struct WevtApi {
    // 구독 핸들 -> Box<SinkBox> 포인터
    contexts: Mutex<HashMap<u64, usize>>,
}

impl WevtApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn contexts(&self) -> MutexGuard<'_, HashMap<u64, usize>> {
        self.contexts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn to_evt(handle: RawHandle) -> EVT_HANDLE {
    handle.0 as usize as EVT_HANDLE
}

fn from_evt(handle: EVT_HANDLE) -> RawHandle {
    RawHandle(handle as usize as u64)
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(once(0)).collect()
}

fn last_error(call: &'static str) -> CollectorError {
    CollectorError::native(call, io::Error::last_os_error().to_string())
}

fn insufficient_buffer() -> bool {
    io::Error::last_os_error().raw_os_error() == Some(ERROR_INSUFFICIENT_BUFFER as i32)
}

fn checked(call: &'static str, handle: EVT_HANDLE) -> Result<RawHandle, CollectorError> {
    let raw = from_evt(handle);
    if raw.0 == 0 {
        Err(last_error(call))
    } else {
        Ok(raw)
    }
}

unsafe fn read_wide(ptr: *const u16) -> String {
    if ptr.is_null() {
        return String::new();
    }
    let mut len = 0;
    // SAFETY: 호출자가 NUL 종료 문자열 포인터를 보장합니다.
    unsafe {
        while *ptr.add(len) != 0 {
            len += 1;
        }
        String::from_utf16_lossy(std::slice::from_raw_parts(ptr, len))
    }
}

fn filetime_to_utc(filetime: u64) -> Option<DateTime<Utc>> {
    let secs = (filetime / 10_000_000) as i64 - FILETIME_UNIX_OFFSET_SECS;
    let nanos = ((filetime % 10_000_000) * 100) as u32;
    DateTime::from_timestamp(secs, nanos)
}

unsafe fn variant_u64(v: &EVT_VARIANT) -> Option<u64> {
    let ty = v.Type as i32;
    // SAFETY: Type 필드가 유니온의 활성 멤버를 결정합니다.
    unsafe {
        let value = match ty {
            t if t == EvtVarTypeByte as i32 => u64::from(v.Anonymous.ByteVal),
            t if t == EvtVarTypeSByte as i32 => v.Anonymous.SByteVal as u64,
            t if t == EvtVarTypeUInt16 as i32 => u64::from(v.Anonymous.UInt16Val),
            t if t == EvtVarTypeInt16 as i32 => v.Anonymous.Int16Val as u64,
            t if t == EvtVarTypeUInt32 as i32 || t == EvtVarTypeHexInt32 as i32 => {
                u64::from(v.Anonymous.UInt32Val)
            }
            t if t == EvtVarTypeInt32 as i32 => v.Anonymous.Int32Val as u64,
            t if t == EvtVarTypeUInt64 as i32 || t == EvtVarTypeHexInt64 as i32 => {
                v.Anonymous.UInt64Val
            }
            t if t == EvtVarTypeInt64 as i32 => v.Anonymous.Int64Val as u64,
            _ => return None,
        };
        Some(value)
    }
}

unsafe fn variant_string(v: &EVT_VARIANT) -> Option<String> {
    if v.Type as i32 != EvtVarTypeString as i32 {
        return None;
    }
    // SAFETY: 문자열 타입이면 StringVal이 활성 멤버입니다.
    Some(unsafe { read_wide(v.Anonymous.StringVal) })
}

unsafe fn variant_time(v: &EVT_VARIANT) -> Option<DateTime<Utc>> {
    if v.Type as i32 != EvtVarTypeFileTime as i32 {
        return None;
    }
    // SAFETY: FILETIME 타입이면 FileTimeVal이 활성 멤버입니다.
    filetime_to_utc(unsafe { v.Anonymous.FileTimeVal })
}

/// 크기 조회 후 다시 호출하는 EvtRender (XML/북마크)
fn render_text(handle: RawHandle, flags: u32, call: &'static str) -> Result<String, CollectorError> {
    let mut used = 0u32;
    let mut count = 0u32;
    // SAFETY: 크기 조회 호출은 버퍼를 쓰지 않습니다.
    let ok = unsafe {
        EvtRender(0 as _, to_evt(handle), flags, 0, std::ptr::null_mut(), &mut used, &mut count)
    };
    if ok == 0 && !insufficient_buffer() {
        return Err(last_error(call));
    }

    let mut buf = vec![0u16; (used as usize).div_ceil(2)];
    // SAFETY: 버퍼 크기는 직전 호출이 보고한 바이트 수 이상입니다.
    let ok = unsafe {
        EvtRender(
            0 as _,
            to_evt(handle),
            flags,
            (buf.len() * 2) as u32,
            buf.as_mut_ptr().cast::<c_void>(),
            &mut used,
            &mut count,
        )
    };
    if ok == 0 {
        return Err(last_error(call));
    }
    let end = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
    Ok(String::from_utf16_lossy(&buf[..end]))
}

unsafe extern "system" fn on_subscription(
    action: EVT_SUBSCRIBE_NOTIFY_ACTION,
    context: *const c_void,
    event: EVT_HANDLE,
) -> u32 {
    if context.is_null() {
        return 0;
    }
    // SAFETY: context는 구독이 닫힐 때까지 살아 있는 Box<SinkBox>입니다.
    let sink = unsafe { &*context.cast::<SinkBox>() };
    let _ = catch_unwind(AssertUnwindSafe(|| {
        if action == EvtSubscribeActionDeliver {
            sink.deliver(from_evt(event));
        } else {
            // 에러 통지에서는 event 자리에 Win32 에러 코드가 옵니다.
            sink.fail(CollectorError::native(
                "EvtSubscribe",
                format!("subscription error {}", event as usize),
            ));
        }
    }));
    0
}

impl EventLogApi for WevtApi {
    fn create_render_context(&self) -> Result<RawHandle, CollectorError> {
        // SAFETY: 경로 없이 시스템 속성 컨텍스트를 만듭니다.
        let handle = unsafe { EvtCreateRenderContext(0, std::ptr::null(), EvtRenderContextSystem) };
        checked("EvtCreateRenderContext", handle)
    }

    fn create_bookmark(&self, xml: Option<&str>) -> Result<RawHandle, CollectorError> {
        let text = xml.map(wide);
        let ptr = text.as_ref().map_or(std::ptr::null(), |t| t.as_ptr());
        // SAFETY: ptr은 NULL이거나 NUL 종료 UTF-16입니다.
        let handle = unsafe { EvtCreateBookmark(ptr) };
        checked("EvtCreateBookmark", handle)
    }

    fn subscribe(
        &self,
        channel: &str,
        query: &str,
        start: StartAt,
        sink: Arc<dyn RecordSink>,
    ) -> Result<RawHandle, CollectorError> {
        let (flags, bookmark) = match start {
            StartAt::Oldest => (EvtSubscribeStartAtOldestRecord, RawHandle(0)),
            StartAt::Future => (EvtSubscribeToFutureEvents, RawHandle(0)),
            StartAt::AfterBookmark(b) => (EvtSubscribeStartAfterBookmark, b),
        };
        let channel_w = wide(channel);
        let query_w = wide(query);
        let context = Box::into_raw(Box::new(sink));

        // SAFETY: context는 구독 핸들이 닫힐 때까지 해제하지 않습니다.
        let handle = unsafe {
            EvtSubscribe(
                0 as _,
                0 as _,
                channel_w.as_ptr(),
                query_w.as_ptr(),
                to_evt(bookmark),
                context.cast::<c_void>().cast_const(),
                Some(on_subscription),
                flags,
            )
        };
        match checked("EvtSubscribe", handle) {
            Ok(raw) => {
                self.contexts().insert(raw.0, context as usize);
                Ok(raw)
            }
            Err(e) => {
                // SAFETY: 구독이 만들어지지 않았으므로 콜백이 참조하지 않습니다.
                drop(unsafe { Box::from_raw(context) });
                Err(e)
            }
        }
    }

    fn render_values(
        &self,
        context: RawHandle,
        record: RawHandle,
    ) -> Result<SystemValues, CollectorError> {
        let mut used = 0u32;
        let mut count = 0u32;
        // SAFETY: 크기 조회 호출
        let ok = unsafe {
            EvtRender(
                to_evt(context),
                to_evt(record),
                EvtRenderEventValues,
                0,
                std::ptr::null_mut(),
                &mut used,
                &mut count,
            )
        };
        if ok == 0 && !insufficient_buffer() {
            return Err(last_error("EvtRender"));
        }

        // EVT_VARIANT 정렬을 위해 u64 버퍼를 사용합니다.
        let mut buf = vec![0u64; (used as usize).div_ceil(8)];
        // SAFETY: 버퍼 크기는 보고된 바이트 수 이상입니다.
        let ok = unsafe {
            EvtRender(
                to_evt(context),
                to_evt(record),
                EvtRenderEventValues,
                (buf.len() * 8) as u32,
                buf.as_mut_ptr().cast::<c_void>(),
                &mut used,
                &mut count,
            )
        };
        if ok == 0 {
            return Err(last_error("EvtRender"));
        }

        // SAFETY: EvtRender가 count개의 EVT_VARIANT를 버퍼 앞쪽에 기록했습니다.
        let props =
            unsafe { std::slice::from_raw_parts(buf.as_ptr().cast::<EVT_VARIANT>(), count as usize) };
        let num = |i: usize| props.get(i).and_then(|v| unsafe { variant_u64(v) });
        let text = |i: usize| props.get(i).and_then(|v| unsafe { variant_string(v) });

        Ok(SystemValues {
            provider_name: text(PROP_PROVIDER_NAME),
            event_id: num(PROP_EVENT_ID),
            qualifiers: num(PROP_QUALIFIERS),
            level: num(PROP_LEVEL),
            task: num(PROP_TASK),
            opcode: num(PROP_OPCODE),
            created: props
                .get(PROP_TIME_CREATED)
                .and_then(|v| unsafe { variant_time(v) }),
            record_id: num(PROP_RECORD_ID),
            process_id: num(PROP_PROCESS_ID),
            thread_id: num(PROP_THREAD_ID),
            channel: text(PROP_CHANNEL),
            computer: text(PROP_COMPUTER),
            version: num(PROP_VERSION),
        })
    }

    fn render_xml(&self, record: RawHandle) -> Result<String, CollectorError> {
        render_text(record, EvtRenderEventXml, "EvtRender")
    }

    fn update_bookmark(
        &self,
        bookmark: RawHandle,
        record: RawHandle,
    ) -> Result<(), CollectorError> {
        // SAFETY: 두 핸들 모두 호출자가 소유한 유효한 핸들입니다.
        let ok = unsafe { EvtUpdateBookmark(to_evt(bookmark), to_evt(record)) };
        if ok == 0 {
            return Err(last_error("EvtUpdateBookmark"));
        }
        Ok(())
    }

    fn render_bookmark(&self, bookmark: RawHandle) -> Result<String, CollectorError> {
        render_text(bookmark, EvtRenderBookmark, "EvtRender")
    }

    fn open_publisher(&self, provider: &str) -> Result<RawHandle, CollectorError> {
        let provider_w = wide(provider);
        // SAFETY: 로컬 세션, 기본 로캘
        let handle = unsafe {
            EvtOpenPublisherMetadata(0 as _, provider_w.as_ptr(), std::ptr::null(), 0, 0)
        };
        checked("EvtOpenPublisherMetadata", handle)
    }

    fn format_message(
        &self,
        publisher: RawHandle,
        record: RawHandle,
        field: MessageField,
    ) -> Result<String, CollectorError> {
        let flags = match field {
            MessageField::Event => EvtFormatMessageEvent,
            MessageField::Level => EvtFormatMessageLevel,
            MessageField::Task => EvtFormatMessageTask,
            MessageField::Opcode => EvtFormatMessageOpcode,
            MessageField::Keyword => EvtFormatMessageKeyword,
            MessageField::Channel => EvtFormatMessageChannel,
            MessageField::Provider => EvtFormatMessageProvider,
            MessageField::Id => EvtFormatMessageId,
        };

        let mut used = 0u32;
        // SAFETY: 크기 조회 호출
        let ok = unsafe {
            EvtFormatMessage(
                to_evt(publisher),
                to_evt(record),
                0,
                0,
                std::ptr::null(),
                flags,
                0,
                std::ptr::null_mut(),
                &mut used,
            )
        };
        if ok == 0 && !insufficient_buffer() {
            return Err(last_error("EvtFormatMessage"));
        }

        let mut buf = vec![0u16; used as usize];
        // SAFETY: 버퍼 크기는 보고된 문자 수 이상입니다.
        let ok = unsafe {
            EvtFormatMessage(
                to_evt(publisher),
                to_evt(record),
                0,
                0,
                std::ptr::null(),
                flags,
                buf.len() as u32,
                buf.as_mut_ptr(),
                &mut used,
            )
        };
        if ok == 0 {
            return Err(last_error("EvtFormatMessage"));
        }
        // 키워드는 NUL로 구분된 목록이므로 끝의 NUL만 제거합니다.
        let text = String::from_utf16_lossy(&buf[..(used as usize).min(buf.len())]);
        Ok(text.trim_end_matches('\0').to_owned())
    }

    fn close(&self, handle: RawHandle) -> Result<(), CollectorError> {
        // SAFETY: 핸들은 OwnedHandle이 한 번만 닫습니다.
        let ok = unsafe { EvtClose(to_evt(handle)) };
        if ok == 0 {
            return Err(last_error("EvtClose"));
        }
        if let Some(context) = self.contexts().remove(&handle.0) {
            // SAFETY: 구독 핸들이 닫혀 더 이상 콜백이 호출되지 않습니다.
            drop(unsafe { Box::from_raw(context as *mut SinkBox) });
        }
        Ok(())
    }
}
