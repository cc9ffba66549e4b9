//! 로그온 감사 훅
//!
//! Security 채널의 4624(로그온 성공), 4625(로그온 실패), 4634(로그오프) 이벤트에서
//! 사용자와 원격 주소를 꺼내 `win-logon` 감사 레코드를 남기고,
//! [`LogonRecord`]를 `windows_access_log` 체크포인트 버킷에 기록합니다.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sysbeat_core::audit::{AUDIT_KIND_LOGON, AuditRecord, AuditSink};
use sysbeat_core::checkpoint::{CheckpointKey, CheckpointStore};
use sysbeat_core::event::{Event, LogEvent};

use super::event_data::EventData;
use crate::dispatch::Hook;
use crate::error::CollectorError;

/// 로그온 기록 체크포인트 버킷
pub const LOGON_BUCKET: &str = "windows_access_log";

/// 로그온 성공
pub const EVENT_LOGON_SUCCESS: u64 = 4624;
/// 로그온 실패
pub const EVENT_LOGON_FAILURE: u64 = 4625;
/// 로그오프
pub const EVENT_LOGOFF: u64 = 4634;

/// 로그온 기록
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogonRecord {
    pub time: Option<DateTime<Utc>>,
    pub event_id: u64,
    pub task_text: String,
    pub data: EventData,
    pub pc: String,
    pub username: String,
    pub remote: String,
    pub port: String,
    pub sub_status: String,
    pub msg: String,
    pub keywords: Vec<String>,
}

impl LogonRecord {
    /// 이벤트와 추출한 EventData로 기록을 만듭니다.
    pub fn from_event(ev: &LogEvent, data: EventData) -> Self {
        let field = |name: &str| data.get(name).unwrap_or_default().to_owned();
        Self {
            time: ev.created,
            event_id: ev.event_id,
            task_text: ev.task_text.clone(),
            pc: field("TargetDomainName"),
            username: field("TargetUserName"),
            remote: field("IpAddress"),
            port: field("IpPort"),
            sub_status: field("SubStatus"),
            msg: compact_message(&ev.message),
            keywords: ev.keywords.clone(),
            data,
        }
    }
}

/// 로그온 감사 훅
pub struct LogonHook {
    checkpoints: Arc<dyn CheckpointStore>,
    audit: Arc<dyn AuditSink>,
}

impl LogonHook {
    pub fn new(checkpoints: Arc<dyn CheckpointStore>, audit: Arc<dyn AuditSink>) -> Self {
        Self { checkpoints, audit }
    }

    /// 훅이 처리하는 이벤트 ID
    pub fn event_ids() -> [u64; 3] {
        [EVENT_LOGON_SUCCESS, EVENT_LOGON_FAILURE, EVENT_LOGOFF]
    }
}

impl Hook for LogonHook {
    fn name(&self) -> &str {
        "logon"
    }

    fn call(&self, event: &Event) -> Result<(), CollectorError> {
        let Event::Log(ev) = event else {
            return Ok(());
        };
        let subject = match ev.event_id {
            EVENT_LOGON_SUCCESS => "logon success",
            EVENT_LOGON_FAILURE => "logon failure",
            EVENT_LOGOFF => "logoff",
            _ => return Ok(()),
        };

        let mut audit = AuditRecord::new(AUDIT_KIND_LOGON, subject, compact_message(&ev.message))
            .with_origin(ev.collector.as_str());
        if let Some(created) = ev.created {
            audit.time = created;
        }

        let data = match EventData::from_xml(&ev.xml) {
            Ok(data) => data,
            Err(e) => {
                self.audit.emit(audit.with_error(&e));
                return Err(e);
            }
        };
        let record = LogonRecord::from_event(ev, data);
        if !record.username.is_empty() {
            audit = audit.with_user(record.username.as_str());
        }
        if !record.remote.is_empty() {
            audit = audit.with_remote(record.remote.as_str(), record.port.parse().ok());
        }

        let result = serde_json::to_vec(&record)
            .map_err(|e| CollectorError::sink("logon", e.to_string()))
            .and_then(|payload| {
                let key = CheckpointKey::new(
                    LOGON_BUCKET,
                    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
                );
                self.checkpoints.put(&key, &payload).map_err(CollectorError::from)
            });
        if let Err(e) = &result {
            audit = audit.with_error(e);
        }
        self.audit.emit(audit);
        result
    }
}

/// 로그온 메시지의 빈 줄과 탭 들여쓰기를 줄입니다.
fn compact_message(msg: &str) -> String {
    msg.replace("\r\n", "\n")
        .replace("\n\n", "\n")
        .replace("\t\t", " ")
}
