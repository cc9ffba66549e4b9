//! 감사 레코드 -- 수집 경로에서 발생한 비치명적 사건의 기록
//!
//! 체크포인트 쓰기 실패, 소스 수준 에러, 북마크 로드, 로그온 이벤트 등이
//! [`AuditRecord`]로 [`AuditSink`]에 전달됩니다.
//! 기본 구현인 [`TracingAuditSink`]는 `audit` tracing 타깃으로 기록합니다.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// 감사 레코드 종류: 이벤트 로그 수집기
pub const AUDIT_KIND_WINLOG: &str = "win-log";
/// 감사 레코드 종류: 로그온/로그오프
pub const AUDIT_KIND_LOGON: &str = "win-logon";
/// 감사 레코드 종류: DNS 수집기
pub const AUDIT_KIND_DNS: &str = "dns";
/// 감사 레코드 종류: 체크포인트 저장소
pub const AUDIT_KIND_CHECKPOINT: &str = "checkpoint";

/// 감사 레코드
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRecord {
    /// 레코드 종류 (예: "win-log")
    pub kind: String,
    /// 대상 (수집기 이름, 채널 이름 등)
    pub subject: String,
    /// 발생 위치 (채널, 바인드 주소 등)
    pub origin: String,
    /// 메시지
    pub message: String,
    /// 관련 에러
    pub error: Option<String>,
    /// 관련 사용자
    pub user: Option<String>,
    /// 원격 주소
    pub remote_addr: Option<String>,
    /// 원격 포트
    pub remote_port: Option<u16>,
    /// 발생 시각
    pub time: DateTime<Utc>,
}

impl AuditRecord {
    /// 새 감사 레코드를 생성합니다.
    pub fn new(
        kind: impl Into<String>,
        subject: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            subject: subject.into(),
            origin: String::new(),
            message: message.into(),
            error: None,
            user: None,
            remote_addr: None,
            remote_port: None,
            time: Utc::now(),
        }
    }

    /// 발생 위치를 설정합니다.
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    /// 관련 에러를 설정합니다.
    pub fn with_error(mut self, error: impl std::fmt::Display) -> Self {
        self.error = Some(error.to_string());
        self
    }

    /// 관련 사용자를 설정합니다.
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// 원격 주소와 포트를 설정합니다.
    pub fn with_remote(mut self, addr: impl Into<String>, port: Option<u16>) -> Self {
        self.remote_addr = Some(addr.into());
        self.remote_port = port;
        self
    }
}

/// 감사 레코드 수신자
pub trait AuditSink: Send + Sync {
    /// 레코드를 기록합니다. 실패해도 호출자에게 전파하지 않습니다.
    fn emit(&self, record: AuditRecord);
}

/// `audit` tracing 타깃으로 기록하는 감사 수신자
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, record: AuditRecord) {
        tracing::info!(
            target: "audit",
            kind = %record.kind,
            subject = %record.subject,
            origin = %record.origin,
            error = record.error.as_deref().unwrap_or(""),
            user = record.user.as_deref().unwrap_or(""),
            remote_addr = record.remote_addr.as_deref().unwrap_or(""),
            remote_port = record.remote_port.unwrap_or(0),
            "{}",
            record.message
        );
    }
}

/// 레코드를 메모리에 쌓아 두는 감사 수신자
///
/// 임베딩 환경에서 감사 레코드를 직접 소비하거나 테스트에서 검증할 때 사용합니다.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    /// 빈 수신자를 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    /// 지금까지 기록된 레코드의 복사본을 반환합니다.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// 특정 종류의 레코드만 반환합니다.
    pub fn records_of(&self, kind: &str) -> Vec<AuditRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.kind == kind)
            .collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn emit(&self, record: AuditRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_optional_fields() {
        let record = AuditRecord::new(AUDIT_KIND_LOGON, "security", "logon success")
            .with_origin("Security")
            .with_user("CORP\\alice")
            .with_remote("10.0.0.5", Some(50122))
            .with_error("none");
        assert_eq!(record.origin, "Security");
        assert_eq!(record.user.as_deref(), Some("CORP\\alice"));
        assert_eq!(record.remote_port, Some(50122));
        assert_eq!(record.error.as_deref(), Some("none"));
    }

    #[test]
    fn memory_sink_filters_by_kind() {
        let sink = MemoryAuditSink::new();
        sink.emit(AuditRecord::new(AUDIT_KIND_WINLOG, "a", "one"));
        sink.emit(AuditRecord::new(AUDIT_KIND_DNS, "b", "two"));
        assert_eq!(sink.records().len(), 2);
        assert_eq!(sink.records_of(AUDIT_KIND_DNS)[0].message, "two");
    }

    #[test]
    fn tracing_sink_does_not_panic_without_subscriber() {
        TracingAuditSink.emit(AuditRecord::new(AUDIT_KIND_WINLOG, "a", "msg"));
    }
}
