//! 수집기 에러 타입
//!
//! [`CollectorError`]는 수집기 내부에서 발생하는 모든 에러를 표현합니다.
//! `From<CollectorError> for SysbeatError` 변환이 구현되어 있어
//! 상위 레이어에서 `?` 연산자로 자연스럽게 전파할 수 있습니다.
//!
//! | 변형 | 전파 |
//! |---|---|
//! | `Config` | 생성 시점에 호출자에게 반환 |
//! | `SourceOpen` | `start()` 실패로 호출자에게 반환 |
//! | `SubscriptionConflict` | 즉시 거부 |
//! | `Native`, `Decode` | 레코드/데이터그램 단위로 기록 후 계속 |
//! | `Sink` | 스테이지 단위로 격리, 전파하지 않음 |

use sysbeat_core::error::{CheckpointError, ConfigError, SourceError, SysbeatError};

/// 수집기 도메인 에러
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    /// 설정 에러
    #[error("config error: {field}: {reason}")]
    Config {
        /// 설정 필드명
        field: String,
        /// 에러 사유
        reason: String,
    },

    /// 네이티브 리소스 획득 실패
    #[error("failed to open {source_type} source: {reason}")]
    SourceOpen {
        /// 소스 유형 (winlog, dns)
        source_type: String,
        /// 실패 사유
        reason: String,
    },

    /// 이미 활성 구독이 있는 채널
    #[error("a watcher for channel '{channel}' already exists")]
    SubscriptionConflict {
        /// 채널 이름
        channel: String,
    },

    /// 네이티브 API 호출 실패
    #[error("native call {call} failed: {reason}")]
    Native {
        /// 호출 이름 (EvtSubscribe 등)
        call: &'static str,
        /// 실패 사유
        reason: String,
    },

    /// 페이로드 디코딩 실패
    #[error("decode error at offset {offset}: {reason}")]
    Decode {
        /// 실패 위치 (바이트 오프셋)
        offset: usize,
        /// 실패 사유
        reason: String,
    },

    /// 싱크/훅 스테이지 실패
    #[error("stage '{stage}' failed: {reason}")]
    Sink {
        /// 스테이지 이름
        stage: String,
        /// 실패 사유
        reason: String,
    },

    /// 체크포인트 저장소 에러
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// 수집기 상태 에러
    #[error("collector '{name}' is {state}")]
    State {
        /// 수집기 이름
        name: String,
        /// 현재 상태 설명
        state: &'static str,
    },

    /// I/O 에러
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CollectorError {
    /// 설정 에러를 생성합니다.
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// 네이티브 호출 에러를 생성합니다.
    pub fn native(call: &'static str, reason: impl Into<String>) -> Self {
        Self::Native {
            call,
            reason: reason.into(),
        }
    }

    /// 싱크 스테이지 에러를 생성합니다.
    pub fn sink(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Sink {
            stage: stage.into(),
            reason: reason.into(),
        }
    }
}

impl From<CollectorError> for SysbeatError {
    fn from(err: CollectorError) -> Self {
        match err {
            CollectorError::Config { field, reason } => {
                SysbeatError::Config(ConfigError::InvalidValue { field, reason })
            }
            CollectorError::SourceOpen {
                source_type,
                reason,
            } => SysbeatError::Source(SourceError::Open {
                source_type,
                reason,
            }),
            CollectorError::SubscriptionConflict { channel } => {
                SysbeatError::Source(SourceError::SubscriptionConflict { channel })
            }
            CollectorError::Checkpoint(e) => SysbeatError::Checkpoint(e),
            CollectorError::Io(e) => SysbeatError::Io(e),
            other => SysbeatError::Source(SourceError::Other(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_converts_to_core_config_error() {
        let err: SysbeatError = CollectorError::config("bind", "unsupported scheme").into();
        assert!(matches!(
            err,
            SysbeatError::Config(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn conflict_converts_to_source_error() {
        let err: SysbeatError = CollectorError::SubscriptionConflict {
            channel: "Security".to_owned(),
        }
        .into();
        assert!(matches!(
            err,
            SysbeatError::Source(SourceError::SubscriptionConflict { .. })
        ));
    }

    #[test]
    fn native_error_display() {
        let err = CollectorError::native("EvtSubscribe", "access denied");
        assert_eq!(err.to_string(), "native call EvtSubscribe failed: access denied");
    }

    #[test]
    fn decode_error_falls_back_to_other() {
        let err: SysbeatError = CollectorError::Decode {
            offset: 12,
            reason: "truncated".to_owned(),
        }
        .into();
        assert!(matches!(err, SysbeatError::Source(SourceError::Other(_))));
    }
}
