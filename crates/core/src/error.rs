//! 에러 타입 -- 도메인별 에러 정의

/// sysbeat 최상위 에러 타입
#[derive(Debug, thiserror::Error)]
pub enum SysbeatError {
    /// 설정 관련 에러
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// 수집 소스 에러
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    /// 체크포인트 저장소 에러
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// I/O 에러
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 설정 관련 에러
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// 설정 파일을 찾을 수 없음
    #[error("config file not found: {path}")]
    FileNotFound { path: String },

    /// 설정 파싱 실패
    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    /// 유효하지 않은 설정 값
    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// 수집 소스 생명주기 에러
///
/// 생성 시점과 시작 시점의 실패만 수집기 경계를 넘어 전파됩니다.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// 네이티브 리소스 획득 실패 (소켓, 렌더 컨텍스트 등)
    #[error("failed to open {source_type} source: {reason}")]
    Open { source_type: String, reason: String },

    /// 이미 활성 구독이 있는 채널에 대한 중복 구독
    #[error("a watcher for channel '{channel}' already exists")]
    SubscriptionConflict { channel: String },

    /// 이미 실행 중
    #[error("collector '{name}' is already running")]
    AlreadyRunning { name: String },

    /// 기타 수집기 에러
    #[error("{0}")]
    Other(String),
}

/// 체크포인트 저장소 에러
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// 읽기 실패
    #[error("failed to read checkpoint '{key}': {reason}")]
    Read { key: String, reason: String },

    /// 쓰기 실패
    #[error("failed to write checkpoint '{key}': {reason}")]
    Write { key: String, reason: String },

    /// 저장소 파일 손상
    #[error("checkpoint store corrupted: {0}")]
    Corrupted(String),
}
