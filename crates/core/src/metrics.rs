//! 메트릭 상수 및 설명 등록
//!
//! 모든 Prometheus 메트릭의 이름과 설명을 중앙에서 정의합니다.
//! 각 모듈은 이 상수를 사용하여 `metrics::counter!()`, `metrics::gauge!()`
//! 매크로를 호출합니다.
//!
//! # 네이밍 컨벤션
//!
//! - 접두어: `sysbeat_`
//! - 모듈명: `winlog_`, `dns_`, `dispatch_`, `checkpoint_`, `daemon_`
//! - 접미어: `_total` (counter), `_seconds` (gauge/latency), 없음 (gauge)
//!
//! # 사용 예시
//!
//! ```ignore
//! use metrics::counter;
//!
//! counter!(sysbeat_core::metrics::DNS_TRANSACTIONS_TOTAL, "collector" => "dns").increment(1);
//! ```

// ─── 레이블 키 상수 ────────────────────────────────────────────────

/// 수집기 이름 레이블 키
pub const LABEL_COLLECTOR: &str = "collector";

/// 디스패치 스테이지 이름 레이블 키
pub const LABEL_STAGE: &str = "stage";

/// 채널 이름 레이블 키
pub const LABEL_CHANNEL: &str = "channel";

// ─── Winlog 메트릭 ─────────────────────────────────────────────────

/// Winlog: 큐에 전달된 이벤트 수 (counter)
pub const WINLOG_EVENTS_RECEIVED_TOTAL: &str = "sysbeat_winlog_events_received_total";

/// Winlog: 구독 해제나 큐 닫힘으로 버린 레코드 수 (counter)
pub const WINLOG_EVENTS_DROPPED_TOTAL: &str = "sysbeat_winlog_events_dropped_total";

/// Winlog: pass 목록에 없어 버린 레코드 수 (counter)
pub const WINLOG_ADMISSION_MISSES_TOTAL: &str = "sysbeat_winlog_admission_misses_total";

/// Winlog: 렌더링 필드 에러가 있는 레코드 수 (counter)
pub const WINLOG_RENDER_ERRORS_TOTAL: &str = "sysbeat_winlog_render_errors_total";

/// Winlog: 활성 구독 수 (gauge)
pub const WINLOG_SUBSCRIPTIONS: &str = "sysbeat_winlog_subscriptions";

// ─── DNS 메트릭 ────────────────────────────────────────────────────

/// DNS: 수신한 데이터그램 수 (counter)
pub const DNS_DATAGRAMS_TOTAL: &str = "sysbeat_dns_datagrams_total";

/// DNS: ACL에 걸려 버린 데이터그램 수 (counter)
pub const DNS_ADMISSION_MISSES_TOTAL: &str = "sysbeat_dns_admission_misses_total";

/// DNS: 디코딩 실패 수 (counter)
pub const DNS_DECODE_ERRORS_TOTAL: &str = "sysbeat_dns_decode_errors_total";

/// DNS: 생성된 트랜잭션 수 (counter)
pub const DNS_TRANSACTIONS_TOTAL: &str = "sysbeat_dns_transactions_total";

// ─── Dispatch 메트릭 ───────────────────────────────────────────────

/// Dispatch: 디스패치된 이벤트 수 (counter)
pub const DISPATCH_EVENTS_TOTAL: &str = "sysbeat_dispatch_events_total";

/// Dispatch: 스테이지 실패 수 (counter, label: stage)
pub const DISPATCH_STAGE_FAILURES_TOTAL: &str = "sysbeat_dispatch_stage_failures_total";

/// Dispatch: 훅 실패 수 (counter)
pub const DISPATCH_HOOK_FAILURES_TOTAL: &str = "sysbeat_dispatch_hook_failures_total";

// ─── Checkpoint 메트릭 ─────────────────────────────────────────────

/// Checkpoint: 성공한 쓰기 수 (counter)
pub const CHECKPOINT_WRITES_TOTAL: &str = "sysbeat_checkpoint_writes_total";

/// Checkpoint: 실패한 쓰기 수 (counter)
pub const CHECKPOINT_WRITE_FAILURES_TOTAL: &str = "sysbeat_checkpoint_write_failures_total";

// ─── Daemon 메트릭 ──────────────────────────────────────────────────

/// Daemon: 가동 시간 (gauge, 초)
pub const DAEMON_UPTIME_SECONDS: &str = "sysbeat_daemon_uptime_seconds";

/// Daemon: 등록된 수집기 수 (gauge)
pub const DAEMON_COLLECTORS_REGISTERED: &str = "sysbeat_daemon_collectors_registered";

/// Daemon: 빌드 정보 (gauge, 항상 1, labels: version)
pub const DAEMON_BUILD_INFO: &str = "sysbeat_daemon_build_info";

// ─── 설명 등록 함수 ─────────────────────────────────────────────────

/// 모든 메트릭의 설명(description)을 등록합니다.
///
/// 이 함수는 전역 레코더 설치 후 한 번만 호출해야 합니다.
/// 일반적으로 `sysbeat-daemon`의 시작 시점에서 호출합니다.
pub fn describe_all() {
    use metrics::{describe_counter, describe_gauge};

    // Winlog
    describe_counter!(
        WINLOG_EVENTS_RECEIVED_TOTAL,
        "Total number of event log records queued for dispatch"
    );
    describe_counter!(
        WINLOG_EVENTS_DROPPED_TOTAL,
        "Total number of event log records dropped because the subscription was released or the queue closed"
    );
    describe_counter!(
        WINLOG_ADMISSION_MISSES_TOTAL,
        "Total number of event log records rejected by the pass list"
    );
    describe_counter!(
        WINLOG_RENDER_ERRORS_TOTAL,
        "Total number of event log records delivered with a render field error"
    );
    describe_gauge!(
        WINLOG_SUBSCRIPTIONS,
        "Number of live event log channel subscriptions"
    );

    // DNS
    describe_counter!(
        DNS_DATAGRAMS_TOTAL,
        "Total number of datagrams read from the raw socket"
    );
    describe_counter!(
        DNS_ADMISSION_MISSES_TOTAL,
        "Total number of datagrams rejected by the source port ACL"
    );
    describe_counter!(
        DNS_DECODE_ERRORS_TOTAL,
        "Total number of admitted datagrams that failed DNS decoding"
    );
    describe_counter!(
        DNS_TRANSACTIONS_TOTAL,
        "Total number of DNS transactions dispatched"
    );

    // Dispatch
    describe_counter!(
        DISPATCH_EVENTS_TOTAL,
        "Total number of events handed to the dispatcher"
    );
    describe_counter!(
        DISPATCH_STAGE_FAILURES_TOTAL,
        "Total number of sink stage failures, isolated per event"
    );
    describe_counter!(
        DISPATCH_HOOK_FAILURES_TOTAL,
        "Total number of hook handler failures"
    );

    // Checkpoint
    describe_counter!(
        CHECKPOINT_WRITES_TOTAL,
        "Total number of resume tokens persisted"
    );
    describe_counter!(
        CHECKPOINT_WRITE_FAILURES_TOTAL,
        "Total number of failed resume token writes"
    );

    // Daemon
    describe_gauge!(DAEMON_UPTIME_SECONDS, "sysbeat daemon uptime in seconds");
    describe_gauge!(
        DAEMON_COLLECTORS_REGISTERED,
        "Number of collectors registered in the daemon"
    );
    describe_gauge!(
        DAEMON_BUILD_INFO,
        "Build information (always 1, with version label)"
    );
}
