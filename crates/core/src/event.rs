//! 이벤트 모델 -- 수집 소스가 생성하고 디스패처가 소비하는 레코드
//!
//! [`Event`]는 두 가지 변형을 가지는 태그드 유니온입니다.
//! - [`LogEvent`]: 네이티브 이벤트 로그에서 렌더링한 레코드
//! - [`Transaction`]: raw UDP 소켓에서 디코딩한 DNS 트랜잭션
//!
//! 이벤트는 생성 -> 디스패치 -> (선택적) 체크포인트 -> 폐기 순서로 짧게 살아갑니다.
//! 디스패치 이후에 이벤트를 보관하지 않습니다.
//!
//! # 내보내기 형식
//! [`Event::encode_json`]은 필드 순서가 고정된 JSON 한 줄을 생성합니다.
//! 필드 이름은 하위 소비자와의 호환 표면이므로 변경하지 않습니다.

use std::net::IpAddr;

use bytes::BytesMut;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::types::{DnsMessage, Question, RecordData, Region, ResourceRecord, record_type_name};

/// 로그 이벤트 종류명
pub const EVENT_KIND_LOG: &str = "winlog";
/// DNS 트랜잭션 종류명
pub const EVENT_KIND_DNS: &str = "dns";

/// 내보내기에 포함되는 노드 식별 정보
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeIdentity {
    /// 노드 ID (설정의 `general.node_id`)
    pub node_id: String,
    /// 노드 주소
    pub addr: String,
}

impl NodeIdentity {
    /// 새 노드 식별 정보를 생성합니다.
    pub fn new(node_id: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            addr: addr.into(),
        }
    }
}

/// 수집 소스가 생성하는 이벤트
#[derive(Debug, Clone)]
pub enum Event {
    /// 네이티브 이벤트 로그 레코드
    Log(LogEvent),
    /// DNS 트랜잭션
    Dns(Transaction),
}

impl Event {
    /// 이벤트 종류명을 반환합니다.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Log(_) => EVENT_KIND_LOG,
            Self::Dns(_) => EVENT_KIND_DNS,
        }
    }

    /// 훅 테이블 조회에 사용하는 판별 ID를 반환합니다.
    ///
    /// 로그 이벤트는 이벤트 ID, DNS 트랜잭션은 첫 질의의 QTYPE입니다.
    /// 질의가 없는 트랜잭션은 `None`입니다.
    pub fn discriminant_id(&self) -> Option<u64> {
        match self {
            Self::Log(ev) => Some(ev.event_id),
            Self::Dns(tx) => tx.message.first_qtype().map(u64::from),
        }
    }

    /// 이벤트를 생성한 수집기 이름을 반환합니다.
    pub fn collector(&self) -> &str {
        match self {
            Self::Log(ev) => &ev.collector,
            Self::Dns(tx) => &tx.collector,
        }
    }

    /// 이벤트 고유 ID를 반환합니다.
    pub fn id(&self) -> &str {
        match self {
            Self::Log(ev) => &ev.id,
            Self::Dns(tx) => &tx.id,
        }
    }

    /// 필드 순서가 고정된 JSON으로 직렬화합니다.
    pub fn encode_json(&self, node: &NodeIdentity) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Self::Log(ev) => serde_json::to_vec(&LogEventRecord::new(ev, node)),
            Self::Dns(tx) => serde_json::to_vec(&TransactionRecord::new(tx)),
        }
    }
}

/// 네이티브 이벤트 로그에서 렌더링한 레코드
///
/// 숫자/시각 필드는 시스템 값 렌더링에서, `*_text` 필드는 게시자(provider)
/// 메시지 포맷에서 채워집니다. 개별 필드 추출 실패는 이벤트를 버리지 않고
/// `render_error`/`publisher_error`에 기록합니다.
#[derive(Debug, Clone, Default)]
pub struct LogEvent {
    /// 이벤트 고유 ID (UUID v4)
    pub id: String,
    /// 이벤트를 생성한 수집기 이름
    pub collector: String,
    /// 구독한 채널 이름 (체크포인트 키)
    pub subscribed_channel: String,
    /// 레코드에 기록된 채널 이름
    pub channel: String,
    pub provider_name: String,
    pub event_id: u64,
    pub qualifiers: u64,
    pub level: u64,
    pub task: u64,
    pub opcode: u64,
    pub record_id: u64,
    pub process_id: u64,
    pub thread_id: u64,
    pub version: u64,
    pub computer: String,
    /// 레코드 생성 시각
    pub created: Option<DateTime<Utc>>,
    /// 지역화된 메시지 본문
    pub message: String,
    pub level_text: String,
    pub task_text: String,
    pub opcode_text: String,
    pub keywords: Vec<String>,
    pub channel_text: String,
    pub provider_text: String,
    pub id_text: String,
    /// 렌더링된 재개 토큰 (북마크 XML)
    pub bookmark: String,
    /// 원본 XML
    pub xml: String,
    /// 시스템 값 렌더링 중 발생한 필드 에러
    pub render_error: Option<String>,
    /// 게시자 메시지 포맷 에러
    pub publisher_error: Option<String>,
}

impl LogEvent {
    /// 수집기와 구독 채널을 지정해 빈 이벤트를 생성합니다.
    pub fn new(collector: impl Into<String>, subscribed_channel: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            collector: collector.into(),
            subscribed_channel: subscribed_channel.into(),
            ..Default::default()
        }
    }
}

/// DNS 트랜잭션
///
/// 원본 페이로드는 풀에서 빌린 스크래치 버퍼에 담겨 있으며, 디스패치가 끝나면
/// [`Transaction::take_scratch`]로 회수해 풀에 반환합니다.
#[derive(Debug, Clone)]
pub struct Transaction {
    /// 트랜잭션 고유 ID (UUID v4)
    pub id: String,
    /// 이벤트를 생성한 수집기 이름
    pub collector: String,
    /// 바인드 호스트
    pub host: String,
    /// 원격 주소
    pub remote: IpAddr,
    pub source_port: u16,
    pub destination_port: u16,
    /// 지역 조회 결과 (IPv4만 조회)
    pub region: Option<Region>,
    pub message: DnsMessage,
    pub received_at: DateTime<Utc>,
    scratch: Option<BytesMut>,
}

impl Transaction {
    /// 새 트랜잭션을 생성합니다.
    pub fn new(
        collector: impl Into<String>,
        host: impl Into<String>,
        remote: IpAddr,
        source_port: u16,
        destination_port: u16,
        message: DnsMessage,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            collector: collector.into(),
            host: host.into(),
            remote,
            source_port,
            destination_port,
            region: None,
            message,
            received_at: Utc::now(),
            scratch: None,
        }
    }

    /// 지역 정보를 설정합니다.
    pub fn with_region(mut self, region: Option<Region>) -> Self {
        self.region = region;
        self
    }

    /// 원본 페이로드를 담은 스크래치 버퍼의 소유권을 넘겨받습니다.
    pub fn with_scratch(mut self, scratch: BytesMut) -> Self {
        self.scratch = Some(scratch);
        self
    }

    /// 원본 페이로드를 반환합니다.
    pub fn payload(&self) -> &[u8] {
        self.scratch.as_deref().unwrap_or_default()
    }

    /// 스크래치 버퍼를 회수합니다.
    pub fn take_scratch(&mut self) -> Option<BytesMut> {
        self.scratch.take()
    }
}

// --- 내보내기 레코드 ---

#[derive(Serialize)]
struct LogEventRecord<'a> {
    addr: &'a str,
    node_id: &'a str,
    provider_name: &'a str,
    event_id: u64,
    qualifiers: u64,
    level: u64,
    task: u64,
    op_code: u64,
    create_time: String,
    record_id: u64,
    process_id: u64,
    thread_id: u64,
    channel: &'a str,
    computer: &'a str,
    version: u64,
    render_field_error: &'a str,
    msg: String,
    level_text: &'a str,
    task_text: &'a str,
    op_code_text: &'a str,
    keywords: &'a [String],
    channel_text: &'a str,
    provider_text: &'a str,
    id_text: &'a str,
    publish_error: &'a str,
    bookmark: String,
    subscribe: &'a str,
    xml_txt: &'a str,
}

impl<'a> LogEventRecord<'a> {
    fn new(ev: &'a LogEvent, node: &'a NodeIdentity) -> Self {
        Self {
            addr: &node.addr,
            node_id: &node.node_id,
            provider_name: &ev.provider_name,
            event_id: ev.event_id,
            qualifiers: ev.qualifiers,
            level: ev.level,
            task: ev.task,
            op_code: ev.opcode,
            create_time: ev
                .created
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
                .unwrap_or_default(),
            record_id: ev.record_id,
            process_id: ev.process_id,
            thread_id: ev.thread_id,
            channel: &ev.channel,
            computer: &ev.computer,
            version: ev.version,
            render_field_error: ev.render_error.as_deref().unwrap_or_default(),
            msg: normalize_message(&ev.message),
            level_text: &ev.level_text,
            task_text: &ev.task_text,
            op_code_text: &ev.opcode_text,
            keywords: &ev.keywords,
            channel_text: &ev.channel_text,
            provider_text: &ev.provider_text,
            id_text: &ev.id_text,
            publish_error: ev.publisher_error.as_deref().unwrap_or_default(),
            bookmark: ev.bookmark.replace("\r\n", ""),
            subscribe: &ev.subscribed_channel,
            xml_txt: ev
                .xml
                .trim_matches(|c: char| c.is_whitespace() || c.is_control()),
        }
    }
}

/// 메시지 본문을 한 줄로 정규화합니다.
///
/// CR 제거, LF를 공백으로 치환, TAB 제거.
pub fn normalize_message(msg: &str) -> String {
    msg.chars()
        .filter_map(|c| match c {
            '\r' | '\t' => None,
            '\n' => Some(' '),
            other => Some(other),
        })
        .collect()
}

#[derive(Serialize)]
struct TransactionRecord<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    inet: &'static str,
    remote: String,
    region: Option<&'a Region>,
    host: &'a str,
    dns_id: u16,
    response: bool,
    op_code: u8,
    authoritative: bool,
    truncated: bool,
    recursion_desired: bool,
    recursion_available: bool,
    zero: bool,
    authenticated: bool,
    disable: bool,
    r_code: u8,
    question: Vec<QuestionRecord<'a>>,
    answer: Vec<ResourceRecordExport<'a>>,
    extra: Vec<ResourceRecordExport<'a>>,
    ns: Vec<ResourceRecordExport<'a>>,
}

#[derive(Serialize)]
struct QuestionRecord<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    qtype: &'static str,
    class: u16,
}

impl<'a> From<&'a Question> for QuestionRecord<'a> {
    fn from(q: &'a Question) -> Self {
        Self {
            name: &q.name,
            qtype: record_type_name(q.qtype),
            class: q.qclass,
        }
    }
}

#[derive(Serialize)]
struct ResourceRecordExport<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    rtype: &'static str,
    class: u16,
    ttl: u32,
    length: u16,
    data: &'a RecordData,
}

impl<'a> From<&'a ResourceRecord> for ResourceRecordExport<'a> {
    fn from(rr: &'a ResourceRecord) -> Self {
        Self {
            name: &rr.name,
            rtype: record_type_name(rr.rtype),
            class: rr.rclass,
            ttl: rr.ttl,
            length: rr.length,
            data: &rr.data,
        }
    }
}

impl<'a> TransactionRecord<'a> {
    fn new(tx: &'a Transaction) -> Self {
        let h = &tx.message.header;
        Self {
            id: &tx.id,
            inet: "udp",
            remote: std::net::SocketAddr::new(tx.remote, tx.source_port).to_string(),
            region: tx.region.as_ref(),
            host: &tx.host,
            dns_id: h.id,
            response: h.response,
            op_code: h.opcode,
            authoritative: h.authoritative,
            truncated: h.truncated,
            recursion_desired: h.recursion_desired,
            recursion_available: h.recursion_available,
            zero: h.zero,
            authenticated: h.authentic_data,
            disable: h.checking_disabled,
            r_code: h.rcode,
            question: tx.message.questions.iter().map(Into::into).collect(),
            answer: tx.message.answers.iter().map(Into::into).collect(),
            extra: tx.message.additionals.iter().map(Into::into).collect(),
            ns: tx.message.authorities.iter().map(Into::into).collect(),
        }
    }
}
