//! 도메인 타입 -- DNS 메시지 구조와 지역 정보
//!
//! 수집기 크레이트의 디코더가 이 타입을 채우고, [`Transaction`](crate::event::Transaction)이
//! 소유합니다.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

/// DNS 헤더 (RFC 1035 4.1.1)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsHeader {
    /// 트랜잭션 ID
    pub id: u16,
    /// QR 비트 (응답이면 true)
    pub response: bool,
    /// OPCODE (4비트)
    pub opcode: u8,
    /// AA 비트
    pub authoritative: bool,
    /// TC 비트
    pub truncated: bool,
    /// RD 비트
    pub recursion_desired: bool,
    /// RA 비트
    pub recursion_available: bool,
    /// Z 비트 (예약)
    pub zero: bool,
    /// AD 비트 (RFC 4035)
    pub authentic_data: bool,
    /// CD 비트 (RFC 4035)
    pub checking_disabled: bool,
    /// RCODE (4비트)
    pub rcode: u8,
}

/// 질의 섹션 엔트리
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

/// 리소스 레코드의 RDATA
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Cname(String),
    Ns(String),
    Ptr(String),
    Mx {
        preference: u16,
        exchange: String,
    },
    Txt(Vec<String>),
    Soa {
        mname: String,
        rname: String,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
    },
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: String,
    },
    /// 해석하지 않는 타입. 16진 문자열로 내보냅니다.
    Raw(String),
}

/// 응답/권한/추가 섹션의 리소스 레코드
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub name: String,
    pub rtype: u16,
    pub rclass: u16,
    pub ttl: u32,
    /// RDLENGTH (와이어 상의 RDATA 길이)
    pub length: u16,
    pub data: RecordData,
}

/// 디코딩된 DNS 메시지
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsMessage {
    pub header: DnsHeader,
    pub questions: Vec<Question>,
    pub answers: Vec<ResourceRecord>,
    pub authorities: Vec<ResourceRecord>,
    pub additionals: Vec<ResourceRecord>,
    /// 이름 압축 포인터가 한 번이라도 사용되었는지
    pub compressed: bool,
}

impl DnsMessage {
    /// 첫 번째 질의의 QTYPE을 반환합니다.
    pub fn first_qtype(&self) -> Option<u16> {
        self.questions.first().map(|q| q.qtype)
    }
}

/// 레코드 타입 번호를 이름으로 변환합니다.
pub fn record_type_name(rtype: u16) -> &'static str {
    match rtype {
        1 => "A",
        2 => "NS",
        5 => "CNAME",
        6 => "SOA",
        12 => "PTR",
        15 => "MX",
        16 => "TXT",
        28 => "AAAA",
        33 => "SRV",
        41 => "OPT",
        43 => "DS",
        46 => "RRSIG",
        47 => "NSEC",
        48 => "DNSKEY",
        65 => "HTTPS",
        255 => "ANY",
        _ => "UNKNOWN",
    }
}

/// IP 지역 조회 결과
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Region {
    pub country: String,
    pub province: String,
    pub city: String,
    pub isp: String,
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<&str> = [&self.country, &self.province, &self.city, &self.isp]
            .into_iter()
            .map(String::as_str)
            .filter(|s| !s.is_empty())
            .collect();
        write!(f, "{}", parts.join("|"))
    }
}
