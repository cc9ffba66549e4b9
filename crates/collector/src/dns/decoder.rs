//! DNS 메시지 디코더 (RFC 1035)
//!
//! [`DnsDecoder`]는 헤더 플래그, 질의 섹션, 응답/권한/추가 섹션을 디코딩합니다.
//! 이름 압축 포인터를 따라가며, 포인터 루프는 점프 횟수 제한으로 차단합니다.
//!
//! RDATA는 A, AAAA, CNAME, NS, PTR, MX, TXT, SOA, SRV만 해석하고
//! 나머지 타입은 16진 문자열로 보존합니다.
//!
//! 디코더는 어떤 입력에도 패닉하지 않아야 합니다. 잘못된 입력은
//! [`CollectorError::Decode`]로 실패 위치와 함께 반환됩니다.

use std::net::{Ipv4Addr, Ipv6Addr};

use sysbeat_core::types::{DnsHeader, DnsMessage, Question, RecordData, ResourceRecord};

use crate::error::CollectorError;

/// DNS 헤더 길이
pub const DNS_HEADER_LEN: usize = 12;

/// 이름 압축 포인터 최대 점프 횟수
const MAX_POINTER_JUMPS: usize = 64;

/// 이름 최대 길이 (RFC 1035 2.3.4)
const MAX_NAME_LEN: usize = 255;

/// 섹션 카운트로 미리 할당할 최대 엔트리 수
const MAX_PREALLOC: usize = 32;

const TYPE_A: u16 = 1;
const TYPE_NS: u16 = 2;
const TYPE_CNAME: u16 = 5;
const TYPE_SOA: u16 = 6;
const TYPE_PTR: u16 = 12;
const TYPE_MX: u16 = 15;
const TYPE_TXT: u16 = 16;
const TYPE_AAAA: u16 = 28;
const TYPE_SRV: u16 = 33;

/// 페이로드를 DNS 메시지로 변환하는 디코더 trait
///
/// 테스트에서 디코딩 호출 횟수를 세거나 다른 프로토콜 디코더로
/// 교체할 수 있도록 trait으로 분리합니다.
pub trait MessageDecoder: Send + Sync {
    /// 페이로드를 디코딩합니다.
    fn decode(&self, payload: &[u8]) -> Result<DnsMessage, CollectorError>;
}

/// 기본 DNS 디코더
#[derive(Debug, Default, Clone, Copy)]
pub struct DnsDecoder;

impl DnsDecoder {
    /// 새 디코더를 생성합니다.
    pub fn new() -> Self {
        Self
    }
}

impl MessageDecoder for DnsDecoder {
    fn decode(&self, payload: &[u8]) -> Result<DnsMessage, CollectorError> {
        let mut reader = Reader::new(payload);

        let id = reader.u16()?;
        let flags = reader.u16()?;
        let qdcount = reader.u16()?;
        let ancount = reader.u16()?;
        let nscount = reader.u16()?;
        let arcount = reader.u16()?;

        let header = DnsHeader {
            id,
            response: flags & 0x8000 != 0,
            opcode: ((flags >> 11) & 0x0f) as u8,
            authoritative: flags & 0x0400 != 0,
            truncated: flags & 0x0200 != 0,
            recursion_desired: flags & 0x0100 != 0,
            recursion_available: flags & 0x0080 != 0,
            zero: flags & 0x0040 != 0,
            authentic_data: flags & 0x0020 != 0,
            checking_disabled: flags & 0x0010 != 0,
            rcode: (flags & 0x000f) as u8,
        };

        let mut questions = Vec::with_capacity(usize::from(qdcount).min(MAX_PREALLOC));
        for _ in 0..qdcount {
            let name = reader.name()?;
            let qtype = reader.u16()?;
            let qclass = reader.u16()?;
            questions.push(Question {
                name,
                qtype,
                qclass,
            });
        }

        let answers = reader.records(ancount)?;
        let authorities = reader.records(nscount)?;
        let additionals = reader.records(arcount)?;

        Ok(DnsMessage {
            header,
            questions,
            answers,
            authorities,
            additionals,
            compressed: reader.compressed,
        })
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    compressed: bool,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            compressed: false,
        }
    }

    fn error(&self, offset: usize, reason: impl Into<String>) -> CollectorError {
        CollectorError::Decode {
            offset,
            reason: reason.into(),
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CollectorError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| self.error(self.pos, format!("need {n} bytes, message truncated")))?;
        let buf = self.buf;
        let slice = &buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CollectorError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CollectorError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, CollectorError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// 현재 위치의 이름을 읽습니다. 포인터를 만나면 이후 읽기 위치는 포인터 바로 뒤입니다.
    fn name(&mut self) -> Result<String, CollectorError> {
        let mut labels: Vec<String> = Vec::new();
        let mut cursor = self.pos;
        let mut resume_at: Option<usize> = None;
        let mut jumps = 0usize;
        let mut total_len = 0usize;

        loop {
            let len = *self
                .buf
                .get(cursor)
                .ok_or_else(|| self.error(cursor, "name runs past end of message"))?;

            match len & 0xc0 {
                0x00 => {
                    if len == 0 {
                        cursor += 1;
                        break;
                    }
                    let start = cursor + 1;
                    let end = start + usize::from(len);
                    let label = self
                        .buf
                        .get(start..end)
                        .ok_or_else(|| self.error(cursor, "label runs past end of message"))?;
                    total_len += usize::from(len) + 1;
                    if total_len > MAX_NAME_LEN {
                        return Err(self.error(cursor, "name exceeds 255 bytes"));
                    }
                    labels.push(String::from_utf8_lossy(label).into_owned());
                    cursor = end;
                }
                0xc0 => {
                    let low = *self
                        .buf
                        .get(cursor + 1)
                        .ok_or_else(|| self.error(cursor, "truncated compression pointer"))?;
                    let target = (usize::from(len & 0x3f) << 8) | usize::from(low);
                    jumps += 1;
                    if jumps > MAX_POINTER_JUMPS {
                        return Err(self.error(cursor, "compression pointer loop"));
                    }
                    if target >= self.buf.len() {
                        return Err(self.error(cursor, format!("pointer to {target} out of range")));
                    }
                    if resume_at.is_none() {
                        resume_at = Some(cursor + 2);
                    }
                    self.compressed = true;
                    cursor = target;
                }
                _ => return Err(self.error(cursor, format!("unsupported label type 0x{len:02x}"))),
            }
        }

        self.pos = resume_at.unwrap_or(cursor);
        Ok(labels.join("."))
    }

    fn records(&mut self, count: u16) -> Result<Vec<ResourceRecord>, CollectorError> {
        let mut records = Vec::with_capacity(usize::from(count).min(MAX_PREALLOC));
        for _ in 0..count {
            records.push(self.record()?);
        }
        Ok(records)
    }

    fn record(&mut self) -> Result<ResourceRecord, CollectorError> {
        let name = self.name()?;
        let rtype = self.u16()?;
        let rclass = self.u16()?;
        let ttl = self.u32()?;
        let length = self.u16()?;

        let rdata_start = self.pos;
        let rdata = self.take(usize::from(length))?;
        let rdata_end = self.pos;

        let data = self.rdata(rtype, rdata, rdata_start)?;
        self.pos = rdata_end;

        Ok(ResourceRecord {
            name,
            rtype,
            rclass,
            ttl,
            length,
            data,
        })
    }

    fn rdata(&mut self, rtype: u16, rdata: &'a [u8], start: usize) -> Result<RecordData, CollectorError> {
        let data = match rtype {
            TYPE_A => {
                let octets: [u8; 4] = rdata
                    .try_into()
                    .map_err(|_| self.error(start, format!("A record with {} bytes", rdata.len())))?;
                RecordData::A(Ipv4Addr::from(octets))
            }
            TYPE_AAAA => {
                let octets: [u8; 16] = rdata
                    .try_into()
                    .map_err(|_| self.error(start, format!("AAAA record with {} bytes", rdata.len())))?;
                RecordData::Aaaa(Ipv6Addr::from(octets))
            }
            TYPE_CNAME => RecordData::Cname(self.name_at(start)?),
            TYPE_NS => RecordData::Ns(self.name_at(start)?),
            TYPE_PTR => RecordData::Ptr(self.name_at(start)?),
            TYPE_MX => {
                self.pos = start;
                let preference = self.u16()?;
                let exchange = self.name()?;
                RecordData::Mx {
                    preference,
                    exchange,
                }
            }
            TYPE_TXT => {
                let mut strings = Vec::new();
                let mut rest = rdata;
                while let Some((&len, tail)) = rest.split_first() {
                    let len = usize::from(len);
                    let chunk = tail
                        .get(..len)
                        .ok_or_else(|| self.error(start, "TXT string runs past rdata"))?;
                    strings.push(String::from_utf8_lossy(chunk).into_owned());
                    rest = &tail[len..];
                }
                RecordData::Txt(strings)
            }
            TYPE_SOA => {
                self.pos = start;
                let mname = self.name()?;
                let rname = self.name()?;
                RecordData::Soa {
                    mname,
                    rname,
                    serial: self.u32()?,
                    refresh: self.u32()?,
                    retry: self.u32()?,
                    expire: self.u32()?,
                    minimum: self.u32()?,
                }
            }
            TYPE_SRV => {
                self.pos = start;
                let priority = self.u16()?;
                let weight = self.u16()?;
                let port = self.u16()?;
                let target = self.name()?;
                RecordData::Srv {
                    priority,
                    weight,
                    port,
                    target,
                }
            }
            _ => RecordData::Raw(hex::encode(rdata)),
        };
        Ok(data)
    }

    fn name_at(&mut self, start: usize) -> Result<String, CollectorError> {
        self.pos = start;
        self.name()
    }
}
