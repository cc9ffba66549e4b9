//! raw 소켓 데이터그램에서 UDP 헤더를 분리합니다.
//!
//! IPv4 raw 소켓은 IP 헤더를 포함해 전달하므로 IHL만큼 건너뜁니다.
//! IPv6 raw 소켓은 IP 헤더 없이 UDP 헤더부터 전달합니다.

use crate::error::CollectorError;

/// UDP 헤더 길이
pub const UDP_HEADER_LEN: usize = 8;

const IPV4_MIN_HEADER_LEN: usize = 20;
const IPPROTO_UDP: u8 = 17;

/// UDP 헤더 (RFC 768)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub source_port: u16,
    pub destination_port: u16,
    pub length: u16,
    pub checksum: u16,
}

impl UdpHeader {
    /// 세그먼트 앞 8바이트에서 헤더를 읽고 페이로드를 함께 반환합니다.
    ///
    /// 헤더의 길이 필드가 실제 길이보다 짧으면 그 길이까지만 페이로드로 봅니다.
    pub fn parse(segment: &[u8]) -> Result<(Self, &[u8]), CollectorError> {
        if segment.len() < UDP_HEADER_LEN {
            return Err(CollectorError::Decode {
                offset: 0,
                reason: format!("udp segment too short: {} bytes", segment.len()),
            });
        }

        let header = Self {
            source_port: u16::from_be_bytes([segment[0], segment[1]]),
            destination_port: u16::from_be_bytes([segment[2], segment[3]]),
            length: u16::from_be_bytes([segment[4], segment[5]]),
            checksum: u16::from_be_bytes([segment[6], segment[7]]),
        };

        let declared = usize::from(header.length);
        let end = if declared >= UDP_HEADER_LEN && declared <= segment.len() {
            declared
        } else {
            segment.len()
        };

        Ok((header, &segment[UDP_HEADER_LEN..end]))
    }
}

/// IPv4 패킷에서 UDP 세그먼트를 잘라냅니다.
pub fn strip_ipv4_header(packet: &[u8]) -> Result<&[u8], CollectorError> {
    let first = *packet.first().ok_or_else(|| CollectorError::Decode {
        offset: 0,
        reason: "empty packet".to_owned(),
    })?;

    if first >> 4 != 4 {
        return Err(CollectorError::Decode {
            offset: 0,
            reason: format!("not an ipv4 packet (version {})", first >> 4),
        });
    }

    let ihl = usize::from(first & 0x0f) * 4;
    if ihl < IPV4_MIN_HEADER_LEN || packet.len() < ihl {
        return Err(CollectorError::Decode {
            offset: 0,
            reason: format!("invalid ipv4 header length {ihl}"),
        });
    }

    if packet.get(9).copied() != Some(IPPROTO_UDP) {
        return Err(CollectorError::Decode {
            offset: 9,
            reason: "ipv4 protocol is not udp".to_owned(),
        });
    }

    Ok(&packet[ihl..])
}
