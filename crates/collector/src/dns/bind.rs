//! 바인드 명세 파서
//!
//! `udp://HOST[:PORT][/?port=P1,P2,...]` 형식의 문자열을 [`url::Url`]로 파싱한 뒤
//! [`BindSpec`]으로 변환합니다.
//!
//! - 스킴은 `udp` 또는 `tcp`입니다.
//! - IPv6 호스트는 대괄호로 감쌉니다 (`udp://[::1]:53`).
//! - 주소 패밀리는 호스트가 IPv4/IPv6 중 어느 쪽으로 파싱되는지로 결정합니다.
//! - 호스트 뒤의 단일 포트가 있으면 ACL은 그 포트 하나와의 일치 검사이고,
//!   없으면 `port` 쿼리의 포트 목록 멤버십 검사입니다.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use sysbeat_core::filter::FilterPolicy;
use url::{Host, Url};

use crate::error::CollectorError;

/// 전송 계층 스킴
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp => write!(f, "udp"),
            Self::Tcp => write!(f, "tcp"),
        }
    }
}

/// 파싱된 바인드 명세
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindSpec {
    /// 스킴
    pub transport: Transport,
    /// 바인드 호스트
    pub host: IpAddr,
    /// 호스트 뒤에 지정된 단일 포트
    pub port: Option<u16>,
    /// `port` 쿼리로 지정된 포트 목록 (선언 순서, 중복 제거)
    pub ports: Vec<u16>,
}

impl BindSpec {
    /// 바인드 명세를 파싱합니다.
    pub fn parse(spec: &str) -> Result<Self, CollectorError> {
        let spec = spec.trim();
        if !spec.contains("://") {
            return Err(bind_error(spec, "missing scheme"));
        }
        let url = Url::parse(spec).map_err(|e| bind_error(spec, format!("malformed url: {e}")))?;

        let transport = match url.scheme() {
            "udp" => Transport::Udp,
            "tcp" => Transport::Tcp,
            other => return Err(bind_error(spec, format!("unsupported scheme '{other}'"))),
        };

        let host = match url.host() {
            Some(Host::Ipv6(v6)) => IpAddr::V6(v6),
            Some(Host::Ipv4(v4)) => IpAddr::V4(v4),
            Some(Host::Domain(name)) if !name.is_empty() => IpAddr::from_str(name).map_err(|_| {
                bind_error(spec, format!("host '{name}' is not an ipv4 or ipv6 address"))
            })?,
            _ => return Err(bind_error(spec, "host must not be empty")),
        };

        let port = match url.port() {
            Some(0) => return Err(bind_error(spec, "invalid port '0'")),
            other => other,
        };

        if !matches!(url.path(), "" | "/") {
            return Err(bind_error(spec, format!("unexpected path '{}'", url.path())));
        }

        let mut ports: Vec<u16> = Vec::new();
        for (key, value) in url.query_pairs() {
            if key != "port" {
                continue;
            }
            for item in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                let p = parse_port(item)
                    .ok_or_else(|| bind_error(spec, format!("invalid port '{item}'")))?;
                if !ports.contains(&p) {
                    ports.push(p);
                }
            }
        }

        if port.is_none() && ports.is_empty() {
            return Err(bind_error(spec, "no listen port"));
        }

        Ok(Self {
            transport,
            host,
            port,
            ports,
        })
    }

    /// IPv6 바인드인지 확인합니다.
    pub fn is_ipv6(&self) -> bool {
        self.host.is_ipv6()
    }

    /// 출발지 포트 ACL을 반환합니다.
    ///
    /// 단일 포트가 지정되어 있으면 포트 목록은 무시합니다.
    pub fn acl(&self) -> FilterPolicy {
        match self.port {
            Some(port) => FilterPolicy::Single(u64::from(port)),
            None => FilterPolicy::from_values(self.ports.iter().copied().map(u64::from)),
        }
    }
}

impl FromStr for BindSpec {
    type Err = CollectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for BindSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.transport)?;
        match self.host {
            IpAddr::V6(v6) => write!(f, "[{v6}]")?,
            IpAddr::V4(v4) => write!(f, "{v4}")?,
        }
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        if !self.ports.is_empty() {
            let list: Vec<String> = self.ports.iter().map(u16::to_string).collect();
            write!(f, "/?port={}", list.join(","))?;
        }
        Ok(())
    }
}

fn parse_port(s: &str) -> Option<u16> {
    s.parse::<u16>().ok().filter(|p| *p != 0)
}

fn bind_error(spec: &str, reason: impl fmt::Display) -> CollectorError {
    CollectorError::config("bind", format!("'{spec}': {reason}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn parses_port_list() {
        let spec = BindSpec::parse("udp://0.0.0.0/?port=53,5353").unwrap();
        assert_eq!(spec.transport, Transport::Udp);
        assert_eq!(spec.host, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(spec.port, None);
        assert_eq!(spec.ports, vec![53, 5353]);
        assert!(!spec.is_ipv6());

        let acl = spec.acl();
        assert!(acl.admits(53));
        assert!(acl.admits(5353));
        assert!(!acl.admits(80));
    }

    #[test]
    fn single_port_takes_precedence() {
        let spec = BindSpec::parse("udp://10.0.0.1:53/?port=5353").unwrap();
        assert_eq!(spec.port, Some(53));
        let acl = spec.acl();
        assert!(acl.admits(53));
        assert!(!acl.admits(5353));
    }

    #[test]
    fn parses_bracketed_ipv6() {
        let spec = BindSpec::parse("udp://[::1]:53").unwrap();
        assert_eq!(spec.host, IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(spec.port, Some(53));
        assert!(spec.is_ipv6());
    }

    #[test]
    fn parses_bracketed_ipv6_with_query() {
        let spec = BindSpec::parse("udp://[::]/?port=53").unwrap();
        assert!(spec.is_ipv6());
        assert_eq!(spec.port, None);
        assert_eq!(spec.ports, vec![53]);
    }

    #[test]
    fn rejects_unbracketed_ipv6() {
        assert!(BindSpec::parse("udp://::/?port=53").is_err());
    }

    #[test]
    fn scheme_is_case_insensitive() {
        let spec = BindSpec::parse("UDP://127.0.0.1:53").unwrap();
        assert_eq!(spec.transport, Transport::Udp);
    }

    #[test]
    fn repeated_port_keys_merge() {
        let spec = BindSpec::parse("udp://0.0.0.0/?port=53&port=5353&other=1").unwrap();
        assert_eq!(spec.ports, vec![53, 5353]);
    }

    #[test]
    fn rejects_missing_scheme_and_path() {
        let err = BindSpec::parse("0.0.0.0:53").unwrap_err();
        assert!(err.to_string().contains("missing scheme"));
        let err = BindSpec::parse("udp://0.0.0.0:53/dns").unwrap_err();
        assert!(err.to_string().contains("unexpected path"));
    }

    #[test]
    fn tcp_scheme_parses() {
        let spec = BindSpec::parse("tcp://127.0.0.1:53").unwrap();
        assert_eq!(spec.transport, Transport::Tcp);
    }

    #[test]
    fn rejects_unknown_scheme() {
        let err = BindSpec::parse("http://0.0.0.0:53").unwrap_err();
        assert!(err.to_string().contains("unsupported scheme"));
    }

    #[test]
    fn rejects_hostname() {
        let err = BindSpec::parse("udp://localhost:53").unwrap_err();
        assert!(err.to_string().contains("not an ipv4 or ipv6"));
    }

    #[test]
    fn rejects_missing_port() {
        let err = BindSpec::parse("udp://0.0.0.0/").unwrap_err();
        assert!(err.to_string().contains("no listen port"));
    }

    #[test]
    fn rejects_invalid_port() {
        assert!(BindSpec::parse("udp://0.0.0.0/?port=53,abc").is_err());
        assert!(BindSpec::parse("udp://0.0.0.0:70000").is_err());
        assert!(BindSpec::parse("udp://0.0.0.0:0").is_err());
    }

    #[test]
    fn duplicate_ports_collapse() {
        let spec = BindSpec::parse("udp://0.0.0.0/?port=53,53").unwrap();
        assert_eq!(spec.ports, vec![53]);
        assert_eq!(spec.acl(), FilterPolicy::Single(53));
    }

    #[test]
    fn display_roundtrips_through_parse() {
        for raw in ["udp://0.0.0.0/?port=53,5353", "udp://[::1]:53", "tcp://10.1.2.3:853"] {
            let spec = BindSpec::parse(raw).unwrap();
            assert_eq!(BindSpec::parse(&spec.to_string()).unwrap(), spec);
        }
    }
}
