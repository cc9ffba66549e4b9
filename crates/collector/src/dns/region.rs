//! 원격 주소 지역 조회
//!
//! [`RegionTable`]은 `[[dns.regions]]` 설정에서 만든 IPv4 CIDR 테이블입니다.
//! 가장 긴 접두어가 일치하는 엔트리를 반환합니다. IPv6 주소는 조회하지 않습니다.

use std::net::{IpAddr, Ipv4Addr};

use sysbeat_core::config::RegionSection;
use sysbeat_core::types::Region;

use crate::error::CollectorError;

/// 지역 조회 trait
pub trait GeoLookup: Send + Sync {
    /// 주소에 해당하는 지역을 반환합니다.
    fn lookup(&self, addr: IpAddr) -> Option<Region>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CidrEntry {
    network: u32,
    prefix: u8,
    region: Region,
}

impl CidrEntry {
    fn mask(&self) -> u32 {
        if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(self.prefix))
        }
    }

    fn contains(&self, addr: u32) -> bool {
        addr & self.mask() == self.network
    }
}

/// IPv4 CIDR -> 지역 테이블
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionTable {
    // 접두어 길이 내림차순
    entries: Vec<CidrEntry>,
}

impl RegionTable {
    /// 빈 테이블을 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    /// 설정 섹션에서 테이블을 생성합니다.
    pub fn from_sections(sections: &[RegionSection]) -> Result<Self, CollectorError> {
        let mut table = Self::new();
        for section in sections {
            let region = Region {
                country: section.country.clone(),
                province: section.province.clone(),
                city: section.city.clone(),
                isp: section.isp.clone(),
            };
            table.insert(&section.cidr, region)?;
        }
        Ok(table)
    }

    /// CIDR 엔트리를 추가합니다. 접두어가 없으면 `/32`로 취급합니다.
    pub fn insert(&mut self, cidr: &str, region: Region) -> Result<(), CollectorError> {
        let (addr, prefix) = parse_cidr(cidr)?;
        let mut entry = CidrEntry {
            network: 0,
            prefix,
            region,
        };
        entry.network = u32::from(addr) & entry.mask();

        let pos = self
            .entries
            .iter()
            .position(|e| e.prefix < prefix)
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, entry);
        Ok(())
    }

    /// 엔트리 수를 반환합니다.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 테이블이 비어 있는지 확인합니다.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl GeoLookup for RegionTable {
    fn lookup(&self, addr: IpAddr) -> Option<Region> {
        let IpAddr::V4(v4) = addr else {
            return None;
        };
        let bits = u32::from(v4);
        self.entries
            .iter()
            .find(|e| e.contains(bits))
            .map(|e| e.region.clone())
    }
}

fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, u8), CollectorError> {
    let cidr = cidr.trim();
    let (addr, prefix) = match cidr.split_once('/') {
        Some((a, p)) => {
            let prefix = p
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= 32)
                .ok_or_else(|| CollectorError::config("regions.cidr", format!("invalid prefix in '{cidr}'")))?;
            (a, prefix)
        }
        None => (cidr, 32),
    };
    let addr = addr
        .parse::<Ipv4Addr>()
        .map_err(|_| CollectorError::config("regions.cidr", format!("'{cidr}' is not an ipv4 cidr")))?;
    Ok((addr, prefix))
}
