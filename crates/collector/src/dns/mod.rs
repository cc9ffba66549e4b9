//! DNS raw UDP 패킷 소스
//!
//! - [`bind`]: 바인드 명세 파싱 (`udp://host:port?port=a,b`)
//! - [`udp`]: UDP 헤더 / IPv4 헤더 처리
//! - [`decoder`]: DNS 메시지 디코더
//! - [`region`]: 원격 주소 지역 조회
//! - [`pool`]: 스크래치 버퍼 풀
//! - [`reader`]: raw 소켓 / 재생 채널 리더
//! - [`collector`]: 수신 루프와 생명주기

pub mod bind;
pub mod collector;
pub mod decoder;
pub mod pool;
pub mod reader;
pub mod region;
pub mod udp;

pub use bind::{BindSpec, Transport};
pub use collector::{DNS_KIND, DnsCollector, DnsCollectorBuilder};
pub use decoder::{DnsDecoder, MessageDecoder};
pub use pool::BufferPool;
pub use reader::{Datagram, DatagramReader};
pub use region::{GeoLookup, RegionTable};
pub use udp::UdpHeader;
