//! 데이터그램 리더
//!
//! [`DatagramReader`]는 UDP 세그먼트(UDP 헤더 + 페이로드)와 원격 주소를 돌려줍니다.
//!
//! - `Raw`: `SOCK_RAW` + `IPPROTO_UDP` 소켓. IPv4는 IP 헤더를 잘라냅니다.
//! - `Channel`: 테스트나 임베딩 환경이 넣어 주는 세그먼트를 재생합니다.

use std::io;
use std::net::SocketAddr;

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use super::bind::BindSpec;
use super::udp::strip_ipv4_header;

/// 재생용 데이터그램 (UDP 세그먼트, 원격 주소)
pub type Datagram = (Bytes, SocketAddr);

/// 데이터그램 리더
#[derive(Debug)]
pub enum DatagramReader {
    /// raw 소켓
    Raw {
        socket: UdpSocket,
        ipv6: bool,
    },
    /// 재생 채널
    Channel(mpsc::Receiver<Datagram>),
}

impl DatagramReader {
    /// 바인드 명세의 주소 패밀리로 raw 소켓을 엽니다.
    ///
    /// raw 소켓은 포트에 바인드하지 않습니다. 포트 필터링은 수집기의 ACL이 담당합니다.
    pub fn open(spec: &BindSpec, recv_buffer_size: usize) -> io::Result<Self> {
        let domain = if spec.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket = Socket::new(domain, Type::RAW, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        socket.set_recv_buffer_size(recv_buffer_size.saturating_mul(64))?;
        socket.bind(&SocketAddr::new(spec.host, 0).into())?;

        let std_socket: std::net::UdpSocket = socket.into();
        Ok(Self::Raw {
            socket: UdpSocket::from_std(std_socket)?,
            ipv6: spec.is_ipv6(),
        })
    }

    /// 재생 채널 리더와 송신측을 생성합니다.
    pub fn channel(capacity: usize) -> (mpsc::Sender<Datagram>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self::Channel(rx))
    }

    /// 다음 UDP 세그먼트를 `buf`에 채우고 길이와 원격 주소를 반환합니다.
    ///
    /// 재생 채널이 닫히면 더 이상 반환하지 않습니다 (취소로만 빠져나옵니다).
    pub async fn recv(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        match self {
            Self::Raw { socket, ipv6 } => {
                let (n, remote) = socket.recv_from(buf).await?;
                if *ipv6 {
                    return Ok((n, remote));
                }
                let segment_len = strip_ipv4_header(&buf[..n])
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?
                    .len();
                buf.copy_within(n - segment_len..n, 0);
                Ok((segment_len, remote))
            }
            Self::Channel(rx) => match rx.recv().await {
                Some((segment, remote)) => {
                    let n = segment.len().min(buf.len());
                    buf[..n].copy_from_slice(&segment[..n]);
                    Ok((n, remote))
                }
                None => std::future::pending().await,
            },
        }
    }
}
