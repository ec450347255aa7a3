use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::time;
use tracing::debug;

use crate::error::ScanError;

/// Result of a single TCP connect attempt.
#[derive(Debug)]
pub enum TcpProbe {
    /// Handshake completed; the socket moves on to fingerprinting.
    Open(TcpStream),
    /// Actively refused or failed outright.
    Closed,
    /// No answer within the timeout.
    Filtered,
}

impl TcpProbe {
    pub fn is_open(&self) -> bool {
        matches!(self, TcpProbe::Open(_))
    }
}

/// Result of a best-effort UDP check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdpProbe {
    Open(Vec<u8>),
    Closed,
    Filtered,
}

/// Resolve a host name or IP literal to the first address it maps to.
pub async fn resolve_target(target: &str) -> Result<IpAddr, ScanError> {
    let host = target.trim();
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    let mut addrs = lookup_host((host, 0)).await.map_err(|e| ScanError::Resolve {
        target: host.to_string(),
        reason: e.to_string(),
    })?;
    addrs
        .next()
        .map(|a| a.ip())
        .ok_or_else(|| ScanError::Resolve {
            target: host.to_string(),
            reason: "no addresses returned".to_string(),
        })
}

/// Attempt a TCP connection bounded by `timeout`. Reads and writes nothing.
pub async fn probe_tcp(addr: SocketAddr, timeout: Duration) -> TcpProbe {
    match time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => TcpProbe::Open(stream),
        Ok(Err(e)) => {
            if e.kind() != ErrorKind::ConnectionRefused {
                debug!(%addr, error = %e, "connect failed");
            }
            TcpProbe::Closed
        }
        Err(_) => TcpProbe::Filtered,
    }
}

/// Send a port-appropriate datagram and wait for any reply.
///
/// A reply means open; an ICMP port-unreachable surfaces as a refused
/// receive and means closed; silence is filtered.
pub async fn probe_udp(addr: SocketAddr, timeout: Duration) -> UdpProbe {
    let bind: SocketAddr = match addr {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = match UdpSocket::bind(bind).await {
        Ok(s) => s,
        Err(e) => {
            debug!(%addr, error = %e, "udp bind failed");
            return UdpProbe::Filtered;
        }
    };
    if socket.connect(addr).await.is_err() {
        return UdpProbe::Closed;
    }
    if let Err(e) = socket.send(udp_payload(addr.port())).await {
        return classify_udp_error(e.kind());
    }

    let mut buf = vec![0u8; 1024];
    match time::timeout(timeout, socket.recv(&mut buf)).await {
        Ok(Ok(n)) => {
            buf.truncate(n);
            UdpProbe::Open(buf)
        }
        Ok(Err(e)) => classify_udp_error(e.kind()),
        Err(_) => UdpProbe::Filtered,
    }
}

fn classify_udp_error(kind: ErrorKind) -> UdpProbe {
    match kind {
        ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset => UdpProbe::Closed,
        _ => UdpProbe::Filtered,
    }
}

/// DNS `version.bind` CHAOS TXT query.
const DNS_VERSION_QUERY: &[u8] = &[
    0x00, 0x06, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x07, b'v', b'e',
    b'r', b's', b'i', b'o', b'n', 0x04, b'b', b'i', b'n', b'd', 0x00, 0x00, 0x10, 0x00, 0x03,
];

/// NTPv4 client request, mode 3.
static NTP_REQUEST: [u8; 48] = {
    let mut pkt = [0u8; 48];
    pkt[0] = 0xe3;
    pkt
};

/// SNMPv1 GetRequest for sysDescr.0 with community `public`.
const SNMP_GET_SYSDESCR: &[u8] = &[
    0x30, 0x26, 0x02, 0x01, 0x00, 0x04, 0x06, b'p', b'u', b'b', b'l', b'i', b'c', 0xa0, 0x19,
    0x02, 0x01, 0x01, 0x02, 0x01, 0x00, 0x02, 0x01, 0x00, 0x30, 0x0e, 0x30, 0x0c, 0x06, 0x08,
    0x2b, 0x06, 0x01, 0x02, 0x01, 0x01, 0x01, 0x00, 0x05, 0x00,
];

pub(crate) fn udp_payload(port: u16) -> &'static [u8] {
    match port {
        53 => DNS_VERSION_QUERY,
        123 => &NTP_REQUEST,
        161 => SNMP_GET_SYSDESCR,
        _ => &[],
    }
}
