use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time;
use tokio_native_tls::{TlsConnector, TlsStream};
use tracing::debug;
use x509_parser::prelude::{parse_x509_certificate, GeneralName};

use crate::fingerprint::{self, GET_REQUEST};
use crate::types::PortInfo;

/// What a successful handshake revealed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsDetails {
    /// First SAN DNS name, else the subject CN.
    pub hostname: Option<String>,
    /// Service identified by replaying the HTTP probe inside the session.
    pub service: Option<PortInfo>,
}

/// Performs certificate-unverified handshakes for fingerprinting.
#[derive(Clone)]
pub struct TlsInspector {
    connector: TlsConnector,
}

impl TlsInspector {
    pub fn new() -> Result<Self, native_tls::Error> {
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .use_sni(false)
            .build()?;
        Ok(Self {
            connector: TlsConnector::from(connector),
        })
    }

    /// Open a fresh connection and try a TLS handshake within `timeout`.
    ///
    /// Returns `None` when the port does not speak TLS. With `replay_http`
    /// set, the HTTP probe is sent through the established session.
    pub async fn inspect(
        &self,
        addr: SocketAddr,
        host: &str,
        timeout: Duration,
        replay_http: bool,
    ) -> Option<TlsDetails> {
        let handshake = async {
            let tcp = TcpStream::connect(addr).await.ok()?;
            self.connector.connect(host, tcp).await.ok()
        };
        let mut stream = match time::timeout(timeout, handshake).await {
            Ok(Some(s)) => s,
            _ => {
                debug!(%addr, "no tls");
                return None;
            }
        };

        let hostname = peer_hostname(&stream);
        let service = if replay_http {
            fingerprint::probe_session(&mut stream, addr.port(), GET_REQUEST, timeout).await
        } else {
            None
        };
        debug!(%addr, ?hostname, "tls handshake ok");
        Some(TlsDetails { hostname, service })
    }
}

fn peer_hostname(stream: &TlsStream<TcpStream>) -> Option<String> {
    let cert = stream.get_ref().peer_certificate().ok()??;
    let der = cert.to_der().ok()?;
    hostname_from_der(&der)
}

/// Pull a host name out of a DER certificate: SAN DNS entries first, then CN.
pub fn hostname_from_der(der: &[u8]) -> Option<String> {
    let (_, cert) = parse_x509_certificate(der).ok()?;

    if let Ok(Some(san)) = cert.subject_alternative_name() {
        let dns = san.value.general_names.iter().find_map(|name| match name {
            GeneralName::DNSName(d) => Some(d.to_string()),
            _ => None,
        });
        if dns.is_some() {
            return dns;
        }
    }

    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);
    cn
}
