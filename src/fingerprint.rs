//! Banner and probe-response fingerprinting.
//!
//! A port is identified by reading what the service says on its own, then
//! by sending a short list of active probes over the same connection. Every
//! response is matched against a static signature table where the first
//! match wins.
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::bytes::{Captures, Regex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{self, Instant};
use tracing::debug;

use crate::types::PortInfo;

/// Longest raw-response excerpt kept in `info` for unidentified services.
pub const EXCERPT_LEN: usize = 64;

const MAX_RESPONSE: usize = 4096;
const TRAILING_GAP: Duration = Duration::from_millis(50);

/// A payload sent to provoke a response. `NULL` sends nothing and only listens.
#[derive(Debug, Clone, Copy)]
pub struct Probe {
    pub name: &'static str,
    pub payload: Option<&'static [u8]>,
}

pub const NULL_PROBE: Probe = Probe { name: "NULL", payload: None };
pub const GET_REQUEST: Probe = Probe {
    name: "GetRequest",
    payload: Some(b"GET / HTTP/1.0\r\n\r\n"),
};
pub const GENERIC_LINES: Probe = Probe {
    name: "GenericLines",
    payload: Some(b"\r\n\r\n"),
};

/// Probes in the order they are tried on a plaintext connection.
pub const PROBES: &[Probe] = &[NULL_PROBE, GET_REQUEST, GENERIC_LINES];

#[derive(Debug)]
pub enum Matcher {
    Pattern(Regex),
    Prefix(&'static [u8]),
}

impl Matcher {
    fn captures<'a>(&self, data: &'a [u8]) -> Option<Option<Captures<'a>>> {
        match self {
            Matcher::Pattern(re) => re.captures(data).map(Some),
            Matcher::Prefix(p) => data.starts_with(p).then_some(None),
        }
    }
}

/// One fingerprint table entry. Templates may reference capture groups as `$1`..`$9`.
#[derive(Debug)]
pub struct Signature {
    pub name: &'static str,
    pub protocol: &'static str,
    pub service: &'static str,
    pub matcher: Matcher,
    product: Option<&'static str>,
    version: Option<&'static str>,
    info: Option<&'static str>,
    hostname: Option<&'static str>,
    os: Option<&'static str>,
    device_type: Option<&'static str>,
}

impl Signature {
    fn pattern(name: &'static str, protocol: &'static str, pattern: &str) -> Self {
        let re = Regex::new(pattern).unwrap_or_else(|e| panic!("signature {name}: {e}"));
        Self::with_matcher(name, protocol, Matcher::Pattern(re))
    }

    fn prefix(name: &'static str, protocol: &'static str, prefix: &'static [u8]) -> Self {
        Self::with_matcher(name, protocol, Matcher::Prefix(prefix))
    }

    fn with_matcher(name: &'static str, protocol: &'static str, matcher: Matcher) -> Self {
        Self {
            name,
            protocol,
            service: protocol,
            matcher,
            product: None,
            version: None,
            info: None,
            hostname: None,
            os: None,
            device_type: None,
        }
    }

    fn service(mut self, s: &'static str) -> Self {
        self.service = s;
        self
    }
    fn product(mut self, s: &'static str) -> Self {
        self.product = Some(s);
        self
    }
    fn version(mut self, s: &'static str) -> Self {
        self.version = Some(s);
        self
    }
    fn info(mut self, s: &'static str) -> Self {
        self.info = Some(s);
        self
    }
    fn hostname(mut self, s: &'static str) -> Self {
        self.hostname = Some(s);
        self
    }
    fn os(mut self, s: &'static str) -> Self {
        self.os = Some(s);
        self
    }
    fn device(mut self, s: &'static str) -> Self {
        self.device_type = Some(s);
        self
    }

    /// Apply this signature to `data`, filling a `PortInfo` on match.
    pub fn apply(&self, port: u16, data: &[u8]) -> Option<PortInfo> {
        let caps = self.matcher.captures(data)?;
        let fill = |t: Option<&'static str>| t.map(|t| expand(t, caps.as_ref())).unwrap_or_default();
        Some(PortInfo {
            port,
            protocol: self.protocol.to_string(),
            service: self.service.to_string(),
            product_name: fill(self.product),
            version: fill(self.version),
            info: fill(self.info),
            hostname: fill(self.hostname),
            operating_system: fill(self.os),
            device_type: fill(self.device_type),
            probe_name: String::new(),
            tls: false,
        })
    }
}

/// Substitute `$N` references with capture text. Missing groups expand to nothing.
fn expand(template: &str, caps: Option<&Captures<'_>>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '$' {
            if let Some(idx) = chars.peek().and_then(|d| d.to_digit(10)) {
                chars.next();
                if let Some(m) = caps.and_then(|c| c.get(idx as usize)) {
                    out.push_str(&printable(m.as_bytes()));
                }
                continue;
            }
        }
        out.push(c);
    }
    out.trim().to_string()
}

/// Lossy text with control bytes dropped and line breaks escaped.
fn printable(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .chars()
        .filter_map(|c| match c {
            '\r' => Some("\\r".to_string()),
            '\n' => Some("\\n".to_string()),
            c if c.is_control() => None,
            c => Some(c.to_string()),
        })
        .collect()
}

/// Printable excerpt of the first `EXCERPT_LEN` characters of a raw response.
///
/// Truncation happens before escaping so an escape is never cut in half.
pub fn excerpt(bytes: &[u8]) -> String {
    let kept: String = String::from_utf8_lossy(bytes)
        .chars()
        .filter(|c| matches!(c, '\r' | '\n') || !c.is_control())
        .take(EXCERPT_LEN)
        .collect();
    printable(kept.as_bytes())
}

static SIGNATURES: Lazy<Vec<Signature>> = Lazy::new(|| {
    const HTTP: &str = r"(?s-u)^HTTP/1\.[01] \d\d\d.*?\r\n(?i:server): ";
    let http = |name: &'static str, rest: &str| Signature::pattern(name, "http", &format!("{HTTP}{rest}"));
    vec![
        // ssh
        Signature::pattern("ssh-openssh-windows", "ssh", r"^SSH-([\d.]+)-OpenSSH_for_Windows_([\w.]+)")
            .product("OpenSSH for_Windows").version("$2").info("protocol $1").os("Windows"),
        Signature::pattern("ssh-openssh-ubuntu", "ssh", r"^SSH-([\d.]+)-OpenSSH_([\w.]+)[ -]Ubuntu-(\S+)")
            .product("OpenSSH").version("$2").info("Ubuntu $3; protocol $1").os("Linux"),
        Signature::pattern("ssh-openssh-debian", "ssh", r"^SSH-([\d.]+)-OpenSSH_([\w.]+)[ -]Debian-(\S+)")
            .product("OpenSSH").version("$2").info("Debian $3; protocol $1").os("Linux"),
        Signature::pattern("ssh-openssh-freebsd", "ssh", r"^SSH-([\d.]+)-OpenSSH_([\w.]+) FreeBSD-(\S+)")
            .product("OpenSSH").version("$2").info("FreeBSD $3; protocol $1").os("FreeBSD"),
        Signature::pattern("ssh-openssh", "ssh", r"^SSH-([\d.]+)-OpenSSH_([\w.]+)")
            .product("OpenSSH").version("$2").info("protocol $1"),
        Signature::pattern("ssh-dropbear", "ssh", r"^SSH-([\d.]+)-dropbear_([\w.]+)")
            .product("Dropbear sshd").version("$2").info("protocol $1").os("Linux").device("embedded"),
        Signature::pattern("ssh-cisco", "ssh", r"^SSH-([\d.]+)-Cisco-([\d.]+)")
            .product("Cisco SSH").version("$2").info("protocol $1").os("IOS").device("router"),
        Signature::pattern("ssh-generic", "ssh", r"^SSH-([\d.]+)-(\S+)")
            .product("$2").info("protocol $1"),
        // ftp
        Signature::pattern("ftp-vsftpd", "ftp", r"^220 \(vsFTPd ([\w.]+)\)")
            .product("vsftpd").version("$1").os("Unix"),
        Signature::pattern("ftp-proftpd", "ftp", r"^220[ -]ProFTPD ([\w.]+) Server(?: \(([^)\r\n]*)\))?")
            .product("ProFTPD").version("$1").info("$2"),
        Signature::pattern("ftp-filezilla", "ftp", r"^220[ -]FileZilla Server(?: version)? ?([\w.]*)")
            .product("FileZilla ftpd").version("$1").os("Windows"),
        Signature::pattern("ftp-microsoft", "ftp", r"^220[ -]Microsoft FTP Service")
            .product("Microsoft ftpd").os("Windows"),
        Signature::pattern("ftp-pureftpd", "ftp", r"^220[ -][^\r\n]*Pure-FTPd")
            .product("Pure-FTPd"),
        // smtp
        Signature::pattern("smtp-postfix", "smtp", r"^220 ([\w.-]+) ESMTP Postfix(?: \(([^)\r\n]+)\))?")
            .product("Postfix smtpd").hostname("$1").info("$2"),
        Signature::pattern("smtp-exim", "smtp", r"^220 ([\w.-]+) ESMTP Exim ([\w.]+)")
            .product("Exim smtpd").version("$2").hostname("$1"),
        Signature::pattern("smtp-microsoft", "smtp", r"^220 ([\w.-]+) Microsoft ESMTP MAIL Service")
            .product("Microsoft ESMTP").hostname("$1").os("Windows"),
        Signature::pattern("smtp-generic", "smtp", r"^220[ -]([\w.-]+) E?SMTP")
            .hostname("$1"),
        Signature::pattern("ftp-generic", "ftp", r"(?i)^220[ -][^\r\n]*ftp"),
        // mail retrieval
        Signature::pattern("pop3-dovecot", "pop3", r"^\+OK[^\r\n]*Dovecot").product("Dovecot pop3d"),
        Signature::pattern("pop3-generic", "pop3", r"^\+OK"),
        Signature::pattern("imap-dovecot", "imap", r"^\* OK[^\r\n]*Dovecot").product("Dovecot imapd"),
        Signature::pattern("imap-generic", "imap", r"^\* OK"),
        // databases and brokers
        Signature::pattern("mysql-mariadb", "mysql", r"(?s-u)^.\x00\x00\x00\x0a(?:5\.5\.5-)?([\d.]+)-MariaDB")
            .product("MariaDB").version("$1"),
        Signature::pattern("mysql", "mysql", r"(?s-u)^.\x00\x00\x00\x0a([\d.]+[\w.-]*)\x00")
            .product("MySQL").version("$1"),
        Signature::pattern("mysql-unauthorized", "mysql", r"(?s-u)^.\x00\x00\x00\xff.{2}Host .* is not allowed to connect")
            .product("MySQL").info("unauthorized"),
        Signature::pattern("redis", "redis", r"^-(?:ERR (?:wrong number of arguments|unknown command)|NOAUTH|DENIED)")
            .product("Redis key-value store"),
        Signature::prefix("amqp", "amqp", b"AMQP\x00").product("AMQP broker"),
        // remote access
        Signature::pattern("vnc", "vnc", r"^RFB (\d{3})\.(\d{3})\n")
            .product("VNC").info("protocol $1.$2"),
        Signature::prefix("telnet-will", "telnet", &[0xff, 0xfb]),
        Signature::prefix("telnet-do", "telnet", &[0xff, 0xfd]),
        Signature::pattern("rtsp", "rtsp", r"^RTSP/1\.0 \d\d\d").device("media device"),
        // http, most specific servers first
        http("http-iis", r"Microsoft-IIS/([\d.]+)")
            .product("Microsoft IIS httpd").version("$1").os("Windows"),
        http("http-apache-linux", r"Apache/([\d.]+) \((Ubuntu|Debian|CentOS|Red Hat|Fedora)\)")
            .product("Apache httpd").version("$1").info("$2").os("Linux"),
        http("http-apache-windows", r"Apache/([\d.]+) \((Win32|Win64)\)")
            .product("Apache httpd").version("$1").info("$2").os("Windows"),
        http("http-apache", r"Apache(?:/([\d.]+))?")
            .product("Apache httpd").version("$1"),
        http("http-nginx", r"nginx(?:/([\d.]+))?")
            .product("nginx").version("$1"),
        http("http-lighttpd", r"lighttpd(?:/([\d.]+))?")
            .product("lighttpd").version("$1"),
        http("http-jetty", r"Jetty\(([\w.-]+)\)")
            .product("Jetty").version("$1"),
        http("http-squid", r"squid(?:/([\d.]+))?")
            .service("http-proxy").product("Squid http proxy").version("$1"),
        http("http-rompager", r"RomPager/([\d.]+)")
            .product("Allegro RomPager").version("$1").device("broadband router"),
        http("http-goahead", r"GoAhead-(?:Webs|http)")
            .product("GoAhead WebServer").device("embedded"),
        http("http-generic-server", r"([^\r\n/ ]+)(?:/([^\s]+))?")
            .product("$1").version("$2"),
        Signature::pattern("http-generic", "http", r"^HTTP/1\.[01] \d\d\d"),
    ]
});

/// The read-only signature table, in priority order.
pub fn signatures() -> &'static [Signature] {
    &SIGNATURES
}

/// Match `data` against the table. The first matching entry wins.
pub fn match_banner(port: u16, data: &[u8]) -> Option<PortInfo> {
    if data.is_empty() {
        return None;
    }
    SIGNATURES.iter().find_map(|sig| {
        let info = sig.apply(port, data)?;
        debug!(port, signature = sig.name, "signature matched");
        Some(info)
    })
}

/// Result for an open port whose responses matched nothing.
pub fn unidentified(port: u16, data: &[u8]) -> PortInfo {
    PortInfo {
        info: excerpt(data),
        ..PortInfo::unknown(port)
    }
}

/// Time allowance for fingerprinting one connection.
#[derive(Debug, Clone, Copy)]
pub struct ProbeBudget {
    pub banner_wait: Duration,
    pub deadline: Instant,
}

impl ProbeBudget {
    /// The banner wait gets at most an equal share of `timeout`, so the
    /// active probes always keep time of their own.
    pub fn new(banner_wait: Duration, timeout: Duration) -> Self {
        Self {
            banner_wait: banner_wait.min(timeout / PROBES.len() as u32),
            deadline: Instant::now() + timeout,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ReadState {
    got: usize,
    closed: bool,
}

/// Read whatever arrives within `wait` (and before the deadline), then keep
/// draining until the peer goes quiet for a short gap.
async fn read_response<S>(stream: &mut S, wait: Duration, deadline: Instant, acc: &mut Vec<u8>) -> ReadState
where
    S: AsyncRead + Unpin,
{
    let mut state = ReadState::default();
    let mut buf = [0u8; 1024];
    let mut limit = wait.min(deadline.saturating_duration_since(Instant::now()));

    while acc.len() < MAX_RESPONSE && !limit.is_zero() {
        match time::timeout(limit, stream.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) => {
                state.closed = true;
                break;
            }
            Ok(Ok(n)) => {
                let take = n.min(MAX_RESPONSE - acc.len());
                acc.extend_from_slice(&buf[..take]);
                state.got += take;
            }
            Err(_) => break,
        }
        limit = TRAILING_GAP.min(deadline.saturating_duration_since(Instant::now()));
    }
    state
}

/// Identify the service behind an established plaintext connection.
///
/// Partial responses are matched as-is; nothing here waits past the budget.
pub async fn fingerprint_stream<S>(stream: &mut S, port: u16, budget: ProbeBudget) -> PortInfo
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut acc = Vec::new();
    let mut closed = false;

    for (idx, probe) in PROBES.iter().enumerate() {
        let wait = match probe.payload {
            None => budget.banner_wait,
            Some(payload) => {
                if closed || budget.remaining().is_zero() {
                    break;
                }
                match time::timeout(budget.remaining(), stream.write_all(payload)).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
                // Leave room for the probes still to come.
                budget.remaining() / (PROBES.len() - idx) as u32
            }
        };

        let start = acc.len();
        let read = read_response(stream, wait, budget.deadline, &mut acc).await;
        closed = read.closed;
        if read.got == 0 {
            continue;
        }

        let hit = match_banner(port, &acc[start..]).or_else(|| {
            (start > 0).then(|| match_banner(port, &acc)).flatten()
        });
        if let Some(mut info) = hit {
            info.probe_name = probe.name.to_string();
            return info;
        }
    }

    unidentified(port, &acc)
}

/// Run one probe inside an already established session (e.g. TLS) and match the reply.
pub async fn probe_session<S>(stream: &mut S, port: u16, probe: Probe, timeout: Duration) -> Option<PortInfo>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let deadline = Instant::now() + timeout;
    if let Some(payload) = probe.payload {
        time::timeout(timeout, stream.write_all(payload)).await.ok()?.ok()?;
    }
    let mut acc = Vec::new();
    read_response(stream, timeout, deadline, &mut acc).await;
    let mut info = match_banner(port, &acc)?;
    info.probe_name = probe.name.to_string();
    Some(info)
}
