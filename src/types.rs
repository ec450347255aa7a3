use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default per-connection timeout used when the caller does not pick one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Default wait for an unsolicited banner before active probing starts.
pub const DEFAULT_BANNER_TIMEOUT: Duration = Duration::from_millis(500);

/// Immutable input to one scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    pub target: String,
    pub start_port: u16,
    pub end_port: u16,
    pub max_threads: usize,
    /// Bounds connect, every read/write, and the TLS handshake.
    pub timeout: Duration,
    /// Passive banner wait. Never longer than `timeout`.
    pub banner_timeout: Duration,
    /// Run a best-effort UDP check for ports that are not open over TCP.
    pub udp: bool,
}

impl ScanConfig {
    pub fn new(target: impl Into<String>, start_port: u16, end_port: u16, max_threads: usize) -> Self {
        Self {
            target: target.into(),
            start_port,
            end_port,
            max_threads,
            timeout: DEFAULT_TIMEOUT,
            banner_timeout: DEFAULT_BANNER_TIMEOUT,
            udp: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_banner_timeout(mut self, banner_timeout: Duration) -> Self {
        self.banner_timeout = banner_timeout;
        self
    }

    pub fn with_udp(mut self, udp: bool) -> Self {
        self.udp = udp;
        self
    }

    /// Number of ports in the inclusive range. Zero only for an inverted range.
    pub fn total_ports(&self) -> u32 {
        if self.end_port < self.start_port {
            return 0;
        }
        u32::from(self.end_port) - u32::from(self.start_port) + 1
    }

    pub fn ports(&self) -> std::ops::RangeInclusive<u16> {
        self.start_port..=self.end_port
    }

    pub fn effective_banner_timeout(&self) -> Duration {
        self.banner_timeout.min(self.timeout)
    }
}

/// Fingerprint record for one open port. Field names are the `port-found` payload.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct PortInfo {
    pub port: u16,
    pub protocol: String,
    pub service: String,
    pub product_name: String,
    pub version: String,
    pub info: String,
    pub hostname: String,
    pub operating_system: String,
    pub device_type: String,
    pub probe_name: String,
    pub tls: bool,
}

impl PortInfo {
    pub const UNKNOWN: &'static str = "unknown";

    /// An open port nothing could be identified on.
    pub fn unknown(port: u16) -> Self {
        Self {
            port,
            protocol: Self::UNKNOWN.to_string(),
            service: Self::UNKNOWN.to_string(),
            ..Self::default()
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.protocol == Self::UNKNOWN
    }
}

/// What the scan engine reports for each port.
///
/// Every processed port yields exactly one `Progress`; open ports yield a
/// `Found` first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortEvent {
    Progress(u16),
    Found(PortInfo),
}

/// How a scan that did not fault ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    Completed,
    Cancelled,
}

/// Status strings carried by `scan-status` and `scan-progress`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Idle,
    Running,
    Scanning,
    Stopping,
    Cancelled,
    Error,
    Completed,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Idle => "idle",
            ScanStatus::Running => "running",
            ScanStatus::Scanning => "scanning",
            ScanStatus::Stopping => "stopping",
            ScanStatus::Cancelled => "cancelled",
            ScanStatus::Error => "error",
            ScanStatus::Completed => "completed",
        }
    }
}

impl std::fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `scan-progress` payload, also returned by progress queries.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanProgress {
    pub current_port: u32,
    pub total_ports: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scanned: Option<u32>,
    pub status: ScanStatus,
}

impl ScanProgress {
    pub fn idle() -> Self {
        Self {
            current_port: 0,
            total_ports: 0,
            scanned: None,
            status: ScanStatus::Idle,
        }
    }
}

/// `scan-complete` payload.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanComplete {
    pub total_ports: u32,
    pub scanned: u32,
}

/// JSON report written by the CLI.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ScanReport {
    pub target: String,
    pub start_port: u16,
    pub end_port: u16,
    pub started_at: String,
    pub finished_at: String,
    pub status: ScanStatus,
    pub scanned: u32,
    pub total_ports: u32,
    pub ports: Vec<PortInfo>,
}
