use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ScanError;
use crate::fingerprint::{self, ProbeBudget};
use crate::probe::{self, TcpProbe, UdpProbe};
use crate::tls::{TlsDetails, TlsInspector};
use crate::types::{PortEvent, PortInfo, ScanConfig, ScanOutcome};

/// Hard ceiling on concurrent probes regardless of what the caller asks for.
pub const MAX_CONCURRENCY: usize = 5_000;

/// Per-scan state shared read-only by every probe task.
struct PortScanContext {
    ip: IpAddr,
    host: String,
    timeout: Duration,
    banner_timeout: Duration,
    udp: bool,
    tls: TlsInspector,
}

/// Scan every port in the configured range, reporting through `on_event`.
///
/// - Limits in-flight probes with a `Semaphore` sized to `max_threads`.
/// - Each open port is fingerprinted in plaintext and then checked for TLS.
/// - Emits `PortEvent::Found` for open ports, then one `PortEvent::Progress`
///   for every processed port, open or not.
/// - Once `cancel` fires no new port is dispatched, in-flight probes are
///   aborted and nothing more is reported.
pub async fn scan_ports_combined<F>(
    config: &ScanConfig,
    cancel: CancellationToken,
    on_event: F,
) -> Result<ScanOutcome, ScanError>
where
    F: Fn(PortEvent) + Send + Sync + 'static,
{
    if config.total_ports() == 0 {
        return Err(ScanError::InvalidRange {
            start: config.start_port.into(),
            end: config.end_port.into(),
        });
    }

    let ip = probe::resolve_target(&config.target).await?;
    let tls = TlsInspector::new().map_err(|e| ScanError::Internal(format!("tls connector: {e}")))?;
    let ctx = Arc::new(PortScanContext {
        ip,
        host: config.target.trim().to_string(),
        timeout: config.timeout,
        banner_timeout: config.effective_banner_timeout(),
        udp: config.udp,
        tls,
    });
    let on_event = Arc::new(on_event);

    let sem = Arc::new(Semaphore::new(config.max_threads.clamp(1, MAX_CONCURRENCY)));
    let mut set = JoinSet::new();

    for port in config.ports() {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = sem.clone().acquire_owned() => {
                permit.map_err(|e| ScanError::Internal(format!("semaphore closed: {e}")))?
            }
        };

        // Reap finished tasks as we go so a panicking probe surfaces early.
        while let Some(res) = set.try_join_next() {
            check_join(res)?;
        }

        let ctx = ctx.clone();
        let on_event = on_event.clone();
        let cancel = cancel.clone();
        set.spawn(async move {
            let _permit = permit; // keep permit until task completes

            let found = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                found = scan_port(&ctx, port) => found,
            };
            if cancel.is_cancelled() {
                return;
            }
            if let Some(info) = found {
                on_event(PortEvent::Found(info));
            }
            on_event(PortEvent::Progress(port));
        });
    }

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            res = set.join_next() => match res {
                Some(res) => check_join(res)?,
                None => break,
            },
        }
    }

    if cancel.is_cancelled() {
        set.shutdown().await;
        return Ok(ScanOutcome::Cancelled);
    }
    Ok(ScanOutcome::Completed)
}

/// Run a scan to completion and collect the open ports.
pub async fn scan_ports(config: &ScanConfig) -> Result<Vec<PortInfo>, ScanError> {
    let found = Arc::new(Mutex::new(Vec::new()));
    let sink = found.clone();
    scan_ports_combined(config, CancellationToken::new(), move |event| {
        if let PortEvent::Found(info) = event {
            if let Ok(mut guard) = sink.lock() {
                guard.push(info);
            }
        }
    })
    .await?;

    let mut ports = found.lock().map(|g| g.clone()).unwrap_or_default();
    ports.sort_by_key(|p| p.port);
    Ok(ports)
}

fn check_join(res: Result<(), JoinError>) -> Result<(), ScanError> {
    match res {
        Ok(()) => Ok(()),
        Err(e) if e.is_panic() => {
            warn!(error = %e, "probe task panicked");
            Err(ScanError::Internal(format!("probe task panicked: {e}")))
        }
        // Aborted on shutdown.
        Err(_) => Ok(()),
    }
}

async fn scan_port(ctx: &PortScanContext, port: u16) -> Option<PortInfo> {
    let addr = SocketAddr::new(ctx.ip, port);
    match probe::probe_tcp(addr, ctx.timeout).await {
        TcpProbe::Open(mut stream) => {
            let budget = ProbeBudget::new(ctx.banner_timeout, ctx.timeout);
            let mut info = fingerprint::fingerprint_stream(&mut stream, port, budget).await;
            drop(stream);

            let replay = info.is_unknown();
            if let Some(details) = ctx.tls.inspect(addr, &ctx.host, ctx.timeout, replay).await {
                apply_tls(&mut info, details);
            }
            debug!(port, protocol = %info.protocol, tls = info.tls, "open port");
            Some(info)
        }
        TcpProbe::Closed | TcpProbe::Filtered if ctx.udp => match probe::probe_udp(addr, ctx.timeout).await {
            UdpProbe::Open(reply) => {
                debug!(port, bytes = reply.len(), "udp reply");
                Some(udp_info(port, &reply))
            }
            UdpProbe::Closed | UdpProbe::Filtered => None,
        },
        TcpProbe::Closed | TcpProbe::Filtered => None,
    }
}

/// Fold TLS findings into the plaintext result without discarding what it found.
fn apply_tls(info: &mut PortInfo, details: TlsDetails) {
    if info.is_unknown() {
        *info = match details.service {
            Some(svc) => svc,
            None => PortInfo {
                protocol: "tls".to_string(),
                service: PortInfo::UNKNOWN.to_string(),
                probe_name: "TLSHandshake".to_string(),
                ..PortInfo::unknown(info.port)
            },
        };
    }
    info.tls = true;
    if info.hostname.is_empty() {
        if let Some(host) = details.hostname {
            info.hostname = host;
        }
    }
}

fn udp_info(port: u16, reply: &[u8]) -> PortInfo {
    let service = match port {
        53 => "domain",
        123 => "ntp",
        161 => "snmp",
        _ => PortInfo::UNKNOWN,
    };
    PortInfo {
        port,
        protocol: "udp".to_string(),
        service: service.to_string(),
        info: fingerprint::excerpt(reply),
        probe_name: "UDPProbe".to_string(),
        ..PortInfo::default()
    }
}
