use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use svcscan_rs::events::{ChannelSink, ScanEvent, PORT_FOUND, SCAN_COMPLETE, SCAN_ERROR, SCAN_PROGRESS};
use svcscan_rs::ports::parse_port_range;
use svcscan_rs::session::ScanSession;
use svcscan_rs::server;
use svcscan_rs::types::{PortInfo, ScanConfig, ScanReport, ScanStatus};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use time::{format_description::well_known, OffsetDateTime};
use tracing_subscriber::EnvFilter;

/// svcscan-rs: cancellable async TCP port scanner with service, version and TLS fingerprinting.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "svcscan-rs",
    version,
    about = "Cancellable async TCP port scanner with service, version and TLS fingerprinting.",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Scan one host and print the open ports.
    Scan(ScanArgs),
    /// Serve the scan API and static UI over HTTP.
    Serve(ServeArgs),
}

#[derive(Debug, Clone, clap::Args)]
struct ScanArgs {
    /// Host name or IP address to scan.
    #[arg(long)]
    target: String,

    /// Port or inclusive range, e.g. `22` or `1-1024`.
    #[arg(long, default_value = "1-1024")]
    ports: String,

    /// Max concurrent probes.
    #[arg(long, default_value_t = 100)]
    concurrency: usize,

    /// Per-connection timeout in milliseconds.
    #[arg(long = "timeout-ms", default_value_t = 2000)]
    timeout_ms: u64,

    /// How long to wait for an unsolicited banner, in milliseconds.
    #[arg(long = "banner-timeout-ms", default_value_t = 500)]
    banner_timeout_ms: u64,

    /// Also try UDP on ports that are not open over TCP.
    #[arg(long, default_value_t = false)]
    udp: bool,

    /// Write results as pretty JSON to this path (optional).
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Clone, clap::Args)]
struct ServeArgs {
    /// Address to bind the HTTP server to.
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: String,

    /// Directory with the static UI.
    #[arg(long = "ui-dir", default_value = "ui")]
    ui_dir: PathBuf,

    /// Default per-connection timeout in milliseconds.
    #[arg(long = "timeout-ms", default_value_t = 2000)]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Scan(args) => run_scan(args).await,
        Command::Serve(args) => {
            println!("UI server starting at http://{} (Ctrl+C to stop)", args.bind);
            tokio::select! {
                res = server::spawn_server(&args.bind, args.ui_dir, Duration::from_millis(args.timeout_ms)) => res,
                _ = tokio::signal::ctrl_c() => Ok(()),
            }
        }
    }
}

async fn run_scan(args: ScanArgs) -> Result<()> {
    let (start, end) = parse_port_range(&args.ports).context("invalid --ports")?;
    let config = ScanConfig::new(args.target.clone(), start, end, args.concurrency)
        .with_timeout(Duration::from_millis(args.timeout_ms))
        .with_banner_timeout(Duration::from_millis(args.banner_timeout_ms))
        .with_udp(args.udp);

    println!("svcscan-rs configuration:");
    println!("  target       : {}", config.target);
    println!("  ports        : {}-{} ({} total)", start, end, config.total_ports());
    println!("  concurrency  : {}", config.max_threads);
    println!("  timeout_ms   : {}", args.timeout_ms);
    println!("  udp          : {}", config.udp);
    println!(
        "  output       : {}",
        args.output
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<none>".to_string())
    );

    let session = ScanSession::new();
    let (sink, mut rx) = ChannelSink::new();
    session.startup(Arc::new(sink));

    let started_at = now_rfc3339();
    session.start_scan_with(config.clone())?;

    let mut found: Vec<PortInfo> = Vec::new();
    let mut status = ScanStatus::Running;
    let mut scanned = 0u32;
    let mut error: Option<String> = None;
    let mut last_pct = 0u32;
    let total = config.total_ports();

    loop {
        let event = tokio::select! {
            ev = rx.recv() => ev,
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Stopping scan...");
                session.stop_scan()?;
                continue;
            }
        };
        let Some(event) = event else { break };
        match event.name.as_str() {
            PORT_FOUND => {
                if let Ok(info) = serde_json::from_value::<PortInfo>(event.payload.clone()) {
                    println!("  open {:>5}/{:<8} {}", info.port, info.protocol, describe(&info));
                    found.push(info);
                }
            }
            SCAN_PROGRESS => {
                if let Some(n) = event.payload.get("scanned").and_then(|v| v.as_u64()) {
                    scanned = n as u32;
                    let pct = scanned * 100 / total.max(1);
                    if pct >= last_pct + 10 {
                        last_pct = pct - pct % 10;
                        eprintln!("  progress: {pct}% ({scanned}/{total})");
                    }
                }
            }
            SCAN_COMPLETE => {
                if let Some(n) = event.payload.get("scanned").and_then(|v| v.as_u64()) {
                    scanned = n as u32;
                }
            }
            SCAN_ERROR => error = event.payload.as_str().map(str::to_string),
            _ => {}
        }
        if let Some(s) = terminal_status(&event) {
            status = s;
            break;
        }
    }

    found.sort_by_key(|p| p.port);
    print_results_table(&found, scanned, total);

    if let Some(path) = args.output.as_deref() {
        let report = ScanReport {
            target: config.target.clone(),
            start_port: start,
            end_port: end,
            started_at,
            finished_at: now_rfc3339(),
            status,
            scanned,
            total_ports: total,
            ports: found,
        };
        if let Err(e) = write_report_json(path, &report) {
            eprintln!("Failed to write JSON to {}: {}", path.display(), e);
        } else {
            println!("Wrote JSON results to {}", path.display());
        }
    }

    if let Some(e) = error {
        bail!("scan failed: {e}");
    }
    Ok(())
}

fn terminal_status(event: &ScanEvent) -> Option<ScanStatus> {
    match event.status()? {
        "completed" => Some(ScanStatus::Completed),
        "cancelled" => Some(ScanStatus::Cancelled),
        "error" => Some(ScanStatus::Error),
        _ => None,
    }
}

fn describe(info: &PortInfo) -> String {
    let mut parts: Vec<&str> = vec![info.service.as_str()];
    for s in [
        info.product_name.as_str(),
        info.version.as_str(),
        info.operating_system.as_str(),
    ] {
        if !s.is_empty() {
            parts.push(s);
        }
    }
    if info.tls {
        parts.push("[tls]");
    }
    parts.join(" ")
}

fn print_results_table(results: &[PortInfo], scanned: u32, total: u32) {
    let port_w = 5usize;
    let mut proto_w = "protocol".len();
    let mut product_w = "product".len();
    for e in results {
        proto_w = proto_w.max(e.protocol.len());
        product_w = product_w.max(e.product_name.len().min(30));
    }

    println!("\nOpen ports: {} (scanned: {}/{})", results.len(), scanned, total);
    println!(
        "{:>port_w$}  {:<proto_w$}  {:<product_w$}  {:<10}  {:<5}  info",
        "port", "protocol", "product", "version", "tls",
    );
    println!(
        "{:->port_w$}  {:-<proto_w$}  {:-<product_w$}  {:-<10}  {:-<5}  ----",
        "", "", "", "", "",
    );
    for e in results {
        let product: String = e.product_name.chars().take(30).collect();
        let mut extra = if e.hostname.is_empty() {
            e.info.clone()
        } else {
            format!("host={} {}", e.hostname, e.info)
        };
        if extra.len() > 60 {
            extra = extra.chars().take(60).collect();
        }
        println!(
            "{:>port_w$}  {:<proto_w$}  {:<product_w$}  {:<10}  {:<5}  {}",
            e.port, e.protocol, product, e.version, e.tls, extra,
        );
    }
}

fn write_report_json(path: &std::path::Path, report: &ScanReport) -> anyhow::Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, report)?;
    Ok(())
}

fn now_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
