mod common;

use std::sync::Arc;
use std::time::Duration;

use svcscan_rs::events::{ChannelSink, PORT_FOUND, SCAN_COMPLETE, SCAN_PROGRESS};
use svcscan_rs::session::ScanSession;
use svcscan_rs::types::{ScanConfig, ScanStatus};

fn session() -> (ScanSession, tokio::sync::mpsc::UnboundedReceiver<svcscan_rs::events::ScanEvent>) {
    let session = ScanSession::with_timeout(Duration::from_millis(500));
    let (sink, rx) = ChannelSink::new();
    session.startup(Arc::new(sink));
    (session, rx)
}

#[tokio::test]
async fn http_port_in_hundred_port_range() {
    let http_port = common::spawn_http_server().await;
    let start = common::window_around(http_port, 100);
    let (session, mut rx) = session();

    session
        .start_scan("127.0.0.1", start.into(), u32::from(start) + 99, 10)
        .unwrap();
    assert_eq!(session.status(), ScanStatus::Running);

    let events = common::collect_until_idle(&mut rx, Duration::from_secs(30)).await;

    let ours: Vec<_> = events
        .iter()
        .filter(|e| e.name == PORT_FOUND && e.payload["port"] == http_port)
        .collect();
    assert_eq!(ours.len(), 1);
    assert_eq!(ours[0].payload["protocol"], "http");
    assert_eq!(ours[0].payload["tls"], false);

    let increments = events
        .iter()
        .filter(|e| e.name == SCAN_PROGRESS && e.payload.get("scanned").is_some())
        .count();
    assert_eq!(increments, 100);

    let complete = events.iter().find(|e| e.name == SCAN_COMPLETE).unwrap();
    assert_eq!(complete.payload["total_ports"], 100);
    assert_eq!(complete.payload["scanned"], 100);

    assert_eq!(common::statuses(&events), vec!["running", "completed", "idle"]);
    assert_eq!(session.status(), ScanStatus::Idle);
}

#[tokio::test]
async fn stop_reports_cancelled_without_complete() {
    let port = common::spawn_silent_server().await;
    let session = ScanSession::new();
    let (sink, mut rx) = ChannelSink::new();
    session.startup(Arc::new(sink));

    let cfg = ScanConfig::new("127.0.0.1", port, port, 1)
        .with_timeout(Duration::from_secs(20))
        .with_banner_timeout(Duration::from_secs(20));
    session.start_scan_with(cfg).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    session.stop_scan().unwrap();
    // A second stop while stopping changes nothing.
    session.stop_scan().unwrap();

    let events = common::collect_until_idle(&mut rx, Duration::from_secs(5)).await;
    assert_eq!(
        common::statuses(&events),
        vec!["running", "stopping", "cancelled", "idle"]
    );
    assert!(events.iter().all(|e| e.name != SCAN_COMPLETE));

    let stopping_at = events
        .iter()
        .position(|e| e.status() == Some("stopping"))
        .unwrap();
    assert!(events[stopping_at..].iter().all(|e| e.name != PORT_FOUND));

    let cancelled = events
        .iter()
        .find(|e| e.name == SCAN_PROGRESS && e.payload["status"] == "cancelled")
        .unwrap();
    assert!(cancelled.payload["current_port"].as_u64().unwrap() <= 1);
    assert_eq!(session.status(), ScanStatus::Idle);
}

#[tokio::test]
async fn stop_after_twenty_ports_in_hundred_port_range() {
    let start = common::spawn_silent_block(100).await;
    let (session, mut rx) = session();
    let cfg = ScanConfig::new("127.0.0.1", start, start + 99, 1)
        .with_timeout(Duration::from_millis(100))
        .with_banner_timeout(Duration::from_millis(100));
    session.start_scan_with(cfg).unwrap();

    let mut events = Vec::new();
    let mut increments = 0;
    tokio::time::timeout(Duration::from_secs(60), async {
        while let Some(ev) = rx.recv().await {
            let counted = ev.name == SCAN_PROGRESS && ev.payload.get("scanned").is_some();
            events.push(ev);
            if counted {
                increments += 1;
                if increments == 20 {
                    session.stop_scan().unwrap();
                    break;
                }
            }
        }
    })
    .await
    .unwrap();
    events.extend(common::collect_until_idle(&mut rx, Duration::from_secs(10)).await);

    assert_eq!(
        common::statuses(&events),
        vec!["running", "stopping", "cancelled", "idle"]
    );
    assert!(events.iter().all(|e| e.name != SCAN_COMPLETE));

    let stopping_at = events
        .iter()
        .position(|e| e.status() == Some("stopping"))
        .unwrap();
    assert!(events[stopping_at..].iter().all(|e| e.name != PORT_FOUND));
    assert!(events[stopping_at..]
        .iter()
        .all(|e| e.payload.get("scanned").is_none()));

    let mut last = 0;
    for e in events.iter().filter(|e| e.name == SCAN_PROGRESS) {
        let count = match e.payload.get("scanned") {
            Some(n) => n.as_u64().unwrap(),
            None if e.payload["status"] == "scanning" => continue,
            None => e.payload["current_port"].as_u64().unwrap(),
        };
        assert!(count >= last, "counter went back from {last} to {count}");
        last = count;
    }
    assert_eq!(last, 20);
    assert_eq!(session.status(), ScanStatus::Idle);
}

#[tokio::test]
async fn new_scan_supersedes_old_without_cross_talk() {
    let silent = common::spawn_silent_server().await;
    let closed = common::closed_port().await;
    let start = common::window_around(closed, 10);
    let (session, mut rx) = session();

    let slow = ScanConfig::new("127.0.0.1", silent, silent, 1)
        .with_timeout(Duration::from_secs(20))
        .with_banner_timeout(Duration::from_secs(20));
    session.start_scan_with(slow).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    session
        .start_scan("127.0.0.1", start.into(), u32::from(start) + 9, 4)
        .unwrap();

    let events = common::collect_until_idle(&mut rx, Duration::from_secs(30)).await;

    assert_eq!(
        common::statuses(&events),
        vec!["running", "cancelled", "running", "completed", "idle"]
    );
    let second_start = events
        .iter()
        .enumerate()
        .filter(|(_, e)| e.status() == Some("running"))
        .map(|(i, _)| i)
        .nth(1)
        .unwrap();
    for e in &events[second_start..] {
        if e.name == SCAN_PROGRESS && e.payload["status"] == "scanning" {
            assert_eq!(e.payload["total_ports"], 10);
        }
        if e.name == PORT_FOUND {
            assert_ne!(e.payload["port"], silent);
        }
    }
    let complete = events.iter().find(|e| e.name == SCAN_COMPLETE).unwrap();
    assert_eq!(complete.payload["scanned"], 10);

    let replaced = events
        .iter()
        .find(|e| e.name == SCAN_PROGRESS && e.payload["status"] == "cancelled")
        .unwrap();
    assert_eq!(replaced.payload["total_ports"], 1);

    // Nothing more arrives once the superseded task winds down.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(session.status(), ScanStatus::Idle);
}

#[tokio::test]
async fn progress_snapshot_while_running() {
    let port = common::spawn_silent_server().await;
    let (session, _rx) = session();
    let cfg = ScanConfig::new("127.0.0.1", port, port, 1)
        .with_timeout(Duration::from_secs(20))
        .with_banner_timeout(Duration::from_secs(20));
    session.start_scan_with(cfg).unwrap();

    let progress = session.progress();
    assert_eq!(progress.status, ScanStatus::Running);
    assert_eq!(progress.total_ports, 1);
    assert_eq!(progress.current_port, 0);

    session.stop_scan().unwrap();
    tokio::time::timeout(Duration::from_secs(5), session.wait_idle())
        .await
        .unwrap();
    assert_eq!(session.progress().status, ScanStatus::Idle);
}

#[tokio::test]
async fn unresolvable_target_ends_in_error() {
    let (session, mut rx) = session();
    session.start_scan("no-such-host.invalid", 1, 5, 2).unwrap();
    let events = common::collect_until_idle(&mut rx, Duration::from_secs(30)).await;
    assert_eq!(common::statuses(&events), vec!["running", "error", "idle"]);
    assert!(events.iter().any(|e| e.name == "scan-error"));
}
