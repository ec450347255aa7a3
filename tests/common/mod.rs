#![allow(dead_code)]

use std::time::Duration;

use svcscan_rs::events::ScanEvent;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time;

pub const HTTP_RESPONSE: &[u8] =
    b"HTTP/1.1 200 OK\r\nServer: nginx/1.18.0\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Listener that answers any request with `HTTP_RESPONSE` and closes.
pub async fn spawn_http_server() -> u16 {
    spawn_server(|mut sock| async move {
        let mut buf = [0u8; 1024];
        let _ = time::timeout(Duration::from_millis(500), sock.read(&mut buf)).await;
        let _ = sock.write_all(HTTP_RESPONSE).await;
    })
    .await
}

/// TLS listener (self-signed, SAN `scan.example.test`) that answers HTTP inside the session.
pub async fn spawn_tls_http_server() -> u16 {
    let identity = native_tls::Identity::from_pkcs8(
        include_bytes!("../fixtures/server_cert.pem"),
        include_bytes!("../fixtures/server_key.pem"),
    )
    .unwrap();
    let acceptor = tokio_native_tls::TlsAcceptor::from(native_tls::TlsAcceptor::new(identity).unwrap());
    spawn_server(move |sock| {
        let acceptor = acceptor.clone();
        async move {
            let Ok(mut tls) = acceptor.accept(sock).await else { return };
            let mut buf = [0u8; 1024];
            let _ = time::timeout(Duration::from_millis(500), tls.read(&mut buf)).await;
            let _ = tls.write_all(HTTP_RESPONSE).await;
            let _ = tls.flush().await;
            time::sleep(Duration::from_millis(500)).await;
        }
    })
    .await
}

/// Listener that writes `banner` right after accept and keeps the socket open briefly.
pub async fn spawn_banner_server(banner: &'static [u8]) -> u16 {
    spawn_server(move |mut sock| async move {
        let _ = sock.write_all(banner).await;
        time::sleep(Duration::from_secs(2)).await;
    })
    .await
}

/// Listener that accepts and never says anything.
pub async fn spawn_silent_server() -> u16 {
    spawn_server(|sock| async move {
        time::sleep(Duration::from_secs(30)).await;
        drop(sock);
    })
    .await
}

/// `len` consecutive silent listeners; returns the first port of the block.
pub async fn spawn_silent_block(len: u16) -> u16 {
    for _ in 0..32 {
        let base = closed_port().await;
        if base.checked_add(len).is_none() {
            continue;
        }
        let mut listeners = Vec::with_capacity(usize::from(len));
        for port in base..base + len {
            match TcpListener::bind(("127.0.0.1", port)).await {
                Ok(l) => listeners.push(l),
                Err(_) => break,
            }
        }
        if listeners.len() < usize::from(len) {
            continue;
        }
        for listener in listeners {
            tokio::spawn(async move {
                while let Ok((sock, _)) = listener.accept().await {
                    tokio::spawn(async move {
                        time::sleep(Duration::from_secs(30)).await;
                        drop(sock);
                    });
                }
            });
        }
        return base;
    }
    panic!("no free block of {len} ports");
}

async fn spawn_server<F, Fut>(handler: F) -> u16
where
    F: Fn(tokio::net::TcpStream) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((sock, _)) = listener.accept().await {
            tokio::spawn(handler(sock));
        }
    });
    port
}

/// A port nothing listens on: bind, note the port, release it.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start of a `len`-port window containing `port`, clamped to the valid range.
pub fn window_around(port: u16, len: u16) -> u16 {
    let start = port.saturating_sub(len / 2).max(1);
    start.min(u16::MAX - len + 1)
}

/// Collect events until the session reports `idle` after a terminal status.
pub async fn collect_until_idle(rx: &mut UnboundedReceiver<ScanEvent>, limit: Duration) -> Vec<ScanEvent> {
    let mut out = Vec::new();
    let mut terminal = false;
    let res = time::timeout(limit, async {
        while let Some(ev) = rx.recv().await {
            terminal |= ev.is_terminal_status();
            let idle = terminal && ev.status() == Some("idle");
            out.push(ev);
            if idle {
                break;
            }
        }
    })
    .await;
    assert!(res.is_ok(), "timed out waiting for idle; got {out:?}");
    out
}

pub fn statuses(events: &[ScanEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| e.status().map(str::to_string))
        .collect()
}
