//! Caller-owned handle that runs at most one scan at a time.
//!
//! State machine: idle -> running -> {completed, cancelled, error} -> idle.
//! Starting a scan while another is live reports the old one as cancelled,
//! cancels it and bumps the generation; every report from the scan engine
//! carries its generation and is dropped if it no longer matches, so a
//! superseded scan can never touch the counters or events of its replacement.
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ScanError;
use crate::events::{self, EventSink};
use crate::ports::validate_range;
use crate::scanner::scan_ports_combined;
use crate::types::{
    PortEvent, ScanComplete, ScanConfig, ScanOutcome, ScanProgress, ScanStatus, DEFAULT_TIMEOUT,
};

/// Live-scan handle: everything shared between the scan task and queries.
#[derive(Debug)]
struct ActiveScan {
    generation: u64,
    cancel: CancellationToken,
    start_port: u16,
    end_port: u16,
    total_ports: u32,
    scanned: Arc<AtomicU32>,
}

impl ActiveScan {
    fn scanned(&self) -> u32 {
        self.scanned.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct SessionState {
    sink: Option<Arc<dyn EventSink>>,
    generation: u64,
    active: Option<ActiveScan>,
}

impl SessionState {
    fn live(&self, generation: u64) -> Option<&ActiveScan> {
        self.active.as_ref().filter(|a| a.generation == generation)
    }
}

struct SessionInner {
    state: Mutex<SessionState>,
    idle: Notify,
    timeout: Duration,
}

impl SessionInner {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handle one engine event for the scan with `generation`.
    fn report(&self, generation: u64, event: PortEvent) {
        let state = self.lock();
        let (Some(active), Some(sink)) = (state.live(generation), state.sink.as_deref()) else {
            return;
        };
        if active.cancel.is_cancelled() {
            return;
        }

        match event {
            PortEvent::Progress(port) => {
                let scanned = active.scanned.fetch_add(1, Ordering::SeqCst) + 1;
                events::emit_progress(
                    sink,
                    &ScanProgress {
                        current_port: port.into(),
                        total_ports: active.total_ports,
                        scanned: Some(scanned),
                        status: ScanStatus::Scanning,
                    },
                );
            }
            PortEvent::Found(info) => {
                info!(port = info.port, protocol = %info.protocol, service = %info.service, "port found");
                events::emit_port(sink, &info);
            }
        }
    }

    /// Report the terminal state and clear the handle, unless superseded.
    fn finish(&self, generation: u64, result: Result<ScanOutcome, ScanError>) {
        let mut state = self.lock();
        if state.live(generation).is_none() {
            debug!(generation, "superseded scan finished; nothing reported");
            return;
        }
        let Some(active) = state.active.take() else {
            return;
        };
        let scanned = active.scanned();
        let total = active.total_ports;
        // A stop that lands after the engine finished still ends as cancelled.
        let result = match result {
            Ok(ScanOutcome::Completed) if active.cancel.is_cancelled() => Ok(ScanOutcome::Cancelled),
            other => other,
        };

        if let Some(sink) = state.sink.as_deref() {
            match result {
                Ok(ScanOutcome::Completed) => {
                    info!(total, scanned, "scan completed");
                    events::emit_complete(sink, &ScanComplete { total_ports: total, scanned });
                    events::emit_status(sink, ScanStatus::Completed);
                    events::emit_progress(
                        sink,
                        &ScanProgress {
                            current_port: active.end_port.into(),
                            total_ports: total,
                            scanned: None,
                            status: ScanStatus::Completed,
                        },
                    );
                }
                Ok(ScanOutcome::Cancelled) => {
                    info!(total, scanned, "scan cancelled");
                    events::emit_status(sink, ScanStatus::Cancelled);
                    events::emit_progress(sink, &snapshot(scanned, total, ScanStatus::Cancelled));
                }
                Err(e) => {
                    warn!(error = %e, "scan failed");
                    events::emit_error(sink, &e.to_string());
                    events::emit_status(sink, ScanStatus::Error);
                    events::emit_progress(sink, &snapshot(scanned, total, ScanStatus::Error));
                }
            }
            events::emit_status(sink, ScanStatus::Idle);
        }
        drop(state);
        self.idle.notify_waiters();
    }
}

fn snapshot(scanned: u32, total: u32, status: ScanStatus) -> ScanProgress {
    ScanProgress {
        current_port: scanned,
        total_ports: total,
        scanned: None,
        status,
    }
}

/// Start/stop/query surface for port scans. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ScanSession {
    inner: Arc<SessionInner>,
}

impl Default for ScanSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanSession {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    /// Session whose `start_scan` uses `timeout` per connection.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                state: Mutex::new(SessionState::default()),
                idle: Notify::new(),
                timeout,
            }),
        }
    }

    /// Attach the event sink. Scans are rejected until this has been called.
    pub fn startup(&self, sink: Arc<dyn EventSink>) {
        self.inner.lock().sink = Some(sink);
    }

    /// Validate inputs and start a background scan. Returns immediately.
    pub fn start_scan(
        &self,
        target: &str,
        start_port: u32,
        end_port: u32,
        max_threads: usize,
    ) -> Result<(), ScanError> {
        let (start, end) = validate_range(start_port, end_port)?;
        let config = ScanConfig::new(target.trim(), start, end, max_threads).with_timeout(self.inner.timeout);
        self.start_scan_with(config)
    }

    /// Like `start_scan`, with every knob of `ScanConfig` under caller control.
    pub fn start_scan_with(&self, config: ScanConfig) -> Result<(), ScanError> {
        let runtime = Handle::try_current().map_err(|_| ScanError::NotInitialized)?;
        let mut state = self.inner.lock();
        let sink = state.sink.clone().ok_or(ScanError::NotInitialized)?;

        if config.target.trim().is_empty() {
            return Err(ScanError::EmptyTarget);
        }
        validate_range(config.start_port.into(), config.end_port.into())?;
        if config.max_threads == 0 {
            return Err(ScanError::InvalidConcurrency);
        }

        if let Some(previous) = state.active.take() {
            info!(generation = previous.generation, "replacing running scan");
            previous.cancel.cancel();
            events::emit_status(sink.as_ref(), ScanStatus::Cancelled);
            events::emit_progress(
                sink.as_ref(),
                &snapshot(previous.scanned(), previous.total_ports, ScanStatus::Cancelled),
            );
        }

        state.generation += 1;
        let generation = state.generation;
        let cancel = CancellationToken::new();
        let total_ports = config.total_ports();
        state.active = Some(ActiveScan {
            generation,
            cancel: cancel.clone(),
            start_port: config.start_port,
            end_port: config.end_port,
            total_ports,
            scanned: Arc::new(AtomicU32::new(0)),
        });

        info!(
            target = %config.target,
            start = config.start_port,
            end = config.end_port,
            max_threads = config.max_threads,
            generation,
            "scan started"
        );
        events::emit_status(sink.as_ref(), ScanStatus::Running);
        events::emit_progress(
            sink.as_ref(),
            &ScanProgress {
                current_port: config.start_port.into(),
                total_ports,
                scanned: None,
                status: ScanStatus::Scanning,
            },
        );
        drop(state);

        let inner = self.inner.clone();
        runtime.spawn(async move {
            let reporter = inner.clone();
            let scan = tokio::spawn(async move {
                scan_ports_combined(&config, cancel, move |event| reporter.report(generation, event)).await
            });
            // A panic inside the scan task still ends in the error state.
            let result = match scan.await {
                Ok(result) => result,
                Err(e) => Err(ScanError::Internal(format!("scan task failed: {e}"))),
            };
            inner.finish(generation, result);
        });
        Ok(())
    }

    /// Request cancellation of the running scan. No-op when idle or already stopping.
    pub fn stop_scan(&self) -> Result<(), ScanError> {
        let state = self.inner.lock();
        let Some(active) = state.active.as_ref() else {
            return Ok(());
        };
        if active.cancel.is_cancelled() {
            return Ok(());
        }

        active.cancel.cancel();
        info!(generation = active.generation, scanned = active.scanned(), "scan stopping");
        if let Some(sink) = state.sink.as_deref() {
            events::emit_status(sink, ScanStatus::Stopping);
            events::emit_progress(sink, &snapshot(active.scanned(), active.total_ports, ScanStatus::Stopping));
        }
        Ok(())
    }

    /// `Running` while a scan handle is live, `Idle` otherwise.
    pub fn status(&self) -> ScanStatus {
        if self.inner.lock().active.is_some() {
            ScanStatus::Running
        } else {
            ScanStatus::Idle
        }
    }

    pub fn progress(&self) -> ScanProgress {
        match self.inner.lock().active.as_ref() {
            Some(active) => {
                let scanned = active.scanned();
                ScanProgress {
                    current_port: scanned,
                    total_ports: active.total_ports,
                    scanned: Some(scanned),
                    status: ScanStatus::Running,
                }
            }
            None => ScanProgress::idle(),
        }
    }

    /// Resolve once no scan is live.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.lock().active.is_none() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChannelSink;

    #[tokio::test]
    async fn rejects_before_startup() {
        let session = ScanSession::new();
        let err = session.start_scan("127.0.0.1", 1, 10, 4).unwrap_err();
        assert!(matches!(err, ScanError::NotInitialized));
        assert_eq!(session.status(), ScanStatus::Idle);
    }

    #[tokio::test]
    async fn rejects_bad_input() {
        let session = ScanSession::new();
        let (sink, _rx) = ChannelSink::new();
        session.startup(Arc::new(sink));

        assert!(matches!(
            session.start_scan("127.0.0.1", 10, 1, 4),
            Err(ScanError::InvalidRange { .. })
        ));
        assert!(matches!(
            session.start_scan("127.0.0.1", 0, 1, 4),
            Err(ScanError::InvalidRange { .. })
        ));
        assert!(matches!(
            session.start_scan("127.0.0.1", 1, 70000, 4),
            Err(ScanError::InvalidRange { .. })
        ));
        assert!(matches!(session.start_scan("  ", 1, 2, 4), Err(ScanError::EmptyTarget)));
        assert!(matches!(
            session.start_scan("127.0.0.1", 1, 2, 0),
            Err(ScanError::InvalidConcurrency)
        ));
        assert_eq!(session.status(), ScanStatus::Idle);
    }

    #[test]
    fn rejects_outside_runtime() {
        let session = ScanSession::new();
        let (sink, _rx) = ChannelSink::new();
        session.startup(Arc::new(sink));
        assert!(matches!(
            session.start_scan("127.0.0.1", 1, 2, 1),
            Err(ScanError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn stop_when_idle_is_noop() {
        let session = ScanSession::new();
        let (sink, mut rx) = ChannelSink::new();
        session.startup(Arc::new(sink));

        assert!(session.stop_scan().is_ok());
        assert_eq!(session.status(), ScanStatus::Idle);
        assert_eq!(session.progress(), ScanProgress::idle());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn stale_generation_is_ignored() {
        let inner = SessionInner {
            state: Mutex::new(SessionState::default()),
            idle: Notify::new(),
            timeout: DEFAULT_TIMEOUT,
        };
        let (sink, mut rx) = ChannelSink::new();
        let scanned = Arc::new(AtomicU32::new(0));
        {
            let mut state = inner.lock();
            state.sink = Some(Arc::new(sink));
            state.generation = 2;
            state.active = Some(ActiveScan {
                generation: 2,
                cancel: CancellationToken::new(),
                start_port: 1,
                end_port: 10,
                total_ports: 10,
                scanned: scanned.clone(),
            });
        }

        inner.report(1, PortEvent::Progress(3));
        inner.finish(1, Ok(ScanOutcome::Completed));
        assert_eq!(scanned.load(Ordering::SeqCst), 0);
        assert!(rx.try_recv().is_err());

        inner.report(2, PortEvent::Progress(3));
        assert_eq!(scanned.load(Ordering::SeqCst), 1);
        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.name, events::SCAN_PROGRESS);
        assert_eq!(ev.payload["scanned"], 1);
        assert_eq!(ev.payload["total_ports"], 10);
    }

    type Events = tokio::sync::mpsc::UnboundedReceiver<events::ScanEvent>;

    fn seeded(generation: u64, total: u32, scanned: u32) -> (ScanSession, Events) {
        let session = ScanSession::new();
        let (sink, rx) = ChannelSink::new();
        {
            let mut state = session.inner.lock();
            state.sink = Some(Arc::new(sink));
            state.generation = generation;
            state.active = Some(ActiveScan {
                generation,
                cancel: CancellationToken::new(),
                start_port: 1,
                end_port: total as u16,
                total_ports: total,
                scanned: Arc::new(AtomicU32::new(scanned)),
            });
        }
        (session, rx)
    }

    #[test]
    fn stop_racing_completion_ends_cancelled() {
        let (session, mut rx) = seeded(1, 2, 2);
        session.stop_scan().unwrap();
        session.inner.finish(1, Ok(ScanOutcome::Completed));

        let seen: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        let statuses: Vec<_> = seen.iter().filter_map(|e| e.status()).collect();
        assert_eq!(statuses, vec!["stopping", "cancelled", "idle"]);
        assert!(seen.iter().all(|e| e.name != events::SCAN_COMPLETE));
        assert_eq!(session.status(), ScanStatus::Idle);
    }

    #[test]
    fn finish_reports_error_then_idle() {
        let inner = SessionInner {
            state: Mutex::new(SessionState::default()),
            idle: Notify::new(),
            timeout: DEFAULT_TIMEOUT,
        };
        let (sink, mut rx) = ChannelSink::new();
        {
            let mut state = inner.lock();
            state.sink = Some(Arc::new(sink));
            state.generation = 1;
            state.active = Some(ActiveScan {
                generation: 1,
                cancel: CancellationToken::new(),
                start_port: 1,
                end_port: 2,
                total_ports: 2,
                scanned: Arc::new(AtomicU32::new(1)),
            });
        }

        inner.finish(1, Err(ScanError::Internal("boom".into())));
        let names: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(names[0].name, events::SCAN_ERROR);
        assert_eq!(names[1].status(), Some("error"));
        assert_eq!(names[2].payload["status"], "error");
        assert_eq!(names[2].payload["current_port"], 1);
        assert_eq!(names[3].status(), Some("idle"));
        assert!(inner.lock().active.is_none());
    }
}
