//! Shared test collector.

use async_trait::async_trait;
use metlo_tower::{MetloApp, MetloTrace, TraceMeta, TraceReq};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

/// Collector that records every call and forwards sent traces to a channel.
pub struct RecordingApp {
    pub allow: bool,
    pub block_paths: Vec<&'static str>,
    pub calls: Mutex<Vec<&'static str>>,
    pub rate_limited: Mutex<Vec<MetloTrace>>,
    sent: mpsc::UnboundedSender<MetloTrace>,
}

impl RecordingApp {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MetloTrace>) {
        let (sent, rx) = mpsc::unbounded_channel();
        (
            Self {
                allow: true,
                block_paths: Vec::new(),
                calls: Mutex::new(Vec::new()),
                rate_limited: Mutex::new(Vec::new()),
                sent,
            },
            rx,
        )
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl MetloApp for RecordingApp {
    fn allow(&self) -> bool {
        self.calls.lock().unwrap().push("allow");
        self.allow
    }

    fn should_block(&self, request: &TraceReq, _meta: &TraceMeta) -> bool {
        self.calls.lock().unwrap().push("should_block");
        self.block_paths.iter().any(|p| *p == request.url.path)
    }

    fn update_rate_limit(&self, trace: &MetloTrace) {
        self.calls.lock().unwrap().push("update_rate_limit");
        self.rate_limited.lock().unwrap().push(trace.clone());
    }

    async fn send(&self, trace: MetloTrace) {
        self.calls.lock().unwrap().push("send");
        let _ = self.sent.send(trace);
    }
}

/// Wait for the next dispatched trace.
pub async fn next_trace(rx: &mut mpsc::UnboundedReceiver<MetloTrace>) -> MetloTrace {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for trace")
        .expect("collector dropped")
}
