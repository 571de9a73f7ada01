//! A runner's record of one in-flight (or just-finished) prediction.
//!
//! Generalizes the teacher's single-process `PredictionEntry` (in
//! `supervisor.rs`) and `PredictionSlot` (in `permit/slot.rs`) into the
//! record a file-IPC `Runner` keeps per prediction: the original request,
//! the most recently observed response, accumulated log lines, any
//! materialized temp input paths that need cleanup, a per-prediction
//! cancellation trigger, and the single-shot guard that lets two
//! independent call sites (the response watcher and the crash monitor)
//! race to deliver the terminal webhook without double-sending.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::prediction::{LogLines, PredictionRequest, PredictionResponse, PredictionStatus};
use crate::webhook::WebhookSender;

/// Shared, cheaply-clonable handle to a pending prediction.
pub type PendingHandle = Arc<Pending>;

pub struct Pending {
    pub id: String,
    pub request: PredictionRequest,
    started_at: String,

    inner: Mutex<Inner>,

    /// Fired to ask the worker (via a `cancel-<id>` marker file) to cancel.
    cancel_token: CancellationToken,

    /// Signals a new response file has been observed, for streaming output
    /// consumers; capacity 1, coalescing bursts into a single wakeup.
    output_notify: Arc<Notify>,

    /// Buffered terminal response, delivered at most once, to whichever
    /// task is awaiting synchronous completion (HTTP sync dispatch).
    terminal_tx: Mutex<Option<mpsc::Sender<PredictionResponse>>>,
    terminal_rx: Mutex<Option<mpsc::Receiver<PredictionResponse>>>,

    /// At most one of {watcher cleanup, crash monitor} may send the
    /// terminal webhook; whichever wins the CAS does it.
    terminal_webhook_sent: AtomicBool,

    /// The sender this prediction was submitted with, if any. Stashed here
    /// (rather than only held locally by the watcher task) so the crash
    /// monitor can also reach it when it wins the terminal-webhook CAS.
    webhook: Mutex<Option<Arc<WebhookSender>>>,

    /// Set once the terminal response has been fully processed and the
    /// pending record is ready to be dropped from the runner's map.
    closed: AtomicBool,

    /// The fleet-wide capacity token this prediction was admitted under.
    /// Held for the prediction's full lifetime and dropped (releasing the
    /// token) only when the pending record itself is dropped.
    capacity_permit: Mutex<Option<tokio::sync::OwnedSemaphorePermit>>,
}

struct Inner {
    logs: Vec<String>,
    status: PredictionStatus,
    output: Option<serde_json::Value>,
    error: Option<String>,
    metrics: std::collections::HashMap<String, serde_json::Value>,
    completed_at: Option<String>,
    temp_input_paths: Vec<PathBuf>,
    output_cache: std::collections::HashMap<String, serde_json::Value>,
}

impl Pending {
    pub fn new(id: String, request: PredictionRequest, started_at: String) -> PendingHandle {
        let (tx, rx) = mpsc::channel(1);
        Arc::new(Self {
            id,
            request,
            started_at,
            inner: Mutex::new(Inner {
                logs: Vec::new(),
                status: PredictionStatus::Starting,
                output: None,
                error: None,
                metrics: Default::default(),
                completed_at: None,
                temp_input_paths: Vec::new(),
                output_cache: Default::default(),
            }),
            cancel_token: CancellationToken::new(),
            output_notify: Arc::new(Notify::new()),
            terminal_tx: Mutex::new(Some(tx)),
            terminal_rx: Mutex::new(Some(rx)),
            terminal_webhook_sent: AtomicBool::new(false),
            webhook: Mutex::new(None),
            closed: AtomicBool::new(false),
            capacity_permit: Mutex::new(None),
        })
    }

    /// Attaches the capacity token this prediction was admitted under, so it
    /// stays reserved for the prediction's full lifetime instead of being
    /// released the moment the admitting call returns.
    pub async fn set_capacity_permit(&self, permit: tokio::sync::OwnedSemaphorePermit) {
        *self.capacity_permit.lock().await = Some(permit);
    }

    pub async fn set_webhook_sender(&self, sender: Option<Arc<WebhookSender>>) {
        *self.webhook.lock().await = sender;
    }

    pub async fn webhook_sender(&self) -> Option<Arc<WebhookSender>> {
        self.webhook.lock().await.clone()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    pub async fn status(&self) -> PredictionStatus {
        self.inner.lock().await.status
    }

    pub async fn set_processing(&self) {
        let mut inner = self.inner.lock().await;
        if !inner.status.is_terminal() {
            inner.status = PredictionStatus::Processing;
        }
    }

    pub async fn append_log(&self, line: impl Into<String>) {
        self.inner.lock().await.logs.push(line.into());
    }

    pub async fn set_output(&self, output: serde_json::Value) {
        self.inner.lock().await.output = Some(output);
        self.output_notify.notify_one();
    }

    pub fn output_notify(&self) -> Arc<Notify> {
        self.output_notify.clone()
    }

    pub async fn set_metrics(&self, metrics: std::collections::HashMap<String, serde_json::Value>) {
        self.inner.lock().await.metrics = metrics;
    }

    pub async fn register_temp_input(&self, path: PathBuf) {
        self.inner.lock().await.temp_input_paths.push(path);
    }

    pub async fn take_temp_inputs(&self) -> Vec<PathBuf> {
        std::mem::take(&mut self.inner.lock().await.temp_input_paths)
    }

    pub async fn cache_output(&self, key: String, value: serde_json::Value) {
        self.inner.lock().await.output_cache.insert(key, value);
    }

    pub async fn cached_output(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.lock().await.output_cache.get(key).cloned()
    }

    /// Marks the prediction terminal, delivers the response to whichever
    /// task is awaiting synchronous completion (if any), and returns the
    /// fully built response.
    pub async fn finish(
        &self,
        status: PredictionStatus,
        output: Option<serde_json::Value>,
        error: Option<String>,
        completed_at: String,
    ) -> PredictionResponse {
        debug_assert!(status.is_terminal());
        let response = {
            let mut inner = self.inner.lock().await;
            inner.status = status;
            if output.is_some() {
                inner.output = output;
            }
            inner.error = error;
            inner.completed_at = Some(completed_at.clone());
            self.build_response(&inner)
        };

        if let Some(tx) = self.terminal_tx.lock().await.take() {
            let _ = tx.try_send(response.clone());
        }

        response
    }

    fn build_response(&self, inner: &Inner) -> PredictionResponse {
        PredictionResponse {
            id: self.id.clone(),
            status: inner.status,
            input: self.request.input.clone(),
            output: inner.output.clone(),
            error: inner.error.clone(),
            logs: LogLines(inner.logs.clone()),
            metrics: inner.metrics.clone(),
            started_at: self.started_at.clone(),
            completed_at: inner.completed_at.clone(),
        }
    }

    pub async fn current_response(&self) -> PredictionResponse {
        let inner = self.inner.lock().await;
        self.build_response(&inner)
    }

    /// Awaits the terminal response. Returns `None` if another caller
    /// already consumed it (at most one task may await synchronously).
    pub async fn wait_for_terminal(&self) -> Option<PredictionResponse> {
        let mut guard = self.terminal_rx.lock().await;
        match guard.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Attempts to claim the right to send the terminal webhook for this
    /// prediction. Returns `true` for exactly one caller across however
    /// many sites race to call this (watcher cleanup vs. crash monitor).
    pub fn claim_terminal_webhook(&self) -> bool {
        self.terminal_webhook_sent
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for Pending {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            tracing::warn!(prediction_id = %self.id, "pending record dropped before being closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn req() -> PredictionRequest {
        serde_json::from_value(json!({"input": {"x": 1}})).unwrap()
    }

    #[tokio::test]
    async fn finish_delivers_to_waiter() {
        let pending = Pending::new("p1".into(), req(), "2026-01-01T00:00:00Z".into());
        let p2 = pending.clone();
        let handle = tokio::spawn(async move { p2.wait_for_terminal().await });
        pending
            .finish(
                PredictionStatus::Succeeded,
                Some(json!(42)),
                None,
                "2026-01-01T00:00:01Z".into(),
            )
            .await;
        let resp = handle.await.unwrap().unwrap();
        assert_eq!(resp.status, PredictionStatus::Succeeded);
        assert_eq!(resp.output, Some(json!(42)));
    }

    #[test]
    fn claim_terminal_webhook_only_once() {
        let pending = Pending::new("p1".into(), req(), "now".into());
        assert!(pending.claim_terminal_webhook());
        assert!(!pending.claim_terminal_webhook());
    }

    #[tokio::test]
    async fn append_log_accumulates() {
        let pending = Pending::new("p1".into(), req(), "now".into());
        pending.append_log("line 1").await;
        pending.append_log("line 2").await;
        let resp = pending.current_response().await;
        assert_eq!(resp.logs.0, vec!["line 1", "line 2"]);
    }

    #[tokio::test]
    async fn cancel_token_propagates() {
        let pending = Pending::new("p1".into(), req(), "now".into());
        assert!(!pending.is_canceled());
        pending.cancel_token().cancel();
        assert!(pending.is_canceled());
    }
}
