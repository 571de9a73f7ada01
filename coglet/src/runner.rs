//! A single worker subprocess and the predictions it is currently serving.
//!
//! Generalizes the teacher's `orchestrator.rs` (one process, N in-process
//! slots addressed over a unix socket) into a runner that manages one
//! external `python3 -u -m coglet` subprocess addressed over files in its
//! working directory, plus its stdout/stderr for log capture. A `Manager`
//! owns a fleet of these.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::health::Health;
use crate::ipc::{self, Attribution, IpcPaths, ResponseFile};
use crate::pending::{Pending, PendingHandle};
use crate::path_handler::{self, PathHandlerError};
use crate::prediction::{PredictionRequest, PredictionResponse, PredictionStatus, WebhookEventType};
use crate::webhook::{WebhookConfig, WebhookSender};

const SETUP_TIMEOUT: Duration = Duration::from_secs(10);
const FORCE_KILL_TIMEOUT: Duration = Duration::from_secs(10);
const RESPONSE_POLL_INTERVAL: Duration = Duration::from_millis(100);
const WAIT_FILE_TIMEOUT: Duration = Duration::from_secs(60);
const WAIT_FILE_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(thiserror::Error, Debug)]
pub enum RunnerError {
    #[error("failed to spawn worker process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("setup did not complete within {0:?}")]
    SetupTimeout(Duration),
    #[error("setup failed: {0}")]
    SetupFailed(String),
    #[error("runner is not accepting predictions (status: {0:?})")]
    NotReady(Health),
    #[error("runner is at its concurrency limit")]
    AtCapacity,
    #[error("input/output materialization failed: {0}")]
    PathHandling(#[from] PathHandlerError),
}

/// Configuration needed to start a runner's worker process.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub id: String,
    pub working_dir: std::path::PathBuf,
    pub tmp_dir: std::path::PathBuf,
    pub max_concurrency: u32,
    pub procedure_hash: Option<String>,
    pub procedure_source_url: Option<String>,
    pub replicate_api_token: Option<String>,
    pub uid: Option<u32>,
    /// `COG_WAIT_FILE`: if set, polled for existence (up to `WAIT_FILE_TIMEOUT`)
    /// before `config.json` is written, so an init container can finish
    /// staging the worker's code/weights first.
    pub wait_file: Option<std::path::PathBuf>,
}

struct Gates {
    setup_complete: Notify,
    stopped: watch::Sender<bool>,
}

pub struct Runner {
    pub id: String,
    pub working_dir: std::path::PathBuf,
    pub tmp_dir: std::path::PathBuf,
    pub procedure_hash: Option<String>,
    max_concurrency: u32,

    status: RwLock<Health>,
    child: Mutex<Option<Child>>,
    pending: DashMap<String, PendingHandle>,
    /// Lines the log-capture reader couldn't attribute to a specific
    /// prediction (ambiguous or `[coglet]`-internal).
    log_buffer: Mutex<Vec<String>>,
    schema: RwLock<Option<Value>>,
    setup_result: RwLock<Option<crate::health::SetupResult>>,

    paths: IpcPaths,
    gates: Gates,
    next_epoch: std::sync::atomic::AtomicU64,
    shutting_down: AtomicBool,
}

impl Runner {
    pub fn new(config: &RunnerConfig) -> Arc<Self> {
        let (stopped_tx, _stopped_rx) = watch::channel(false);
        Arc::new(Self {
            id: config.id.clone(),
            working_dir: config.working_dir.clone(),
            tmp_dir: config.tmp_dir.clone(),
            procedure_hash: config.procedure_hash.clone(),
            max_concurrency: config.max_concurrency,
            status: RwLock::new(Health::Unknown),
            child: Mutex::new(None),
            pending: DashMap::new(),
            log_buffer: Mutex::new(Vec::new()),
            schema: RwLock::new(None),
            setup_result: RwLock::new(None),
            paths: IpcPaths::new(&config.working_dir),
            gates: Gates {
                setup_complete: Notify::new(),
                stopped: stopped_tx,
            },
            next_epoch: std::sync::atomic::AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub async fn status(&self) -> Health {
        *self.status.read().await
    }

    pub async fn set_status(&self, status: Health) {
        *self.status.write().await = status;
    }

    pub async fn schema(&self) -> Option<Value> {
        self.schema.read().await.clone()
    }

    pub async fn setup_result(&self) -> Option<crate::health::SetupResult> {
        self.setup_result.read().await.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn max_concurrency(&self) -> u32 {
        self.max_concurrency
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }

    /// Wakes every pending prediction's output-notify waiter, used when the
    /// worker signals a bare `OUTPUT` (new response files may be ready for
    /// more than one prediction at once).
    pub fn broadcast_output_notify(&self) {
        for entry in self.pending.iter() {
            entry.value().output_notify().notify_one();
        }
    }

    /// Spawns the worker process, writes its startup config, captures its
    /// stdout/stderr, and waits (with a bounded timeout) for setup to
    /// complete before returning.
    pub async fn start(self: &Arc<Self>, config: &RunnerConfig) -> Result<(), RunnerError> {
        std::fs::create_dir_all(&self.working_dir).map_err(RunnerError::Spawn)?;
        std::fs::create_dir_all(&config.tmp_dir).map_err(RunnerError::Spawn)?;

        if let Some(wait_file) = &config.wait_file {
            self.await_wait_file(wait_file).await;
        }

        let ipc_cfg = ipc::ConfigFile {
            name: self.id.clone(),
            ipc_dir: self.working_dir.clone(),
            working_dir: self.working_dir.clone(),
            tmp_dir: config.tmp_dir.clone(),
            max_concurrency: self.max_concurrency,
            procedure_source_url: config.procedure_source_url.clone(),
            replicate_api_token: config.replicate_api_token.clone(),
        };
        ipc::write_atomic(&self.paths.config(), &ipc_cfg).map_err(RunnerError::Spawn)?;

        *self.status.write().await = Health::Starting;
        self.setup_result
            .write()
            .await
            .replace(crate::health::SetupResult::starting());

        let mut command = Command::new("python3");
        command
            .arg("-u")
            .arg("-m")
            .arg("coglet")
            .arg("--name")
            .arg(&self.id)
            .arg("--ipc-url")
            .arg(&self.working_dir)
            .arg("--working-dir")
            .arg(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        #[cfg(unix)]
        if let Some(uid) = config.uid {
            command.uid(uid);
        }

        let mut child = command.spawn()?;

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");
        tokio::spawn(Self::capture_output(self.clone(), stdout, ipc::LogSource::Stdout));
        tokio::spawn(Self::capture_output(self.clone(), stderr, ipc::LogSource::Stderr));

        *self.child.lock().await = Some(child);

        self.await_setup().await
    }

    /// Polls for `COG_WAIT_FILE` to appear, up to [`WAIT_FILE_TIMEOUT`].
    /// Gives up silently on timeout — a missing wait file after 60s is
    /// treated as "proceed anyway" rather than a fatal error, matching the
    /// worker's own best-effort wait semantics.
    async fn await_wait_file(&self, path: &std::path::Path) {
        let deadline = tokio::time::Instant::now() + WAIT_FILE_TIMEOUT;
        while !path.exists() {
            if tokio::time::Instant::now() >= deadline {
                warn!(path = %path.display(), "wait file did not appear within timeout, proceeding anyway");
                return;
            }
            tokio::time::sleep(WAIT_FILE_POLL_INTERVAL).await;
        }
    }

    async fn await_setup(self: &Arc<Self>) -> Result<(), RunnerError> {
        let deadline = tokio::time::Instant::now() + SETUP_TIMEOUT;
        loop {
            if let Some(result) = ipc::read_if_exists::<SetupResultWire>(&self.paths.setup_result())
                .map_err(RunnerError::Spawn)?
            {
                let logs = self.drain_log_buffer().await;
                let setup_result = if result.succeeded {
                    crate::health::SetupResult::starting().succeeded(logs)
                } else {
                    crate::health::SetupResult::starting().failed(logs.clone())
                };
                *self.setup_result.write().await = Some(setup_result);

                if let Some(schema) = ipc::read_if_exists::<Value>(&self.paths.openapi())
                    .map_err(RunnerError::Spawn)?
                {
                    *self.schema.write().await = Some(schema);
                }

                if result.succeeded {
                    *self.status.write().await = Health::Ready;
                    self.gates.setup_complete.notify_waiters();
                    return Ok(());
                } else {
                    *self.status.write().await = Health::SetupFailed;
                    self.gates.setup_complete.notify_waiters();
                    return Err(RunnerError::SetupFailed(logs));
                }
            }

            if tokio::time::Instant::now() >= deadline {
                *self.status.write().await = Health::SetupFailed;
                return Err(RunnerError::SetupTimeout(SETUP_TIMEOUT));
            }

            tokio::time::sleep(RESPONSE_POLL_INTERVAL).await;
        }
    }

    async fn drain_log_buffer(&self) -> String {
        let mut buf = self.log_buffer.lock().await;
        if buf.is_empty() {
            String::new()
        } else {
            let mut joined = buf.join("\n");
            joined.push('\n');
            buf.clear();
            joined
        }
    }

    async fn capture_output<R>(self: Arc<Self>, reader: R, source: ipc::LogSource)
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => self.route_log_line(&line).await,
                Ok(None) => break,
                Err(e) => {
                    warn!(runner_id = %self.id, error = %e, source = ?source, "error reading worker output");
                    break;
                }
            }
        }
    }

    async fn route_log_line(&self, line: &str) {
        match ipc::attribute_log_line(line) {
            Attribution::Prediction { id, message } => {
                // Clone the handle and drop the map guard before awaiting;
                // holding a `DashMap` `Ref` across an `.await` risks
                // deadlocking a concurrent `self.pending` access.
                let pending = self.pending.get(id).map(|entry| entry.value().clone());
                match pending {
                    Some(pending) => {
                        pending.append_log(message.to_string()).await;
                        if let Some(sender) = pending.webhook_sender().await {
                            sender.send(
                                WebhookEventType::Logs,
                                &serde_json::to_value(pending.current_response().await)
                                    .unwrap_or(Value::Null),
                            );
                        }
                    }
                    None => {
                        self.log_buffer.lock().await.push(line.to_string());
                    }
                }
            }
            Attribution::Internal(message) => {
                debug!(runner_id = %self.id, "worker: {message}");
                self.log_buffer.lock().await.push(message.to_string());
            }
            Attribution::Ambiguous(message) => {
                self.log_buffer.lock().await.push(message.to_string());
            }
        }
    }

    /// Submits a prediction to this runner's worker and spawns a background
    /// watcher that processes `response-<id>-*` files as they appear.
    pub async fn predict(
        self: &Arc<Self>,
        request: PredictionRequest,
    ) -> Result<(PendingHandle, tokio::task::JoinHandle<PredictionResponse>), RunnerError> {
        let status = self.status().await;
        if status != Health::Ready && status != Health::Busy {
            return Err(RunnerError::NotReady(status));
        }
        if self.pending.len() as u32 >= self.max_concurrency {
            return Err(RunnerError::AtCapacity);
        }

        let id = request
            .id
            .clone()
            .unwrap_or_else(crate::id::generate);
        let started_at = chrono::Utc::now().to_rfc3339();
        let webhook = request.webhook.clone();
        let events_filter: std::collections::HashSet<_> =
            request.webhook_events_filter.iter().copied().collect();

        let schema = self.schema().await.unwrap_or(Value::Null);
        let (materialized_input, temp_paths) =
            path_handler::materialize_input(&schema, &request.input, &self.tmp_dir).await?;

        let pending = Pending::new(id.clone(), request.clone(), started_at);
        for path in temp_paths {
            pending.register_temp_input(path).await;
        }
        self.pending.insert(id.clone(), pending.clone());
        self.set_status(Health::Busy).await;

        let request_file = ipc::RequestFile {
            id: id.clone(),
            input: materialized_input,
            context: request
                .context
                .clone()
                .unwrap_or_default(),
        };
        if let Err(e) = ipc::write_atomic(&self.paths.request(&id), &request_file) {
            self.pending.remove(&id);
            return Err(RunnerError::Spawn(e));
        }

        let sender = webhook.map(|url| {
            Arc::new(WebhookSender::new(
                url,
                WebhookConfig {
                    events_filter,
                    ..Default::default()
                },
            ))
        });

        pending.set_webhook_sender(sender.clone()).await;

        if let Some(sender) = &sender {
            sender.send(
                WebhookEventType::Start,
                &serde_json::to_value(pending.current_response().await).unwrap_or(Value::Null),
            );
        }

        let runner = self.clone();
        let watch_pending = pending.clone();
        let handle = tokio::spawn(async move {
            runner.watch_prediction(watch_pending, sender).await
        });

        Ok((pending, handle))
    }

    /// Waits on a new response file appearing, reported either by the
    /// per-prediction output-notify (woken by the worker's `OUTPUT` ping,
    /// see [`Runner::broadcast_output_notify`]) or the fallback poll
    /// interval, and also watches for cancellation so the cancel marker
    /// file is written immediately rather than on the next tick. Response
    /// files are still read from disk after any of these fire — the wakeup
    /// source only decides how promptly we look.
    async fn watch_prediction(
        self: Arc<Self>,
        pending: PendingHandle,
        webhook: Option<Arc<WebhookSender>>,
    ) -> PredictionResponse {
        let mut interval = tokio::time::interval(RESPONSE_POLL_INTERVAL);
        let notify = pending.output_notify();
        let cancel_token = pending.cancel_token().clone();
        let mut cancel_marker_written = false;

        let response = loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = notify.notified() => {}
                _ = cancel_token.cancelled(), if !cancel_marker_written => {}
            }

            if pending.is_canceled() && !cancel_marker_written {
                let _ = std::fs::write(self.paths.cancel(&pending.id), b"");
                cancel_marker_written = true;
            }

            let files = match self.paths.list_responses(&pending.id) {
                Ok(f) => f,
                Err(e) => {
                    error!(prediction_id = %pending.id, error = %e, "failed listing response files");
                    continue;
                }
            };

            let mut terminal = None;
            for file in files {
                let Ok(Some(update)) = ipc::read_if_exists::<ResponseFile>(&file) else {
                    continue;
                };
                let _ = std::fs::remove_file(&file);

                match update {
                    ResponseFile::Processing => {
                        pending.set_processing().await;
                    }
                    ResponseFile::Succeeded { output, metrics } => {
                        pending.set_metrics(metrics).await;
                        let prefix = pending.request.output_file_prefix.as_deref();
                        match path_handler::process_output(&output, prefix).await {
                            Ok(processed) => {
                                terminal = Some((PredictionStatus::Succeeded, Some(processed), None));
                            }
                            Err(e) => {
                                error!(prediction_id = %pending.id, error = %e, "output materialization failed");
                                terminal = Some((PredictionStatus::Failed, None, Some(e.to_string())));
                            }
                        }
                    }
                    ResponseFile::Failed { error } => {
                        terminal = Some((PredictionStatus::Failed, None, Some(error)));
                    }
                    ResponseFile::Canceled => {
                        terminal = Some((PredictionStatus::Canceled, None, None));
                    }
                }

                if let Some(sender) = &webhook {
                    sender.send(
                        WebhookEventType::Output,
                        &serde_json::to_value(pending.current_response().await)
                            .unwrap_or(Value::Null),
                    );
                }
            }

            if let Some((status, output, error)) = terminal {
                let completed_at = chrono::Utc::now().to_rfc3339();
                let response = pending.finish(status, output, error, completed_at).await;
                break response;
            }
        };

        for path in pending.take_temp_inputs().await {
            let _ = std::fs::remove_file(path);
        }

        self.pending.remove(&pending.id);
        if self.pending.is_empty() {
            self.set_status(Health::Ready).await;
        }

        if pending.claim_terminal_webhook() {
            if let Some(sender) = &webhook {
                sender
                    .send_terminal(
                        WebhookEventType::Completed,
                        &serde_json::to_value(&response).unwrap_or(Value::Null),
                    )
                    .await;
            }
        }
        pending.mark_closed();

        response
    }

    pub fn cancel(&self, prediction_id: &str) {
        if let Some(pending) = self.pending.get(prediction_id) {
            pending.cancel_token().cancel();
            let _ = std::fs::write(self.paths.cancel(prediction_id), b"");
        }
    }

    pub fn contains_prediction(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    /// Requests graceful shutdown: stop accepting new work, let pending
    /// predictions drain, then terminate the process.
    pub async fn graceful_shutdown(self: &Arc<Self>) {
        self.shutting_down.store(true, Ordering::SeqCst);
        while !self.pending.is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.stop().await;
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Sends SIGTERM to the worker's process group and waits for it to
    /// exit, escalating to SIGKILL after [`FORCE_KILL_TIMEOUT`].
    pub async fn stop(self: &Arc<Self>) {
        let pid = {
            let child = self.child.lock().await;
            child.as_ref().and_then(|c| c.id())
        };
        let Some(pid) = pid else { return };

        let _ = signal::killpg(Pid::from_raw(pid as i32), Signal::SIGTERM);

        let wait = async {
            let mut child = self.child.lock().await;
            if let Some(child) = child.as_mut() {
                let _ = child.wait().await;
            }
        };

        if tokio::time::timeout(FORCE_KILL_TIMEOUT, wait).await.is_err() {
            warn!(runner_id = %self.id, "worker did not exit after SIGTERM, sending SIGKILL");
            self.force_kill(pid).await;
        }

        let _ = self.gates.stopped.send(true);
    }

    pub async fn force_kill(&self, pid: u32) {
        let _ = signal::killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
        let mut child = self.child.lock().await;
        if let Some(child) = child.as_mut() {
            let _ = child.wait().await;
        }
    }

    /// Fails every pending prediction with the given message, used when a
    /// runner is found dead (crash) or force-killed. Unattributed crash
    /// output sitting in the runner-wide log buffer (e.g. a worker's
    /// `SystemExit` traceback that never carried a `[pid=<id>]` prefix) is
    /// drained and appended to every failed prediction's logs first, since
    /// there is no more specific prediction to attribute it to.
    pub async fn fail_all_pending(&self, message: &str) {
        let crash_lines: Vec<String> = std::mem::take(&mut *self.log_buffer.lock().await);

        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                for line in &crash_lines {
                    pending.append_log(line.clone()).await;
                }

                for path in pending.take_temp_inputs().await {
                    let _ = std::fs::remove_file(path);
                }

                let completed_at = chrono::Utc::now().to_rfc3339();
                let response = pending
                    .finish(PredictionStatus::Failed, None, Some(message.to_string()), completed_at)
                    .await;

                if pending.claim_terminal_webhook() {
                    if let Some(sender) = pending.webhook_sender().await {
                        sender
                            .send_terminal(
                                WebhookEventType::Completed,
                                &serde_json::to_value(&response).unwrap_or(Value::Null),
                            )
                            .await;
                    }
                }
                pending.mark_closed();
            }
        }
    }

    pub async fn has_exited(&self) -> Option<std::process::ExitStatus> {
        let mut child = self.child.lock().await;
        match child.as_mut() {
            Some(c) => c.try_wait().ok().flatten(),
            None => None,
        }
    }

    pub fn cancel_token_placeholder() -> CancellationToken {
        CancellationToken::new()
    }
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct SetupResultWire {
    succeeded: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &std::path::Path) -> RunnerConfig {
        RunnerConfig {
            id: "default".into(),
            working_dir: dir.to_path_buf(),
            tmp_dir: dir.join("tmp"),
            max_concurrency: 4,
            procedure_hash: None,
            procedure_source_url: None,
            replicate_api_token: None,
            uid: None,
            wait_file: None,
        }
    }

    #[tokio::test]
    async fn new_runner_starts_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let runner = Runner::new(&config);
        assert_eq!(runner.status().await, Health::Unknown);
        assert!(runner.is_idle());
    }

    #[tokio::test]
    async fn cancel_on_unknown_prediction_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let runner = Runner::new(&config);
        runner.cancel("does-not-exist");
        assert!(!dir.path().join("cancel-does-not-exist").exists());
    }

    #[tokio::test]
    async fn fail_all_pending_drains_map() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let runner = Runner::new(&config);
        let req: PredictionRequest = serde_json::from_value(serde_json::json!({})).unwrap();
        let pending = Pending::new("p1".into(), req, "now".into());
        runner.pending.insert("p1".into(), pending);
        assert_eq!(runner.pending_count(), 1);
        runner.fail_all_pending("runner crashed").await;
        assert_eq!(runner.pending_count(), 0);
    }

    #[tokio::test]
    async fn fail_all_pending_merges_crash_log_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let runner = Runner::new(&config);
        let req: PredictionRequest = serde_json::from_value(serde_json::json!({})).unwrap();
        let pending = Pending::new("p1".into(), req, "now".into());
        runner.pending.insert("p1".into(), pending.clone());
        runner.log_buffer.lock().await.push("SystemExit: 1".to_string());

        runner.fail_all_pending("prediction failed").await;

        let resp = pending.current_response().await;
        assert!(resp.logs.0.iter().any(|line| line.contains("SystemExit: 1")));
    }

    #[tokio::test]
    async fn route_log_line_emits_logs_webhook() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let runner = Runner::new(&config);

        let req: PredictionRequest = serde_json::from_value(serde_json::json!({})).unwrap();
        let pending = Pending::new("p1".into(), req, "now".into());
        let sender = Arc::new(WebhookSender::new(
            format!("{}/webhook", server.uri()),
            WebhookConfig::default(),
        ));
        pending.set_webhook_sender(Some(sender)).await;
        runner.pending.insert("p1".into(), pending.clone());

        runner.route_log_line("[pid=p1] hello").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let resp = pending.current_response().await;
        assert_eq!(resp.logs.0, vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn route_log_line_buffers_unattributed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let runner = Runner::new(&config);

        runner.route_log_line("some stray output").await;

        assert_eq!(runner.log_buffer.lock().await.len(), 1);
    }
}
