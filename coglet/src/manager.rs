//! Fleet supervisor: owns the runner slot array and the fleet-wide
//! concurrency budget, assigns predictions/procedures to runners, and
//! monitors for crashed runners.
//!
//! Generalizes the teacher's `PredictionService` (one orchestrator, one
//! in-process pool) to own N runners instead of one, reusing its
//! "orchestrator state set atomically" idiom and its admission-mapping
//! idiom (`CreatePredictionError::{NotReady,AtCapacity}`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock, Semaphore};
use tracing::{error, info, warn};

use crate::config::{Config, Mode};
use crate::health::{Health, HealthResponse};
use crate::ipc::StatusPing;
use crate::prediction::{PredictionRequest, PredictionResponse};
use crate::runner::{Runner, RunnerConfig, RunnerError};

/// Deadline for a blocking sync `Predict`'s capacity-token wait.
const CAPACITY_WAIT_DEADLINE: Duration = Duration::from_secs(10);
/// Deadline for a blocking sync `Predict`'s wait on its assigned runner's
/// setup gate.
const SETUP_GATE_DEADLINE: Duration = Duration::from_secs(10);
const SETUP_GATE_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(thiserror::Error, Debug)]
pub enum ManagerError {
    #[error("no runner slot available")]
    AtCapacity,
    #[error("runner error: {0}")]
    Runner(#[from] RunnerError),
    #[error("prediction not found: {0}")]
    NotFound(String),
}

pub struct HealthSnapshot {
    pub status: HealthResponse,
    pub available_slots: u32,
    pub total_slots: u32,
    pub cleanup_in_progress: bool,
}

struct Slot {
    runner: Option<Arc<Runner>>,
}

pub struct Manager {
    config: Config,
    slots: RwLock<Vec<Slot>>,
    capacity: Arc<Semaphore>,
    cleanup_in_progress: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    uid_cursor: std::sync::atomic::AtomicU32,
}

impl Manager {
    pub fn new(config: Config) -> Arc<Self> {
        let num_slots = config.max_runners as usize;
        let slots = (0..num_slots).map(|_| Slot { runner: None }).collect();
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            capacity: Arc::new(Semaphore::new(config.max_concurrency as usize)),
            slots: RwLock::new(slots),
            cleanup_in_progress: AtomicBool::new(false),
            shutdown_tx,
            uid_cursor: std::sync::atomic::AtomicU32::new(9000),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// In model mode, starts the single always-resident runner. Procedure
    /// mode creates runners lazily on first use of a given source.
    pub async fn start(self: &Arc<Self>) -> Result<(), ManagerError> {
        if self.config.mode == Mode::Model {
            let runner = self.spawn_runner("default", None).await?;
            let mut slots = self.slots.write().await;
            slots[0].runner = Some(runner);
        }
        Ok(())
    }

    fn next_uid(&self) -> Option<u32> {
        if !self.config.uid_isolation || !crate::config::running_in_container() {
            return None;
        }
        Some(self.uid_cursor.fetch_add(1, Ordering::SeqCst))
    }

    async fn spawn_runner(
        self: &Arc<Self>,
        id: &str,
        procedure_source_url: Option<&str>,
    ) -> Result<Arc<Runner>, ManagerError> {
        let working_dir = self.config.working_dir_root.join(id);
        let procedure_hash = procedure_source_url.map(crate::procedure::source_hash);

        let runner_config = RunnerConfig {
            id: id.to_string(),
            working_dir: working_dir.clone(),
            tmp_dir: self.config.tmp_dir.join(id),
            max_concurrency: self.config.max_concurrency,
            procedure_hash,
            procedure_source_url: procedure_source_url.map(str::to_string),
            replicate_api_token: None,
            uid: self.next_uid(),
            wait_file: self.config.wait_file.clone(),
        };

        if let Some(url) = procedure_source_url {
            crate::procedure::prepare(&self.config.tmp_dir, url, id)
                .await
                .map_err(|e| ManagerError::Runner(RunnerError::Spawn(std::io::Error::other(e))))?;
        }

        let runner = Runner::new(&runner_config);
        runner.start(&runner_config).await?;
        Ok(runner)
    }

    /// Finds (or creates, per the slot assignment algorithm) a runner that
    /// can serve `procedure_source_url` (or the single model-mode runner).
    async fn assign_runner(
        self: &Arc<Self>,
        procedure_source_url: Option<&str>,
    ) -> Result<Arc<Runner>, ManagerError> {
        let procedure_hash = procedure_source_url.map(crate::procedure::source_hash);
        let mut slots = self.slots.write().await;

        // 1. An existing runner already hosting this procedure wins first.
        if let Some(hash) = &procedure_hash {
            for slot in slots.iter() {
                if let Some(runner) = &slot.runner {
                    if runner.procedure_hash.as_deref() == Some(hash.as_str())
                        && runner.status().await != Health::Defunct
                    {
                        return Ok(runner.clone());
                    }
                }
            }
        } else if let Some(runner) = slots.first().and_then(|s| s.runner.clone()) {
            return Ok(runner);
        }

        // 2. An empty slot.
        if let Some(idx) = slots.iter().position(|s| s.runner.is_none()) {
            let id = if self.config.mode == Mode::Model {
                "default".to_string()
            } else {
                crate::id::generate_runner_id()
            };
            let runner = self.spawn_runner(&id, procedure_source_url).await?;
            slots[idx].runner = Some(runner.clone());
            return Ok(runner);
        }

        // 3. Evict an idle, ready or defunct runner.
        for slot in slots.iter_mut() {
            if let Some(runner) = &slot.runner {
                let status = runner.status().await;
                let evictable = runner.is_idle()
                    && (status == Health::Ready || status == Health::Defunct);
                if evictable {
                    runner.stop().await;
                    let id = if self.config.mode == Mode::Model {
                        "default".to_string()
                    } else {
                        crate::id::generate_runner_id()
                    };
                    let new_runner = self.spawn_runner(&id, procedure_source_url).await?;
                    slot.runner = Some(new_runner.clone());
                    return Ok(new_runner);
                }
            }
        }

        Err(ManagerError::AtCapacity)
    }

    fn procedure_source_url(request: &PredictionRequest) -> Option<String> {
        request
            .context
            .as_ref()
            .and_then(|c| c.procedure_source_url.clone())
    }

    /// Runs a prediction to completion and returns its terminal response.
    ///
    /// Blocks (rather than failing fast) for up to [`CAPACITY_WAIT_DEADLINE`]
    /// acquiring a capacity token, and up to [`SETUP_GATE_DEADLINE`] waiting
    /// for the assigned runner to clear its setup gate, per the spec's
    /// distinction between blocking sync `Predict` and fail-fast
    /// `PredictAsync`. The token is then held on the `Pending` record for the
    /// prediction's full lifetime, not released when this call returns.
    pub async fn predict(
        self: &Arc<Self>,
        request: PredictionRequest,
    ) -> Result<PredictionResponse, ManagerError> {
        let permit = tokio::time::timeout(
            CAPACITY_WAIT_DEADLINE,
            self.capacity.clone().acquire_owned(),
        )
        .await
        .map_err(|_| ManagerError::AtCapacity)?
        .map_err(|_| ManagerError::AtCapacity)?;

        let url = Self::procedure_source_url(&request);
        let runner = self.assign_runner(url.as_deref()).await?;
        self.await_setup_gate(&runner).await?;
        let (pending, handle) = runner.predict(request).await?;
        pending.set_capacity_permit(permit).await;

        match pending.wait_for_terminal().await {
            Some(response) => Ok(response),
            None => Ok(handle.await.unwrap_or_else(|e| {
                error!(error = %e, "runner watcher task panicked");
                panic!("runner watcher task panicked: {e}")
            })),
        }
    }

    /// Submits a prediction and returns immediately with its starting
    /// response; the caller is expected to rely on webhooks for progress.
    /// Capacity is reserved fail-fast (no blocking wait) and the token is
    /// held on the `Pending` record until its result channel is drained,
    /// just like the sync path.
    pub async fn predict_async(
        self: &Arc<Self>,
        request: PredictionRequest,
    ) -> Result<PredictionResponse, ManagerError> {
        let permit = self
            .capacity
            .clone()
            .try_acquire_owned()
            .map_err(|_| ManagerError::AtCapacity)?;

        let url = Self::procedure_source_url(&request);
        let runner = self.assign_runner(url.as_deref()).await?;
        let (pending, _handle) = runner.predict(request).await?;
        pending.set_capacity_permit(permit).await;
        let starting = pending.current_response().await;

        Ok(starting)
    }

    /// Waits, up to [`SETUP_GATE_DEADLINE`], for `runner` to leave `Starting`.
    /// Used only by the blocking sync `Predict` path; `PredictAsync` accepts
    /// a `Starting` runner (per the spec's looser async admission rule) and
    /// lets `Runner::predict` itself reject anything not yet ready.
    async fn await_setup_gate(&self, runner: &Arc<Runner>) -> Result<(), ManagerError> {
        let deadline = tokio::time::Instant::now() + SETUP_GATE_DEADLINE;
        loop {
            let status = runner.status().await;
            if status != Health::Starting && status != Health::Unknown {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ManagerError::Runner(RunnerError::SetupTimeout(
                    SETUP_GATE_DEADLINE,
                )));
            }
            tokio::time::sleep(SETUP_GATE_POLL_INTERVAL).await;
        }
    }

    pub async fn cancel_prediction(&self, prediction_id: &str) -> bool {
        let slots = self.slots.read().await;
        for slot in slots.iter() {
            if let Some(runner) = &slot.runner {
                if runner.contains_prediction(prediction_id) {
                    runner.cancel(prediction_id);
                    return true;
                }
            }
        }
        false
    }

    pub async fn handle_runner_ipc(&self, ping: StatusPing) {
        let slots = self.slots.read().await;
        let runner = slots
            .iter()
            .filter_map(|s| s.runner.as_ref())
            .find(|r| r.id == ping.name);
        match runner {
            Some(runner) => self.apply_status_ping(runner, &ping.status).await,
            None => warn!(runner_name = %ping.name, pid = ping.pid, "ipc ping from unknown runner"),
        }
    }

    /// Applies a `READY`/`BUSY`/`OUTPUT` status word to one runner, whether it
    /// arrived over `/_ipc` or (legacy compatibility) as a bare signal.
    /// `OUTPUT` is a pure liveness marker and drives no state transition.
    async fn apply_status_ping(&self, runner: &Arc<Runner>, status: &str) {
        match status {
            "READY" => runner.set_status(Health::Ready).await,
            "BUSY" => runner.set_status(Health::Busy).await,
            "OUTPUT" => runner.broadcast_output_notify(),
            other => warn!(runner_name = %runner.id, status = other, "unrecognized ipc status"),
        }
    }

    /// Legacy signal compatibility (spec: SIGHUP/SIGUSR1/SIGUSR2 as aliases
    /// for READY/BUSY/OUTPUT). POSIX signals carry no payload identifying
    /// which runner sent them, so — unlike the `/_ipc` path, which names the
    /// runner explicitly — this applies the transition to every runner
    /// currently short of terminal state. In single-runner model mode this
    /// is exact; in a multi-runner fleet it is best-effort, which is why the
    /// spec marks signal support as optional legacy compatibility rather
    /// than the primary protocol.
    #[cfg(unix)]
    pub async fn watch_legacy_signals(self: Arc<Self>) {
        use tokio::signal::unix::{signal, SignalKind};

        let Ok(mut hup) = signal(SignalKind::hangup()) else {
            return;
        };
        let Ok(mut usr1) = signal(SignalKind::user_defined1()) else {
            return;
        };
        let Ok(mut usr2) = signal(SignalKind::user_defined2()) else {
            return;
        };

        loop {
            let status = tokio::select! {
                _ = hup.recv() => "OUTPUT",
                _ = usr1.recv() => "READY",
                _ = usr2.recv() => "BUSY",
            };
            let slots = self.slots.read().await;
            for runner in slots.iter().filter_map(|s| s.runner.as_ref()) {
                if runner.status().await != Health::Defunct {
                    self.apply_status_ping(runner, status).await;
                }
            }
        }
    }

    pub async fn health(&self) -> HealthSnapshot {
        let slots = self.slots.read().await;
        let total_slots = slots.len() as u32;
        let mut any_ready = false;
        let mut any_defunct = false;
        let mut any_started = false;

        for slot in slots.iter() {
            if let Some(runner) = &slot.runner {
                any_started = true;
                match runner.status().await {
                    Health::Ready => any_ready = true,
                    Health::Defunct => any_defunct = true,
                    Health::Busy => any_ready = true,
                    _ => {}
                }
            }
        }

        let available = self.capacity.available_permits() as u32;
        let status = if any_defunct && !any_ready {
            HealthResponse::Defunct
        } else if !any_started {
            HealthResponse::Unknown
        } else if available == 0 {
            HealthResponse::Busy
        } else if any_ready {
            HealthResponse::Ready
        } else {
            HealthResponse::Starting
        };

        HealthSnapshot {
            status,
            available_slots: available,
            total_slots,
            cleanup_in_progress: self.cleanup_in_progress.load(Ordering::SeqCst),
        }
    }

    pub async fn schema(&self) -> Option<serde_json::Value> {
        let slots = self.slots.read().await;
        slots.first().and_then(|s| s.runner.clone())?.schema().await
    }

    pub async fn setup_result(&self) -> Option<crate::health::SetupResult> {
        let slots = self.slots.read().await;
        let runner = slots.first().and_then(|s| s.runner.clone())?;
        runner.setup_result().await
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Stops every runner gracefully, waiting for in-flight predictions to
    /// drain. Marks `cleanup_in_progress` for the duration (health-surface
    /// only; never gates new admission, per the OneShot+procedure mode
    /// decision in DESIGN.md).
    pub async fn stop(self: &Arc<Self>) {
        self.cleanup_in_progress.store(true, Ordering::SeqCst);
        let runners: Vec<Arc<Runner>> = {
            let slots = self.slots.read().await;
            slots.iter().filter_map(|s| s.runner.clone()).collect()
        };
        for runner in runners {
            runner.graceful_shutdown().await;
        }
        self.cleanup_in_progress.store(false, Ordering::SeqCst);
        info!("all runners stopped");
    }

    pub async fn force_kill_all(self: &Arc<Self>) {
        let runners: Vec<Arc<Runner>> = {
            let slots = self.slots.read().await;
            slots.iter().filter_map(|s| s.runner.clone()).collect()
        };
        for runner in runners {
            runner.stop().await;
        }
    }

    /// Periodically checks every occupied slot for a worker that has
    /// exited without going through normal shutdown, failing its pending
    /// predictions and freeing the slot.
    pub async fn monitor_crashes(self: Arc<Self>) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            interval.tick().await;
            let mut slots = self.slots.write().await;
            for slot in slots.iter_mut() {
                let Some(runner) = &slot.runner else { continue };
                if runner.is_shutting_down() {
                    continue;
                }
                if runner.has_exited().await.is_some() {
                    warn!(runner_id = %runner.id, "runner process exited unexpectedly");
                    let message = if runner.status().await == Health::Starting {
                        "setup failed"
                    } else {
                        "prediction failed"
                    };
                    runner.fail_all_pending(message).await;
                    runner.set_status(Health::Defunct).await;
                    if self.config.mode == Mode::Procedure {
                        slot.runner = None;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Cli, Mode};

    fn test_config(mode: Mode) -> Config {
        let cli = Cli {
            mode,
            host: "0.0.0.0".into(),
            port: 5000,
            max_runners: Some(2),
            max_concurrency: Some(2),
            one_shot: false,
            await_explicit_shutdown: false,
            working_dir_root: None,
            tmp_dir: None,
            uid_isolation: false,
            wait_file: None,
        };
        Config::resolve(cli, None).unwrap()
    }

    #[tokio::test]
    async fn health_is_unknown_before_any_runner_starts() {
        let manager = Manager::new(test_config(Mode::Procedure));
        let health = manager.health().await;
        assert_eq!(health.status, HealthResponse::Unknown);
        assert_eq!(health.total_slots, 2);
    }

    #[tokio::test]
    async fn cancel_on_unknown_prediction_returns_false() {
        let manager = Manager::new(test_config(Mode::Procedure));
        assert!(!manager.cancel_prediction("nope").await);
    }

    #[tokio::test]
    async fn cleanup_in_progress_defaults_false() {
        let manager = Manager::new(test_config(Mode::Procedure));
        assert!(!manager.health().await.cleanup_in_progress);
    }
}
