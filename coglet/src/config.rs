//! Configuration: compiled defaults, overridden by environment variables,
//! overridden by CLI flags.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Serving mode: a single pinned model, or an on-demand fleet of procedure
/// workers addressed by source URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    Model,
    Procedure,
}

/// Resolved manifest details for single-model mode, read from the model's
/// own manifest by a collaborator out of this crate's scope; coglet only
/// needs the concurrency ceiling it declares.
#[derive(Debug, Clone)]
pub struct ManifestConfig {
    pub max_concurrency: u32,
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self { max_concurrency: 1 }
    }
}

#[derive(Debug, Parser)]
#[command(name = "coglet", version, about = "Prediction-serving supervisor for Cog models")]
pub struct Cli {
    /// Serving mode.
    #[arg(long, env = "COG_MODE", value_enum, default_value = "model")]
    pub mode: Mode,

    /// HTTP bind host.
    #[arg(long, env = "COG_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// HTTP bind port.
    #[arg(long, env = "COG_PORT", default_value_t = 5000)]
    pub port: u16,

    /// Maximum number of runner slots. Defaults: 1 for model mode, number of
    /// CPUs * 4 for procedure mode. OneShot always clamps this to 1.
    #[arg(long, env = "COG_MAX_RUNNERS")]
    pub max_runners: Option<u32>,

    /// Fleet-wide concurrent-prediction admission budget. Defaults to the
    /// manifest's concurrency in model mode, or max_runners in procedure
    /// mode.
    #[arg(long, env = "COG_MAX_CONCURRENCY")]
    pub max_concurrency: Option<u32>,

    /// Serve exactly one prediction/procedure then shut down.
    #[arg(long, env = "COG_ONE_SHOT", default_value_t = false)]
    pub one_shot: bool,

    /// Ignore SIGTERM; wait for SIGINT or an explicit /shutdown call. Used
    /// under Kubernetes to allow graceful draining.
    #[arg(long, env = "COG_AWAIT_EXPLICIT_SHUTDOWN", default_value_t = false)]
    pub await_explicit_shutdown: bool,

    /// Root directory under which runner working directories are created.
    #[arg(long, env = "COG_WORKING_DIR_ROOT")]
    pub working_dir_root: Option<PathBuf>,

    /// Override TMPDIR for worker processes and temp input materialization.
    #[arg(long, env = "TMPDIR")]
    pub tmp_dir: Option<PathBuf>,

    /// Allocate UID >= 9000 per runner and chown its working directory.
    /// Best-effort: only applied when running as root inside a container.
    #[arg(long, env = "COG_UID_ISOLATION", default_value_t = false)]
    pub uid_isolation: bool,

    /// File whose presence gates readiness (used by some orchestration
    /// layers to delay traffic until external setup finishes).
    #[arg(long, env = "COG_WAIT_FILE")]
    pub wait_file: Option<PathBuf>,
}

/// Fully resolved runtime configuration, derived from [`Cli`] plus the
/// manifest (model mode only) and environment probing (container
/// detection).
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub host: String,
    pub port: u16,
    pub max_runners: u32,
    pub max_concurrency: u32,
    pub one_shot: bool,
    pub await_explicit_shutdown: bool,
    pub working_dir_root: PathBuf,
    pub tmp_dir: PathBuf,
    pub uid_isolation: bool,
    pub wait_file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("max_runners must be at least 1")]
    ZeroRunners,
    #[error("max_concurrency must be at least 1")]
    ZeroConcurrency,
}

impl Config {
    pub fn resolve(cli: Cli, manifest: Option<&ManifestConfig>) -> Result<Self, ConfigError> {
        let default_max_runners = match cli.mode {
            Mode::Model => 1,
            Mode::Procedure => num_cpus() * 4,
        };
        let mut max_runners = cli.max_runners.unwrap_or(default_max_runners);

        if cli.one_shot {
            max_runners = 1;
        }
        if max_runners == 0 {
            return Err(ConfigError::ZeroRunners);
        }

        let default_max_concurrency = match cli.mode {
            Mode::Model => manifest.map(|m| m.max_concurrency).unwrap_or(1),
            Mode::Procedure => max_runners,
        };
        let max_concurrency = cli.max_concurrency.unwrap_or(default_max_concurrency);
        if max_concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }

        Ok(Self {
            mode: cli.mode,
            host: cli.host,
            port: cli.port,
            max_runners,
            max_concurrency,
            one_shot: cli.one_shot,
            await_explicit_shutdown: cli.await_explicit_shutdown,
            working_dir_root: cli
                .working_dir_root
                .unwrap_or_else(|| std::env::temp_dir().join("coglet")),
            tmp_dir: cli.tmp_dir.unwrap_or_else(std::env::temp_dir),
            uid_isolation: cli.uid_isolation,
            wait_file: cli.wait_file,
        })
    }
}

fn num_cpus() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

/// Best-effort detection of whether we're running inside a container,
/// consulted by UID isolation and by readiness-file writing.
pub fn running_in_container() -> bool {
    std::path::Path::new("/.dockerenv").exists() || std::env::var("KUBERNETES_SERVICE_HOST").is_ok()
}
