//! coglet: prediction-serving supervisor for Cog models.
//!
//! Spawns and supervises one or more `python3 -u -m coglet` worker
//! subprocesses, exposing predictions and procedures over HTTP while the
//! workers themselves communicate with their supervising [`Runner`] over a
//! small file-based protocol.

pub mod config;
pub mod health;
pub mod id;
pub mod ipc;
pub mod manager;
pub mod path_handler;
pub mod pending;
pub mod prediction;
pub mod procedure;
pub mod runner;
pub mod transport;
pub mod version;
pub mod webhook;

pub use config::{Cli, Config, Mode};
pub use health::{Health, HealthResponse, SetupResult, SetupStatus};
pub use manager::{HealthSnapshot, Manager, ManagerError};
pub use prediction::{
    MetricMode, PredictionOutput, PredictionRequest, PredictionResponse, PredictionStatus,
    WebhookEventType,
};
pub use runner::{Runner, RunnerConfig, RunnerError};
pub use version::{VersionInfo, COGLET_VERSION};
