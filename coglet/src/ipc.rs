//! File-based IPC between a [`crate::runner::Runner`] and the worker
//! subprocess it manages.
//!
//! The worker is an external black box (a `python3 -u -m coglet` process);
//! all communication with it happens through files in the runner's working
//! directory plus a single HTTP status ping the worker makes back to the
//! manager. This module owns the file naming convention, the wire types
//! written to/read from those files, and small helpers for writing them
//! atomically (write to a temp name, then rename, so a reader never
//! observes a partially written file).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

/// File layout rooted at a runner's working directory.
#[derive(Debug, Clone)]
pub struct IpcPaths {
    root: PathBuf,
}

impl IpcPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn openapi(&self) -> PathBuf {
        self.root.join("openapi.json")
    }

    pub fn setup_result(&self) -> PathBuf {
        self.root.join("setup_result.json")
    }

    pub fn request(&self, prediction_id: &str) -> PathBuf {
        self.root.join(format!("request-{prediction_id}.json"))
    }

    pub fn cancel(&self, prediction_id: &str) -> PathBuf {
        self.root.join(format!("cancel-{prediction_id}"))
    }

    /// Response file for one update. `epoch` must increase for every update
    /// to the same prediction so the runner's directory listing naturally
    /// orders updates oldest-first.
    pub fn response(&self, prediction_id: &str, epoch: u64) -> PathBuf {
        self.root
            .join(format!("response-{prediction_id}-{epoch:020}.json"))
    }

    /// Lists pending response files for `prediction_id`, oldest epoch first.
    pub fn list_responses(&self, prediction_id: &str) -> std::io::Result<Vec<PathBuf>> {
        let prefix = format!("response-{prediction_id}-");
        let mut matches = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(&prefix) && name.ends_with(".json") {
                matches.push(entry.path());
            }
        }
        matches.sort();
        Ok(matches)
    }
}

/// Worker startup configuration, written to `config.json` before the
/// worker process is spawned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    pub name: String,
    pub ipc_dir: PathBuf,
    pub working_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub max_concurrency: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub procedure_source_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicate_api_token: Option<String>,
}

/// Optional per-prediction procedure context, carried on the request so a
/// procedure-mode worker knows which source/token a given call applies to.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PredictionContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub procedure_source_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicate_api_token: Option<String>,
}

/// Written to `request-<id>.json` to start a prediction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFile {
    pub id: String,
    pub input: Value,
    #[serde(default, skip_serializing_if = "is_default_context")]
    pub context: PredictionContext,
}

fn is_default_context(ctx: &PredictionContext) -> bool {
    ctx.procedure_source_url.is_none() && ctx.replicate_api_token.is_none()
}

/// Worker-reported prediction state, mirrored in every `response-<id>-*`
/// file. Log lines are not carried here: the runner captures the worker's
/// stdout/stderr directly and attributes lines by PID prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResponseFile {
    Processing,
    Succeeded {
        output: Value,
        #[serde(default, skip_serializing_if = "std::collections::HashMap::is_empty")]
        metrics: std::collections::HashMap<String, Value>,
    },
    Failed {
        error: String,
    },
    Canceled,
}

/// Heartbeat the worker process sends over HTTP to the manager's `/_ipc`
/// route, distinct from the file-based prediction protocol above.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusPing {
    pub name: String,
    pub pid: u32,
    pub status: String,
}

/// Writes `value` to `path` atomically: serialize to a sibling `.tmp` file,
/// then rename over the destination so a concurrent reader never observes
/// a half-written file.
pub fn write_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let bytes = serde_json::to_vec(value)?;
    trace!(path = %path.display(), json_size_bytes = bytes.len(), "writing ipc file");
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, &bytes)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Reads and deserializes `path`, returning `Ok(None)` if it doesn't exist
/// (a normal race against the writer, not an error).
pub fn read_if_exists<T: for<'de> Deserialize<'de>>(path: &Path) -> std::io::Result<Option<T>> {
    match std::fs::read(path) {
        Ok(bytes) => {
            trace!(path = %path.display(), json_size_bytes = bytes.len(), "read ipc file");
            Ok(Some(serde_json::from_slice(&bytes)?))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Which stream a captured worker log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    Stdout,
    Stderr,
}

/// Log line attribution, grounded on the spec's `[pid=<id>]` prefix
/// convention.
pub enum Attribution<'a> {
    Prediction { id: &'a str, message: &'a str },
    /// `[coglet]` internal worker lines, always runner-wide.
    Internal(&'a str),
    /// No/unknown prefix; runner-wide by the log-attribution decision in
    /// DESIGN.md.
    Ambiguous(&'a str),
}

/// Parses one line of worker output per the `[pid=<id>] <message>`
/// convention. `[coglet]`-prefixed lines are internal worker diagnostics.
pub fn attribute_log_line(line: &str) -> Attribution<'_> {
    if let Some(rest) = line.strip_prefix("[coglet]") {
        return Attribution::Internal(rest.trim_start());
    }
    if let Some(rest) = line.strip_prefix("[pid=") {
        if let Some(end) = rest.find(']') {
            let id = &rest[..end];
            let message = rest[end + 1..].trim_start();
            if !id.is_empty() {
                return Attribution::Prediction { id, message };
            }
        }
    }
    Attribution::Ambiguous(line)
}
