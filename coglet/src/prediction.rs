//! Prediction request/response data model and metric accumulation.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::ipc::PredictionContext;

/// Lifecycle status of a prediction, mirrored 1:1 in the wire response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionStatus {
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

impl PredictionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PredictionStatus::Succeeded | PredictionStatus::Failed | PredictionStatus::Canceled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PredictionStatus::Starting => "starting",
            PredictionStatus::Processing => "processing",
            PredictionStatus::Succeeded => "succeeded",
            PredictionStatus::Failed => "failed",
            PredictionStatus::Canceled => "canceled",
        }
    }
}

/// A prediction's output: either a single JSON value, or (for iterator-style
/// predictors) a stream of values accumulated over the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PredictionOutput {
    Single(Value),
    Stream(Vec<Value>),
}

impl PredictionOutput {
    pub fn is_stream(&self) -> bool {
        matches!(self, PredictionOutput::Stream(_))
    }

    pub fn into_values(self) -> Vec<Value> {
        match self {
            PredictionOutput::Single(v) => vec![v],
            PredictionOutput::Stream(vs) => vs,
        }
    }

    /// The value to report as `output` in a terminal response: the single
    /// value, or the full accumulated array for a stream.
    pub fn final_value(&self) -> Value {
        match self {
            PredictionOutput::Single(v) => v.clone(),
            PredictionOutput::Stream(vs) => Value::Array(vs.clone()),
        }
    }
}

/// Events a webhook subscriber can filter on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookEventType {
    Start,
    Output,
    Logs,
    Completed,
}

impl WebhookEventType {
    pub fn is_terminal(self) -> bool {
        matches!(self, WebhookEventType::Completed)
    }

    pub fn all() -> Vec<WebhookEventType> {
        vec![
            WebhookEventType::Start,
            WebhookEventType::Output,
            WebhookEventType::Logs,
            WebhookEventType::Completed,
        ]
    }
}

fn default_input(input: Option<Value>) -> Value {
    input.unwrap_or_else(|| Value::Object(Default::default()))
}

fn deserialize_input<'de, D>(deserializer: D) -> Result<Value, D::Error>
where
    D: Deserializer<'de>,
{
    let opt = Option::<Value>::deserialize(deserializer)?;
    Ok(default_input(opt))
}

fn default_webhook_events_filter() -> Vec<WebhookEventType> {
    WebhookEventType::all()
}

/// Inbound prediction/procedure creation payload (`POST /predictions`,
/// `POST /procedures`, and their idempotent `PUT .../{id}` forms).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_input")]
    pub input: Value,
    #[serde(default)]
    pub webhook: Option<String>,
    #[serde(default = "default_webhook_events_filter")]
    pub webhook_events_filter: Vec<WebhookEventType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<PredictionContext>,
    /// Per-request prefix to PUT file-shaped outputs to instead of inlining
    /// them as `data:` URLs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file_prefix: Option<String>,
}

/// Log lines, serialized externally as a single newline-joined string with
/// a trailing newline when non-empty (matching the worker's own line
/// buffering convention).
#[derive(Debug, Clone, Default)]
pub struct LogLines(pub Vec<String>);

impl Serialize for LogLines {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.0.is_empty() {
            serializer.serialize_str("")
        } else {
            let mut joined = self.0.join("\n");
            joined.push('\n');
            serializer.serialize_str(&joined)
        }
    }
}

impl<'de> Deserialize<'de> for LogLines {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            Ok(LogLines(Vec::new()))
        } else {
            Ok(LogLines(s.trim_end_matches('\n').split('\n').map(String::from).collect()))
        }
    }
}

impl LogLines {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Outbound prediction/procedure response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub id: String,
    pub status: PredictionStatus,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "LogLines::is_empty")]
    pub logs: LogLines,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metrics: HashMap<String, Value>,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

/// How a metric update at a dot-path key should be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricMode {
    /// Overwrite the value at the path; a `null` value deletes the key.
    Replace,
    /// Numerically add to the existing value, preserving its numeric type
    /// (i64/u64/f64); treats a missing key as zero.
    Increment,
    /// Push onto an array at the path, creating one if absent, wrapping an
    /// existing non-array scalar as the first element.
    Append,
}

/// Applies a metric update at `path` (dot-separated, e.g. `"timing.setup"`)
/// to `metrics`, creating intermediate nested objects as needed.
pub fn set_metric_dotpath(
    metrics: &mut HashMap<String, Value>,
    path: &str,
    value: Value,
    mode: MetricMode,
) {
    let mut parts = path.split('.');
    let Some(first) = parts.next() else { return };
    let rest: Vec<&str> = parts.collect();

    if rest.is_empty() {
        let slot = metrics.entry(first.to_string()).or_insert(Value::Null);
        apply_mode(slot, value, mode);
        if mode == MetricMode::Replace && slot.is_null() {
            metrics.remove(first);
        }
        return;
    }

    let entry = metrics
        .entry(first.to_string())
        .or_insert_with(|| Value::Object(Default::default()));
    if !entry.is_object() {
        *entry = Value::Object(Default::default());
    }
    let obj = entry.as_object_mut().expect("just ensured object");
    set_metric_dotpath_value(obj, &rest, value, mode);
}

fn set_metric_dotpath_value(
    obj: &mut serde_json::Map<String, Value>,
    path: &[&str],
    value: Value,
    mode: MetricMode,
) {
    let (head, rest) = match path.split_first() {
        Some(x) => x,
        None => return,
    };
    if rest.is_empty() {
        let slot = obj.entry(head.to_string()).or_insert(Value::Null);
        apply_mode(slot, value, mode);
        if mode == MetricMode::Replace && slot.is_null() {
            obj.remove(*head);
        }
        return;
    }
    let entry = obj
        .entry(head.to_string())
        .or_insert_with(|| Value::Object(Default::default()));
    if !entry.is_object() {
        *entry = Value::Object(Default::default());
    }
    set_metric_dotpath_value(entry.as_object_mut().expect("just ensured object"), rest, value, mode);
}

fn apply_mode(slot: &mut Value, value: Value, mode: MetricMode) {
    match mode {
        MetricMode::Replace => {
            *slot = value;
        }
        MetricMode::Increment => {
            *slot = increment(slot, &value);
        }
        MetricMode::Append => {
            if !slot.is_array() {
                let existing = std::mem::replace(slot, Value::Null);
                *slot = if existing.is_null() {
                    Value::Array(Vec::new())
                } else {
                    Value::Array(vec![existing])
                };
            }
            if let Value::Array(arr) = slot {
                arr.push(value);
            }
        }
    }
}

fn increment(existing: &Value, delta: &Value) -> Value {
    match (existing, delta) {
        (Value::Null, d) => d.clone(),
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
                Value::from(a + b)
            } else if let (Some(a), Some(b)) = (a.as_u64(), b.as_u64()) {
                Value::from(a + b)
            } else {
                Value::from(a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0))
            }
        }
        (_, d) => d.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_terminal() {
        assert!(PredictionStatus::Succeeded.is_terminal());
        assert!(PredictionStatus::Failed.is_terminal());
        assert!(PredictionStatus::Canceled.is_terminal());
        assert!(!PredictionStatus::Starting.is_terminal());
        assert!(!PredictionStatus::Processing.is_terminal());
    }

    #[test]
    fn input_defaults_to_empty_object() {
        let req: PredictionRequest = serde_json::from_str(r#"{"input": null}"#).unwrap();
        assert_eq!(req.input, Value::Object(Default::default()));
        let req: PredictionRequest = serde_json::from_str(r#"{}"#).unwrap();
        assert_eq!(req.input, Value::Object(Default::default()));
    }

    #[test]
    fn webhook_events_filter_defaults_to_all() {
        let req: PredictionRequest = serde_json::from_str(r#"{}"#).unwrap();
        assert_eq!(req.webhook_events_filter.len(), 4);
    }

    #[test]
    fn log_lines_join_with_trailing_newline() {
        let logs = LogLines(vec!["a".into(), "b".into()]);
        let json = serde_json::to_value(&logs).unwrap();
        assert_eq!(json, Value::String("a\nb\n".to_string()));
    }

    #[test]
    fn log_lines_empty_serializes_to_empty_string() {
        let logs = LogLines::default();
        let json = serde_json::to_value(&logs).unwrap();
        assert_eq!(json, Value::String(String::new()));
    }

    #[test]
    fn response_omits_logs_field_when_empty() {
        let response = PredictionResponse {
            id: "p1".into(),
            status: PredictionStatus::Succeeded,
            input: Value::Object(Default::default()),
            output: Some(Value::from(1)),
            error: None,
            logs: LogLines::default(),
            metrics: HashMap::new(),
            started_at: "now".into(),
            completed_at: Some("now".into()),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert!(!json.as_object().unwrap().contains_key("logs"));
    }

    #[test]
    fn metric_replace_sets_value() {
        let mut metrics = HashMap::new();
        set_metric_dotpath(&mut metrics, "predict_time", Value::from(1.5), MetricMode::Replace);
        assert_eq!(metrics["predict_time"], Value::from(1.5));
    }

    #[test]
    fn metric_replace_null_deletes() {
        let mut metrics = HashMap::new();
        metrics.insert("x".to_string(), Value::from(1));
        set_metric_dotpath(&mut metrics, "x", Value::Null, MetricMode::Replace);
        assert!(!metrics.contains_key("x"));
    }

    #[test]
    fn metric_increment_preserves_integer_type() {
        let mut metrics = HashMap::new();
        set_metric_dotpath(&mut metrics, "count", Value::from(1), MetricMode::Increment);
        set_metric_dotpath(&mut metrics, "count", Value::from(2), MetricMode::Increment);
        assert_eq!(metrics["count"], Value::from(3));
        assert!(metrics["count"].is_i64());
    }

    #[test]
    fn metric_append_wraps_existing_scalar() {
        let mut metrics = HashMap::new();
        set_metric_dotpath(&mut metrics, "events", Value::from("a"), MetricMode::Replace);
        set_metric_dotpath(&mut metrics, "events", Value::from("b"), MetricMode::Append);
        assert_eq!(metrics["events"], serde_json::json!(["a", "b"]));
    }

    #[test]
    fn metric_dotpath_nests_objects() {
        let mut metrics = HashMap::new();
        set_metric_dotpath(&mut metrics, "timing.preprocess", Value::from(0.2), MetricMode::Replace);
        set_metric_dotpath(&mut metrics, "timing.predict", Value::from(1.1), MetricMode::Replace);
        assert_eq!(metrics["timing"]["preprocess"], Value::from(0.2));
        assert_eq!(metrics["timing"]["predict"], Value::from(1.1));
    }

    #[test]
    fn output_final_value_wraps_stream() {
        let out = PredictionOutput::Stream(vec![Value::from(1), Value::from(2)]);
        assert_eq!(out.final_value(), serde_json::json!([1, 2]));
        assert!(out.is_stream());
    }
}
