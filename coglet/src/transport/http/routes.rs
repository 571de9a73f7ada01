//! HTTP route handlers: the supervisor's external surface.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post, put},
    Router,
};
use serde::Serialize;
use serde_json::{json, Value};

use crate::health::{HealthResponse, SetupResult};
use crate::ipc::StatusPing;
use crate::manager::{Manager, ManagerError};
use crate::prediction::PredictionRequest;
use crate::version::VersionInfo;
use crate::webhook::TraceContext;

#[derive(Debug, Serialize)]
pub struct HealthCheckResponse {
    pub status: HealthResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup: Option<SetupResult>,
    pub version: VersionInfo,
}

fn admission_error(code: StatusCode, message: impl Into<String>) -> axum::response::Response {
    (code, Json(json!({"error": message.into()}))).into_response()
}

/// Validates the request shape common to both predictions and procedures:
/// content type, path/body id agreement, and (for procedures) a non-empty
/// procedure context.
fn validate_admission(
    headers: &HeaderMap,
    path_id: Option<&str>,
    request: &PredictionRequest,
    require_procedure_context: bool,
) -> Result<(), axum::response::Response> {
    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type.is_empty() && !content_type.starts_with("application/json") {
        return Err(admission_error(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Content-Type must be application/json",
        ));
    }

    if !request.input.is_object() {
        return Err(admission_error(StatusCode::BAD_REQUEST, "input must be a JSON object"));
    }

    if let Some(path_id) = path_id {
        if let Some(body_id) = &request.id {
            if body_id != path_id {
                return Err(admission_error(
                    StatusCode::CONFLICT,
                    "id in request body does not match id in URL",
                ));
            }
        }
    }

    if require_procedure_context {
        let ctx = request.context.as_ref();
        let source_ok = ctx
            .and_then(|c| c.procedure_source_url.as_deref())
            .map(|s| !s.is_empty())
            .unwrap_or(false);
        let token_ok = ctx
            .and_then(|c| c.replicate_api_token.as_deref())
            .map(|s| !s.is_empty())
            .unwrap_or(false);
        if !source_ok || !token_ok {
            return Err(admission_error(
                StatusCode::BAD_REQUEST,
                "procedure requests require a non-empty context.procedure_source_url and context.replicate_api_token",
            ));
        }
    }

    Ok(())
}

fn should_respond_async(headers: &HeaderMap) -> bool {
    headers
        .get("Prefer")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("respond-async"))
        .unwrap_or(false)
}

fn extract_trace_context(headers: &HeaderMap) -> TraceContext {
    TraceContext {
        traceparent: headers
            .get("traceparent")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        tracestate: headers
            .get("tracestate")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    }
}

async fn root() -> impl IntoResponse {
    Json(json!({"docs_url": "/docs", "openapi_url": "/openapi.json"}))
}

async fn health_check(State(manager): State<Arc<Manager>>) -> impl IntoResponse {
    let snapshot = manager.health().await;
    let setup = manager.setup_result().await;

    if manager.config().wait_file.is_none() || snapshot.status == HealthResponse::Ready {
        write_readiness_file(&snapshot);
    }

    Json(HealthCheckResponse {
        status: snapshot.status,
        setup,
        version: VersionInfo::new(),
    })
}

fn write_readiness_file(snapshot: &crate::manager::HealthSnapshot) {
    if snapshot.status != HealthResponse::Ready {
        return;
    }
    if !crate::config::running_in_container() {
        return;
    }
    let dir = std::path::Path::new("/var/run/cog");
    if let Err(e) = std::fs::create_dir_all(dir) {
        tracing::warn!(error = %e, "failed to create readiness directory");
        return;
    }
    let path = dir.join("ready");
    if let Err(e) = std::fs::write(&path, b"") {
        tracing::warn!(error = %e, "failed to write readiness file");
        return;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600));
    }
}

async fn openapi_schema(State(manager): State<Arc<Manager>>) -> impl IntoResponse {
    match manager.schema().await {
        Some(schema) => Json(schema).into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "OpenAPI schema not available"})),
        )
            .into_response(),
    }
}

async fn shutdown(State(manager): State<Arc<Manager>>) -> impl IntoResponse {
    manager.trigger_shutdown();
    StatusCode::OK
}

async fn create_prediction(
    State(manager): State<Arc<Manager>>,
    headers: HeaderMap,
    Json(request): Json<PredictionRequest>,
) -> axum::response::Response {
    create_prediction_with_id(manager, headers, None, request, false).await
}

async fn create_prediction_idempotent(
    State(manager): State<Arc<Manager>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<PredictionRequest>,
) -> axum::response::Response {
    create_prediction_with_id(manager, headers, Some(id), request, false).await
}

async fn create_procedure(
    State(manager): State<Arc<Manager>>,
    headers: HeaderMap,
    Json(request): Json<PredictionRequest>,
) -> axum::response::Response {
    create_prediction_with_id(manager, headers, None, request, true).await
}

async fn create_procedure_idempotent(
    State(manager): State<Arc<Manager>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<PredictionRequest>,
) -> axum::response::Response {
    create_prediction_with_id(manager, headers, Some(id), request, true).await
}

async fn create_prediction_with_id(
    manager: Arc<Manager>,
    headers: HeaderMap,
    path_id: Option<String>,
    mut request: PredictionRequest,
    is_procedure: bool,
) -> axum::response::Response {
    if let Err(resp) = validate_admission(&headers, path_id.as_deref(), &request, is_procedure) {
        return resp;
    }

    let id = path_id.or_else(|| request.id.clone()).unwrap_or_else(crate::id::generate);
    request.id = Some(id.clone());

    let _trace_context = extract_trace_context(&headers);

    let result = if should_respond_async(&headers) {
        manager.predict_async(request).await
    } else {
        manager.predict(request).await
    };

    match result {
        Ok(response) => {
            let code = if response.status.is_terminal() || response.status == crate::prediction::PredictionStatus::Processing {
                StatusCode::OK
            } else {
                StatusCode::ACCEPTED
            };
            (code, Json(response)).into_response()
        }
        Err(ManagerError::AtCapacity) => admission_error(StatusCode::CONFLICT, "at capacity"),
        Err(ManagerError::Runner(crate::runner::RunnerError::NotReady(_))) => {
            admission_error(StatusCode::SERVICE_UNAVAILABLE, "not ready")
        }
        Err(e) => {
            tracing::error!(error = %e, "prediction failed");
            admission_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn cancel_prediction(
    State(manager): State<Arc<Manager>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if manager.cancel_prediction(&id).await {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn handle_ipc(
    State(manager): State<Arc<Manager>>,
    Json(ping): Json<StatusPing>,
) -> impl IntoResponse {
    manager.handle_runner_ipc(ping).await;
    StatusCode::OK
}

pub fn routes(manager: Arc<Manager>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health-check", get(health_check))
        .route("/openapi.json", get(openapi_schema))
        .route("/shutdown", post(shutdown))
        .route("/predictions", post(create_prediction))
        .route("/predictions/{id}", put(create_prediction_idempotent))
        .route("/predictions/{id}/cancel", post(cancel_prediction))
        .route("/procedures", post(create_procedure))
        .route("/procedures/{id}", put(create_procedure_idempotent))
        .route("/procedures/{id}/cancel", post(cancel_prediction))
        .route("/_ipc", post(handle_ipc))
        .with_state(manager)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Cli, Config, Mode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_config() -> Config {
        let cli = Cli {
            mode: Mode::Model,
            host: "0.0.0.0".into(),
            port: 5000,
            max_runners: Some(1),
            max_concurrency: Some(1),
            one_shot: false,
            await_explicit_shutdown: false,
            working_dir_root: None,
            tmp_dir: None,
            uid_isolation: false,
            wait_file: None,
        };
        Config::resolve(cli, None).unwrap()
    }

    async fn response_json(response: axum::response::Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_check_unknown_before_start() {
        let manager = Manager::new(test_config());
        let app = routes(manager);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health-check")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response_json(response).await;
        assert_eq!(body["status"], "UNKNOWN");
    }

    #[tokio::test]
    async fn openapi_unavailable_before_setup() {
        let manager = Manager::new(test_config());
        let app = routes(manager);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/openapi.json")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn create_prediction_rejects_non_object_input() {
        let manager = Manager::new(test_config());
        let app = routes(manager);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/predictions")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(r#"{"input": "not-an-object"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn create_prediction_rejects_bad_content_type() {
        let manager = Manager::new(test_config());
        let app = routes(manager);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/predictions")
                    .header("content-type", "text/plain")
                    .body(axum::body::Body::from(r#"{}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn create_prediction_returns_at_capacity_when_not_started() {
        // With no runner started and no slot startable synchronously inside
        // this handler path (model mode requires `start()` first), the
        // manager reports NotReady from the runner path once a slot exists;
        // prior to any slot, assignment itself fails at capacity.
        let manager = Manager::new(test_config());
        let app = routes(manager);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/predictions")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(r#"{"input": {}}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert!(response.status().is_client_error() || response.status().is_server_error());
    }

    #[tokio::test]
    async fn create_procedure_without_context_is_rejected() {
        let manager = Manager::new(test_config());
        let app = routes(manager);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/procedures")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(r#"{"input": {}}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn cancel_unknown_prediction_is_404() {
        let manager = Manager::new(test_config());
        let app = routes(manager);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/predictions/does-not-exist/cancel")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn shutdown_returns_ok() {
        let manager = Manager::new(test_config());
        let app = routes(manager);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/shutdown")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }
}
