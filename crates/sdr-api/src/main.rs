use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use sdr_core::{
    AnswerOptions, Assistant, AssistantReply, ClassificationError, Config, ConfigLoader,
    FieldCoercionWarning, TelemetryOptions, ToolUsage, init_telemetry, log_request_completion,
    metrics::init_metrics_from_env, persist_trace,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::{
    net::TcpListener,
    signal,
    sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError},
};
use tracing::{info, warn};

const DEFAULT_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_MAX_REQUESTS: usize = 5;

#[derive(Clone)]
struct AppState {
    assistant: Arc<Assistant>,
    config: Arc<Config>,
    request_permits: Arc<Semaphore>,
    max_requests: usize,
}

impl AppState {
    fn new(config: Config, assistant: Assistant, max_requests: usize) -> Self {
        Self {
            assistant: Arc::new(assistant),
            config: Arc::new(config),
            request_permits: Arc::new(Semaphore::new(max_requests)),
            max_requests,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = ConfigLoader::load(None).context("failed to load configuration")?;
    init_telemetry(TelemetryOptions {
        default_level: Some(config.logging.level.clone()),
        with_ansi: false,
        ..TelemetryOptions::default()
    })?;
    init_metrics_from_env("sdr-api")?;

    let addr: SocketAddr = std::env::var("SDR_API_ADDR")
        .unwrap_or_else(|_| DEFAULT_ADDR.to_string())
        .parse()
        .context("invalid SDR_API_ADDR")?;

    let max_requests = std::env::var("SDR_API_MAX_CONCURRENT_REQUESTS")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|limit| *limit > 0)
        .unwrap_or(DEFAULT_MAX_REQUESTS);

    let assistant = Assistant::from_config(&config).context("failed to build assistant")?;
    let app = build_router(AppState::new(config, assistant, max_requests));

    info!(%addr, max_requests, "sales research API listening");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/query", post(handle_query))
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(%err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(%err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, stopping server");
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum ExplainFormat {
    #[default]
    Markdown,
    Mermaid,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<ClassificationError> for AppError {
    fn from(error: ClassificationError) -> Self {
        AppError::new(StatusCode::UNPROCESSABLE_ENTITY, error.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, AppError>;

fn acquire_request_permit(state: &AppState) -> ApiResult<OwnedSemaphorePermit> {
    match state.request_permits.clone().try_acquire_owned() {
        Ok(permit) => Ok(permit),
        Err(TryAcquireError::NoPermits) => Err(AppError::new(
            StatusCode::TOO_MANY_REQUESTS,
            "request capacity reached; retry once a slot frees up",
        )),
        Err(TryAcquireError::Closed) => Err(AppError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "request executor unavailable",
        )),
    }
}

#[derive(Debug, Default, Deserialize)]
struct QueryParams {
    explain: Option<bool>,
    explain_format: Option<ExplainFormat>,
    include_tools: Option<bool>,
}

#[derive(Debug, Serialize)]
struct QueryResponse {
    request_id: String,
    mode: &'static str,
    /// Field object for structured requests, narrative string otherwise.
    answer: Value,
    citations: Vec<String>,
    warnings: Vec<FieldCoercionWarning>,
    cycles: u32,
    stop_reason: &'static str,
    timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolUsage>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    explanation: Option<String>,
}

#[derive(Debug, Serialize)]
struct CapacityReport {
    max_requests: usize,
    available_requests: usize,
    active_requests: usize,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    capacity: CapacityReport,
    backend: &'static str,
}

fn capacity_report(state: &AppState) -> CapacityReport {
    let available = state.request_permits.available_permits();
    CapacityReport {
        max_requests: state.max_requests,
        available_requests: available,
        active_requests: state.max_requests.saturating_sub(available),
    }
}

async fn handle_health(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    Ok(Json(HealthResponse {
        status: "ok",
        capacity: capacity_report(&state),
        backend: match state.config.backend.kind {
            sdr_core::BackendKind::Http => "http",
            sdr_core::BackendKind::Fixture => "fixture",
        },
    }))
}

/// Accepts `{"input": "..."}`, a JSON string, or a pre-structured
/// `{"format": "json", "fields": {...}, "query": "..."}` body.
async fn handle_query(
    State(state): State<AppState>,
    Query(params): Query<QueryParams>,
    body: String,
) -> ApiResult<Json<QueryResponse>> {
    if body.trim().is_empty() {
        return Err(AppError::new(StatusCode::BAD_REQUEST, "request body is empty"));
    }
    let _permit = acquire_request_permit(&state)?;

    let explain = params.explain.unwrap_or(false);
    let collect_trace = explain || state.config.logging.trace_dir.is_some();
    let reply = state
        .assistant
        .answer_with_options(AnswerOptions::payload(&body).with_trace(collect_trace))
        .await?;

    if state.config.logging.request_log {
        record_reply(&state.config, &reply);
    }

    let explanation = if explain {
        reply.trace.as_ref().map(|trace| {
            let summary = trace.summary();
            match params.explain_format.unwrap_or_default() {
                ExplainFormat::Markdown => summary.render_markdown(),
                ExplainFormat::Mermaid => summary.render_mermaid(),
            }
        })
    } else {
        None
    };

    Ok(Json(response_payload(
        reply,
        params.include_tools.unwrap_or(false),
        explanation,
    )))
}

fn response_payload(
    reply: AssistantReply,
    include_tools: bool,
    explanation: Option<String>,
) -> QueryResponse {
    let answer = match reply.answer.fields() {
        Some(fields) => serde_json::to_value(fields).unwrap_or(Value::Null),
        None => Value::String(reply.answer.render()),
    };
    QueryResponse {
        request_id: reply.request_id,
        mode: reply.request.mode_label(),
        answer,
        citations: reply.answer.citations,
        warnings: reply.warnings,
        cycles: reply.cycles,
        stop_reason: reply.stop_reason.as_str(),
        timed_out: reply.timed_out,
        tools: include_tools.then_some(reply.tools),
        explanation,
    }
}

fn record_reply(config: &Config, reply: &AssistantReply) {
    let trace_path = match (&config.logging.trace_dir, &reply.trace) {
        (Some(dir), Some(trace)) => match persist_trace(dir, &reply.request_id, trace.events()) {
            Ok(path) => Some(path.display().to_string()),
            Err(err) => {
                warn!(%err, "failed to persist trace");
                None
            }
        },
        _ => None,
    };
    if let Err(err) = log_request_completion(reply.log_input(trace_path)) {
        warn!(%err, request_id = %reply.request_id, "failed to append request log");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum_test::TestServer;
    use sdr_core::{BackendResponse, FixtureBackend};
    use serde_json::json;

    fn test_state(max_requests: usize) -> AppState {
        let config = ConfigLoader::from_toml(
            "[tools]\nmax_retries = 0\n[logging]\nrequest_log = false",
        )
        .unwrap();
        let backend = Arc::new(FixtureBackend::default().with(
            "company_info",
            json!({"company_name": "Acme Corp"}),
            BackendResponse::ok(json!({"company_name": "Acme Corp", "source": "linkedin.com"})),
        ));
        let assistant = Assistant::with_backend(&config, backend).unwrap();
        AppState::new(config, assistant, max_requests)
    }

    #[test]
    fn capacity_limit_returns_429() {
        let state = test_state(1);

        let permit = acquire_request_permit(&state).expect("first permit should succeed");
        let err = acquire_request_permit(&state).expect_err("second permit should fail");
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        drop(permit);
    }

    #[tokio::test]
    async fn health_reports_capacity() {
        let server = TestServer::new(build_router(test_state(3))).unwrap();

        let response = server.get("/health").await;
        assert_eq!(response.status_code(), 200);
        let body = response.json::<Value>();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["capacity"]["available_requests"], 3);
    }

    #[tokio::test]
    async fn structured_query_returns_schema_shaped_answer() {
        let server = TestServer::new(build_router(test_state(2))).unwrap();

        let response = server
            .post("/query")
            .json(&json!({
                "input": r#"{"format": "json", "fields": {"company_name": "string", "employee_count": "integer"}} Get info about Acme Corp"#
            }))
            .await;
        assert_eq!(response.status_code(), 200);
        let body = response.json::<Value>();
        assert_eq!(body["mode"], "structured");
        assert_eq!(
            body["answer"],
            json!({"company_name": "Acme Corp", "employee_count": null})
        );
        assert_eq!(body["citations"], json!(["linkedin.com"]));
        assert!(body.get("tools").is_none());
    }

    #[tokio::test]
    async fn pre_structured_payload_is_accepted() {
        let server = TestServer::new(build_router(test_state(2))).unwrap();

        let response = server
            .post("/query")
            .add_query_param("include_tools", true)
            .json(&json!({
                "format": "json",
                "fields": {"company_name": "string"},
                "query": "Get info about Acme Corp"
            }))
            .await;
        assert_eq!(response.status_code(), 200);
        let body = response.json::<Value>();
        assert_eq!(body["answer"]["company_name"], "Acme Corp");
        assert_eq!(body["tools"][0]["tool"], "company_info");
    }

    #[tokio::test]
    async fn malformed_envelope_is_unprocessable() {
        let server = TestServer::new(build_router(test_state(2))).unwrap();

        let response = server
            .post("/query")
            .json(&json!({"input": r#"{"format": "json"} Get info about Acme Corp"#}))
            .await;
        assert_eq!(response.status_code(), 422);
        assert!(response.json::<Value>()["error"].is_string());
    }

    #[tokio::test]
    async fn saturated_server_rejects_queries() {
        let state = test_state(1);
        let _held = acquire_request_permit(&state).unwrap();
        let server = TestServer::new(build_router(state)).unwrap();

        let response = server
            .post("/query")
            .json(&json!({"input": "Research Acme Corp"}))
            .await;
        assert_eq!(response.status_code(), 429);
    }
}
