//! End-to-end request handling: classify, research, synthesize.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{BackendKind, Config, DeciderKind};
use crate::decision::{DecisionService, HeuristicDecider};
use crate::error::{ClassificationError, SdrError};
use crate::eval::structured_compliance;
use crate::events::{EventCollector, drain_into_trace};
use crate::evidence::ToolStatus;
use crate::logging::RequestLogInput;
use crate::orchestrator::{LoopOutcome, ResearchLoop, StopReason};
use crate::request::{Request, classify, classify_payload};
use crate::synthesizer::{Answer, FieldCoercionWarning, Synthesizer};
use crate::tools::{FixtureBackend, ToolBackend, ToolInvoker, ToolKind};
use crate::trace::TraceCollector;

/// How the caller's input should be classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// Free text, optionally carrying an inline `{"format": "json", ...}` envelope.
    Text,
    /// A JSON request body (`{"input": ...}` or a bare envelope).
    Payload,
}

/// Options for answering one request.
pub struct AnswerOptions<'a> {
    pub input: &'a str,
    pub kind: InputKind,
    pub request_id: Option<String>,
    pub cancel: Option<CancellationToken>,
    pub collect_trace: bool,
}

impl<'a> AnswerOptions<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            input,
            kind: InputKind::Text,
            request_id: None,
            cancel: None,
            collect_trace: false,
        }
    }

    pub fn payload(body: &'a str) -> Self {
        Self {
            kind: InputKind::Payload,
            ..Self::new(body)
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_trace(mut self, enabled: bool) -> Self {
        self.collect_trace = enabled;
        self
    }
}

/// One tool call as reported back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolUsage {
    pub tool: ToolKind,
    pub source_label: String,
    pub status: ToolStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Everything produced while answering one request.
#[derive(Debug, Clone, Serialize)]
pub struct AssistantReply {
    pub request_id: String,
    pub request: Request,
    pub answer: Answer,
    pub warnings: Vec<FieldCoercionWarning>,
    pub tools: Vec<ToolUsage>,
    pub cycles: u32,
    pub stop_reason: StopReason,
    /// The overall request deadline cut research short.
    pub timed_out: bool,
    pub duration_ms: u64,
    #[serde(skip)]
    pub trace: Option<TraceCollector>,
}

impl AssistantReply {
    /// Structured requests only: whether the answer matches its schema.
    pub fn structured_compliant(&self) -> Option<bool> {
        let schema = self.request.field_schema()?;
        let fields = self.answer.fields()?;
        let value = serde_json::to_value(fields).unwrap_or(Value::Null);
        Some(structured_compliance(schema, &value).compliant())
    }

    pub fn log_input(&self, trace_path: Option<String>) -> RequestLogInput {
        RequestLogInput {
            request_id: self.request_id.clone(),
            query: self.request.query().to_string(),
            mode: self.request.mode_label().to_string(),
            answer: self.answer.render(),
            citations: self.answer.citations.clone(),
            tools: self.tools.iter().map(|usage| usage.tool.to_string()).collect(),
            cycles: self.cycles,
            stop_reason: self.stop_reason.as_str().to_string(),
            duration_ms: self.duration_ms,
            structured_compliant: self.structured_compliant(),
            trace_path,
        }
    }
}

/// The assembled assistant. Built once from configuration and shared across requests.
#[derive(Clone)]
pub struct Assistant {
    research: ResearchLoop,
    synthesizer: Synthesizer,
    request_timeout: Option<Duration>,
}

impl Assistant {
    /// Build with the configured backend and decision service.
    pub fn from_config(config: &Config) -> Result<Self, SdrError> {
        let backend = build_backend(config)?;
        Self::with_backend(config, backend)
    }

    pub fn with_backend(config: &Config, backend: Arc<dyn ToolBackend>) -> Result<Self, SdrError> {
        let decider = build_decider(config)?;
        Self::with_parts(config, backend, decider)
    }

    pub fn with_parts(
        config: &Config,
        backend: Arc<dyn ToolBackend>,
        decider: Arc<dyn DecisionService>,
    ) -> Result<Self, SdrError> {
        let mut invoker = ToolInvoker::new(backend, config.invocation_policy());
        if let Some(cache) = config.result_cache() {
            invoker = invoker.with_cache(cache);
        }
        info!(
            backend = invoker.backend_name(),
            decider = decider.name(),
            "assistant ready"
        );
        Ok(Self {
            research: ResearchLoop::new(invoker, decider, config.loop_config()),
            synthesizer: Synthesizer::new(config.trust_order()?),
            request_timeout: config.request_timeout(),
        })
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Classify and answer free-text input.
    pub async fn answer(&self, input: &str) -> Result<AssistantReply, ClassificationError> {
        self.answer_with_options(AnswerOptions::new(input)).await
    }

    /// Classification is the only failure; a classified request always gets an answer.
    pub async fn answer_with_options(
        &self,
        options: AnswerOptions<'_>,
    ) -> Result<AssistantReply, ClassificationError> {
        let request = match options.kind {
            InputKind::Text => classify(options.input)?,
            InputKind::Payload => classify_payload(options.input)?,
        };
        let request_id = options
            .request_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let cancel = options.cancel.unwrap_or_default();
        Ok(self
            .answer_request(request_id, request, &cancel, options.collect_trace)
            .await)
    }

    pub async fn answer_request(
        &self,
        request_id: String,
        request: Request,
        cancel: &CancellationToken,
        collect_trace: bool,
    ) -> AssistantReply {
        let scoped = cancel.child_token();
        let timer = self.request_timeout.map(|limit| {
            let token = scoped.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                warn!(timeout_ms = limit.as_millis() as u64, "request deadline reached");
                token.cancel();
            })
        });

        let (outcome, trace) = if collect_trace {
            let (events, mut receiver) = EventCollector::new();
            let research = self.research.clone().with_events(events);
            let outcome = research.run_with_id(&request_id, &request, &scoped).await;
            drop(research);
            (outcome, Some(drain_into_trace(&mut receiver)))
        } else {
            let outcome = self.research.run_with_id(&request_id, &request, &scoped).await;
            (outcome, None)
        };

        if let Some(timer) = timer {
            timer.abort();
        }
        let timed_out = scoped.is_cancelled() && !cancel.is_cancelled();

        let mut reply = self.reply(request, outcome, timed_out);
        if let Some(mut trace) = trace {
            trace.record(
                "synthesize",
                format!(
                    "{} citation(s), {} warning(s)",
                    reply.answer.citations.len(),
                    reply.warnings.len()
                ),
            );
            reply.trace = Some(trace);
        }
        reply
    }

    fn reply(&self, request: Request, outcome: LoopOutcome, timed_out: bool) -> AssistantReply {
        let synthesis = self.synthesizer.synthesize(&request, &outcome.evidence);
        let tools = outcome
            .evidence
            .iter()
            .map(|result| ToolUsage {
                tool: result.tool,
                source_label: result.source_label.clone(),
                status: result.status(),
                attempts: result.attempts,
                error: result.error().map(ToString::to_string),
            })
            .collect();

        info!(
            request_id = %outcome.request_id,
            mode = request.mode_label(),
            citations = synthesis.answer.citations.len(),
            warnings = synthesis.warnings.len(),
            timed_out,
            "request answered"
        );

        AssistantReply {
            request_id: outcome.request_id,
            request,
            answer: synthesis.answer,
            warnings: synthesis.warnings,
            tools,
            cycles: outcome.cycles,
            stop_reason: outcome.stop_reason,
            timed_out,
            duration_ms: outcome.duration_ms,
            trace: None,
        }
    }
}

/// Construct the backend named in `[backend]`.
pub fn build_backend(config: &Config) -> Result<Arc<dyn ToolBackend>, SdrError> {
    match config.backend.kind {
        BackendKind::Fixture => {
            let path = config.backend.fixture_path.as_ref().ok_or_else(|| {
                SdrError::InvalidConfiguration("backend.fixture_path is required".into())
            })?;
            Ok(Arc::new(FixtureBackend::from_path(path)?))
        }
        BackendKind::Http => http_backend(config),
    }
}

#[cfg(feature = "http-backend")]
fn http_backend(config: &Config) -> Result<Arc<dyn ToolBackend>, SdrError> {
    let token = config.backend_token()?;
    let backend = crate::tools::HttpBackend::new(config.backend.base_url.clone(), Some(token))
        .with_request_timeout(config.invocation_policy().timeout)?;
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "http-backend"))]
fn http_backend(_config: &Config) -> Result<Arc<dyn ToolBackend>, SdrError> {
    Err(SdrError::InvalidConfiguration(
        "http backend support is not compiled in; enable the `http-backend` feature".into(),
    ))
}

pub fn build_decider(config: &Config) -> Result<Arc<dyn DecisionService>, SdrError> {
    match config.decision.kind {
        DeciderKind::Heuristic => Ok(Arc::new(HeuristicDecider::new(config.selector()?))),
        DeciderKind::Http => http_decider(config),
    }
}

#[cfg(feature = "http-backend")]
fn http_decider(config: &Config) -> Result<Arc<dyn DecisionService>, SdrError> {
    let decider =
        crate::decision::HttpDecider::new(config.decision.base_url.clone(), config.decision_token())
            .with_model(config.decision.model.clone())
            .with_request_timeout(config.loop_config().decision_timeout)?;
    Ok(Arc::new(decider))
}

#[cfg(not(feature = "http-backend"))]
fn http_decider(_config: &Config) -> Result<Arc<dyn DecisionService>, SdrError> {
    Err(SdrError::InvalidConfiguration(
        "http decision support is not compiled in; enable the `http-backend` feature".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigLoader;
    use crate::tools::BackendResponse;
    use serde_json::json;

    fn acme_backend() -> Arc<FixtureBackend> {
        Arc::new(FixtureBackend::default().with(
            "company_info",
            json!({"company_name": "Acme Corp"}),
            BackendResponse::ok(json!({
                "company_name": "Acme Corp",
                "url": "https://www.linkedin.com/company/acme"
            })),
        ))
    }

    #[tokio::test]
    async fn reply_reports_tools_and_compliance() {
        let config = ConfigLoader::from_toml("[tools]\nmax_retries = 0").unwrap();
        let assistant = Assistant::with_backend(&config, acme_backend()).unwrap();

        let reply = assistant
            .answer_with_options(
                AnswerOptions::new(
                    r#"{"format": "json", "fields": {"company_name": "string"}} Get info about Acme Corp"#,
                )
                .with_request_id("req-acme")
                .with_trace(true),
            )
            .await
            .unwrap();

        assert_eq!(reply.request_id, "req-acme");
        assert_eq!(reply.structured_compliant(), Some(true));
        assert_eq!(reply.tools[0].tool, ToolKind::CompanyInfo);
        assert_eq!(reply.tools[0].status, ToolStatus::Ok);
        assert!(!reply.timed_out);

        let trace = reply.trace.as_ref().unwrap();
        assert!(trace.events().iter().any(|step| step.stage == "synthesize"));

        let log = reply.log_input(None);
        assert_eq!(log.mode, "structured");
        assert_eq!(log.citations, reply.answer.citations);
    }

    #[tokio::test]
    async fn classification_errors_are_returned() {
        let config = Config::default();
        let assistant = Assistant::with_backend(&config, acme_backend()).unwrap();
        let err = assistant
            .answer(r#"{"format": "json", "fields": {}} Acme"#)
            .await
            .unwrap_err();
        assert_eq!(err, ClassificationError::EmptyFields);
    }

    #[test]
    fn decision_service_follows_configuration() {
        let heuristic = build_decider(&Config::default()).unwrap();
        assert_eq!(heuristic.name(), "heuristic");

        let config = ConfigLoader::from_toml(
            "[decision]\nkind = \"http\"\nbase_url = \"http://127.0.0.1:9\"\napi_token_env = \"\"",
        )
        .unwrap();
        let decider = build_decider(&config);
        if cfg!(feature = "http-backend") {
            assert_eq!(decider.unwrap().name(), "http");
        } else {
            assert!(decider.is_err());
        }
    }
}
