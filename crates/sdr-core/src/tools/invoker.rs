use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::error::ToolInvocationError;
use crate::evidence::{ToolCall, ToolOutcome, ToolResult};
use crate::metrics::record_tool_metrics;
use crate::tools::{ResultCache, ToolBackend};

/// Timeout and retry policy applied to every tool call.
#[derive(Debug, Clone)]
pub struct InvocationPolicy {
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// Retries after the first attempt, for transient failures only.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for InvocationPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

/// Runs tool calls against a backend. Never fails: every error is folded into the
/// returned `ToolResult`.
#[derive(Clone)]
pub struct ToolInvoker {
    backend: Arc<dyn ToolBackend>,
    policy: InvocationPolicy,
    cache: Option<ResultCache>,
}

impl ToolInvoker {
    pub fn new(backend: Arc<dyn ToolBackend>, policy: InvocationPolicy) -> Self {
        Self {
            backend,
            policy,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: ResultCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    #[instrument(name = "tool.invoke", skip(self, call), fields(tool = %call.tool))]
    pub async fn invoke(&self, call: &ToolCall) -> ToolResult {
        if let Err(err) = call.tool.spec().validate(&call.arguments) {
            warn!(error = %err, "rejecting tool call before backend dispatch");
            record_tool_metrics(call.tool.as_str(), "invalid", 0, 0);
            return ToolResult::failed(call, err);
        }

        let key = call.key();
        if let Some((payload, source_label)) = self.cache.as_ref().and_then(|c| c.get(&key)) {
            debug!("serving tool result from cache");
            record_tool_metrics(call.tool.as_str(), "cached", 0, 0);
            return ToolResult {
                call: key,
                tool: call.tool,
                arguments: call.arguments.clone(),
                outcome: ToolOutcome::Ok(payload),
                source_label,
                attempts: 0,
                duration_ms: 0,
            };
        }

        let started = Instant::now();
        let mut attempt: u32 = 0;
        let mut backoff = self.policy.initial_backoff;

        let outcome = loop {
            attempt += 1;
            debug!(attempt, "dispatching tool call");

            match self.attempt(call).await {
                Ok(payload) => break ToolOutcome::Ok(payload),
                Err(err) if err.is_transient() && attempt <= self.policy.max_retries => {
                    warn!(
                        error = %err,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "transient tool failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.policy.max_backoff);
                }
                Err(err) => {
                    warn!(error = %err, attempt, "tool call failed");
                    break ToolOutcome::Error(err);
                }
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let source_label = match &outcome {
            ToolOutcome::Ok(payload) => source_label_for(call, payload),
            ToolOutcome::Error(_) => call.tool.default_source(&call.arguments),
        };

        let status = match &outcome {
            ToolOutcome::Ok(_) => "ok",
            ToolOutcome::Error(_) => "error",
        };
        record_tool_metrics(call.tool.as_str(), status, attempt, duration_ms);

        if let (Some(cache), ToolOutcome::Ok(payload)) = (&self.cache, &outcome) {
            cache.insert(key.clone(), payload.clone(), source_label.clone());
        }

        ToolResult {
            call: key,
            tool: call.tool,
            arguments: call.arguments.clone(),
            outcome,
            source_label,
            attempts: attempt,
            duration_ms,
        }
    }

    async fn attempt(&self, call: &ToolCall) -> Result<Value, ToolInvocationError> {
        let response = tokio::time::timeout(self.policy.timeout, self.backend.call(call))
            .await
            .map_err(|_| ToolInvocationError::Timeout(self.policy.timeout))??;

        if response.success {
            Ok(response.data.unwrap_or(Value::Null))
        } else {
            Err(ToolInvocationError::from_backend_message(
                response
                    .error
                    .unwrap_or_else(|| "backend reported failure without detail".to_string()),
            ))
        }
    }
}

/// Provenance for a successful payload: an explicit `source`, else the host of a
/// top-level `url`, else the tool's default.
fn source_label_for(call: &ToolCall, payload: &Value) -> String {
    let explicit = payload
        .get("source")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|source| !source.is_empty())
        .map(str::to_string);
    if let Some(source) = explicit {
        return source;
    }
    if call.tool.is_specific() {
        if let Some(url) = payload.get("url").and_then(Value::as_str) {
            return super::host_of(url);
        }
    }
    call.tool.default_source(&call.arguments)
}
