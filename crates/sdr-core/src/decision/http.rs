use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use super::{Decision, DecisionContext, DecisionService};
use crate::error::DecisionError;
use crate::evidence::{ToolResult, ToolStatus};
use crate::request::FieldSchema;
use crate::security::SecretValue;
use crate::selector::{FollowUp, PlannedCall};
use crate::tools::{ToolKind, ToolSpec};

/// Characters of each payload shown to the model.
const EXCERPT_CHARS: usize = 1_500;

#[derive(Serialize)]
struct DecideRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    query: &'a str,
    mode: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    fields: Option<&'a FieldSchema>,
    cycle: u32,
    max_cycles: u32,
    evidence: Vec<EvidenceSummary<'a>>,
    tools: &'a [ToolSpec],
}

#[derive(Serialize)]
struct EvidenceSummary<'a> {
    tool: ToolKind,
    arguments: &'a Map<String, Value>,
    status: ToolStatus,
    source: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    excerpt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<'a> EvidenceSummary<'a> {
    fn from_result(result: &'a ToolResult) -> Self {
        Self {
            tool: result.tool,
            arguments: &result.arguments,
            status: result.status(),
            source: &result.source_label,
            excerpt: result.payload().map(excerpt),
            error: result.error().map(ToString::to_string),
        }
    }
}

fn excerpt(payload: &Value) -> String {
    let rendered = match payload {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    if rendered.chars().count() <= EXCERPT_CHARS {
        return rendered;
    }
    let mut cut: String = rendered.chars().take(EXCERPT_CHARS).collect();
    cut.push('…');
    cut
}

#[derive(Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
enum WirePlan {
    Invoke {
        #[serde(default)]
        calls: Vec<WireCall>,
    },
    Sufficient,
}

#[derive(Deserialize)]
struct WireCall {
    tool: String,
    #[serde(default)]
    arguments: Value,
    #[serde(default)]
    follow_up: Option<FollowUp>,
}

/// Model-backed planner: `POST {base_url}/decide` with the request, an evidence
/// summary and the tool catalogue, answered by `{"decision": "invoke", "calls": [...]}`
/// or `{"decision": "sufficient"}`. Chat-style gateways may wrap the plan in a
/// `content` string instead.
#[derive(Debug, Clone)]
pub struct HttpDecider {
    client: Client,
    base_url: String,
    token: Option<SecretValue>,
    model: Option<String>,
    request_timeout: Option<Duration>,
}

impl HttpDecider {
    pub fn new(base_url: impl Into<String>, token: Option<SecretValue>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            model: None,
            request_timeout: None,
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model.filter(|name| !name.trim().is_empty());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> anyhow::Result<Self> {
        self.client = Client::builder().timeout(timeout).build()?;
        self.request_timeout = Some(timeout);
        Ok(self)
    }

    fn endpoint(&self) -> String {
        format!("{}/decide", self.base_url)
    }

    fn request_body<'a>(&'a self, ctx: &DecisionContext<'a>) -> DecideRequest<'a> {
        DecideRequest {
            model: self.model.as_deref(),
            query: ctx.request.query(),
            mode: ctx.request.mode_label(),
            fields: ctx.request.field_schema(),
            cycle: ctx.cycle,
            max_cycles: ctx.max_cycles,
            evidence: ctx.evidence.iter().map(EvidenceSummary::from_result).collect(),
            tools: ctx.catalogue,
        }
    }

    fn transport_error(&self, err: reqwest::Error) -> DecisionError {
        match self.request_timeout {
            Some(timeout) if err.is_timeout() => DecisionError::Timeout(timeout),
            _ => DecisionError::Unavailable(err.to_string()),
        }
    }
}

#[async_trait]
impl DecisionService for HttpDecider {
    fn name(&self) -> &str {
        "http"
    }

    async fn decide(&self, ctx: DecisionContext<'_>) -> Result<Decision, DecisionError> {
        let body = self.request_body(&ctx);
        debug!(
            endpoint = %self.endpoint(),
            cycle = ctx.cycle,
            evidence = body.evidence.len(),
            "consulting decision model"
        );

        let mut request = self.client.post(self.endpoint()).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose());
        }

        let response = request
            .send()
            .await
            .map_err(|err| self.transport_error(err))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| self.transport_error(err))?;
        if !status.is_success() {
            return Err(status_error(status, &text));
        }
        parse_plan(&text)
    }
}

/// Parse a model reply into a decision. Tool names must come from the catalogue;
/// argument checking is left to the tool layer so the model sees the failure as
/// evidence on the next cycle.
fn parse_plan(raw: &str) -> Result<Decision, DecisionError> {
    let value: Value = serde_json::from_str(raw.trim())
        .map_err(|err| DecisionError::InvalidPlan(format!("reply is not JSON: {err}")))?;

    let embedded = value
        .as_object()
        .filter(|map| !map.contains_key("decision"))
        .and_then(|map| map.get("content"))
        .and_then(Value::as_str)
        .map(|content| serde_json::from_str::<Value>(strip_fences(content)));
    let value = match embedded {
        Some(parsed) => parsed.map_err(|err| {
            DecisionError::InvalidPlan(format!("content is not a JSON plan: {err}"))
        })?,
        None => value,
    };

    let plan: WirePlan = serde_json::from_value(value)
        .map_err(|err| DecisionError::InvalidPlan(err.to_string()))?;
    match plan {
        WirePlan::Sufficient => Ok(Decision::Sufficient),
        WirePlan::Invoke { calls } => calls
            .into_iter()
            .map(planned_call)
            .collect::<Result<Vec<_>, _>>()
            .map(Decision::Invoke),
    }
}

fn planned_call(call: WireCall) -> Result<PlannedCall, DecisionError> {
    let tool: ToolKind = call
        .tool
        .parse()
        .map_err(|_| DecisionError::InvalidPlan(format!("unknown tool `{}`", call.tool)))?;
    let arguments = match call.arguments {
        Value::Null => Value::Object(Map::new()),
        Value::Object(map) => Value::Object(map),
        other => {
            return Err(DecisionError::InvalidPlan(format!(
                "arguments for {tool} must be an object, got {other}"
            )));
        }
    };
    let mut planned = PlannedCall::new(tool, arguments);
    planned.follow_up = call.follow_up;
    Ok(planned)
}

fn strip_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

fn status_error(status: StatusCode, body: &str) -> DecisionError {
    let detail = if body.trim().is_empty() {
        status.to_string()
    } else {
        format!("{status}: {}", body.trim())
    };
    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            DecisionError::Unavailable(format!("rate limited: {detail}"))
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            DecisionError::Unavailable(detail)
        }
        status if status.is_server_error() => DecisionError::Unavailable(detail),
        _ => DecisionError::Rejected(detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::{EvidenceSet, ToolCall, ToolOutcome};
    use crate::request::classify;
    use crate::tools::catalogue;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    const ACME_REQUEST: &str = r#"{"format":"json","fields":{"company_name":"string","employee_count":"integer"}} Get info about Acme Corp"#;

    fn landed(tool: ToolKind, arguments: Value, payload: Value) -> ToolResult {
        let call = ToolCall::new(tool, arguments);
        ToolResult {
            call: call.key(),
            tool,
            arguments: call.arguments.clone(),
            outcome: ToolOutcome::Ok(payload),
            source_label: "linkedin.com".into(),
            attempts: 1,
            duration_ms: 4,
        }
    }

    /// Accept one connection, answer it with `status` and `body`, and hand back the raw request.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            while !request_complete(&raw) {
                let read = stream.read(&mut buf).await.unwrap();
                if read == 0 {
                    break;
                }
                raw.extend_from_slice(&buf[..read]);
            }
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&raw).into_owned()
        });
        (format!("http://{addr}"), handle)
    }

    fn request_complete(raw: &[u8]) -> bool {
        let text = String::from_utf8_lossy(raw);
        let Some((head, body)) = text.split_once("\r\n\r\n") else {
            return false;
        };
        let length = head
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.trim()
                    .eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        body.len() >= length
    }

    #[test]
    fn invoke_replies_become_planned_calls() {
        let decision = parse_plan(
            r#"{
                "decision": "invoke",
                "calls": [
                    {"tool": "company_info", "arguments": {"company_name": "Acme Corp"}},
                    {"tool": "web_search", "arguments": {"query": "Acme Corp headcount"},
                     "follow_up": {"kind": "scrape_top_results", "limit": 2}}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(
            decision,
            Decision::Invoke(vec![
                PlannedCall::new(ToolKind::CompanyInfo, json!({"company_name": "Acme Corp"})),
                PlannedCall::new(ToolKind::WebSearch, json!({"query": "Acme Corp headcount"}))
                    .with_follow_up(FollowUp::ScrapeTopResults { limit: 2 }),
            ])
        );
        assert_eq!(
            parse_plan(r#"{"decision": "sufficient"}"#).unwrap(),
            Decision::Sufficient
        );
    }

    #[test]
    fn fenced_content_replies_are_unwrapped() {
        let reply = json!({
            "content": "```json\n{\"decision\": \"invoke\", \"calls\": [{\"tool\": \"job_search\", \"arguments\": {\"query\": \"Tesla sales roles\"}}]}\n```"
        });
        let decision = parse_plan(&reply.to_string()).unwrap();
        assert_eq!(
            decision,
            Decision::Invoke(vec![PlannedCall::new(
                ToolKind::JobSearch,
                json!({"query": "Tesla sales roles"})
            )])
        );
    }

    #[test]
    fn unusable_replies_are_invalid_plans() {
        for reply in [
            "I would search the web",
            r#"{"calls": []}"#,
            r#"{"decision": "invoke", "calls": [{"tool": "fax_machine"}]}"#,
            r#"{"decision": "invoke", "calls": [{"tool": "web_search", "arguments": ["Acme"]}]}"#,
            r#"{"content": "not json either"}"#,
        ] {
            let err = parse_plan(reply).unwrap_err();
            assert!(matches!(err, DecisionError::InvalidPlan(_)), "{reply}: {err}");
            assert!(!err.is_transient());
        }
    }

    #[test]
    fn statuses_map_to_transience() {
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(status_error(StatusCode::SERVICE_UNAVAILABLE, "overloaded").is_transient());
        assert!(status_error(StatusCode::GATEWAY_TIMEOUT, "").is_transient());
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, "bad key"),
            DecisionError::Rejected(_)
        ));
        assert!(!status_error(StatusCode::BAD_REQUEST, "").is_transient());
    }

    #[test]
    fn request_body_carries_schema_evidence_and_catalogue() {
        let request = classify(ACME_REQUEST).unwrap();
        let evidence: EvidenceSet = [landed(
            ToolKind::CompanyInfo,
            json!({"company_name": "Acme Corp"}),
            json!({"company_name": "Acme Corp", "about": "x".repeat(4_000)}),
        )]
        .into_iter()
        .collect();
        let tools = catalogue();
        let ctx = DecisionContext {
            request: &request,
            evidence: &evidence,
            catalogue: &tools,
            cycle: 1,
            max_cycles: 3,
        };
        let decider = HttpDecider::new("http://localhost:8932/", None)
            .with_model(Some("sales-planner".into()));

        let body = serde_json::to_value(decider.request_body(&ctx)).unwrap();

        assert_eq!(decider.endpoint(), "http://localhost:8932/decide");
        assert_eq!(body["model"], "sales-planner");
        assert_eq!(body["query"], "Get info about Acme Corp");
        assert_eq!(body["fields"], json!({"company_name": "string", "employee_count": "integer"}));
        assert_eq!(body["tools"].as_array().unwrap().len(), 7);
        assert_eq!(body["evidence"][0]["tool"], "company_info");
        assert_eq!(body["evidence"][0]["status"], "ok");
        let excerpt = body["evidence"][0]["excerpt"].as_str().unwrap();
        assert_eq!(excerpt.chars().count(), EXCERPT_CHARS + 1);
    }

    #[tokio::test]
    async fn decide_posts_context_and_reads_the_plan() {
        let (base_url, server) = serve_once(
            "200 OK",
            r#"{"decision":"invoke","calls":[{"tool":"company_info","arguments":{"company_name":"Acme Corp"}}]}"#,
        )
        .await;
        let request = classify("Research Acme Corp").unwrap();
        let evidence = EvidenceSet::new();
        let tools = catalogue();
        let decider = HttpDecider::new(base_url, Some(SecretValue::new("test-token")))
            .with_request_timeout(Duration::from_secs(5))
            .unwrap();

        let decision = decider
            .decide(DecisionContext {
                request: &request,
                evidence: &evidence,
                catalogue: &tools,
                cycle: 0,
                max_cycles: 3,
            })
            .await
            .unwrap();

        assert_eq!(
            decision,
            Decision::Invoke(vec![PlannedCall::new(
                ToolKind::CompanyInfo,
                json!({"company_name": "Acme Corp"})
            )])
        );
        let raw = server.await.unwrap();
        assert!(raw.starts_with("POST /decide "), "{raw}");
        assert!(raw.to_ascii_lowercase().contains("authorization: bearer test-token"));
        assert!(raw.contains("\"social_profile\""));
    }

    #[tokio::test]
    async fn overloaded_service_is_transient() {
        let (base_url, server) = serve_once("503 Service Unavailable", r#"{"error":"busy"}"#).await;
        let request = classify("Research Acme Corp").unwrap();
        let evidence = EvidenceSet::new();
        let tools = catalogue();

        let err = HttpDecider::new(base_url, None)
            .decide(DecisionContext {
                request: &request,
                evidence: &evidence,
                catalogue: &tools,
                cycle: 0,
                max_cycles: 3,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, DecisionError::Unavailable(_)), "{err}");
        assert!(err.is_transient());
        server.await.unwrap();
    }
}
