//! Decision service seam.
//!
//! The loop consults a `DecisionService` once per cycle. `HeuristicDecider` plans
//! from query signals and requested fields; `HttpDecider` asks a language model
//! behind a JSON endpoint and sees the same context.

#[cfg(feature = "http-backend")]
mod http;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;

use crate::error::DecisionError;
use crate::evidence::{EvidenceSet, ToolCall};
use crate::request::Request;
use crate::selector::{FollowUp, PlannedCall, QuerySignals, ToolSelector};
use crate::synthesizer::field_resolvable;
use crate::tools::{ToolKind, ToolSpec};

#[cfg(feature = "http-backend")]
pub use http::HttpDecider;

/// Everything a decision may depend on for the current cycle.
#[derive(Debug, Clone, Copy)]
pub struct DecisionContext<'a> {
    pub request: &'a Request,
    pub evidence: &'a EvidenceSet,
    pub catalogue: &'a [ToolSpec],
    /// Zero-based index of the cycle being decided.
    pub cycle: u32,
    pub max_cycles: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", content = "calls", rename_all = "snake_case")]
pub enum Decision {
    Invoke(Vec<PlannedCall>),
    Sufficient,
}

#[async_trait]
pub trait DecisionService: Send + Sync {
    fn name(&self) -> &str;

    async fn decide(&self, ctx: DecisionContext<'_>) -> Result<Decision, DecisionError>;
}

/// Number of search hits scraped after a fallback search.
const FALLBACK_SCRAPE_LIMIT: usize = 2;

/// Rule-based planner: the selector's choice first, then targeted web searches for
/// whatever is still missing.
#[derive(Debug, Clone, Default)]
pub struct HeuristicDecider {
    selector: ToolSelector,
}

impl HeuristicDecider {
    pub fn new(selector: ToolSelector) -> Self {
        Self { selector }
    }

    fn fallback(&self, ctx: &DecisionContext<'_>) -> Decision {
        let signals = QuerySignals::extract(ctx.request.query());
        let subject = signals
            .subject()
            .map(str::to_string)
            .unwrap_or_else(|| ctx.request.query().trim().to_string());
        if subject.is_empty() {
            return Decision::Sufficient;
        }

        let calls: Vec<PlannedCall> = match ctx.request.field_schema() {
            Some(schema) => schema
                .names()
                .filter(|field| !field_resolvable(ctx.evidence, field))
                .map(|field| {
                    let topic = field.replace('_', " ");
                    search(format!("{subject} {topic}"))
                })
                .collect(),
            None if !ctx.evidence.any_specific_success() => {
                vec![search(format!("{subject} company overview"))]
            }
            None => Vec::new(),
        };

        let fresh: Vec<PlannedCall> = calls
            .into_iter()
            .filter(|planned| {
                let call = ToolCall::new(planned.tool, planned.arguments.clone());
                !ctx.evidence.contains(&call.key())
            })
            .collect();

        if fresh.is_empty() {
            Decision::Sufficient
        } else {
            Decision::Invoke(fresh)
        }
    }
}

fn search(query: String) -> PlannedCall {
    PlannedCall::new(ToolKind::WebSearch, json!({ "query": query }))
        .with_follow_up(FollowUp::ScrapeTopResults {
            limit: FALLBACK_SCRAPE_LIMIT,
        })
}

#[async_trait]
impl DecisionService for HeuristicDecider {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn decide(&self, ctx: DecisionContext<'_>) -> Result<Decision, DecisionError> {
        if ctx.cycle == 0 && ctx.evidence.is_empty() {
            let selection = self.selector.select(ctx.request);
            if selection.calls.is_empty() {
                return Ok(Decision::Sufficient);
            }
            return Ok(Decision::Invoke(selection.calls));
        }
        Ok(self.fallback(&ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ToolInvocationError;
    use crate::evidence::{ToolOutcome, ToolResult};
    use crate::request::classify;
    use crate::tools::catalogue;

    fn ctx<'a>(
        request: &'a Request,
        evidence: &'a EvidenceSet,
        catalogue: &'a [ToolSpec],
        cycle: u32,
    ) -> DecisionContext<'a> {
        DecisionContext {
            request,
            evidence,
            catalogue,
            cycle,
            max_cycles: 3,
        }
    }

    #[tokio::test]
    async fn first_cycle_uses_selection() {
        let request = classify("Research Tesla for outbound sales").unwrap();
        let evidence = EvidenceSet::new();
        let tools = catalogue();
        let decision = HeuristicDecider::default()
            .decide(ctx(&request, &evidence, &tools, 0))
            .await
            .unwrap();
        let Decision::Invoke(calls) = decision else {
            panic!("expected calls");
        };
        assert_eq!(calls[0].tool, ToolKind::CompanyInfo);
    }

    #[tokio::test]
    async fn later_cycles_search_for_unresolved_fields() {
        let request = classify(
            r#"{"format":"json","fields":{"company_name":"string","employee_count":"integer"}} Get info about Acme Corp"#,
        )
        .unwrap();
        let call = ToolCall::new(ToolKind::CompanyInfo, json!({"company_name": "Acme Corp"}));
        let evidence: EvidenceSet = [ToolResult {
            call: call.key(),
            tool: call.tool,
            arguments: call.arguments.clone(),
            outcome: ToolOutcome::Ok(json!({"company_name": "Acme Corp"})),
            source_label: "linkedin.com".into(),
            attempts: 1,
            duration_ms: 3,
        }]
        .into_iter()
        .collect();
        let tools = catalogue();

        let decision = HeuristicDecider::default()
            .decide(ctx(&request, &evidence, &tools, 1))
            .await
            .unwrap();
        assert_eq!(
            decision,
            Decision::Invoke(vec![search("Acme Corp employee count".to_string())])
        );
    }

    #[tokio::test]
    async fn exhausted_fallbacks_are_sufficient() {
        let request = classify("Research Tesla").unwrap();
        let call = ToolCall::new(
            ToolKind::WebSearch,
            json!({"query": "Tesla company overview"}),
        );
        let evidence: EvidenceSet =
            [ToolResult::failed(&call, ToolInvocationError::Network("down".into()))]
                .into_iter()
                .collect();
        let tools = catalogue();

        let decision = HeuristicDecider::default()
            .decide(ctx(&request, &evidence, &tools, 1))
            .await
            .unwrap();
        assert_eq!(decision, Decision::Sufficient);
    }
}
