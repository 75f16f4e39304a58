//! Tool calls, their results, and the per-request evidence set.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ToolInvocationError;
use crate::tools::ToolKind;

/// Identity of a call for de-duplication: tool name plus canonical arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallKey(String);

impl CallKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One attempted invocation. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCall {
    pub tool: ToolKind,
    pub arguments: Map<String, Value>,
    pub issued_at: DateTime<Utc>,
}

impl ToolCall {
    /// Non-object `arguments` are treated as an empty argument map.
    pub fn new(tool: ToolKind, arguments: Value) -> Self {
        let arguments = match arguments {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            tool,
            arguments,
            issued_at: Utc::now(),
        }
    }

    pub fn key(&self) -> CallKey {
        let mut canonical = String::new();
        write_canonical(&Value::Object(self.arguments.clone()), &mut canonical);
        CallKey(format!("{}:{}", self.tool, canonical))
    }

    pub fn argument_str(&self, name: &str) -> Option<&str> {
        self.arguments.get(name).and_then(Value::as_str)
    }
}

/// Stable rendering with object keys sorted at every depth and string values trimmed.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::String(text) => out.push_str(&Value::String(text.trim().to_string()).to_string()),
        other => out.push_str(&other.to_string()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Ok(Value),
    Error(ToolInvocationError),
}

/// Completed invocation. Refers back to its call by key only.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub call: CallKey,
    pub tool: ToolKind,
    pub arguments: Map<String, Value>,
    pub outcome: ToolOutcome,
    pub source_label: String,
    pub attempts: u32,
    pub duration_ms: u64,
}

impl ToolResult {
    pub fn status(&self) -> ToolStatus {
        match self.outcome {
            ToolOutcome::Ok(_) => ToolStatus::Ok,
            ToolOutcome::Error(_) => ToolStatus::Error,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Ok(_))
    }

    pub fn payload(&self) -> Option<&Value> {
        match &self.outcome {
            ToolOutcome::Ok(payload) => Some(payload),
            ToolOutcome::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&ToolInvocationError> {
        match &self.outcome {
            ToolOutcome::Ok(_) => None,
            ToolOutcome::Error(err) => Some(err),
        }
    }

    /// Result for a call that never reached the backend.
    pub fn failed(call: &ToolCall, error: ToolInvocationError) -> Self {
        Self {
            call: call.key(),
            tool: call.tool,
            arguments: call.arguments.clone(),
            source_label: call.tool.default_source(&call.arguments),
            outcome: ToolOutcome::Error(error),
            attempts: 0,
            duration_ms: 0,
        }
    }
}

/// Append-only evidence for one request.
#[derive(Debug, Clone, Default)]
pub struct EvidenceSet {
    results: Vec<ToolResult>,
    keys: HashSet<CallKey>,
}

impl EvidenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &CallKey) -> bool {
        self.keys.contains(key)
    }

    /// Append a result; a second result for the same call key is dropped.
    pub fn push(&mut self, result: ToolResult) -> bool {
        if !self.keys.insert(result.call.clone()) {
            return false;
        }
        self.results.push(result);
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolResult> {
        self.results.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &CallKey> {
        self.results.iter().map(|result| &result.call)
    }

    pub fn successes(&self) -> impl Iterator<Item = &ToolResult> {
        self.results.iter().filter(|result| result.is_ok())
    }

    pub fn any_specific_success(&self) -> bool {
        self.successes().any(|result| result.tool.is_specific())
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

impl FromIterator<ToolResult> for EvidenceSet {
    fn from_iter<I: IntoIterator<Item = ToolResult>>(iter: I) -> Self {
        let mut evidence = EvidenceSet::new();
        for result in iter {
            evidence.push(result);
        }
        evidence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn call_key_ignores_argument_order_and_padding() {
        let a = ToolCall::new(ToolKind::WebSearch, json!({"query": "Tesla", "num_results": 5}));
        let b = ToolCall::new(ToolKind::WebSearch, json!({"num_results": 5, "query": " Tesla "}));
        let c = ToolCall::new(ToolKind::JobSearch, json!({"query": "Tesla"}));
        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn evidence_rejects_duplicate_calls() {
        let call = ToolCall::new(ToolKind::CompanyInfo, json!({"company_name": "Acme"}));
        let mut evidence = EvidenceSet::new();
        assert!(evidence.push(ToolResult::failed(&call, ToolInvocationError::Cancelled)));
        assert!(!evidence.push(ToolResult::failed(&call, ToolInvocationError::Cancelled)));
        assert_eq!(evidence.len(), 1);
        assert!(evidence.contains(&call.key()));
    }
}
