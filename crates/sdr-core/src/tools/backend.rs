use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ToolInvocationError;
use crate::evidence::ToolCall;

/// Result shape every extraction backend returns: `{success, data | error}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BackendResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// External research provider reached through the uniform tool contract.
///
/// Transport-level problems are reported as `Err`; provider-level rejections come
/// back as `Ok(BackendResponse { success: false, .. })`.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn call(&self, call: &ToolCall) -> Result<BackendResponse, ToolInvocationError>;
}

/// One canned response. `arguments` is matched as a subset of the call's
/// arguments; string values compare case-insensitively.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureEntry {
    pub tool: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    pub response: BackendResponse,
}

impl FixtureEntry {
    fn matches(&self, call: &ToolCall) -> bool {
        if self.tool != call.tool.as_str() {
            return false;
        }
        self.arguments
            .iter()
            .all(|(key, expected)| match (call.arguments.get(key), expected) {
                (Some(Value::String(actual)), Value::String(expected)) => {
                    actual.trim().eq_ignore_ascii_case(expected.trim())
                }
                (Some(actual), expected) => actual == expected,
                (None, _) => false,
            })
    }
}

/// Offline backend answering from canned payloads. First matching entry wins.
#[derive(Debug, Default)]
pub struct FixtureBackend {
    entries: Vec<FixtureEntry>,
    calls: AtomicUsize,
}

impl FixtureBackend {
    pub fn new(entries: Vec<FixtureEntry>) -> Self {
        Self {
            entries,
            calls: AtomicUsize::new(0),
        }
    }

    /// Load entries from a JSON array file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read fixture file {}", path.display()))?;
        let entries: Vec<FixtureEntry> = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse fixture file {}", path.display()))?;
        Ok(Self::new(entries))
    }

    pub fn with(mut self, tool: &str, arguments: Value, response: BackendResponse) -> Self {
        self.entries.push(FixtureEntry {
            tool: tool.to_string(),
            arguments: arguments.as_object().cloned().unwrap_or_default(),
            response,
        });
        self
    }

    /// Number of calls that reached this backend.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolBackend for FixtureBackend {
    fn name(&self) -> &str {
        "fixture"
    }

    async fn call(&self, call: &ToolCall) -> Result<BackendResponse, ToolInvocationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let response = self
            .entries
            .iter()
            .find(|entry| entry.matches(call))
            .map(|entry| entry.response.clone())
            .unwrap_or_else(|| {
                BackendResponse::failed(format!("no data found for {} request", call.tool))
            });
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolKind;
    use serde_json::json;

    #[tokio::test]
    async fn fixture_matches_argument_subset_case_insensitively() {
        let backend = FixtureBackend::default().with(
            "company_info",
            json!({"company_name": "acme corp"}),
            BackendResponse::ok(json!({"company_name": "Acme Corp"})),
        );

        let call = ToolCall::new(
            ToolKind::CompanyInfo,
            json!({"company_name": "Acme Corp", "platform": "linkedin"}),
        );
        let response = backend.call(&call).await.unwrap();
        assert!(response.success);

        let miss = ToolCall::new(ToolKind::CompanyInfo, json!({"company_name": "Globex"}));
        let response = backend.call(&miss).await.unwrap();
        assert!(!response.success);
        assert_eq!(backend.call_count(), 2);
    }

    #[test]
    fn fixture_file_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixtures.json");
        std::fs::write(
            &path,
            r#"[{"tool":"web_search","response":{"success":true,"data":[]}}]"#,
        )
        .unwrap();
        let backend = FixtureBackend::from_path(&path).unwrap();
        assert_eq!(backend.entries.len(), 1);
    }
}
