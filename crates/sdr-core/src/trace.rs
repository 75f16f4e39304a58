use std::fmt::Write as _;
use std::fs::{File, create_dir_all};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::events::Event;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub stage: String,
    pub message: String,
    pub timestamp_ms: u128,
}

impl TraceEvent {
    pub fn new(stage: impl Into<String>, message: impl Into<String>) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self {
            stage: stage.into(),
            message: message.into(),
            timestamp_ms,
        }
    }
}

/// Ordered record of what happened while answering one request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceCollector {
    events: Vec<TraceEvent>,
}

impl TraceCollector {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn record(&mut self, stage: impl Into<String>, message: impl Into<String>) {
        self.events.push(TraceEvent::new(stage, message));
    }

    pub fn record_event(&mut self, event: &Event) {
        let (stage, message) = event.describe();
        self.events.push(TraceEvent {
            stage,
            message,
            timestamp_ms: u128::from(event.timestamp()),
        });
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn summary(&self) -> TraceSummary {
        TraceSummary::from_events(&self.events)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceStep {
    pub index: usize,
    pub stage: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceSummary {
    pub steps: Vec<TraceStep>,
}

impl TraceSummary {
    pub fn from_events(events: &[TraceEvent]) -> Self {
        let steps = events
            .iter()
            .enumerate()
            .map(|(idx, event)| TraceStep {
                index: idx + 1,
                stage: event.stage.clone(),
                message: event.message.clone(),
            })
            .collect();
        Self { steps }
    }

    pub fn render_markdown(&self) -> String {
        if self.steps.is_empty() {
            return "No trace events recorded.".to_string();
        }
        let mut output = String::from("### Trace Summary\n");
        for step in &self.steps {
            let _ = writeln!(output, "{}. {} -> {}", step.index, step.stage, step.message);
        }
        output
    }

    pub fn render_mermaid(&self) -> String {
        if self.steps.is_empty() {
            return "flowchart TD\n  %% no trace events captured".to_string();
        }

        let mut output = String::from("flowchart TD\n  %% auto-generated trace\n");
        for step in &self.steps {
            let node_id = format!("step{}", step.index);
            let label = sanitize_mermaid(&format!("{}: {}", step.stage, step.message));
            let _ = writeln!(output, "  {node_id}[\"{label}\"]");
        }

        for idx in 1..self.steps.len() {
            let _ = writeln!(output, "  step{idx} --> step{}", idx + 1);
        }

        output
    }
}

fn sanitize_mermaid(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('[', "(")
        .replace(']', ")")
        .replace('\n', "<br/>")
}

pub fn persist_trace<P: AsRef<Path>>(
    dir: P,
    request_id: &str,
    events: &[TraceEvent],
) -> Result<PathBuf> {
    let dir = dir.as_ref();
    create_dir_all(dir)
        .with_context(|| format!("failed to create trace directory {}", dir.display()))?;
    let path = dir.join(format!("{request_id}.json"));
    let payload = serde_json::to_vec_pretty(events)?;
    let mut file = File::create(&path)
        .with_context(|| format!("failed to create trace file {}", path.display()))?;
    file.write_all(&payload)
        .with_context(|| format!("failed to write trace file {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markdown_renders_steps() {
        let mut collector = TraceCollector::new();
        collector.record("decide#0", "invoke company_info, web_search");
        collector.record("synthesize", "sufficient after 1 cycle(s)");

        let markdown = collector.summary().render_markdown();

        assert!(markdown.contains("1. decide#0"));
        assert!(markdown.contains("2. synthesize"));
    }

    #[test]
    fn mermaid_links_consecutive_steps() {
        let mut collector = TraceCollector::new();
        collector.record("request", "free_text: Research [Tesla]");
        collector.record("act#0", "company_info -> ok");

        let mermaid = collector.summary().render_mermaid();
        assert!(mermaid.contains("flowchart TD"));
        assert!(mermaid.contains("(Tesla)"));
        assert!(mermaid.contains("step1 --> step2"));
    }

    #[test]
    fn traces_persist_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let mut collector = TraceCollector::new();
        collector.record("request", "structured: Acme Corp");

        let path = persist_trace(dir.path(), "req-42", collector.events()).unwrap();
        let raw = std::fs::read_to_string(path).unwrap();
        let restored: Vec<TraceEvent> = serde_json::from_str(&raw).unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].stage, "request");
    }
}
