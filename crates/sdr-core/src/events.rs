//! Event bus for explainability and trace collection.
//!
//! The research loop reports request, decision and tool lifecycle events through
//! this fire-and-forget channel. A missing or closed receiver never affects answers.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::trace::TraceCollector;

/// Unique identifier for an event
pub type EventId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    RequestStarted {
        event_id: EventId,
        timestamp: u64,
        request_id: String,
        mode: String,
        query: String,
    },
    /// The decision service answered for a cycle.
    Decision {
        event_id: EventId,
        timestamp: u64,
        request_id: String,
        cycle: u32,
        decision: String,
        calls: Vec<String>,
    },
    ToolStarted {
        event_id: EventId,
        timestamp: u64,
        request_id: String,
        cycle: u32,
        call: String,
    },
    ToolFinished {
        event_id: EventId,
        timestamp: u64,
        request_id: String,
        cycle: u32,
        call: String,
        outcome: ToolEventOutcome,
        source_label: String,
        attempts: u32,
        duration_ms: u64,
    },
    RequestFinished {
        event_id: EventId,
        timestamp: u64,
        request_id: String,
        stop_reason: String,
        cycles: u32,
        duration_ms: u64,
    },
}

impl Event {
    pub fn event_id(&self) -> &str {
        match self {
            Event::RequestStarted { event_id, .. }
            | Event::Decision { event_id, .. }
            | Event::ToolStarted { event_id, .. }
            | Event::ToolFinished { event_id, .. }
            | Event::RequestFinished { event_id, .. } => event_id,
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            Event::RequestStarted { timestamp, .. }
            | Event::Decision { timestamp, .. }
            | Event::ToolStarted { timestamp, .. }
            | Event::ToolFinished { timestamp, .. }
            | Event::RequestFinished { timestamp, .. } => *timestamp,
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            Event::RequestStarted { request_id, .. }
            | Event::Decision { request_id, .. }
            | Event::ToolStarted { request_id, .. }
            | Event::ToolFinished { request_id, .. }
            | Event::RequestFinished { request_id, .. } => request_id,
        }
    }

    /// Short label and message used for trace rendering.
    pub fn describe(&self) -> (String, String) {
        match self {
            Event::RequestStarted { mode, query, .. } => {
                ("request".to_string(), format!("{mode}: {query}"))
            }
            Event::Decision {
                cycle,
                decision,
                calls,
                ..
            } => {
                let message = if calls.is_empty() {
                    decision.clone()
                } else {
                    format!("{decision} {}", calls.join(", "))
                };
                (format!("decide#{cycle}"), message)
            }
            Event::ToolStarted { cycle, call, .. } => (format!("act#{cycle}"), format!("start {call}")),
            Event::ToolFinished {
                cycle,
                call,
                outcome,
                source_label,
                attempts,
                ..
            } => {
                let status = match outcome {
                    ToolEventOutcome::Ok => "ok".to_string(),
                    ToolEventOutcome::Error { reason } => format!("error ({reason})"),
                };
                (
                    format!("act#{cycle}"),
                    format!("{call} -> {status} via {source_label} after {attempts} attempt(s)"),
                )
            }
            Event::RequestFinished {
                stop_reason,
                cycles,
                duration_ms,
                ..
            } => (
                "synthesize".to_string(),
                format!("{stop_reason} after {cycles} cycle(s) in {duration_ms}ms"),
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolEventOutcome {
    Ok,
    Error { reason: String },
}

/// Sending half of the event channel, cloned into every component that reports.
#[derive(Clone)]
pub struct EventCollector {
    sender: mpsc::UnboundedSender<Event>,
}

impl EventCollector {
    /// Create a new event collector
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn emit_request_started(&self, request_id: &str, mode: &str, query: &str) {
        self.send(Event::RequestStarted {
            event_id: generate_event_id(),
            timestamp: current_timestamp(),
            request_id: request_id.to_string(),
            mode: mode.to_string(),
            query: query.to_string(),
        });
    }

    pub fn emit_decision(&self, request_id: &str, cycle: u32, decision: &str, calls: Vec<String>) {
        self.send(Event::Decision {
            event_id: generate_event_id(),
            timestamp: current_timestamp(),
            request_id: request_id.to_string(),
            cycle,
            decision: decision.to_string(),
            calls,
        });
    }

    pub fn emit_tool_started(&self, request_id: &str, cycle: u32, call: &str) {
        self.send(Event::ToolStarted {
            event_id: generate_event_id(),
            timestamp: current_timestamp(),
            request_id: request_id.to_string(),
            cycle,
            call: call.to_string(),
        });
    }

    #[allow(clippy::too_many_arguments)]
    pub fn emit_tool_finished(
        &self,
        request_id: &str,
        cycle: u32,
        call: &str,
        outcome: ToolEventOutcome,
        source_label: &str,
        attempts: u32,
        duration_ms: u64,
    ) {
        self.send(Event::ToolFinished {
            event_id: generate_event_id(),
            timestamp: current_timestamp(),
            request_id: request_id.to_string(),
            cycle,
            call: call.to_string(),
            outcome,
            source_label: source_label.to_string(),
            attempts,
            duration_ms,
        });
    }

    pub fn emit_request_finished(
        &self,
        request_id: &str,
        stop_reason: &str,
        cycles: u32,
        duration_ms: u64,
    ) {
        self.send(Event::RequestFinished {
            event_id: generate_event_id(),
            timestamp: current_timestamp(),
            request_id: request_id.to_string(),
            stop_reason: stop_reason.to_string(),
            cycles,
            duration_ms,
        });
    }

    fn send(&self, event: Event) {
        if let Err(e) = self.sender.send(event) {
            tracing::trace!(error = %e, "event receiver dropped");
        }
    }
}

impl Default for EventCollector {
    fn default() -> Self {
        Self::new().0
    }
}

/// Generate a unique event ID
fn generate_event_id() -> EventId {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let id = COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("evt_{}", id)
}

/// Current Unix timestamp in milliseconds
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Drain every event currently buffered in `receiver` into a trace.
pub fn drain_into_trace(receiver: &mut mpsc::UnboundedReceiver<Event>) -> TraceCollector {
    let mut trace = TraceCollector::new();
    while let Ok(event) = receiver.try_recv() {
        trace.record_event(&event);
    }
    trace
}
