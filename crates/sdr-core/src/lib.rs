//! Sales research assistant core.
//!
//! A request is classified as free text or structured, the selector picks research
//! tools, a decide/act loop gathers evidence through a single tool contract, and the
//! synthesizer turns that evidence into a cited narrative or a schema-shaped object.

pub mod config;
pub mod decision;
pub mod error;
mod eval;
pub mod events;
pub mod evidence;
mod logging;
pub mod metrics;
pub mod orchestrator;
pub mod request;
mod security;
pub mod selector;
pub mod synthesizer;
pub mod telemetry;
pub mod tools;
mod trace;
mod workflow;

pub use config::{BackendKind, Config, ConfigLoader, DeciderKind, DecisionConfig};
pub use decision::{Decision, DecisionContext, DecisionService, HeuristicDecider};
#[cfg(feature = "http-backend")]
pub use decision::HttpDecider;
pub use error::{ClassificationError, DecisionError, SdrError, ToolInvocationError};
pub use eval::{
    ComplianceReport, EvaluationHarness, EvaluationMetrics, FieldCheck, keyword_accuracy,
    structured_compliance,
};
pub use events::{Event, EventCollector, drain_into_trace};
pub use evidence::{CallKey, EvidenceSet, ToolCall, ToolOutcome, ToolResult, ToolStatus};
pub use logging::{
    RequestLogInput, RequestLogRecord, log_base_dir, log_request_completion, remove_request_logs,
};
pub use orchestrator::{LoopConfig, LoopOutcome, ResearchLoop, StopReason};
pub use request::{FieldSchema, FieldType, OutputMode, Request, classify, classify_payload};
pub use security::{SecretValue, require_env};
pub use selector::{FollowUp, PlannedCall, Selection, ToolSelector, TrustOrder};
pub use synthesizer::{Answer, AnswerBody, FieldCoercionWarning, FieldValues, Synthesizer};
pub use telemetry::{TelemetryOptions, init_telemetry};
pub use tools::{BackendResponse, FixtureBackend, ToolBackend, ToolInvoker, ToolKind};
pub use trace::{TraceCollector, TraceEvent, TraceStep, TraceSummary, persist_trace};
pub use workflow::{
    AnswerOptions, Assistant, AssistantReply, InputKind, ToolUsage, build_backend, build_decider,
};
