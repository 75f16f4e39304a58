//! Decide/act research loop.
//!
//! An explicit state machine (`Decide -> Act -> Decide ... -> Synthesize`) that
//! gathers evidence for one request. Calls within an act phase fan out under a
//! semaphore and fold back in issue order; cancellation stops the current phase and
//! hands whatever landed to synthesis.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::decision::{Decision, DecisionContext, DecisionService};
use crate::error::{DecisionError, ToolInvocationError};
use crate::events::{EventCollector, ToolEventOutcome};
use crate::evidence::{CallKey, EvidenceSet, ToolCall, ToolResult};
use crate::metrics::record_request_metrics;
use crate::request::Request;
use crate::selector::{FollowUp, PlannedCall};
use crate::synthesizer::field_resolvable;
use crate::tools::{ToolInvoker, ToolKind, ToolSpec, catalogue};

/// Configuration for loop behaviour
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Maximum act phases per request
    pub max_cycles: u32,
    /// Concurrent calls per act phase; `None` means one slot per distinct tool in the batch
    pub max_in_flight: Option<usize>,
    pub decision_timeout: Duration,
    /// Retries for transient decision failures
    pub decision_retries: u32,
    pub decision_backoff: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_cycles: 3,
            max_in_flight: None,
            decision_timeout: Duration::from_secs(20),
            decision_retries: 2,
            decision_backoff: Duration::from_millis(250),
        }
    }
}

/// Why the loop stopped gathering evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Evidence already covers the request.
    Sufficient,
    /// The decision service declared the evidence sufficient.
    DecisionSufficient,
    CycleCap,
    /// Every call the decision service asked for had already been made.
    NoNewCalls,
    DecisionFailed,
    Cancelled,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Sufficient => "sufficient",
            StopReason::DecisionSufficient => "decision_sufficient",
            StopReason::CycleCap => "cycle_cap",
            StopReason::NoNewCalls => "no_new_calls",
            StopReason::DecisionFailed => "decision_failed",
            StopReason::Cancelled => "cancelled",
        }
    }
}

/// Evidence gathered for one request and how gathering ended.
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub request_id: String,
    pub evidence: EvidenceSet,
    pub cycles: u32,
    pub stop_reason: StopReason,
    pub duration_ms: u64,
}

enum LoopState {
    Decide,
    Act(Vec<PlannedCall>),
    Synthesize(StopReason),
}

enum Interrupted {
    Cancelled,
    Failed(DecisionError),
}

#[derive(Clone)]
pub struct ResearchLoop {
    invoker: ToolInvoker,
    decider: Arc<dyn DecisionService>,
    config: LoopConfig,
    events: Option<EventCollector>,
    catalogue: Vec<ToolSpec>,
}

impl ResearchLoop {
    pub fn new(invoker: ToolInvoker, decider: Arc<dyn DecisionService>, config: LoopConfig) -> Self {
        Self {
            invoker,
            decider,
            config,
            events: None,
            catalogue: catalogue(),
        }
    }

    pub fn with_events(mut self, events: EventCollector) -> Self {
        self.events = Some(events);
        self
    }

    /// Gather evidence for a classified request. Always terminates with an outcome;
    /// tool and decision failures only shape what evidence is available.
    pub async fn run(&self, request: &Request, cancel: &CancellationToken) -> LoopOutcome {
        let request_id = Uuid::new_v4().to_string();
        self.run_with_id(&request_id, request, cancel).await
    }

    #[instrument(name = "research_loop", skip(self, request, cancel), fields(mode = request.mode_label()))]
    pub async fn run_with_id(
        &self,
        request_id: &str,
        request: &Request,
        cancel: &CancellationToken,
    ) -> LoopOutcome {
        let started = Instant::now();
        if let Some(events) = &self.events {
            events.emit_request_started(request_id, request.mode_label(), request.query());
        }

        let mut evidence = EvidenceSet::new();
        let mut cycles: u32 = 0;
        let mut state = LoopState::Decide;

        let stop_reason = loop {
            state = match state {
                LoopState::Decide => {
                    self.decide(request_id, request, &evidence, cycles, cancel)
                        .await
                }
                LoopState::Act(batch) => {
                    let cancelled = self
                        .act(request_id, cycles, batch, &mut evidence, cancel)
                        .await;
                    cycles += 1;
                    if cancelled {
                        LoopState::Synthesize(StopReason::Cancelled)
                    } else {
                        LoopState::Decide
                    }
                }
                LoopState::Synthesize(reason) => break reason,
            };
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(
            cycles,
            evidence = evidence.len(),
            stop_reason = stop_reason.as_str(),
            duration_ms,
            "research loop finished"
        );
        record_request_metrics(request.mode_label(), stop_reason.as_str(), cycles, duration_ms);
        if let Some(events) = &self.events {
            events.emit_request_finished(request_id, stop_reason.as_str(), cycles, duration_ms);
        }

        LoopOutcome {
            request_id: request_id.to_string(),
            evidence,
            cycles,
            stop_reason,
            duration_ms,
        }
    }

    async fn decide(
        &self,
        request_id: &str,
        request: &Request,
        evidence: &EvidenceSet,
        cycles: u32,
        cancel: &CancellationToken,
    ) -> LoopState {
        if cancel.is_cancelled() {
            return LoopState::Synthesize(StopReason::Cancelled);
        }
        if is_sufficient(request, evidence) {
            return LoopState::Synthesize(StopReason::Sufficient);
        }
        if cycles >= self.config.max_cycles {
            debug!(cycles, "cycle cap reached");
            return LoopState::Synthesize(StopReason::CycleCap);
        }

        let ctx = DecisionContext {
            request,
            evidence,
            catalogue: &self.catalogue,
            cycle: cycles,
            max_cycles: self.config.max_cycles,
        };

        match self.consult(ctx, cancel).await {
            Ok(Decision::Sufficient) => {
                self.emit_decision(request_id, cycles, "sufficient", &[]);
                LoopState::Synthesize(StopReason::DecisionSufficient)
            }
            Ok(Decision::Invoke(calls)) => {
                let requested = calls.len();
                let mut batch_keys = HashSet::new();
                let fresh: Vec<PlannedCall> = calls
                    .into_iter()
                    .filter(|planned| {
                        let key = planned_key(planned);
                        !evidence.contains(&key) && batch_keys.insert(key)
                    })
                    .collect();
                if fresh.len() < requested {
                    debug!(
                        requested,
                        fresh = fresh.len(),
                        "dropped repeated tool calls from decision"
                    );
                }
                self.emit_decision(request_id, cycles, "invoke", &fresh);
                if fresh.is_empty() {
                    LoopState::Synthesize(StopReason::NoNewCalls)
                } else {
                    LoopState::Act(fresh)
                }
            }
            Err(Interrupted::Cancelled) => LoopState::Synthesize(StopReason::Cancelled),
            Err(Interrupted::Failed(err)) => {
                warn!(error = %err, "decision service failed, synthesizing from current evidence");
                self.emit_decision(request_id, cycles, "failed", &[]);
                LoopState::Synthesize(StopReason::DecisionFailed)
            }
        }
    }

    /// Ask the decision service, retrying transient failures with backoff.
    async fn consult(
        &self,
        ctx: DecisionContext<'_>,
        cancel: &CancellationToken,
    ) -> Result<Decision, Interrupted> {
        let mut attempt: u32 = 0;
        let mut backoff = self.config.decision_backoff;

        loop {
            attempt += 1;
            let pending = tokio::time::timeout(self.config.decision_timeout, self.decider.decide(ctx));
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Interrupted::Cancelled),
                result = pending => result
                    .unwrap_or(Err(DecisionError::Timeout(self.config.decision_timeout))),
            };

            match result {
                Ok(decision) => return Ok(decision),
                Err(err) if err.is_transient() && attempt <= self.config.decision_retries => {
                    warn!(
                        decider = self.decider.name(),
                        error = %err,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "decision failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(Interrupted::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = backoff.saturating_mul(2);
                }
                Err(err) => return Err(Interrupted::Failed(err)),
            }
        }
    }

    /// Run one batch. Returns `true` when cancelled before every call landed.
    #[instrument(skip(self, batch, evidence, cancel), fields(calls = batch.len()))]
    async fn act(
        &self,
        request_id: &str,
        cycle: u32,
        batch: Vec<PlannedCall>,
        evidence: &mut EvidenceSet,
        cancel: &CancellationToken,
    ) -> bool {
        let distinct_tools = batch
            .iter()
            .map(|planned| planned.tool)
            .collect::<HashSet<ToolKind>>()
            .len();
        let limit = self.config.max_in_flight.unwrap_or(distinct_tools).max(1);
        let semaphore = Arc::new(Semaphore::new(limit));

        let mut known: HashSet<CallKey> = evidence.keys().cloned().collect();
        known.extend(batch.iter().map(planned_key));
        let known = Arc::new(known);

        let total = batch.len();
        let (landed_tx, mut landed) = mpsc::unbounded_channel::<(usize, ToolResult)>();
        let mut tasks = JoinSet::new();
        for (slot, planned) in batch.into_iter().enumerate() {
            let invoker = self.invoker.clone();
            let semaphore = Arc::clone(&semaphore);
            let events = self.events.clone();
            let request_id = request_id.to_string();
            let known = Arc::clone(&known);
            let landed_tx = landed_tx.clone();

            tasks.spawn(async move {
                let reporter = Reporter {
                    events: events.as_ref(),
                    request_id: &request_id,
                    cycle,
                };
                let call = ToolCall::new(planned.tool, planned.arguments);
                let parent = run_call(&invoker, &semaphore, &reporter, call).await;

                let follow_ups = match (planned.follow_up, parent.payload()) {
                    (Some(follow_up), Some(payload)) => follow_up_calls(follow_up, payload, &known),
                    _ => Vec::new(),
                };
                // Each result is handed over as soon as it lands.
                if landed_tx.send((slot, parent)).is_err() {
                    return;
                }
                for call in follow_ups {
                    let result = run_call(&invoker, &semaphore, &reporter, call).await;
                    if landed_tx.send((slot, result)).is_err() {
                        return;
                    }
                }
            });
        }
        drop(landed_tx);

        let mut slots: Vec<Vec<ToolResult>> = (0..total).map(|_| Vec::new()).collect();
        let cancelled = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    while let Ok((slot, result)) = landed.try_recv() {
                        land(&mut slots, slot, result);
                    }
                    warn!(
                        landed = slots.iter().map(Vec::len).sum::<usize>(),
                        total,
                        "act phase cancelled"
                    );
                    break true;
                }
                received = landed.recv() => match received {
                    Some((slot, result)) => land(&mut slots, slot, result),
                    None => break false,
                },
            }
        };

        if !cancelled {
            while let Some(joined) = tasks.join_next().await {
                if let Err(err) = joined {
                    warn!(error = %err, "tool task did not complete");
                }
            }
        }

        for result in slots.into_iter().flatten() {
            let key = result.call.clone();
            if !evidence.push(result) {
                debug!(call = %key, "discarding repeated result");
            }
        }
        cancelled
    }

    fn emit_decision(&self, request_id: &str, cycle: u32, decision: &str, calls: &[PlannedCall]) {
        if let Some(events) = &self.events {
            let calls = calls.iter().map(|planned| planned_key(planned).to_string()).collect();
            events.emit_decision(request_id, cycle, decision, calls);
        }
    }
}

/// Structured: every requested field resolves from a successful result.
/// Free text: at least one entity-specific tool succeeded.
pub fn is_sufficient(request: &Request, evidence: &EvidenceSet) -> bool {
    match request.field_schema() {
        Some(schema) => schema
            .names()
            .all(|field| field_resolvable(evidence, field)),
        None => evidence.any_specific_success(),
    }
}

/// Results within a slot keep their landing order: parent first, then follow-ups.
fn land(slots: &mut [Vec<ToolResult>], slot: usize, result: ToolResult) {
    if let Some(entry) = slots.get_mut(slot) {
        entry.push(result);
    }
}

fn planned_key(planned: &PlannedCall) -> CallKey {
    ToolCall::new(planned.tool, planned.arguments.clone()).key()
}

struct Reporter<'a> {
    events: Option<&'a EventCollector>,
    request_id: &'a str,
    cycle: u32,
}

async fn run_call(
    invoker: &ToolInvoker,
    semaphore: &Semaphore,
    reporter: &Reporter<'_>,
    call: ToolCall,
) -> ToolResult {
    let Ok(_permit) = semaphore.acquire().await else {
        return ToolResult::failed(&call, ToolInvocationError::Cancelled);
    };
    let label = call.key().to_string();
    if let Some(events) = reporter.events {
        events.emit_tool_started(reporter.request_id, reporter.cycle, &label);
    }

    let result = invoker.invoke(&call).await;

    if let Some(events) = reporter.events {
        let outcome = match result.error() {
            None => ToolEventOutcome::Ok,
            Some(err) => ToolEventOutcome::Error {
                reason: err.to_string(),
            },
        };
        events.emit_tool_finished(
            reporter.request_id,
            reporter.cycle,
            &label,
            outcome,
            &result.source_label,
            result.attempts,
            result.duration_ms,
        );
    }
    result
}

fn follow_up_calls(follow_up: FollowUp, payload: &Value, known: &HashSet<CallKey>) -> Vec<ToolCall> {
    match follow_up {
        FollowUp::ScrapeTopResults { limit } => {
            let mut urls = Vec::new();
            collect_urls(payload, limit, &mut urls);
            urls.into_iter()
                .map(|url| ToolCall::new(ToolKind::ScrapeUrl, json!({ "url": url })))
                .filter(|call| !known.contains(&call.key()))
                .collect()
        }
    }
}

/// URLs from search-style payloads: arrays of hits, or objects holding them under
/// `results`, `organic`, `items` or `data`.
fn collect_urls(payload: &Value, limit: usize, urls: &mut Vec<String>) {
    if urls.len() >= limit {
        return;
    }
    match payload {
        Value::String(text) if text.starts_with("http://") || text.starts_with("https://") => {
            if !urls.contains(text) {
                urls.push(text.clone());
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_urls(item, limit, urls);
                if urls.len() >= limit {
                    break;
                }
            }
        }
        Value::Object(map) => {
            for key in ["url", "link"] {
                if let Some(url) = map.get(key) {
                    collect_urls(url, limit, urls);
                }
            }
            for key in ["results", "organic", "items", "data"] {
                if let Some(nested) = map.get(key) {
                    collect_urls(nested, limit, urls);
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{BackendResponse, FixtureBackend, InvocationPolicy, ToolBackend};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    struct Scripted(Vec<PlannedCall>);

    #[async_trait]
    impl DecisionService for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn decide(&self, _ctx: DecisionContext<'_>) -> Result<Decision, DecisionError> {
            Ok(Decision::Invoke(self.0.clone()))
        }
    }

    /// Fails a fixed number of times, then declares the evidence sufficient.
    struct Flaky {
        failures: u32,
        error: DecisionError,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32, error: DecisionError) -> Self {
            Self {
                failures,
                error,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl DecisionService for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn decide(&self, _ctx: DecisionContext<'_>) -> Result<Decision, DecisionError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(self.error.clone())
            } else {
                Ok(Decision::Sufficient)
            }
        }
    }

    struct Hanging {
        calls: AtomicU32,
    }

    #[async_trait]
    impl DecisionService for Hanging {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn decide(&self, _ctx: DecisionContext<'_>) -> Result<Decision, DecisionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(Decision::Sufficient)
        }
    }

    /// Answers from fixtures, except for one tool that never returns in time.
    struct Stalling {
        fixtures: FixtureBackend,
        stalled: ToolKind,
    }

    #[async_trait]
    impl ToolBackend for Stalling {
        fn name(&self) -> &str {
            "stalling"
        }

        async fn call(&self, call: &ToolCall) -> Result<BackendResponse, ToolInvocationError> {
            if call.tool == self.stalled {
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
            self.fixtures.call(call).await
        }
    }

    /// Records the high-water mark of concurrent calls.
    #[derive(Default)]
    struct PeakTracking {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl ToolBackend for PeakTracking {
        fn name(&self) -> &str {
            "peak"
        }

        async fn call(&self, _call: &ToolCall) -> Result<BackendResponse, ToolInvocationError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(BackendResponse::ok(json!({"source": "peak.example.com"})))
        }
    }

    fn decision_config() -> LoopConfig {
        LoopConfig {
            decision_timeout: Duration::from_millis(20),
            decision_retries: 2,
            decision_backoff: Duration::from_millis(1),
            ..LoopConfig::default()
        }
    }

    fn idle_loop(decider: Arc<dyn DecisionService>, config: LoopConfig) -> ResearchLoop {
        let invoker = ToolInvoker::new(Arc::new(FixtureBackend::default()), fast_policy());
        ResearchLoop::new(invoker, decider, config)
    }

    fn fast_policy() -> InvocationPolicy {
        InvocationPolicy {
            timeout: Duration::from_millis(200),
            max_retries: 0,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
        }
    }

    #[test]
    fn urls_are_collected_from_search_hits() {
        let payload = json!({
            "organic": [
                {"title": "a", "link": "https://a.example.com"},
                {"title": "b", "url": "https://b.example.com"},
                {"title": "c", "url": "https://c.example.com"}
            ]
        });
        let mut urls = Vec::new();
        collect_urls(&payload, 2, &mut urls);
        assert_eq!(urls, vec!["https://a.example.com", "https://b.example.com"]);
    }

    #[tokio::test]
    async fn follow_ups_land_after_their_parent() {
        let backend = Arc::new(
            FixtureBackend::default()
                .with(
                    "web_search",
                    json!({}),
                    BackendResponse::ok(json!([
                        {"title": "Acme", "url": "https://acme.example.com"}
                    ])),
                )
                .with(
                    "scrape_url",
                    json!({}),
                    BackendResponse::ok(json!("Acme builds rockets")),
                ),
        );
        let invoker = ToolInvoker::new(backend, fast_policy());
        let decider = Scripted(vec![
            PlannedCall::new(ToolKind::WebSearch, json!({"query": "Acme"}))
                .with_follow_up(FollowUp::ScrapeTopResults { limit: 2 }),
        ]);
        let research = ResearchLoop::new(
            invoker,
            Arc::new(decider),
            LoopConfig {
                max_cycles: 1,
                ..LoopConfig::default()
            },
        );

        let outcome = research
            .run(&Request::free_text("Acme"), &CancellationToken::new())
            .await;
        let tools: Vec<ToolKind> = outcome.evidence.iter().map(|result| result.tool).collect();
        assert_eq!(tools, vec![ToolKind::WebSearch, ToolKind::ScrapeUrl]);
        assert_eq!(outcome.stop_reason, StopReason::CycleCap);
        assert_eq!(outcome.cycles, 1);
    }

    #[tokio::test]
    async fn cancelled_follow_up_keeps_its_landed_parent() {
        let fixtures = FixtureBackend::default()
            .with(
                "web_search",
                json!({}),
                BackendResponse::ok(json!([{"url": "https://acme.example.com"}])),
            )
            .with("scrape_url", json!({}), BackendResponse::ok(json!("too late")));
        let backend = Stalling {
            fixtures,
            stalled: ToolKind::ScrapeUrl,
        };
        let invoker = ToolInvoker::new(
            Arc::new(backend),
            InvocationPolicy {
                timeout: Duration::from_secs(30),
                ..fast_policy()
            },
        );
        let decider = Scripted(vec![
            PlannedCall::new(ToolKind::WebSearch, json!({"query": "Acme"}))
                .with_follow_up(FollowUp::ScrapeTopResults { limit: 1 }),
        ]);
        let research = ResearchLoop::new(invoker, Arc::new(decider), LoopConfig::default());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            research.run(&Request::free_text("Acme"), &cancel),
        )
        .await
        .expect("cancellation ends the act phase");

        assert_eq!(outcome.stop_reason, StopReason::Cancelled);
        assert_eq!(outcome.evidence.len(), 1);
        let landed = outcome.evidence.iter().next().unwrap();
        assert_eq!(landed.tool, ToolKind::WebSearch);
        assert!(landed.is_ok());
    }

    #[tokio::test]
    async fn transient_decision_failures_are_retried() {
        let decider = Arc::new(Flaky::new(2, DecisionError::Unavailable("503".into())));
        let research = idle_loop(decider.clone(), decision_config());

        let outcome = research
            .run(&Request::free_text("Acme"), &CancellationToken::new())
            .await;

        assert_eq!(decider.calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.stop_reason, StopReason::DecisionSufficient);
    }

    #[tokio::test]
    async fn exhausted_decision_retries_stop_the_loop() {
        let decider = Arc::new(Flaky::new(u32::MAX, DecisionError::Unavailable("503".into())));
        let research = idle_loop(decider.clone(), decision_config());

        let outcome = research
            .run(&Request::free_text("Acme"), &CancellationToken::new())
            .await;

        assert_eq!(decider.calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.stop_reason, StopReason::DecisionFailed);
        assert!(outcome.evidence.is_empty());
    }

    #[tokio::test]
    async fn unusable_plans_fail_without_retry() {
        let decider = Arc::new(Flaky::new(
            u32::MAX,
            DecisionError::InvalidPlan("unknown tool `fax`".into()),
        ));
        let research = idle_loop(decider.clone(), decision_config());

        let outcome = research
            .run(&Request::free_text("Acme"), &CancellationToken::new())
            .await;

        assert_eq!(decider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.stop_reason, StopReason::DecisionFailed);
    }

    #[tokio::test]
    async fn hung_decisions_time_out_and_retry() {
        let decider = Arc::new(Hanging {
            calls: AtomicU32::new(0),
        });
        let research = idle_loop(
            decider.clone(),
            LoopConfig {
                decision_retries: 1,
                ..decision_config()
            },
        );

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            research.run(&Request::free_text("Acme"), &CancellationToken::new()),
        )
        .await
        .expect("decision timeout bounds the loop");

        assert_eq!(decider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.stop_reason, StopReason::DecisionFailed);
    }

    fn distinct_tool_batch() -> Vec<PlannedCall> {
        vec![
            PlannedCall::new(ToolKind::CompanyInfo, json!({"company_name": "Acme"})),
            PlannedCall::new(ToolKind::WebSearch, json!({"query": "Acme"})),
            PlannedCall::new(ToolKind::JobSearch, json!({"query": "Acme sales hiring"})),
        ]
    }

    async fn peak_in_flight(max_in_flight: Option<usize>) -> usize {
        let backend = Arc::new(PeakTracking::default());
        let invoker = ToolInvoker::new(backend.clone(), fast_policy());
        let research = ResearchLoop::new(
            invoker,
            Arc::new(Scripted(distinct_tool_batch())),
            LoopConfig {
                max_cycles: 1,
                max_in_flight,
                ..LoopConfig::default()
            },
        );
        let outcome = research
            .run(&Request::free_text("Acme"), &CancellationToken::new())
            .await;
        assert_eq!(outcome.evidence.len(), 3);
        backend.peak.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn in_flight_limit_serialises_calls() {
        assert_eq!(peak_in_flight(Some(1)).await, 1);
    }

    #[tokio::test]
    async fn distinct_tools_run_in_parallel_by_default() {
        assert_eq!(peak_in_flight(None).await, 3);
    }
}
