use anyhow::Result;
use once_cell::sync::OnceCell;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{KeyValue, global};
use tracing::info;

struct AssistantMetrics {
    tool_calls: Counter<u64>,
    tool_attempts: Counter<u64>,
    tool_duration_ms: Histogram<f64>,
    requests: Counter<u64>,
    request_duration_ms: Histogram<f64>,
    request_cycles: Histogram<u64>,
}

static METRICS: OnceCell<AssistantMetrics> = OnceCell::new();

fn handles() -> &'static AssistantMetrics {
    METRICS.get_or_init(|| {
        let meter: Meter = global::meter("sdr.assistant");
        AssistantMetrics {
            tool_calls: meter
                .u64_counter("sdr_tool_calls_total")
                .with_description("Tool invocations by tool and status")
                .init(),
            tool_attempts: meter
                .u64_counter("sdr_tool_attempts_total")
                .with_description("Backend attempts including retries")
                .init(),
            tool_duration_ms: meter
                .f64_histogram("sdr_tool_duration_ms")
                .with_description("Tool invocation latency in milliseconds")
                .init(),
            requests: meter
                .u64_counter("sdr_requests_total")
                .with_description("Answered requests by mode and stop reason")
                .init(),
            request_duration_ms: meter
                .f64_histogram("sdr_request_duration_ms")
                .with_description("End-to-end request latency in milliseconds")
                .init(),
            request_cycles: meter
                .u64_histogram("sdr_request_cycles")
                .with_description("Decide/act cycles per request")
                .init(),
        }
    })
}

/// Hint to operators that OTEL metrics export can be configured externally.
pub fn init_metrics_from_env(service_name: &str) -> Result<()> {
    if std::env::var("SDR_OTEL_METRICS_ENDPOINT").is_ok() {
        info!(
            target = "telemetry",
            "SDR_OTEL_METRICS_ENDPOINT detected for {service_name}. Configure an OTLP meter provider in your deployment to export assistant metrics."
        );
    }
    Ok(())
}

/// Record OTEL metrics for one tool invocation (no-op if no provider installed).
pub fn record_tool_metrics(tool: &str, status: &str, attempts: u32, duration_ms: u64) {
    let metrics = handles();
    let attrs = [
        KeyValue::new("tool", tool.to_string()),
        KeyValue::new("status", status.to_string()),
    ];

    metrics.tool_calls.add(1, &attrs);
    if attempts > 0 {
        metrics.tool_attempts.add(u64::from(attempts), &attrs);
        metrics.tool_duration_ms.record(duration_ms as f64, &attrs);
    }
}

/// Record OTEL metrics for a completed request.
pub fn record_request_metrics(mode: &str, stop_reason: &str, cycles: u32, duration_ms: u64) {
    let metrics = handles();
    let attrs = [
        KeyValue::new("mode", mode.to_string()),
        KeyValue::new("stop_reason", stop_reason.to_string()),
    ];

    metrics.requests.add(1, &attrs);
    metrics.request_duration_ms.record(duration_ms as f64, &attrs);
    metrics.request_cycles.record(u64::from(cycles), &attrs);
}
