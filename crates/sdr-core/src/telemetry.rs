use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, fmt};

use crate::SdrError;

static TELEMETRY_GUARD: OnceLock<()> = OnceLock::new();

/// Configuration options when initialising telemetry.
#[derive(Debug, Clone)]
pub struct TelemetryOptions {
    /// Filter used when `RUST_LOG` is unset, e.g. the configured `[logging] level`.
    pub default_level: Option<String>,
    pub with_ansi: bool,
    /// Write log lines to stderr so stdout stays reserved for answers.
    pub to_stderr: bool,
}

impl Default for TelemetryOptions {
    fn default() -> Self {
        Self {
            default_level: None,
            with_ansi: true,
            to_stderr: true,
        }
    }
}

/// Initialise the global tracing subscriber.
///
/// Safe to call multiple times; only the first invocation installs the subscriber.
pub fn init_telemetry(options: TelemetryOptions) -> Result<(), SdrError> {
    if TELEMETRY_GUARD.get().is_some() {
        return Ok(());
    }

    let env_filter = std::env::var("RUST_LOG")
        .ok()
        .or(options.default_level)
        .unwrap_or_else(|| "info".to_string());

    let builder = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::new(env_filter))
        .with_ansi(options.with_ansi);

    let installed = if options.to_stderr {
        builder.with_writer(std::io::stderr).try_init()
    } else {
        builder.try_init()
    };
    installed
        .map_err(|err| SdrError::InvalidConfiguration(format!("telemetry init failed: {err}")))?;

    TELEMETRY_GUARD.get_or_init(|| ());
    Ok(())
}
