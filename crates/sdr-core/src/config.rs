use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::orchestrator::LoopConfig;
use crate::selector::{ToolSelector, TrustOrder};
use crate::tools::{InvocationPolicy, ResultCache, ToolKind};
use crate::{SdrError, SecretValue, require_env};

const DEFAULT_CONFIG_PATH: &str = "sdr.toml";
const CONFIG_PATH_ENV: &str = "SDR_CONFIG";

/// Top-level configuration. Every section has defaults, so an empty file (or no file
/// at all) is a valid configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: BackendConfig,
    pub tools: ToolsConfig,
    pub decision: DecisionConfig,
    pub orchestrator: OrchestratorConfig,
    pub selector: SelectorConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Resolve the backend API token (from environment only).
    pub fn backend_token(&self) -> Result<SecretValue, SdrError> {
        require_env(&self.backend.api_token_env)
    }

    /// Decision model token; optional, since local gateways often run without one.
    pub fn decision_token(&self) -> Option<SecretValue> {
        let name = self.decision.api_token_env.trim();
        if name.is_empty() {
            return None;
        }
        require_env(name).ok()
    }

    pub fn trust_order(&self) -> Result<TrustOrder, SdrError> {
        TrustOrder::parse(&self.selector.trust_order)
    }

    pub fn selector(&self) -> Result<ToolSelector, SdrError> {
        Ok(ToolSelector::new(
            self.trust_order()?,
            self.selector.confidence_threshold,
        ))
    }

    pub fn invocation_policy(&self) -> InvocationPolicy {
        InvocationPolicy {
            timeout: Duration::from_millis(self.tools.timeout_ms),
            max_retries: self.tools.max_retries,
            initial_backoff: Duration::from_millis(self.tools.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.tools.max_backoff_ms),
        }
    }

    pub fn result_cache(&self) -> Option<ResultCache> {
        self.tools.cache_enabled.then(|| {
            ResultCache::new(
                Duration::from_secs(self.tools.cache_ttl_secs),
                self.tools.cache_capacity,
            )
        })
    }

    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            max_cycles: self.orchestrator.max_cycles,
            max_in_flight: self.orchestrator.max_in_flight,
            decision_timeout: Duration::from_millis(self.orchestrator.decision_timeout_ms),
            decision_retries: self.orchestrator.decision_retries,
            decision_backoff: Duration::from_millis(self.orchestrator.decision_backoff_ms),
        }
    }

    /// Overall per-request deadline; `None` when disabled with `0`.
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.orchestrator.request_timeout_ms > 0)
            .then(|| Duration::from_millis(self.orchestrator.request_timeout_ms))
    }
}

/// Helper to load configuration with guard rails.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a provided path or discoverable defaults.
    ///
    /// Resolution order:
    /// 1. Explicit `path` argument.
    /// 2. `SDR_CONFIG` environment variable.
    /// 3. `sdr.toml` in the current working directory, if present.
    ///
    /// An explicitly named file must exist; a missing default file yields
    /// `Config::default()`.
    pub fn load(path: Option<PathBuf>) -> Result<Config, SdrError> {
        let (candidate, explicit) = resolve_path(path);
        if !explicit && !candidate.exists() {
            let config = Config::default();
            Self::validate(&config)?;
            return Ok(config);
        }

        let raw = fs::read_to_string(&candidate)
            .map_err(|err| SdrError::config_io(candidate.clone(), err))?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Config, SdrError> {
        let config: Config =
            toml::from_str(raw).map_err(|err| SdrError::InvalidConfiguration(err.to_string()))?;
        Self::validate(&config)?;
        Ok(config)
    }

    fn validate(config: &Config) -> Result<(), SdrError> {
        config.trust_order()?;

        let threshold = config.selector.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(SdrError::InvalidConfiguration(format!(
                "selector.confidence_threshold must be within 0..=1, got {threshold}"
            )));
        }
        if config.orchestrator.max_cycles == 0 {
            return Err(SdrError::InvalidConfiguration(
                "orchestrator.max_cycles must be at least 1".into(),
            ));
        }
        if config.orchestrator.max_in_flight == Some(0) {
            return Err(SdrError::InvalidConfiguration(
                "orchestrator.max_in_flight must be at least 1 when set".into(),
            ));
        }
        if config.tools.timeout_ms == 0 {
            return Err(SdrError::InvalidConfiguration(
                "tools.timeout_ms must be positive".into(),
            ));
        }
        if config.tools.cache_enabled && config.tools.cache_capacity == 0 {
            return Err(SdrError::InvalidConfiguration(
                "tools.cache_capacity must be positive when the cache is enabled".into(),
            ));
        }

        match config.backend.kind {
            BackendKind::Http => {
                if config.backend.api_token_env.trim().is_empty() {
                    return Err(SdrError::InvalidConfiguration(
                        "backend.api_token_env must reference an environment variable".into(),
                    ));
                }
            }
            BackendKind::Fixture => {
                if config.backend.fixture_path.is_none() {
                    return Err(SdrError::InvalidConfiguration(
                        "backend.fixture_path is required for the fixture backend".into(),
                    ));
                }
            }
        }

        if config.decision.kind == DeciderKind::Http && config.decision.base_url.trim().is_empty()
        {
            return Err(SdrError::InvalidConfiguration(
                "decision.base_url is required for the http decision service".into(),
            ));
        }
        Ok(())
    }
}

fn resolve_path(path: Option<PathBuf>) -> (PathBuf, bool) {
    if let Some(path) = path {
        return (path, true);
    }

    if let Ok(from_env) = env::var(CONFIG_PATH_ENV) {
        if !from_env.trim().is_empty() {
            return (PathBuf::from(from_env), true);
        }
    }

    (Path::new(DEFAULT_CONFIG_PATH).to_path_buf(), false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Http,
    Fixture,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub base_url: String,
    pub api_token_env: String,
    pub fixture_path: Option<PathBuf>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Http,
            base_url: "http://127.0.0.1:8931".to_string(),
            api_token_env: "SDR_API_TOKEN".to_string(),
            fixture_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeciderKind {
    /// Rule-based planning from query signals.
    #[default]
    Heuristic,
    /// Language model behind a JSON endpoint.
    Http,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    pub kind: DeciderKind,
    pub base_url: String,
    pub api_token_env: String,
    pub model: Option<String>,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            kind: DeciderKind::Heuristic,
            base_url: "http://127.0.0.1:8932".to_string(),
            api_token_env: "SDR_DECISION_TOKEN".to_string(),
            model: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub cache_enabled: bool,
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            cache_enabled: false,
            cache_ttl_secs: 900,
            cache_capacity: 512,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_cycles: u32,
    pub max_in_flight: Option<usize>,
    pub decision_timeout_ms: u64,
    pub decision_retries: u32,
    pub decision_backoff_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_cycles: 3,
            max_in_flight: None,
            decision_timeout_ms: 20_000,
            decision_retries: 2,
            decision_backoff_ms: 250,
            request_timeout_ms: 45_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub trust_order: Vec<String>,
    pub confidence_threshold: f32,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            trust_order: ToolKind::ALL.iter().map(|kind| kind.to_string()).collect(),
            confidence_threshold: 0.6,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Append a JSON-lines record per answered request.
    pub request_log: bool,
    pub trace_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            request_log: true,
            trace_dir: None,
        }
    }
}
