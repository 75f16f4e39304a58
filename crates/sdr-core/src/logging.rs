use anyhow::{Context, Result};
use chrono::{Datelike, Utc};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions, create_dir_all};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::warn;

const LOG_DIR_ENV: &str = "SDR_LOG_DIR";
const RETENTION_ENV: &str = "SDR_LOG_RETENTION_DAYS";
const DEFAULT_LOG_DIR: &str = "data/logs";
const DEFAULT_RETENTION_DAYS: u64 = 90;
pub const REQUEST_LOG_FILE: &str = "requests.jsonl";
const AUDIT_LOG_FILE: &str = "audit.jsonl";

static REDACTION_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    [
        ("api_key", r"(?i)(api[_-]?key\s*[:=]\s*)([A-Za-z0-9\-_.+/]+)"),
        ("token", r"(?i)(token\s*[:=]\s*)([A-Za-z0-9\-_.+/]+)"),
        ("secret", r"(?i)(secret\s*[:=]\s*)([A-Za-z0-9\-_.+/]+)"),
        ("bearer", r"(?i)(bearer\s+)([A-Za-z0-9\-_.+=/]+)"),
        ("sk_token", r"(sk-[A-Za-z0-9]{16,})"),
    ]
    .into_iter()
    .filter_map(|(name, pattern)| match Regex::new(pattern) {
        Ok(regex) => Some((name, regex)),
        Err(err) => {
            warn!(pattern = name, %err, "skipping invalid redaction pattern");
            None
        }
    })
    .collect()
});

/// What gets recorded about one answered request.
#[derive(Debug, Clone)]
pub struct RequestLogInput {
    pub request_id: String,
    pub query: String,
    pub mode: String,
    pub answer: String,
    pub citations: Vec<String>,
    pub tools: Vec<String>,
    pub cycles: u32,
    pub stop_reason: String,
    pub duration_ms: u64,
    /// Structured requests only: every schema key present with a value of its declared type.
    pub structured_compliant: Option<bool>,
    pub trace_path: Option<String>,
}

/// One line of `requests.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLogRecord {
    pub timestamp: String,
    pub request_id: String,
    pub query: String,
    pub mode: String,
    pub answer: String,
    #[serde(default)]
    pub citations: Vec<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub cycles: u32,
    #[serde(default)]
    pub stop_reason: String,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub structured_compliant: Option<bool>,
    #[serde(default)]
    pub trace_path: Option<String>,
    #[serde(default)]
    pub redactions: Vec<String>,
}

#[derive(Serialize)]
struct AuditLogRecord {
    timestamp: String,
    request_id: String,
    redactions: Vec<String>,
}

/// Root of the request log tree (`SDR_LOG_DIR`, default `data/logs`).
pub fn log_base_dir() -> PathBuf {
    std::env::var(LOG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_LOG_DIR))
}

fn retention_days() -> u64 {
    std::env::var(RETENTION_ENV)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(DEFAULT_RETENTION_DAYS)
}

fn append_json_line<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)
            .with_context(|| format!("failed to create log directory {}", parent.display()))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let line = serde_json::to_string(value)?;
    writeln!(writer, "{}", line)
        .with_context(|| format!("failed to append log entry to {}", path.display()))?;
    writer.flush()?;
    Ok(())
}

fn sanitize_text(input: &str, redactions: &mut BTreeSet<String>) -> String {
    let mut output = input.to_string();
    for (name, regex) in REDACTION_PATTERNS.iter() {
        let mut matched = false;
        output = regex
            .replace_all(&output, |caps: &Captures| {
                matched = true;
                if caps.len() > 2 {
                    format!("{}[REDACTED]", &caps[1])
                } else {
                    "[REDACTED]".to_string()
                }
            })
            .to_string();
        if matched {
            redactions.insert(name.to_string());
        }
    }
    output
}

/// Append a request record under `{SDR_LOG_DIR}/{yyyy}/{mm}/requests.jsonl`, noting any
/// redactions in `audit.jsonl`. Returns the path written.
pub fn log_request_completion(input: RequestLogInput) -> Result<PathBuf> {
    let timestamp = Utc::now();
    let mut redactions = BTreeSet::new();

    let query = sanitize_text(&input.query, &mut redactions);
    let answer = sanitize_text(&input.answer, &mut redactions);
    let citations: Vec<String> = input
        .citations
        .iter()
        .map(|source| sanitize_text(source, &mut redactions))
        .collect();

    let record = RequestLogRecord {
        timestamp: timestamp.to_rfc3339(),
        request_id: input.request_id.clone(),
        query,
        mode: input.mode,
        answer,
        citations,
        tools: input.tools,
        cycles: input.cycles,
        stop_reason: input.stop_reason,
        duration_ms: input.duration_ms,
        structured_compliant: input.structured_compliant,
        trace_path: input.trace_path,
        redactions: redactions.into_iter().collect(),
    };

    let base_dir = log_base_dir();
    let month_dir = base_dir
        .join(format!("{:04}", timestamp.year()))
        .join(format!("{:02}", timestamp.month()));
    let request_log_path = month_dir.join(REQUEST_LOG_FILE);
    append_json_line(&request_log_path, &record)?;

    if !record.redactions.is_empty() {
        let audit = AuditLogRecord {
            timestamp: record.timestamp.clone(),
            request_id: input.request_id.clone(),
            redactions: record.redactions.clone(),
        };
        append_json_line(&month_dir.join(AUDIT_LOG_FILE), &audit)?;
        warn!(
            request_id = %input.request_id,
            fields = ?record.redactions,
            "redacted potential secrets from request log"
        );
    }

    enforce_retention(&base_dir)?;

    Ok(request_log_path)
}

/// Every `requests.jsonl` under the log tree, oldest month first.
pub fn request_log_files(base_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !base_dir.exists() {
        return Ok(files);
    }
    for year_entry in fs::read_dir(base_dir)? {
        let year_entry = year_entry?;
        if !year_entry.file_type()?.is_dir() {
            continue;
        }
        for month_entry in fs::read_dir(year_entry.path())? {
            let path = month_entry?.path().join(REQUEST_LOG_FILE);
            if path.is_file() {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

fn enforce_retention(base_dir: &Path) -> Result<()> {
    let retention = retention_days();
    if retention == 0 || !base_dir.exists() {
        return Ok(());
    }
    let cutoff = SystemTime::now()
        .checked_sub(Duration::from_secs(retention.saturating_mul(86_400)))
        .unwrap_or(SystemTime::UNIX_EPOCH);

    prune_directory(base_dir, cutoff)?;
    Ok(())
}

fn prune_directory(dir: &Path, cutoff: SystemTime) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            prune_directory(&path, cutoff)?;
            if path.read_dir()?.next().is_none() {
                fs::remove_dir(&path).ok();
            }
        } else if metadata.is_file()
            && metadata
                .modified()
                .map(|time| time < cutoff)
                .unwrap_or(false)
        {
            fs::remove_file(&path).ok();
        }
    }

    Ok(())
}

/// Erase every record of `request_id` from the request and audit logs.
pub fn remove_request_logs(request_id: &str) -> Result<()> {
    let base_dir = log_base_dir();
    if !base_dir.exists() {
        return Ok(());
    }

    for year_entry in fs::read_dir(&base_dir)? {
        let year_entry = year_entry?;
        if !year_entry.file_type()?.is_dir() {
            continue;
        }
        for month_entry in fs::read_dir(year_entry.path())? {
            let month_entry = month_entry?;
            if !month_entry.file_type()?.is_dir() {
                continue;
            }
            for name in [REQUEST_LOG_FILE, AUDIT_LOG_FILE] {
                let path = month_entry.path().join(name);
                rewrite_jsonl_without(&path, request_id)?;
                cleanup_empty_file(&path)?;
            }

            if month_entry.path().read_dir()?.next().is_none() {
                fs::remove_dir(month_entry.path()).ok();
            }
        }
        if year_entry.path().read_dir()?.next().is_none() {
            fs::remove_dir(year_entry.path()).ok();
        }
    }

    Ok(())
}

fn rewrite_jsonl_without(path: &Path, request_id: &str) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }

    let file =
        File::open(path).with_context(|| format!("failed to open log file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut retained = Vec::new();
    let mut removed = false;
    for line in reader.lines() {
        let line = line?;
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&line) {
            if value.get("request_id").and_then(|v| v.as_str()) == Some(request_id) {
                removed = true;
                continue;
            }
        }
        retained.push(line);
    }

    if removed {
        let file = File::create(path)
            .with_context(|| format!("failed to rewrite log file {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        for line in retained {
            writeln!(writer, "{}", line)?;
        }
        writer.flush()?;
    }

    Ok(())
}

fn cleanup_empty_file(path: &Path) -> Result<()> {
    if path.exists() {
        let metadata = path.metadata()?;
        if metadata.len() == 0 {
            fs::remove_file(path).ok();
        }
    }
    Ok(())
}
