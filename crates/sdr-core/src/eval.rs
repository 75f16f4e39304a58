use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;

use crate::logging::{RequestLogRecord, request_log_files};
use crate::request::{FieldSchema, FieldType};

#[derive(Debug, Default, Clone, Serialize)]
pub struct EvaluationMetrics {
    pub total_requests: usize,
    pub structured_requests: usize,
    pub json_compliant: usize,
    pub cited_requests: usize,
    pub total_cycles: u64,
    pub total_latency_ms: u64,
    /// Structured requests whose answer did not match the schema.
    pub non_compliant: Vec<String>,
    /// Terms every answer is expected to mention.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(skip)]
    keyword_score: f64,
}

impl EvaluationMetrics {
    /// Also score each answer by how many of `keywords` it mentions.
    pub fn with_keywords<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(Into::into)
                .filter(|keyword: &String| !keyword.trim().is_empty())
                .collect(),
            ..Self::default()
        }
    }

    pub fn record(&mut self, entry: &RequestLogRecord) {
        self.total_requests += 1;
        if !self.keywords.is_empty() {
            let score = keyword_accuracy(&entry.answer, self.keywords.as_slice());
            self.keyword_score += f64::from(score);
        }
        self.total_cycles += u64::from(entry.cycles);
        self.total_latency_ms += entry.duration_ms;
        if !entry.citations.is_empty() {
            self.cited_requests += 1;
        }
        if let Some(compliant) = entry.structured_compliant {
            self.structured_requests += 1;
            if compliant {
                self.json_compliant += 1;
            } else {
                self.non_compliant.push(entry.request_id.clone());
            }
        }
    }

    pub fn json_compliance_rate(&self) -> f32 {
        ratio(self.json_compliant, self.structured_requests)
    }

    pub fn citation_compliance_rate(&self) -> f32 {
        ratio(self.cited_requests, self.total_requests)
    }

    pub fn average_cycles(&self) -> f32 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.total_cycles as f32 / self.total_requests as f32
    }

    pub fn average_latency_ms(&self) -> f32 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.total_latency_ms as f32 / self.total_requests as f32
    }

    /// Mean keyword accuracy over recorded answers; `None` without keywords.
    pub fn keyword_accuracy(&self) -> Option<f32> {
        if self.keywords.is_empty() {
            return None;
        }
        if self.total_requests == 0 {
            return Some(0.0);
        }
        Some((self.keyword_score / self.total_requests as f64) as f32)
    }

    pub fn summary(&self) -> String {
        let mut line = format!(
            "{} request(s) • json compliance {:.2} ({}/{}) • citation compliance {:.2} • avg cycles {:.2} • avg latency {:.0} ms",
            self.total_requests,
            self.json_compliance_rate(),
            self.json_compliant,
            self.structured_requests,
            self.citation_compliance_rate(),
            self.average_cycles(),
            self.average_latency_ms()
        );
        if let Some(accuracy) = self.keyword_accuracy() {
            line.push_str(&format!(" • keyword accuracy {accuracy:.2}"));
        }
        line
    }
}

fn ratio(hits: usize, total: usize) -> f32 {
    if total == 0 {
        0.0
    } else {
        hits as f32 / total as f32
    }
}

pub struct EvaluationHarness;

impl EvaluationHarness {
    /// Aggregate one `requests.jsonl` file. Malformed lines are skipped.
    pub fn analyze_log(path: impl AsRef<Path>) -> Result<EvaluationMetrics> {
        Self::analyze_log_into(path, EvaluationMetrics::default())
    }

    /// Aggregate every monthly request log under `base_dir`.
    pub fn analyze_dir(base_dir: impl AsRef<Path>) -> Result<EvaluationMetrics> {
        Self::analyze_dir_into(base_dir, EvaluationMetrics::default())
    }

    /// Like [`Self::analyze_log`], starting from `metrics` (e.g. one carrying keywords).
    pub fn analyze_log_into(
        path: impl AsRef<Path>,
        mut metrics: EvaluationMetrics,
    ) -> Result<EvaluationMetrics> {
        Self::accumulate(path.as_ref(), &mut metrics)?;
        Ok(metrics)
    }

    pub fn analyze_dir_into(
        base_dir: impl AsRef<Path>,
        mut metrics: EvaluationMetrics,
    ) -> Result<EvaluationMetrics> {
        for path in request_log_files(base_dir.as_ref())? {
            Self::accumulate(&path, &mut metrics)?;
        }
        Ok(metrics)
    }

    fn accumulate(path: &Path, metrics: &mut EvaluationMetrics) -> Result<()> {
        let file = File::open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;

        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RequestLogRecord>(&line) {
                Ok(entry) => metrics.record(&entry),
                Err(err) => {
                    tracing::debug!(%err, "skipping malformed evaluation log entry");
                }
            }
        }
        Ok(())
    }
}

/// Fraction of `keywords` that appear (case-insensitively) in `answer`.
pub fn keyword_accuracy<S: AsRef<str>>(answer: &str, keywords: &[S]) -> f32 {
    if keywords.is_empty() {
        return 0.0;
    }
    let haystack = answer.to_lowercase();
    let hits = keywords
        .iter()
        .filter(|keyword| haystack.contains(&keyword.as_ref().to_lowercase()))
        .count();
    hits as f32 / keywords.len() as f32
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldCheck {
    Correct,
    Null,
    Missing,
    WrongType(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComplianceReport {
    pub all_fields_present: bool,
    pub correct_types: bool,
    pub fields: Vec<(String, FieldCheck)>,
}

impl ComplianceReport {
    pub fn compliant(&self) -> bool {
        self.all_fields_present && self.correct_types
    }
}

/// Check a structured answer against its schema: every key present, and every non-null
/// value of its declared type. Null is always acceptable.
pub fn structured_compliance(schema: &FieldSchema, answer: &Value) -> ComplianceReport {
    let object = answer.as_object();
    let mut report = ComplianceReport {
        all_fields_present: true,
        correct_types: true,
        fields: Vec::with_capacity(schema.len()),
    };

    for (field, ty) in schema.iter() {
        let check = match object.and_then(|map| map.get(field)) {
            None => {
                report.all_fields_present = false;
                FieldCheck::Missing
            }
            Some(Value::Null) => FieldCheck::Null,
            Some(value) if matches_type(value, ty) => FieldCheck::Correct,
            Some(value) => {
                report.correct_types = false;
                FieldCheck::WrongType(json_type_name(value).to_string())
            }
        };
        report.fields.push((field.to_string(), check));
    }
    report
}

fn matches_type(value: &Value, ty: &FieldType) -> bool {
    match ty {
        FieldType::String => value.is_string(),
        FieldType::Integer => value.is_i64() || value.is_u64(),
        FieldType::Number => value.is_number(),
        FieldType::Boolean => value.is_boolean(),
        FieldType::Passthrough(_) => true,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(number) if number.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::{BufWriter, Write};

    #[test]
    fn evaluation_harness_aggregates_request_log() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("requests.jsonl");
        let mut writer = BufWriter::new(File::create(&path).expect("temp file"));
        writeln!(
            writer,
            r#"{{"timestamp":"t","request_id":"a","query":"Acme","mode":"structured","answer":"{{}}","citations":["acme.com"],"cycles":1,"duration_ms":100,"structured_compliant":true}}"#
        )
        .unwrap();
        writeln!(
            writer,
            r#"{{"timestamp":"t","request_id":"b","query":"Globex","mode":"structured","answer":"{{}}","cycles":3,"duration_ms":300,"structured_compliant":false}}"#
        )
        .unwrap();
        writeln!(writer, "not json").unwrap();
        writer.flush().unwrap();
        drop(writer);

        let metrics = EvaluationHarness::analyze_log(&path).expect("metrics");

        assert_eq!(metrics.total_requests, 2);
        assert_eq!(metrics.structured_requests, 2);
        assert!((metrics.json_compliance_rate() - 0.5).abs() < f32::EPSILON);
        assert!((metrics.citation_compliance_rate() - 0.5).abs() < f32::EPSILON);
        assert!((metrics.average_cycles() - 2.0).abs() < f32::EPSILON);
        assert!((metrics.average_latency_ms() - 200.0).abs() < f32::EPSILON);
        assert_eq!(metrics.non_compliant, vec!["b".to_string()]);
    }

    #[test]
    fn keyword_accuracy_is_averaged_over_logged_answers() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("requests.jsonl");
        std::fs::write(
            &path,
            concat!(
                r#"{"timestamp":"t","request_id":"a","query":"Acme","mode":"text","answer":"Acme Corp builds cloud software.","cycles":1,"duration_ms":10}"#,
                "\n",
                r#"{"timestamp":"t","request_id":"b","query":"Globex","mode":"text","answer":"No data found.","cycles":1,"duration_ms":10}"#,
                "\n",
            ),
        )
        .expect("write log");

        let seeded = EvaluationMetrics::with_keywords(["acme", "Cloud", " "]);
        assert_eq!(seeded.keywords, vec!["acme".to_string(), "Cloud".to_string()]);

        let metrics = EvaluationHarness::analyze_log_into(&path, seeded).expect("metrics");
        let accuracy = metrics.keyword_accuracy().expect("keywords were given");
        assert!((accuracy - 0.5).abs() < f32::EPSILON);
        assert!(metrics.summary().ends_with("keyword accuracy 0.50"));

        let plain = EvaluationHarness::analyze_log(&path).expect("metrics");
        assert_eq!(plain.keyword_accuracy(), None);
        assert!(!plain.summary().contains("keyword"));
    }

    #[test]
    fn keyword_accuracy_is_case_insensitive() {
        let answer = "Microsoft sells Cloud software to business customers";
        let score = keyword_accuracy(answer, &["microsoft", "cloud", "hardware", "business"]);
        assert!((score - 0.75).abs() < f32::EPSILON);
        assert_eq!(keyword_accuracy::<&str>(answer, &[]), 0.0);
    }

    #[test]
    fn compliance_accepts_nulls_and_flags_wrong_types() {
        let schema = FieldSchema::new([
            ("company_name", FieldType::String),
            ("employee_count", FieldType::Integer),
            ("public", FieldType::Boolean),
        ]);

        let ok = structured_compliance(
            &schema,
            &json!({"company_name": "Acme Corp", "employee_count": null, "public": false}),
        );
        assert!(ok.compliant());

        let bad = structured_compliance(&schema, &json!({"company_name": "Acme", "employee_count": "500"}));
        assert!(!bad.all_fields_present);
        assert!(!bad.correct_types);
        assert_eq!(
            bad.fields,
            vec![
                ("company_name".to_string(), FieldCheck::Correct),
                ("employee_count".to_string(), FieldCheck::WrongType("string".to_string())),
                ("public".to_string(), FieldCheck::Missing),
            ]
        );
    }
}
