//! Response synthesis.
//!
//! Folds the evidence gathered for a request into the final answer: a cited
//! narrative in free-text mode, or a schema-exact JSON object in structured mode.

use std::fmt::Write as _;

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use tracing::warn;

use crate::evidence::{EvidenceSet, ToolResult};
use crate::request::{FieldSchema, FieldType, Request};
use crate::selector::{TrustOrder, normalise_field};

/// Alternative payload keys a requested field may be published under.
const FIELD_ALIASES: &[(&str, &[&str])] = &[
    ("company_name", &["name", "company", "organization"]),
    ("full_name", &["name", "person_name"]),
    ("person_name", &["name", "full_name"]),
    ("hq_location", &["headquarters", "location", "hq"]),
    ("headquarters", &["hq_location", "location", "hq"]),
    ("location", &["headquarters", "hq_location", "city"]),
    (
        "employee_count",
        &["employees", "company_size", "employees_in_linkedin", "staff_count"],
    ),
    ("employees", &["employee_count", "company_size"]),
    ("company_size", &["employee_count", "employees"]),
    ("short_description", &["description", "about", "summary"]),
    ("description", &["about", "summary", "short_description"]),
    ("position", &["title", "headline", "job_title"]),
    ("title", &["position", "headline", "job_title"]),
    ("job_title", &["title", "position", "headline"]),
    ("website", &["url", "homepage", "website_url"]),
    ("founded_year", &["founded", "year_founded"]),
    ("founded", &["founded_year", "year_founded"]),
    ("followers_count", &["followers"]),
    ("product_name", &["title", "name"]),
    ("price", &["final_price", "initial_price"]),
];

const MAX_NESTING: usize = 3;
const MAX_SUMMARY_FIELDS: usize = 6;
const MAX_SUMMARY_ITEMS: usize = 3;
const MAX_TEXT_CHARS: usize = 280;

/// Structured field values in schema order.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldValues(Vec<(String, Value)>);

impl FieldValues {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(field, value)| (field.as_str(), value))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(field, _)| field.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn resolved(&self) -> usize {
        self.0.iter().filter(|(_, value)| !value.is_null()).count()
    }
}

impl Serialize for FieldValues {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.0.iter().map(|(field, value)| (field, value)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AnswerBody {
    Text(String),
    Fields(FieldValues),
}

/// Final response for one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub body: AnswerBody,
    /// Distinct source labels in order of first contribution.
    pub citations: Vec<String>,
}

impl Answer {
    /// Text shown to the caller: the narrative, or the JSON object pretty-printed.
    pub fn render(&self) -> String {
        match &self.body {
            AnswerBody::Text(text) => text.clone(),
            AnswerBody::Fields(fields) => {
                serde_json::to_string_pretty(fields).unwrap_or_else(|_| "{}".to_string())
            }
        }
    }

    pub fn fields(&self) -> Option<&FieldValues> {
        match &self.body {
            AnswerBody::Fields(fields) => Some(fields),
            AnswerBody::Text(_) => None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.body {
            AnswerBody::Text(text) => Some(text),
            AnswerBody::Fields(_) => None,
        }
    }
}

/// A value was found for a field but could not be coerced to its declared type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldCoercionWarning {
    pub field: String,
    pub expected: String,
    pub found: Value,
    pub source_label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Synthesis {
    pub answer: Answer,
    pub warnings: Vec<FieldCoercionWarning>,
}

#[derive(Debug, Clone, Default)]
pub struct Synthesizer {
    trust_order: TrustOrder,
}

impl Synthesizer {
    pub fn new(trust_order: TrustOrder) -> Self {
        Self { trust_order }
    }

    /// Pure function of its inputs; the same request and evidence always produce the
    /// same answer.
    pub fn synthesize(&self, request: &Request, evidence: &EvidenceSet) -> Synthesis {
        match request.field_schema() {
            Some(schema) => self.synthesize_fields(schema, evidence),
            None => Synthesis {
                answer: synthesize_text(request.query(), evidence),
                warnings: Vec::new(),
            },
        }
    }

    fn synthesize_fields(&self, schema: &FieldSchema, evidence: &EvidenceSet) -> Synthesis {
        let ranked = self.ranked_successes(evidence);
        let mut values = Vec::with_capacity(schema.len());
        let mut citations: Vec<String> = Vec::new();
        let mut warnings = Vec::new();

        for (field, ty) in schema.iter() {
            let found = ranked.iter().find_map(|result| {
                result
                    .payload()
                    .and_then(|payload| resolve_field(payload, field))
                    .map(|value| (value, result.source_label.as_str()))
            });

            let value = match found {
                None => Value::Null,
                Some((raw, source_label)) => match coerce(raw, ty) {
                    Some(value) => {
                        push_unique(&mut citations, source_label);
                        value
                    }
                    None => {
                        warn!(
                            field,
                            expected = %ty,
                            found = %raw,
                            source = source_label,
                            "value could not be coerced to declared type"
                        );
                        warnings.push(FieldCoercionWarning {
                            field: field.to_string(),
                            expected: ty.to_string(),
                            found: raw.clone(),
                            source_label: source_label.to_string(),
                        });
                        Value::Null
                    }
                },
            };
            values.push((field.to_string(), value));
        }

        Synthesis {
            answer: Answer {
                body: AnswerBody::Fields(FieldValues(values)),
                citations,
            },
            warnings,
        }
    }

    /// Successful results, most authoritative first; evidence order breaks ties.
    fn ranked_successes<'a>(&self, evidence: &'a EvidenceSet) -> Vec<&'a ToolResult> {
        let mut ranked: Vec<&ToolResult> = evidence.successes().collect();
        ranked.sort_by_key(|result| self.trust_order.rank(result.tool));
        ranked
    }
}

/// Whether some successful result in `evidence` carries a non-null value for `field`.
pub fn field_resolvable(evidence: &EvidenceSet, field: &str) -> bool {
    evidence
        .successes()
        .filter_map(ToolResult::payload)
        .any(|payload| resolve_field(payload, field).is_some())
}

/// Locate a field in a payload: exact key, normalised key or a known alias, searching
/// nested objects and the first element of arrays.
pub fn resolve_field<'a>(payload: &'a Value, field: &str) -> Option<&'a Value> {
    let normalised = normalise_field(field);
    let mut names = vec![field.to_string(), normalised.clone()];
    if let Some((_, aliases)) = FIELD_ALIASES.iter().find(|(name, _)| *name == normalised) {
        names.extend(aliases.iter().map(|alias| alias.to_string()));
    }
    lookup(payload, &names, 0)
}

fn lookup<'a>(value: &'a Value, names: &[String], depth: usize) -> Option<&'a Value> {
    match value {
        Value::Object(map) => {
            for name in names {
                if let Some(found) = direct(map, name) {
                    return Some(found);
                }
            }
            if depth >= MAX_NESTING {
                return None;
            }
            map.values()
                .filter(|nested| nested.is_object() || nested.is_array())
                .find_map(|nested| lookup(nested, names, depth + 1))
        }
        Value::Array(items) if depth < MAX_NESTING => items
            .iter()
            .find(|item| item.is_object())
            .and_then(|item| lookup(item, names, depth + 1)),
        _ => None,
    }
}

fn direct<'a>(map: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    if let Some(value) = map.get(name).filter(|value| is_present(value)) {
        return Some(value);
    }
    let normalised = normalise_field(name);
    map.iter()
        .find(|(key, value)| normalise_field(key) == normalised && is_present(value))
        .map(|(_, value)| value)
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(text) => !text.trim().is_empty(),
        _ => true,
    }
}

/// Coerce a located value to the declared type; `None` when it cannot be.
pub fn coerce(value: &Value, ty: &FieldType) -> Option<Value> {
    match ty {
        FieldType::String => match value {
            Value::Null => None,
            Value::String(text) => Some(Value::String(text.trim().to_string())),
            other => Some(Value::String(other.to_string())),
        },
        FieldType::Integer => match value {
            Value::Number(number) => number
                .as_i64()
                .or_else(|| number.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
                .map(Value::from),
            Value::String(text) => parse_integer(text).map(Value::from),
            _ => None,
        },
        FieldType::Number => match value {
            Value::Number(number) => number.as_f64().map(Value::from),
            Value::String(text) => clean_numeric(text)
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(Value::from),
            _ => None,
        },
        FieldType::Boolean => match value {
            Value::Bool(flag) => Some(Value::Bool(*flag)),
            Value::String(text) => match text.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" | "on" => Some(Value::Bool(true)),
                "false" | "no" | "0" | "off" => Some(Value::Bool(false)),
                _ => None,
            },
            Value::Number(number) => match number.as_i64() {
                Some(0) => Some(Value::Bool(false)),
                Some(1) => Some(Value::Bool(true)),
                _ => None,
            },
            _ => None,
        },
        FieldType::Passthrough(_) => Some(value.clone()),
    }
}

/// Digit strings parse directly; decimal strings are truncated.
fn parse_integer(text: &str) -> Option<i64> {
    let cleaned = clean_numeric(text);
    if let Ok(whole) = cleaned.parse::<i64>() {
        return Some(whole);
    }
    cleaned
        .parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .map(|f| f.trunc() as i64)
}

fn clean_numeric(text: &str) -> String {
    text.trim()
        .chars()
        .filter(|ch| *ch != ',' && *ch != '_' && !ch.is_whitespace())
        .collect()
}

fn push_unique(citations: &mut Vec<String>, label: &str) {
    if !citations.iter().any(|existing| existing == label) {
        citations.push(label.to_string());
    }
}

fn synthesize_text(query: &str, evidence: &EvidenceSet) -> Answer {
    let successes: Vec<&ToolResult> = evidence.successes().collect();
    if successes.is_empty() {
        let text = if evidence.is_empty() {
            format!(
                "I could not research \"{query}\": no research tools were run for this request."
            )
        } else {
            format!(
                "I could not gather research for \"{query}\": all {} tool call(s) failed. \
                 Please retry later or rephrase the request.",
                evidence.len()
            )
        };
        return Answer {
            body: AnswerBody::Text(text),
            citations: Vec::new(),
        };
    }

    let mut citations: Vec<String> = Vec::new();
    let mut text = format!("Research findings for \"{query}\":\n");
    for result in &successes {
        let summary = result.payload().map(summarize).unwrap_or_default();
        if summary.is_empty() {
            continue;
        }
        push_unique(&mut citations, &result.source_label);
        let _ = write!(text, "\n- {} ({}): {}", result.tool, result.source_label, summary);
    }
    if citations.is_empty() {
        // Every successful payload was empty; still credit the sources consulted.
        for result in &successes {
            push_unique(&mut citations, &result.source_label);
        }
        text.push_str("\nThe research tools returned no usable details.");
    }
    let _ = write!(text, "\n\nSources: {}", citations.join(", "));

    Answer {
        body: AnswerBody::Text(text),
        citations,
    }
}

/// One-line digest of a payload.
fn summarize(payload: &Value) -> String {
    match payload {
        Value::Object(map) => summarize_object(map),
        Value::Array(items) => items
            .iter()
            .take(MAX_SUMMARY_ITEMS)
            .map(summarize)
            .filter(|item| !item.is_empty())
            .collect::<Vec<_>>()
            .join(" | "),
        Value::String(text) => truncate(text.trim()),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn summarize_object(map: &Map<String, Value>) -> String {
    let mut keys: Vec<&String> = map
        .keys()
        .filter(|key| !matches!(key.as_str(), "source" | "url" | "link"))
        .collect();
    keys.sort();
    keys.into_iter()
        .filter_map(|key| {
            let value = &map[key.as_str()];
            let rendered = match value {
                Value::String(text) if !text.trim().is_empty() => truncate(text.trim()),
                Value::Number(number) => number.to_string(),
                Value::Bool(flag) => flag.to_string(),
                _ => return None,
            };
            Some(format!("{key}: {rendered}"))
        })
        .take(MAX_SUMMARY_FIELDS)
        .collect::<Vec<_>>()
        .join("; ")
}

fn truncate(text: &str) -> String {
    let flattened = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match flattened.char_indices().nth(MAX_TEXT_CHARS) {
        Some((idx, _)) => format!("{}...", &flattened[..idx]),
        None => flattened,
    }
}
