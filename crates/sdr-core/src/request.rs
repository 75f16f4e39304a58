//! Request classification.
//!
//! Decides whether an incoming query wants a free-text answer or a JSON object
//! with a declared field schema, and separates the semantic query (the business
//! question) from the structural envelope.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::ClassificationError;

/// Envelope written with single quotes, e.g. `{'format': 'json', 'fields': {...}}`.
static LOOSE_ENVELOPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?s)\{[^{}]*["']format["']\s*:\s*["']json["'][^{}]*["']fields["']\s*:\s*\{[^{}]*\}[^{}]*\}"#,
    )
    .expect("invalid envelope regex")
});

/// Primitive type a structured field is coerced to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    /// Unrecognised type name; values pass through untouched.
    Passthrough(String),
}

impl FieldType {
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "string" | "str" | "text" => FieldType::String,
            "integer" | "int" => FieldType::Integer,
            "number" | "float" | "double" => FieldType::Number,
            "boolean" | "bool" => FieldType::Boolean,
            _ => FieldType::Passthrough(name.trim().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Passthrough(name) => name,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for FieldType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Ordered mapping of field name to declared type.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldSchema {
    fields: Vec<(String, FieldType)>,
}

impl FieldSchema {
    /// Build a schema; a repeated name keeps its first position and last type.
    pub fn new<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, FieldType)>,
        K: Into<String>,
    {
        let mut schema = Self::default();
        for (name, ty) in fields {
            let name = name.into();
            match schema.fields.iter_mut().find(|(existing, _)| *existing == name) {
                Some(slot) => slot.1 = ty,
                None => schema.fields.push((name, ty)),
            }
        }
        schema
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldType)> {
        self.fields.iter().map(|(name, ty)| (name.as_str(), ty))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    pub fn get(&self, name: &str) -> Option<&FieldType> {
        self.fields
            .iter()
            .find(|(candidate, _)| candidate == name)
            .map(|(_, ty)| ty)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl Serialize for FieldSchema {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.fields.iter().map(|(name, ty)| (name, ty)))
    }
}

/// Requested answer shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", content = "fields", rename_all = "snake_case")]
pub enum OutputMode {
    FreeText,
    Structured(FieldSchema),
}

/// A classified request. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Request {
    raw_text: String,
    query: String,
    mode: OutputMode,
}

impl Request {
    pub fn free_text(query: impl Into<String>) -> Self {
        let query = query.into();
        Self {
            raw_text: query.clone(),
            query: query.trim().to_string(),
            mode: OutputMode::FreeText,
        }
    }

    pub fn structured(query: impl Into<String>, schema: FieldSchema) -> Self {
        let query = query.into();
        Self {
            raw_text: query.clone(),
            query: query.trim().to_string(),
            mode: OutputMode::Structured(schema),
        }
    }

    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }

    /// The business question with any structural envelope stripped.
    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn mode(&self) -> &OutputMode {
        &self.mode
    }

    pub fn field_schema(&self) -> Option<&FieldSchema> {
        match &self.mode {
            OutputMode::Structured(schema) => Some(schema),
            OutputMode::FreeText => None,
        }
    }

    pub fn is_structured(&self) -> bool {
        matches!(self.mode, OutputMode::Structured(_))
    }

    pub fn mode_label(&self) -> &'static str {
        match self.mode {
            OutputMode::FreeText => "free_text",
            OutputMode::Structured(_) => "structured",
        }
    }
}

/// Classify a raw text request, e.g.
/// `{"format": "json", "fields": {"company_name": "string"}} Get info about Acme Corp`.
pub fn classify(raw: &str) -> Result<Request, ClassificationError> {
    let Some(envelope) = find_envelope(raw) else {
        return Ok(free_text_request(raw));
    };

    if !declares_json_format(&envelope.object) {
        debug!("json object present without format=json; treating as free text");
        return Ok(free_text_request(raw));
    }

    let schema = parse_schema(&envelope.object, &envelope.text)?;
    let mut query = remaining_text(raw, envelope.start, envelope.end);
    if query.is_empty() {
        query = embedded_query(&envelope.object).unwrap_or_default();
    }

    debug!(fields = schema.len(), %query, "classified structured request");
    Ok(Request {
        raw_text: raw.to_string(),
        query,
        mode: OutputMode::Structured(schema),
    })
}

/// Classify a pre-structured JSON payload: either a JSON string, an object with an
/// `input` string, or an envelope object carrying its query under `query`/`input`.
pub fn classify_payload(body: &str) -> Result<Request, ClassificationError> {
    let value: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(_) => return classify(body),
    };

    match &value {
        Value::String(text) => classify(text),
        Value::Object(object) if object.contains_key("format") => {
            if !declares_json_format(object) {
                let query = embedded_query(object).unwrap_or_else(|| body.trim().to_string());
                return Ok(free_text_request(&query));
            }
            let schema = parse_schema(object, body)?;
            Ok(Request {
                raw_text: body.to_string(),
                query: embedded_query(object).unwrap_or_default(),
                mode: OutputMode::Structured(schema),
            })
        }
        Value::Object(object) => match object.get("input").and_then(Value::as_str) {
            Some(input) => classify(input),
            None => Ok(free_text_request(body)),
        },
        _ => Ok(free_text_request(body)),
    }
}

fn free_text_request(raw: &str) -> Request {
    Request {
        raw_text: raw.to_string(),
        query: raw.trim().to_string(),
        mode: OutputMode::FreeText,
    }
}

struct Envelope {
    object: Map<String, Value>,
    /// JSON text of the envelope (normalised to double quotes).
    text: String,
    start: usize,
    end: usize,
}

fn find_envelope(raw: &str) -> Option<Envelope> {
    let mut cursor = 0;
    while let Some(offset) = raw[cursor..].find('{') {
        let start = cursor + offset;
        let mut stream = serde_json::Deserializer::from_str(&raw[start..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(Value::Object(object))) => {
                let end = start + stream.byte_offset();
                if object.contains_key("format") {
                    return Some(Envelope {
                        object,
                        text: raw[start..end].to_string(),
                        start,
                        end,
                    });
                }
                cursor = end;
            }
            _ => cursor = start + 1,
        }
    }

    let found = LOOSE_ENVELOPE.find(raw)?;
    let text = found.as_str().replace('\'', "\"");
    match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(object)) => Some(Envelope {
            object,
            text,
            start: found.start(),
            end: found.end(),
        }),
        _ => None,
    }
}

fn declares_json_format(object: &Map<String, Value>) -> bool {
    object
        .get("format")
        .and_then(Value::as_str)
        .is_some_and(|format| format.trim().eq_ignore_ascii_case("json"))
}

fn parse_schema(object: &Map<String, Value>, text: &str) -> Result<FieldSchema, ClassificationError> {
    match object.get("fields") {
        None | Some(Value::Null) => return Err(ClassificationError::MissingFields),
        Some(Value::Object(fields)) if fields.is_empty() => {
            return Err(ClassificationError::EmptyFields);
        }
        Some(Value::Object(_)) => {}
        Some(_) => {
            return Err(ClassificationError::InvalidFields(
                "`fields` must map field names to type names".into(),
            ));
        }
    }

    // serde_json::Map does not keep insertion order; re-read the fields in declaration order.
    let ordered: OrderedEnvelope = serde_json::from_str(text)
        .map_err(|err| ClassificationError::InvalidFields(err.to_string()))?;
    let entries = ordered.fields.map(|fields| fields.0).unwrap_or_default();

    let mut declared = Vec::with_capacity(entries.len());
    for (name, ty) in entries {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(ClassificationError::InvalidFields(
                "field names must not be empty".into(),
            ));
        }
        match ty {
            Value::String(ty) => declared.push((name, FieldType::parse(&ty))),
            other => {
                return Err(ClassificationError::InvalidFields(format!(
                    "field `{name}` must name a type, found {other}"
                )));
            }
        }
    }

    if declared.is_empty() {
        return Err(ClassificationError::EmptyFields);
    }
    Ok(FieldSchema::new(declared))
}

fn embedded_query(object: &Map<String, Value>) -> Option<String> {
    ["query", "input", "request"]
        .iter()
        .filter_map(|key| object.get(*key).and_then(Value::as_str))
        .map(|text| text.trim().to_string())
        .find(|text| !text.is_empty())
}

fn remaining_text(raw: &str, start: usize, end: usize) -> String {
    let before = raw[..start].trim();
    let after = raw[end..].trim();
    match (before.is_empty(), after.is_empty()) {
        (true, _) => after.to_string(),
        (false, true) => before.to_string(),
        (false, false) => format!("{before} {after}"),
    }
}

#[derive(Deserialize)]
struct OrderedEnvelope {
    #[serde(default)]
    fields: Option<OrderedFields>,
}

struct OrderedFields(Vec<(String, Value)>);

impl<'de> Deserialize<'de> for OrderedFields {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedVisitor;

        impl<'de> Visitor<'de> for OrderedVisitor {
            type Value = OrderedFields;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping of field names to type names")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::new();
                while let Some((key, value)) = access.next_entry::<String, Value>()? {
                    entries.push((key, value));
                }
                Ok(OrderedFields(entries))
            }
        }

        deserializer.deserialize_map(OrderedVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_envelope_with_trailing_query() {
        let request = classify(
            r#"{"format":"json","fields":{"company_name":"string","employee_count":"integer"}} Get info about Acme Corp"#,
        )
        .unwrap();

        assert!(request.is_structured());
        assert_eq!(request.query(), "Get info about Acme Corp");
        let schema = request.field_schema().unwrap();
        let names: Vec<_> = schema.names().collect();
        assert_eq!(names, vec!["company_name", "employee_count"]);
        assert_eq!(schema.get("employee_count"), Some(&FieldType::Integer));
    }

    #[test]
    fn field_declaration_order_is_preserved() {
        let request =
            classify(r#"{"format":"json","fields":{"zeta":"string","alpha":"boolean"}} x"#).unwrap();
        let names: Vec<_> = request.field_schema().unwrap().names().collect();
        assert_eq!(names, vec!["zeta", "alpha"]);
    }

    #[test]
    fn single_quoted_envelope_is_accepted() {
        let request =
            classify("{'format': 'json', 'fields': {'industry': 'string'}} Find info about Stripe")
                .unwrap();
        assert!(request.is_structured());
        assert_eq!(request.query(), "Find info about Stripe");
    }

    #[test]
    fn free_text_never_fails() {
        for input in ["Research Tesla for outbound sales", "", "{ not json", "{\"a\": 1} hi"] {
            let request = classify(input).unwrap();
            assert_eq!(request.mode(), &OutputMode::FreeText);
        }
    }

    #[test]
    fn non_json_format_is_free_text() {
        let request = classify(r#"{"format":"markdown","fields":{"a":"string"}} hello"#).unwrap();
        assert!(!request.is_structured());
    }

    #[test]
    fn missing_or_empty_fields_are_rejected() {
        assert_eq!(
            classify(r#"{"format":"json"} Acme"#).unwrap_err(),
            ClassificationError::MissingFields
        );
        assert_eq!(
            classify(r#"{"format":"json","fields":{}} Acme"#).unwrap_err(),
            ClassificationError::EmptyFields
        );
        assert!(matches!(
            classify(r#"{"format":"json","fields":["a"]} Acme"#).unwrap_err(),
            ClassificationError::InvalidFields(_)
        ));
    }

    #[test]
    fn payload_with_embedded_query() {
        let request = classify_payload(
            r#"{"format":"json","fields":{"industry":"string"},"query":"Find info about Google"}"#,
        )
        .unwrap();
        assert!(request.is_structured());
        assert_eq!(request.query(), "Find info about Google");

        let request = classify_payload(r#"{"input":"Research Tesla"}"#).unwrap();
        assert_eq!(request.query(), "Research Tesla");
        assert!(!request.is_structured());
    }

    #[test]
    fn unknown_type_names_pass_through() {
        assert_eq!(
            FieldType::parse("array"),
            FieldType::Passthrough("array".into())
        );
        assert_eq!(FieldType::parse("Float"), FieldType::Number);
    }
}
