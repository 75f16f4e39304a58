//! Tool selection.
//!
//! Turns a classified request into the first batch of tool calls: keyword and entity
//! signals drive free-text confidence, requested fields drive a greedy cover in
//! structured mode.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::error::SdrError;
use crate::request::{FieldSchema, Request};
use crate::tools::ToolKind;

static URL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[^\s"'<>)]+"#).expect("invalid url regex"));
static HANDLE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|\s)@([A-Za-z0-9_.]{2,30})").expect("invalid handle regex"));
static WORD_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9][A-Za-z0-9&.'\-]*").expect("invalid word regex"));

/// Capitalised words that start sentences or phrase requests rather than name entities.
const LEADING_WORDS: &[&str] = &[
    "a", "about", "an", "analyze", "and", "any", "are", "at", "can", "ceo", "cfo", "check",
    "compare", "cto", "could", "describe", "do", "does", "draft", "explain", "find", "for",
    "from", "get", "give", "help", "how", "i", "identify", "in", "info", "information", "is",
    "latest", "list", "look", "me", "need", "of", "on", "please", "prepare", "provide",
    "research", "search", "should", "show", "summarize", "tell", "the", "their", "to", "what",
    "when", "where", "which", "who", "why", "with", "write",
];
const CORPORATE_SUFFIXES: &[&str] = &[
    "inc", "inc.", "corp", "corp.", "corporation", "llc", "ltd", "ltd.", "gmbh", "plc", "co",
    "co.", "company", "technologies", "labs", "group", "systems", "holdings",
];
const COMPANY_TERMS: &[&str] = &[
    "company", "business", "firm", "startup", "organization", "revenue", "employees",
    "industry", "headquarters", "funding", "competitors", "customers", "overview",
];
const SALES_TERMS: &[&str] = &[
    "sales", "outbound", "prospect", "prospecting", "pitch", "outreach", "account", "lead",
    "deal", "meeting",
];
const PERSON_TERMS: &[&str] = &[
    "ceo", "cto", "cfo", "coo", "founder", "cofounder", "co-founder", "vp", "director",
    "manager", "head", "president", "executive", "profile", "linkedin", "person", "contact",
];
const JOB_TERMS: &[&str] = &[
    "hiring", "jobs", "job", "openings", "careers", "recruiting", "positions", "vacancies",
    "roles",
];
const PRODUCT_TERMS: &[&str] = &[
    "product", "products", "price", "pricing", "review", "reviews", "rating", "ratings", "buy",
    "sku", "listing",
];
const SOCIAL_PLATFORMS: &[&str] = &["instagram", "tiktok", "youtube"];

const COMPANY_FIELDS: &[&str] = &[
    "company", "company_name", "name", "industry", "employee_count", "employees",
    "company_size", "headquarters", "hq_location", "location", "website", "founded",
    "founded_year", "description", "short_description", "about", "revenue", "funding",
    "specialties", "followers",
];
const PERSON_FIELDS: &[&str] = &[
    "full_name", "person_name", "name", "title", "position", "headline", "job_title",
    "experience", "education", "linkedin_url", "profile_url", "current_company", "location",
];
const JOB_FIELDS: &[&str] = &[
    "open_positions", "job_openings", "jobs", "hiring", "job_count", "job_titles",
    "open_roles", "location",
];
const PRODUCT_FIELDS: &[&str] = &[
    "price", "product_name", "rating", "reviews", "product_price", "brand", "availability",
];
const SOCIAL_FIELDS: &[&str] = &[
    "followers_count", "username", "handle", "posts", "bio", "instagram", "twitter",
];

/// Confidence at or above which a specific tool is considered a strong match and the
/// generic web search is left out.
const HIGH_CONFIDENCE: f32 = 0.9;

/// Fixed priority order over tool kinds. Earlier means more authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrustOrder(Vec<ToolKind>);

impl TrustOrder {
    /// Build from configured names. Unknown or repeated names are rejected; kinds not
    /// listed keep their default relative order after the listed ones.
    pub fn parse<S: AsRef<str>>(names: &[S]) -> Result<Self, SdrError> {
        let mut order = Vec::with_capacity(ToolKind::ALL.len());
        for name in names {
            let kind: ToolKind = name.as_ref().parse().map_err(|_| {
                SdrError::InvalidConfiguration(format!(
                    "selector.trust_order names unknown tool `{}`",
                    name.as_ref()
                ))
            })?;
            if order.contains(&kind) {
                return Err(SdrError::InvalidConfiguration(format!(
                    "selector.trust_order lists `{kind}` twice"
                )));
            }
            order.push(kind);
        }
        for kind in ToolKind::ALL {
            if !order.contains(&kind) {
                order.push(kind);
            }
        }
        Ok(Self(order))
    }

    pub fn rank(&self, kind: ToolKind) -> usize {
        self.0
            .iter()
            .position(|candidate| *candidate == kind)
            .unwrap_or(self.0.len())
    }

    pub fn iter(&self) -> impl Iterator<Item = ToolKind> + '_ {
        self.0.iter().copied()
    }
}

impl Default for TrustOrder {
    fn default() -> Self {
        Self(ToolKind::ALL.to_vec())
    }
}

/// Work to run once a call has completed successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FollowUp {
    /// Scrape the first `limit` URLs returned by a search.
    ScrapeTopResults { limit: usize },
}

/// A call the loop should issue, with an optional dependent follow-up.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedCall {
    pub tool: ToolKind,
    pub arguments: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub follow_up: Option<FollowUp>,
}

impl PlannedCall {
    pub fn new(tool: ToolKind, arguments: Value) -> Self {
        Self {
            tool,
            arguments,
            follow_up: None,
        }
    }

    pub fn with_follow_up(mut self, follow_up: FollowUp) -> Self {
        self.follow_up = Some(follow_up);
        self
    }
}

/// Keyword and entity signals extracted from a query.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QuerySignals {
    pub company: Option<String>,
    pub person: Option<String>,
    pub corporate_suffix: bool,
    pub company_terms: bool,
    pub sales_terms: bool,
    pub person_terms: bool,
    pub job_terms: bool,
    pub product_terms: bool,
    pub urls: Vec<String>,
    pub handles: Vec<String>,
    pub social_platform: Option<String>,
}

impl QuerySignals {
    pub fn extract(query: &str) -> Self {
        let urls: Vec<String> = URL_PATTERN
            .find_iter(query)
            .map(|m| m.as_str().trim_end_matches(['.', ',']).to_string())
            .collect();
        let handles: Vec<String> = HANDLE_PATTERN
            .captures_iter(query)
            .map(|caps| caps[1].trim_end_matches('.').to_string())
            .collect();

        let stripped = URL_PATTERN.replace_all(query, " ");
        let words: Vec<&str> = WORD_PATTERN
            .find_iter(&stripped)
            .map(|m| m.as_str())
            .collect();
        let lowered: Vec<String> = words
            .iter()
            .map(|word| word.trim_end_matches(['\'', '.']).to_ascii_lowercase())
            .map(|word| word.trim_end_matches("'s").to_string())
            .collect();
        let has_any = |terms: &[&str]| lowered.iter().any(|word| terms.contains(&word.as_str()));

        let entities = entity_runs(&words);
        let with_suffix = entities.iter().position(|run| ends_with_suffix(run));
        let person_terms = has_any(PERSON_TERMS) || query.to_ascii_lowercase().contains("who is");

        let (company, person) = match (with_suffix, entities.len(), person_terms) {
            (Some(idx), _, true) => {
                let person = entities
                    .iter()
                    .enumerate()
                    .find(|(pos, run)| *pos != idx && run.contains(' '))
                    .map(|(_, run)| run.clone());
                (Some(entities[idx].clone()), person)
            }
            (Some(idx), _, false) => (Some(entities[idx].clone()), None),
            (None, 0, _) => (None, None),
            (None, 1, true) if entities[0].contains(' ') => (None, Some(entities[0].clone())),
            (None, 1, _) => (Some(entities[0].clone()), None),
            (None, _, true) => (
                entities.last().cloned(),
                entities.first().filter(|run| run.contains(' ')).cloned(),
            ),
            (None, _, false) => (entities.first().cloned(), None),
        };

        let social_platform = SOCIAL_PLATFORMS
            .iter()
            .find(|platform| lowered.iter().any(|word| word == *platform))
            .map(|platform| platform.to_string());

        Self {
            company,
            person,
            corporate_suffix: with_suffix.is_some(),
            company_terms: has_any(COMPANY_TERMS),
            sales_terms: has_any(SALES_TERMS),
            person_terms,
            job_terms: has_any(JOB_TERMS),
            product_terms: has_any(PRODUCT_TERMS),
            urls,
            handles,
            social_platform,
        }
    }

    /// Best subject for generic searches: the company, else the person.
    pub fn subject(&self) -> Option<&str> {
        self.company.as_deref().or(self.person.as_deref())
    }
}

/// Maximal runs of capitalised words, skipping request phrasing.
fn entity_runs(words: &[&str]) -> Vec<String> {
    let mut runs = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for word in words {
        let clean = word.trim_end_matches("'s").trim_end_matches(['\'', '.', ',']);
        let capitalised = clean.chars().next().is_some_and(char::is_uppercase);
        let leading = LEADING_WORDS.contains(&clean.to_ascii_lowercase().as_str());
        if capitalised && !leading {
            current.push(clean);
            if word.ends_with("'s") {
                runs.push(current.join(" "));
                current.clear();
            }
        } else if !current.is_empty() {
            runs.push(current.join(" "));
            current.clear();
        }
    }
    if !current.is_empty() {
        runs.push(current.join(" "));
    }
    runs
}

fn ends_with_suffix(run: &str) -> bool {
    run.rsplit(' ')
        .next()
        .is_some_and(|last| CORPORATE_SUFFIXES.contains(&last.to_ascii_lowercase().as_str()))
}

/// Specific tools that could supply a requested field.
pub fn candidate_tools(field: &str) -> Vec<ToolKind> {
    let normalised = normalise_field(field);
    let table: [(ToolKind, &[&str]); 5] = [
        (ToolKind::CompanyInfo, COMPANY_FIELDS),
        (ToolKind::PersonProfile, PERSON_FIELDS),
        (ToolKind::JobSearch, JOB_FIELDS),
        (ToolKind::ProductInfo, PRODUCT_FIELDS),
        (ToolKind::SocialProfile, SOCIAL_FIELDS),
    ];
    let exact: Vec<ToolKind> = table
        .iter()
        .filter(|(_, fields)| fields.contains(&normalised.as_str()))
        .map(|(kind, _)| *kind)
        .collect();
    if !exact.is_empty() {
        return exact;
    }

    let fuzzy: [(ToolKind, &[&str]); 5] = [
        (
            ToolKind::CompanyInfo,
            &["company", "industry", "employee", "headquarter", "revenue", "funding"],
        ),
        (ToolKind::PersonProfile, &["title", "linkedin", "experience", "person"]),
        (ToolKind::JobSearch, &["job", "hiring", "opening"]),
        (ToolKind::ProductInfo, &["price", "product", "rating"]),
        (ToolKind::SocialProfile, &["follower", "social", "instagram"]),
    ];
    fuzzy
        .iter()
        .filter(|(_, stems)| stems.iter().any(|stem| normalised.contains(stem)))
        .map(|(kind, _)| *kind)
        .collect()
}

/// Lowercase with every non-alphanumeric run collapsed to `_`.
pub fn normalise_field(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if !out.ends_with('_') && !out.is_empty() {
            out.push('_');
        }
    }
    out.trim_end_matches('_').to_string()
}

/// Outcome of selection for one request.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Selection {
    pub calls: Vec<PlannedCall>,
    /// Requested fields no specific tool could be issued for.
    pub uncovered_fields: Vec<String>,
    pub confidence: Vec<(ToolKind, f32)>,
}

impl Selection {
    pub fn tools(&self) -> impl Iterator<Item = ToolKind> + '_ {
        self.calls.iter().map(|call| call.tool)
    }
}

#[derive(Debug, Clone)]
pub struct ToolSelector {
    trust_order: TrustOrder,
    confidence_threshold: f32,
}

impl Default for ToolSelector {
    fn default() -> Self {
        Self::new(TrustOrder::default(), 0.6)
    }
}

impl ToolSelector {
    pub fn new(trust_order: TrustOrder, confidence_threshold: f32) -> Self {
        Self {
            trust_order,
            confidence_threshold,
        }
    }

    pub fn trust_order(&self) -> &TrustOrder {
        &self.trust_order
    }

    pub fn select(&self, request: &Request) -> Selection {
        let signals = QuerySignals::extract(request.query());
        let selection = match request.field_schema() {
            Some(schema) => self.select_for_fields(request.query(), schema, &signals),
            None => self.select_free_text(request.query(), &signals),
        };
        debug!(
            tools = ?selection.tools().map(|tool| tool.as_str()).collect::<Vec<_>>(),
            uncovered = ?selection.uncovered_fields,
            "selected tools"
        );
        selection
    }

    fn select_free_text(&self, query: &str, signals: &QuerySignals) -> Selection {
        let mut scored: Vec<(ToolKind, f32)> = ToolKind::ALL
            .into_iter()
            .filter(|kind| kind.is_specific() || *kind == ToolKind::ScrapeUrl)
            .map(|kind| (kind, confidence(kind, signals)))
            .filter(|(_, score)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| {
            b.1.total_cmp(&a.1)
                .then_with(|| self.trust_order.rank(a.0).cmp(&self.trust_order.rank(b.0)))
        });

        let mut calls = Vec::new();
        let mut strongest: f32 = 0.0;
        for (kind, score) in &scored {
            if *score < self.confidence_threshold {
                continue;
            }
            let mut built = build_calls(*kind, query, signals);
            if !built.is_empty() {
                strongest = strongest.max(*score);
                calls.append(&mut built);
            }
        }

        if strongest < HIGH_CONFIDENCE {
            calls.push(web_search(query));
        }

        Selection {
            calls,
            uncovered_fields: Vec::new(),
            confidence: scored,
        }
    }

    fn select_for_fields(
        &self,
        query: &str,
        schema: &FieldSchema,
        signals: &QuerySignals,
    ) -> Selection {
        let mut uncovered_fields = Vec::new();
        // field -> tools that can both supply it and be issued for this query
        let mut coverable: Vec<(String, Vec<ToolKind>)> = Vec::new();
        for field in schema.names() {
            let viable: Vec<ToolKind> = candidate_tools(field)
                .into_iter()
                .filter(|kind| !build_calls(*kind, query, signals).is_empty())
                .collect();
            if viable.is_empty() {
                uncovered_fields.push(field.to_string());
            } else {
                coverable.push((field.to_string(), viable));
            }
        }

        let mut chosen: Vec<ToolKind> = Vec::new();
        let mut remaining: HashSet<String> =
            coverable.iter().map(|(field, _)| field.clone()).collect();
        while !remaining.is_empty() {
            let best = self
                .trust_order
                .iter()
                .filter(|kind| !chosen.contains(kind))
                .map(|kind| {
                    let covers = coverable
                        .iter()
                        .filter(|(field, tools)| remaining.contains(field) && tools.contains(&kind))
                        .count();
                    (kind, covers)
                })
                .filter(|(_, covers)| *covers > 0)
                // max_by_key keeps the last maximum; iterate trust order reversed so the
                // most trusted tool wins ties.
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .max_by_key(|(_, covers)| *covers);
            let Some((kind, _)) = best else { break };
            for (field, tools) in &coverable {
                if tools.contains(&kind) {
                    remaining.remove(field);
                }
            }
            chosen.push(kind);
        }

        let mut calls: Vec<PlannedCall> = chosen
            .iter()
            .flat_map(|kind| build_calls(*kind, query, signals))
            .collect();
        let strongest = chosen
            .iter()
            .map(|kind| confidence(*kind, signals))
            .fold(0.0_f32, f32::max);
        if !uncovered_fields.is_empty() || chosen.is_empty() || strongest < HIGH_CONFIDENCE {
            calls.push(web_search(query));
        }

        Selection {
            calls,
            uncovered_fields,
            confidence: chosen
                .iter()
                .map(|kind| (*kind, confidence(*kind, signals)))
                .collect(),
        }
    }
}

fn confidence(kind: ToolKind, signals: &QuerySignals) -> f32 {
    let bump = |flag: bool, amount: f32| if flag { amount } else { 0.0 };
    let score = match kind {
        ToolKind::CompanyInfo if signals.company.is_some() => {
            0.5 + bump(signals.corporate_suffix || signals.company_terms, 0.3)
                + bump(signals.sales_terms, 0.2)
        }
        ToolKind::PersonProfile if signals.person.is_some() => {
            0.5 + bump(signals.person_terms, 0.4)
        }
        ToolKind::JobSearch if signals.job_terms => 0.6 + bump(signals.company.is_some(), 0.2),
        ToolKind::ProductInfo if signals.product_terms => 0.7,
        ToolKind::SocialProfile if !signals.handles.is_empty() => 0.9,
        ToolKind::ScrapeUrl if !signals.urls.is_empty() => 0.95,
        _ => 0.0,
    };
    score.min(1.0)
}

/// Calls a tool would be issued with for this query; empty when its required
/// arguments cannot be derived.
fn build_calls(kind: ToolKind, query: &str, signals: &QuerySignals) -> Vec<PlannedCall> {
    let query = query.trim();
    match kind {
        ToolKind::CompanyInfo => signals
            .company
            .iter()
            .map(|company| PlannedCall::new(kind, json!({ "company_name": company })))
            .collect(),
        ToolKind::PersonProfile => signals
            .person
            .iter()
            .map(|person| {
                let mut arguments = json!({ "name": person });
                if let Some(company) = &signals.company {
                    arguments["company"] = json!(company);
                }
                PlannedCall::new(kind, arguments)
            })
            .collect(),
        ToolKind::JobSearch | ToolKind::ProductInfo if !query.is_empty() => {
            let subject = signals.company.as_deref().unwrap_or(query);
            vec![PlannedCall::new(kind, json!({ "query": subject }))]
        }
        ToolKind::SocialProfile => signals
            .handles
            .iter()
            .map(|handle| {
                let mut arguments = json!({ "username": handle });
                if let Some(platform) = &signals.social_platform {
                    arguments["platform"] = json!(platform);
                }
                PlannedCall::new(kind, arguments)
            })
            .collect(),
        ToolKind::ScrapeUrl => signals
            .urls
            .iter()
            .map(|url| PlannedCall::new(kind, json!({ "url": url })))
            .collect(),
        ToolKind::WebSearch if !query.is_empty() => vec![web_search(query)],
        _ => Vec::new(),
    }
}

fn web_search(query: &str) -> PlannedCall {
    PlannedCall::new(ToolKind::WebSearch, json!({ "query": query.trim() }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{FieldType, classify};

    fn tools(selection: &Selection) -> Vec<ToolKind> {
        selection.tools().collect()
    }

    #[test]
    fn signals_find_company_behind_request_phrasing() {
        let signals = QuerySignals::extract("Get info about Acme Corp");
        assert_eq!(signals.company.as_deref(), Some("Acme Corp"));
        assert!(signals.corporate_suffix);

        let signals = QuerySignals::extract("Research Tesla for outbound sales");
        assert_eq!(signals.company.as_deref(), Some("Tesla"));
        assert!(signals.sales_terms);
        assert!(signals.person.is_none());
    }

    #[test]
    fn signals_separate_person_from_company() {
        let signals = QuerySignals::extract("Who is Jane Doe, the CTO at Globex Inc");
        assert_eq!(signals.person.as_deref(), Some("Jane Doe"));
        assert_eq!(signals.company.as_deref(), Some("Globex Inc"));
        assert!(signals.person_terms);
    }

    #[test]
    fn signals_pick_up_urls_and_handles() {
        let signals = QuerySignals::extract("Check https://acme.com/about and @acme_hq on instagram");
        assert_eq!(signals.urls, vec!["https://acme.com/about".to_string()]);
        assert_eq!(signals.handles, vec!["acme_hq".to_string()]);
        assert_eq!(signals.social_platform.as_deref(), Some("instagram"));
    }

    #[test]
    fn free_text_adds_web_search_below_high_confidence() {
        let selector = ToolSelector::default();
        let request = classify("Research Tesla for outbound sales").unwrap();
        let selection = selector.select(&request);
        assert_eq!(tools(&selection), vec![ToolKind::CompanyInfo, ToolKind::WebSearch]);
        assert_eq!(
            selection.calls[0].arguments,
            json!({"company_name": "Tesla"})
        );
    }

    #[test]
    fn free_text_without_entities_falls_back_to_web_search() {
        let selector = ToolSelector::default();
        let request = classify("what are common objections in saas deals").unwrap();
        assert_eq!(tools(&selector.select(&request)), vec![ToolKind::WebSearch]);
    }

    #[test]
    fn structured_fields_are_covered_greedily() {
        let selector = ToolSelector::default();
        let request = classify(
            r#"{"format":"json","fields":{"company_name":"string","employee_count":"integer","industry":"string"}} Get info about Acme Corp"#,
        )
        .unwrap();
        let selection = selector.select(&request);
        assert_eq!(tools(&selection), vec![ToolKind::CompanyInfo, ToolKind::WebSearch]);
        assert!(selection.uncovered_fields.is_empty());
    }

    #[test]
    fn uncoverable_fields_pull_in_web_search() {
        let selector = ToolSelector::default();
        let request = Request::structured(
            "Acme Corp",
            FieldSchema::new([
                ("company_name", FieldType::String),
                ("tech_stack", FieldType::String),
            ]),
        );
        let selection = selector.select(&request);
        assert_eq!(selection.uncovered_fields, vec!["tech_stack".to_string()]);
        assert!(tools(&selection).contains(&ToolKind::WebSearch));
    }

    #[test]
    fn trust_order_validation() {
        let order = TrustOrder::parse(&["web_search", "company_info"]).unwrap();
        assert_eq!(order.rank(ToolKind::WebSearch), 0);
        assert_eq!(order.rank(ToolKind::CompanyInfo), 1);
        assert_eq!(order.iter().count(), ToolKind::ALL.len());

        assert!(TrustOrder::parse(&["company_info", "company_info"]).is_err());
        assert!(TrustOrder::parse(&["crm_lookup"]).is_err());
    }

    #[test]
    fn field_names_normalise() {
        assert_eq!(normalise_field("Employee Count"), "employee_count");
        assert_eq!(normalise_field("hq-location "), "hq_location");
        assert_eq!(candidate_tools("Total Employees"), vec![ToolKind::CompanyInfo]);
    }
}
