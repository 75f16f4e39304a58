//! Tool interface layer.
//!
//! Seven research capabilities share one contract: a name, a declared parameter
//! schema and an async invocation that always yields a well-formed `ToolResult`.

mod backend;
mod cache;
#[cfg(feature = "http-backend")]
mod http;
mod invoker;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ToolInvocationError;

pub use backend::{BackendResponse, FixtureBackend, FixtureEntry, ToolBackend};
pub use cache::ResultCache;
#[cfg(feature = "http-backend")]
pub use http::HttpBackend;
pub use invoker::{InvocationPolicy, ToolInvoker};

/// The research tools known to the assistant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    WebSearch,
    ScrapeUrl,
    CompanyInfo,
    PersonProfile,
    JobSearch,
    ProductInfo,
    SocialProfile,
}

impl ToolKind {
    pub const ALL: [ToolKind; 7] = [
        ToolKind::CompanyInfo,
        ToolKind::PersonProfile,
        ToolKind::JobSearch,
        ToolKind::ProductInfo,
        ToolKind::SocialProfile,
        ToolKind::ScrapeUrl,
        ToolKind::WebSearch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolKind::WebSearch => "web_search",
            ToolKind::ScrapeUrl => "scrape_url",
            ToolKind::CompanyInfo => "company_info",
            ToolKind::PersonProfile => "person_profile",
            ToolKind::JobSearch => "job_search",
            ToolKind::ProductInfo => "product_info",
            ToolKind::SocialProfile => "social_profile",
        }
    }

    /// Entity-specific tools are preferred over generic fallbacks.
    pub fn is_specific(&self) -> bool {
        !matches!(self, ToolKind::WebSearch | ToolKind::ScrapeUrl)
    }

    pub fn spec(&self) -> ToolSpec {
        let (description, params) = match self {
            ToolKind::WebSearch => (
                "Search the web for an overview and relevant URLs",
                WEB_SEARCH_PARAMS,
            ),
            ToolKind::ScrapeUrl => (
                "Fetch a page and return its content as markdown",
                SCRAPE_URL_PARAMS,
            ),
            ToolKind::CompanyInfo => (
                "Look up a company profile (industry, size, headquarters)",
                COMPANY_INFO_PARAMS,
            ),
            ToolKind::PersonProfile => (
                "Look up a professional profile for a person",
                PERSON_PROFILE_PARAMS,
            ),
            ToolKind::JobSearch => ("Search job listings for hiring signals", JOB_SEARCH_PARAMS),
            ToolKind::ProductInfo => (
                "Look up product listings, pricing and ratings",
                PRODUCT_INFO_PARAMS,
            ),
            ToolKind::SocialProfile => ("Look up a social media profile", SOCIAL_PROFILE_PARAMS),
        };
        ToolSpec {
            kind: *self,
            description,
            params,
        }
    }

    /// Human-readable provenance used when a payload carries no source of its own.
    pub fn default_source(&self, arguments: &Map<String, Value>) -> String {
        let platform = arguments.get("platform").and_then(Value::as_str);
        match self {
            ToolKind::WebSearch => "web search".to_string(),
            ToolKind::ScrapeUrl => arguments
                .get("url")
                .and_then(Value::as_str)
                .map(host_of)
                .unwrap_or_else(|| "web page".to_string()),
            ToolKind::CompanyInfo => platform_domain(platform.unwrap_or("linkedin")),
            ToolKind::PersonProfile | ToolKind::JobSearch => "linkedin.com".to_string(),
            ToolKind::ProductInfo => platform_domain(platform.unwrap_or("amazon")),
            ToolKind::SocialProfile => platform_domain(platform.unwrap_or("instagram")),
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolKind {
    type Err = ToolInvocationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        ToolKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value.trim())
            .ok_or_else(|| ToolInvocationError::UnknownTool(value.to_string()))
    }
}

const WEB_SEARCH_PARAMS: &[ParamSpec] = &[
    ParamSpec::required("query", ParamType::String),
    ParamSpec::optional("num_results", ParamType::Integer),
];
const SCRAPE_URL_PARAMS: &[ParamSpec] = &[
    ParamSpec::required("url", ParamType::String),
    ParamSpec::optional("format", ParamType::String),
];
const COMPANY_INFO_PARAMS: &[ParamSpec] = &[
    ParamSpec::required("company_name", ParamType::String),
    ParamSpec::optional("platform", ParamType::String),
];
const PERSON_PROFILE_PARAMS: &[ParamSpec] = &[
    ParamSpec::required("name", ParamType::String),
    ParamSpec::optional("company", ParamType::String),
    ParamSpec::optional("profile_url", ParamType::String),
];
const JOB_SEARCH_PARAMS: &[ParamSpec] = &[
    ParamSpec::required("query", ParamType::String),
    ParamSpec::optional("location", ParamType::String),
];
const PRODUCT_INFO_PARAMS: &[ParamSpec] = &[
    ParamSpec::required("query", ParamType::String),
    ParamSpec::optional("platform", ParamType::String),
];
const SOCIAL_PROFILE_PARAMS: &[ParamSpec] = &[
    ParamSpec::required("username", ParamType::String),
    ParamSpec::optional("platform", ParamType::String),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Integer,
    Boolean,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ParamSpec {
    pub name: &'static str,
    pub ty: ParamType,
    pub required: bool,
}

impl ParamSpec {
    const fn required(name: &'static str, ty: ParamType) -> Self {
        Self {
            name,
            ty,
            required: true,
        }
    }

    const fn optional(name: &'static str, ty: ParamType) -> Self {
        Self {
            name,
            ty,
            required: false,
        }
    }
}

/// Declared contract of one tool, as shown to the decision service.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub kind: ToolKind,
    pub description: &'static str,
    pub params: &'static [ParamSpec],
}

impl ToolSpec {
    /// Check arguments against the declared parameter schema.
    pub fn validate(&self, arguments: &Map<String, Value>) -> Result<(), ToolInvocationError> {
        for name in arguments.keys() {
            if !self.params.iter().any(|param| param.name == name) {
                return Err(ToolInvocationError::InvalidArguments(format!(
                    "{} does not accept `{name}`",
                    self.kind
                )));
            }
        }

        for param in self.params {
            match arguments.get(param.name) {
                None | Some(Value::Null) if param.required => {
                    return Err(ToolInvocationError::InvalidArguments(format!(
                        "{} requires `{}`",
                        self.kind, param.name
                    )));
                }
                None | Some(Value::Null) => {}
                Some(value) => {
                    let ok = match param.ty {
                        ParamType::String => value.as_str().is_some_and(|s| !s.trim().is_empty()),
                        ParamType::Integer => value.as_i64().is_some(),
                        ParamType::Boolean => value.is_boolean(),
                    };
                    if !ok {
                        return Err(ToolInvocationError::InvalidArguments(format!(
                            "{}.{} expects a non-empty {:?}",
                            self.kind, param.name, param.ty
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Tool catalogue handed to the decision service.
pub fn catalogue() -> Vec<ToolSpec> {
    ToolKind::ALL.iter().map(ToolKind::spec).collect()
}

/// Extract the host portion of a URL, without scheme or `www.` prefix.
pub fn host_of(url: &str) -> String {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let host = without_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or(without_scheme);
    host.trim_start_matches("www.").to_ascii_lowercase()
}

fn platform_domain(platform: &str) -> String {
    let platform = platform.trim().to_ascii_lowercase();
    if platform.contains('.') {
        platform
    } else {
        format!("{platform}.com")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn validation_rejects_missing_and_unknown_params() {
        let spec = ToolKind::CompanyInfo.spec();
        assert!(spec.validate(&args(json!({"company_name": "Acme"}))).is_ok());
        assert!(matches!(
            spec.validate(&args(json!({}))),
            Err(ToolInvocationError::InvalidArguments(_))
        ));
        assert!(spec
            .validate(&args(json!({"company_name": "Acme", "bogus": 1})))
            .is_err());
        assert!(ToolKind::WebSearch
            .spec()
            .validate(&args(json!({"query": "x", "num_results": "ten"})))
            .is_err());
    }

    #[test]
    fn names_round_trip_through_from_str() {
        for kind in ToolKind::ALL {
            assert_eq!(kind.as_str().parse::<ToolKind>().unwrap(), kind);
        }
        assert!("extract".parse::<ToolKind>().is_err());
    }

    #[test]
    fn default_sources_follow_arguments() {
        assert_eq!(
            ToolKind::ScrapeUrl.default_source(&args(json!({"url": "https://www.tesla.com/about"}))),
            "tesla.com"
        );
        assert_eq!(
            ToolKind::CompanyInfo.default_source(&args(json!({"platform": "crunchbase"}))),
            "crunchbase.com"
        );
        assert_eq!(ToolKind::WebSearch.default_source(&Map::new()), "web search");
    }
}
