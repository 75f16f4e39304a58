use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::ToolInvocationError;
use crate::evidence::ToolCall;
use crate::security::SecretValue;
use crate::tools::{BackendResponse, ToolBackend, ToolKind};

/// Provider tools for platform-specific variants.
const PLATFORM_TOOLS: &[(ToolKind, &str, &str)] = &[
    (ToolKind::CompanyInfo, "linkedin", "web_data_linkedin_company_profile"),
    (ToolKind::CompanyInfo, "crunchbase", "web_data_crunchbase_company"),
    (ToolKind::CompanyInfo, "zoominfo", "web_data_zoominfo_company_profile"),
    (ToolKind::ProductInfo, "amazon", "web_data_amazon_product_search"),
    (ToolKind::ProductInfo, "walmart", "web_data_walmart_product"),
    (ToolKind::ProductInfo, "ebay", "web_data_ebay_product"),
    (ToolKind::ProductInfo, "bestbuy", "web_data_bestbuy_products"),
    (ToolKind::SocialProfile, "instagram", "web_data_instagram_profiles"),
    (ToolKind::SocialProfile, "tiktok", "web_data_tiktok_profiles"),
    (ToolKind::SocialProfile, "youtube", "web_data_youtube_profiles"),
];

/// Provider-side names for each tool.
const DEFAULT_ALIASES: &[(ToolKind, &str)] = &[
    (ToolKind::WebSearch, "search_engine"),
    (ToolKind::ScrapeUrl, "scrape_as_markdown"),
    (ToolKind::CompanyInfo, "web_data_linkedin_company_profile"),
    (ToolKind::PersonProfile, "web_data_linkedin_person_profile"),
    (ToolKind::JobSearch, "web_data_linkedin_job_listings"),
    (ToolKind::ProductInfo, "web_data_amazon_product_search"),
    (ToolKind::SocialProfile, "web_data_instagram_profiles"),
];

#[derive(Serialize)]
struct GatewayRequest<'a> {
    tool: &'a str,
    arguments: &'a Map<String, Value>,
}

/// Provider tool name and arguments for one call.
struct Route {
    tool: String,
    arguments: Map<String, Value>,
}

/// JSON gateway client: `POST {base_url}/tools/call` with `{tool, arguments}`,
/// answered by `{success, data | error}`.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
    token: Option<SecretValue>,
    aliases: HashMap<ToolKind, String>,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, token: Option<SecretValue>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            aliases: DEFAULT_ALIASES
                .iter()
                .map(|(kind, name)| (*kind, name.to_string()))
                .collect(),
        }
    }

    /// Bound every HTTP exchange, independent of the invoker's own timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> anyhow::Result<Self> {
        self.client = Client::builder().timeout(timeout).build()?;
        Ok(self)
    }

    pub fn with_alias(mut self, tool: ToolKind, provider_name: impl Into<String>) -> Self {
        self.aliases.insert(tool, provider_name.into());
        self
    }

    pub fn provider_name(&self, tool: ToolKind) -> &str {
        self.aliases
            .get(&tool)
            .map(String::as_str)
            .unwrap_or(tool.as_str())
    }

    fn endpoint(&self) -> String {
        format!("{}/tools/call", self.base_url)
    }

    /// Resolve platform variants; the `platform` and `format` selectors are consumed here
    /// and not forwarded.
    fn route(&self, call: &ToolCall) -> Result<Route, ToolInvocationError> {
        let mut arguments = call.arguments.clone();
        let platform = arguments
            .remove("platform")
            .and_then(|value| value.as_str().map(|s| s.trim().to_ascii_lowercase()));

        let tool = match (call.tool, platform) {
            (ToolKind::ScrapeUrl, _) => match arguments.remove("format") {
                Some(Value::String(format)) if !format.trim().is_empty() => {
                    format!("scrape_as_{}", format.trim().to_ascii_lowercase())
                }
                _ => self.provider_name(call.tool).to_string(),
            },
            (kind, Some(platform)) => {
                let platform = platform.trim_end_matches(".com");
                PLATFORM_TOOLS
                    .iter()
                    .find(|(tool, name, _)| *tool == kind && *name == platform)
                    .map(|(_, _, provider)| provider.to_string())
                    .ok_or_else(|| {
                        ToolInvocationError::InvalidArguments(format!(
                            "{kind} does not support platform `{platform}`"
                        ))
                    })?
            }
            (kind, None) => self.provider_name(kind).to_string(),
        };
        Ok(Route { tool, arguments })
    }
}

#[async_trait]
impl ToolBackend for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn call(&self, call: &ToolCall) -> Result<BackendResponse, ToolInvocationError> {
        let route = self.route(call)?;
        debug!(tool = %route.tool, endpoint = %self.endpoint(), "calling gateway");

        let mut request = self.client.post(self.endpoint()).json(&GatewayRequest {
            tool: &route.tool,
            arguments: &route.arguments,
        });
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose());
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }

        response
            .json::<BackendResponse>()
            .await
            .map_err(|err| ToolInvocationError::Backend(format!("malformed gateway response: {err}")))
    }
}

fn transport_error(err: reqwest::Error) -> ToolInvocationError {
    if err.is_timeout() {
        ToolInvocationError::Network(format!("gateway request timed out: {err}"))
    } else {
        ToolInvocationError::Network(err.to_string())
    }
}

fn status_error(status: StatusCode, body: String) -> ToolInvocationError {
    let detail = if body.trim().is_empty() {
        status.to_string()
    } else {
        format!("{status}: {}", body.trim())
    };
    match status {
        StatusCode::TOO_MANY_REQUESTS => ToolInvocationError::RateLimited(detail),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ToolInvocationError::Unauthorized(detail)
        }
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            ToolInvocationError::InvalidArguments(detail)
        }
        StatusCode::NOT_FOUND => ToolInvocationError::UnknownTool(detail),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            ToolInvocationError::Network(detail)
        }
        status if status.is_server_error() => ToolInvocationError::Network(detail),
        _ => ToolInvocationError::Backend(detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tools_map_to_provider_names() {
        let backend = HttpBackend::new("http://localhost:8931/", None)
            .with_alias(ToolKind::SocialProfile, "web_data_x_posts");
        assert_eq!(
            backend.provider_name(ToolKind::CompanyInfo),
            "web_data_linkedin_company_profile"
        );
        assert_eq!(backend.provider_name(ToolKind::SocialProfile), "web_data_x_posts");
        assert_eq!(backend.endpoint(), "http://localhost:8931/tools/call");
    }

    #[test]
    fn platforms_select_provider_variants() {
        let backend = HttpBackend::new("http://localhost:8931", None);
        let call = ToolCall::new(
            ToolKind::CompanyInfo,
            serde_json::json!({"company_name": "Acme", "platform": "crunchbase"}),
        );
        let route = backend.route(&call).unwrap();
        assert_eq!(route.tool, "web_data_crunchbase_company");
        assert!(!route.arguments.contains_key("platform"));

        let scrape = ToolCall::new(
            ToolKind::ScrapeUrl,
            serde_json::json!({"url": "https://acme.com", "format": "html"}),
        );
        assert_eq!(backend.route(&scrape).unwrap().tool, "scrape_as_html");

        let unsupported = ToolCall::new(
            ToolKind::ProductInfo,
            serde_json::json!({"query": "widgets", "platform": "etsy"}),
        );
        assert!(matches!(
            backend.route(&unsupported),
            Err(ToolInvocationError::InvalidArguments(_))
        ));
    }

    #[test]
    fn statuses_map_to_taxonomy() {
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS, String::new()).is_transient());
        assert!(status_error(StatusCode::BAD_GATEWAY, "upstream".into()).is_transient());
        assert!(matches!(
            status_error(StatusCode::FORBIDDEN, String::new()),
            ToolInvocationError::Unauthorized(_)
        ));
        assert!(!status_error(StatusCode::UNPROCESSABLE_ENTITY, "bad url".into()).is_transient());
    }
}
