//! Provider adapter: everything specific to the one upstream this proxy
//! fronts — URL construction, header rewriting, streaming detection, and
//! rate-limit header parsing.

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use chrono::{DateTime, TimeZone, Utc};

use crate::models::RateLimitSignal;

/// Hop-by-hop headers plus the credential headers we always overwrite
/// ourselves. Never copied from the inbound request verbatim.
const STRIPPED_HEADERS: &[&str] = &[
    "host",
    "connection",
    "content-length",
    "transfer-encoding",
    "keep-alive",
    "proxy-authorization",
    "te",
    "trailer",
    "upgrade",
    "authorization",
    "x-api-key",
];

const USER_AGENT: &str = "relay-gateway/1.0";
const VERSION_HEADER: &str = "anthropic-version";
const VERSION_VALUE: &str = "2023-06-01";

pub struct ProviderAdapter {
    default_base_url: String,
}

impl ProviderAdapter {
    pub fn new(default_base_url: impl Into<String>) -> Self {
        Self {
            default_base_url: default_base_url.into(),
        }
    }

    /// Joins the account's `base_url` override (or the default upstream)
    /// with the inbound path and query, unchanged.
    pub fn build_url(&self, path_and_query: &str, account_base_url: Option<&str>) -> String {
        let base = account_base_url.unwrap_or(&self.default_base_url);
        format!("{}{}", base.trim_end_matches('/'), path_and_query)
    }

    /// Copies incoming headers minus hop-by-hop/credential headers, then
    /// injects exactly one of `Authorization: Bearer` or `x-api-key`.
    pub fn prepare_headers(
        &self,
        incoming: &HeaderMap,
        access_token: Option<&str>,
        api_key: Option<&str>,
    ) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in incoming.iter() {
            let lower = name.as_str().to_ascii_lowercase();
            if STRIPPED_HEADERS.contains(&lower.as_str()) {
                continue;
            }
            headers.insert(name.clone(), value.clone());
        }

        debug_assert!(
            !(access_token.is_some() && api_key.is_some()),
            "an account never carries both an access token and an api key"
        );

        if let Some(token) = access_token {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                headers.insert(HeaderName::from_static("authorization"), value);
            }
            headers.insert(
                HeaderName::from_static("user-agent"),
                HeaderValue::from_static(USER_AGENT),
            );
            headers.insert(
                HeaderName::from_static(VERSION_HEADER),
                HeaderValue::from_static(VERSION_VALUE),
            );
        } else if let Some(key) = api_key {
            if let Ok(value) = HeaderValue::from_str(key) {
                headers.insert(HeaderName::from_static("x-api-key"), value);
            }
            headers.insert(
                HeaderName::from_static(VERSION_HEADER),
                HeaderValue::from_static(VERSION_VALUE),
            );
        }

        headers
    }

    pub fn is_streaming(&self, headers: &HeaderMap) -> bool {
        headers
            .get(axum::http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.starts_with("text/event-stream"))
            .unwrap_or(false)
    }

    /// Parses the provider's rate-limit headers into a structured signal.
    pub fn parse_rate_limit(&self, status: u16, headers: &HeaderMap) -> RateLimitSignal {
        let status_tag = headers
            .get("x-ratelimit-status")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let remaining = headers
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<i64>().ok());

        let reset_at = headers
            .get("retry-after-reset")
            .or_else(|| headers.get("x-ratelimit-reset"))
            .and_then(|v| v.to_str().ok())
            .and_then(parse_epoch_seconds);

        let is_rate_limited = status == 429
            || status_tag
                .as_deref()
                .map(|tag| tag.eq_ignore_ascii_case("rate_limited"))
                .unwrap_or(false);

        RateLimitSignal {
            is_rate_limited,
            reset_at,
            remaining,
            status_tag,
        }
    }

    /// Peeks a response header for a provider-advertised tier change.
    /// Returns `None` when the provider gave no such signal — which is the
    /// common case and not treated as an error.
    pub fn extract_tier_info(&self, headers: &HeaderMap) -> Option<i64> {
        headers
            .get("x-account-tier")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<i64>().ok())
    }
}

fn parse_epoch_seconds(raw: &str) -> Option<DateTime<Utc>> {
    raw.trim().parse::<i64>().ok().and_then(|secs| match Utc.timestamp_opt(secs, 0) {
        chrono::LocalResult::Single(dt) => Some(dt),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_url_uses_account_override() {
        let adapter = ProviderAdapter::new("https://api.default.test");
        let url = adapter.build_url("/v1/messages?x=1", Some("https://custom.test/"));
        assert_eq!(url, "https://custom.test/v1/messages?x=1");
    }

    #[test]
    fn build_url_falls_back_to_default() {
        let adapter = ProviderAdapter::new("https://api.default.test");
        let url = adapter.build_url("/v1/messages", None);
        assert_eq!(url, "https://api.default.test/v1/messages");
    }

    #[test]
    fn prepare_headers_strips_hop_by_hop_and_injects_bearer() {
        let adapter = ProviderAdapter::new("https://api.default.test");
        let mut incoming = HeaderMap::new();
        incoming.insert("host", HeaderValue::from_static("evil.test"));
        incoming.insert("authorization", HeaderValue::from_static("Bearer stale"));
        incoming.insert("x-custom", HeaderValue::from_static("keep-me"));

        let out = adapter.prepare_headers(&incoming, Some("fresh-token"), None);
        assert!(!out.contains_key("host"));
        assert_eq!(out.get("x-custom").unwrap(), "keep-me");
        assert_eq!(out.get("authorization").unwrap(), "Bearer fresh-token");
        assert!(!out.contains_key("x-api-key"));
    }

    #[test]
    fn prepare_headers_never_sets_both_credentials() {
        let adapter = ProviderAdapter::new("https://api.default.test");
        let out = adapter.prepare_headers(&HeaderMap::new(), Some("token"), Some("key"));
        assert!(out.contains_key("authorization"));
        assert!(!out.contains_key("x-api-key"));
    }

    #[test]
    fn is_streaming_detects_sse_content_type() {
        let adapter = ProviderAdapter::new("https://api.default.test");
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::CONTENT_TYPE,
            HeaderValue::from_static("text/event-stream; charset=utf-8"),
        );
        assert!(adapter.is_streaming(&headers));
    }

    #[test]
    fn parse_rate_limit_detects_429() {
        let adapter = ProviderAdapter::new("https://api.default.test");
        let signal = adapter.parse_rate_limit(429, &HeaderMap::new());
        assert!(signal.is_rate_limited);
    }

    #[test]
    fn parse_rate_limit_reads_reset_epoch() {
        let adapter = ProviderAdapter::new("https://api.default.test");
        let mut headers = HeaderMap::new();
        headers.insert("retry-after-reset", HeaderValue::from_static("1700000000"));
        let signal = adapter.parse_rate_limit(429, &headers);
        assert!(signal.reset_at.is_some());
    }
}
