//! Anthropic provider client.
//!
//! Header schema: `anthropic-ratelimit-{requests,input-tokens,output-tokens}-
//! {limit,remaining,reset}` with ISO-8601 reset timestamps.

use super::{header_i64, header_str, CostEstimate, ProviderClient, TokenUsage};
use crate::error::{GovernorError, Result};
use crate::status::{Bucket, RateLimitStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use serde_json::json;
use tracing::warn;

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Client for Anthropic's rate-limit headers and pricing.
pub struct AnthropicClient {
    http: reqwest::Client,
}

impl AnthropicClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    fn parse_bucket(headers: &HeaderMap, dimension: &str) -> Bucket {
        let limit = header_i64(headers, &format!("anthropic-ratelimit-{dimension}-limit"));
        let remaining =
            header_i64(headers, &format!("anthropic-ratelimit-{dimension}-remaining"));
        let reset = header_str(headers, &format!("anthropic-ratelimit-{dimension}-reset"))
            .and_then(parse_iso_timestamp);

        let mut bucket = Bucket::new(limit.unwrap_or(0), remaining.unwrap_or(0));
        bucket.resets_at = reset;
        bucket
    }
}

impl Default for AnthropicClient {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_iso_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[async_trait]
impl ProviderClient for AnthropicClient {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn query_status(&self, model: &str) -> Result<RateLimitStatus> {
        let api_key = match std::env::var(API_KEY_ENV) {
            Ok(key) if !key.is_empty() => key,
            _ => {
                warn!(model, "no {} set; treating anthropic limits as unknown", API_KEY_ENV);
                return Ok(RateLimitStatus::unconstrained("anthropic", model));
            }
        };

        // Minimal one-token request; we only care about the headers.
        let response = self
            .http
            .post(API_URL)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&json!({
                "model": model,
                "max_tokens": 1,
                "messages": [{"role": "user", "content": "ping"}],
            }))
            .send()
            .await
            .map_err(|e| GovernorError::ProbeFailed {
                provider: "anthropic".into(),
                model: model.to_string(),
                message: e.to_string(),
            })?;

        let headers = response.headers().clone();
        Ok(self
            .parse_headers(&headers, model)
            .unwrap_or_else(|| RateLimitStatus::unconstrained("anthropic", model)))
    }

    fn parse_headers(&self, headers: &HeaderMap, model: &str) -> Option<RateLimitStatus> {
        let requests = Self::parse_bucket(headers, "requests");
        let input_tokens = Self::parse_bucket(headers, "input-tokens");
        let output_tokens = Self::parse_bucket(headers, "output-tokens");

        if requests.limit == 0 && input_tokens.limit == 0 && output_tokens.limit == 0 {
            return None;
        }

        let mut status = RateLimitStatus::new("anthropic", model);
        status.requests = requests;
        status.input_tokens = input_tokens;
        status.output_tokens = output_tokens;
        status.tier = header_str(headers, "anthropic-ratelimit-tier").map(str::to_string);
        Some(status)
    }

    fn estimate_cost(&self, model: &str, usage: TokenUsage) -> CostEstimate {
        // USD per million tokens, by model family.
        let (input_rate, output_rate) = if model.contains("opus") {
            (15.0, 75.0)
        } else if model.contains("haiku") {
            (0.8, 4.0)
        } else {
            // Sonnet-class default.
            (3.0, 15.0)
        };
        CostEstimate::from_rates(usage, input_rate, output_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderName, HeaderValue};

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_parse_headers_three_buckets() {
        let client = AnthropicClient::new();
        let headers = headers(&[
            ("anthropic-ratelimit-requests-limit", "4000"),
            ("anthropic-ratelimit-requests-remaining", "3999"),
            ("anthropic-ratelimit-requests-reset", "2026-08-01T12:00:00Z"),
            ("anthropic-ratelimit-input-tokens-limit", "400000"),
            ("anthropic-ratelimit-input-tokens-remaining", "123456"),
            ("anthropic-ratelimit-output-tokens-limit", "80000"),
            ("anthropic-ratelimit-output-tokens-remaining", "80000"),
        ]);

        let status = client.parse_headers(&headers, "claude-sonnet-4").unwrap();
        assert_eq!(status.requests.limit, 4000);
        assert_eq!(status.requests.remaining, 3999);
        assert!(status.requests.resets_at.is_some());
        assert_eq!(status.input_tokens.remaining, 123456);
        assert_eq!(status.output_tokens.limit, 80000);
    }

    #[test]
    fn test_parse_headers_absent_returns_none() {
        let client = AnthropicClient::new();
        let empty = HeaderMap::new();
        assert!(client.parse_headers(&empty, "claude-sonnet-4").is_none());
    }

    #[test]
    fn test_parse_headers_iso_reset() {
        let client = AnthropicClient::new();
        let headers = headers(&[
            ("anthropic-ratelimit-requests-limit", "100"),
            ("anthropic-ratelimit-requests-remaining", "1"),
            ("anthropic-ratelimit-requests-reset", "2026-08-01T00:00:30+00:00"),
        ]);
        let status = client.parse_headers(&headers, "claude").unwrap();
        let reset = status.requests.resets_at.unwrap();
        assert_eq!(reset.to_rfc3339(), "2026-08-01T00:00:30+00:00");
    }

    #[test]
    fn test_estimate_cost_by_family() {
        let client = AnthropicClient::new();
        let usage = TokenUsage {
            input: 1_000_000,
            output: 1_000_000,
        };
        assert_eq!(client.estimate_cost("claude-opus-4", usage).total, 90.0);
        assert_eq!(client.estimate_cost("claude-sonnet-4", usage).total, 18.0);
        assert_eq!(client.estimate_cost("claude-haiku-4", usage).total, 4.8);
    }
}
