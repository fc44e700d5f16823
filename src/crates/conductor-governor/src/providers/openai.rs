//! OpenAI provider client.
//!
//! Header schema: `x-ratelimit-{limit,remaining,reset}-{requests,tokens}`.
//! Reset values come as relative durations ("1s", "6m12s", "250ms") or, from
//! some gateways, absolute timestamps. There is no output-tokens header; that
//! bucket stays at limit 0, which the status math treats as unconstrained.

use super::{header_i64, header_str, CostEstimate, ProviderClient, TokenUsage};
use crate::error::{GovernorError, Result};
use crate::status::{Bucket, RateLimitStatus};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use regex::Regex;
use reqwest::header::HeaderMap;
use serde_json::json;
use std::sync::OnceLock;
use tracing::warn;

const API_URL: &str = "https://api.openai.com/v1/chat/completions";
const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Client for OpenAI's rate-limit headers and pricing.
pub struct OpenAiClient {
    http: reqwest::Client,
}

impl OpenAiClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for OpenAiClient {
    fn default() -> Self {
        Self::new()
    }
}

fn duration_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+)(ms|s|m|h|d)").expect("valid duration regex"))
}

/// Parse an OpenAI reset value relative to `now`.
///
/// Accepts concatenated duration segments (`6m12s`), a bare integer (epoch
/// seconds), or an RFC 3339 timestamp. Anything else falls back to `None`.
pub(crate) fn parse_reset(value: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    // Bare integer: epoch seconds.
    if let Ok(epoch) = value.parse::<i64>() {
        return DateTime::<Utc>::from_timestamp(epoch, 0);
    }

    // Absolute timestamp.
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }

    // Relative duration segments.
    let mut total_ms: i64 = 0;
    let mut matched = 0;
    for cap in duration_regex().captures_iter(value) {
        let amount: i64 = cap[1].parse().ok()?;
        total_ms += match &cap[2] {
            "ms" => amount,
            "s" => amount * 1_000,
            "m" => amount * 60_000,
            "h" => amount * 3_600_000,
            "d" => amount * 86_400_000,
            _ => return None,
        };
        matched += 1;
    }
    if matched == 0 {
        return None;
    }
    Some(now + ChronoDuration::milliseconds(total_ms))
}

#[async_trait]
impl ProviderClient for OpenAiClient {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn query_status(&self, model: &str) -> Result<RateLimitStatus> {
        let api_key = match std::env::var(API_KEY_ENV) {
            Ok(key) if !key.is_empty() => key,
            _ => {
                warn!(model, "no {} set; treating openai limits as unknown", API_KEY_ENV);
                return Ok(RateLimitStatus::unconstrained("openai", model));
            }
        };

        let response = self
            .http
            .post(API_URL)
            .bearer_auth(api_key)
            .json(&json!({
                "model": model,
                "max_tokens": 1,
                "messages": [{"role": "user", "content": "ping"}],
            }))
            .send()
            .await
            .map_err(|e| GovernorError::ProbeFailed {
                provider: "openai".into(),
                model: model.to_string(),
                message: e.to_string(),
            })?;

        let headers = response.headers().clone();
        Ok(self
            .parse_headers(&headers, model)
            .unwrap_or_else(|| RateLimitStatus::unconstrained("openai", model)))
    }

    fn parse_headers(&self, headers: &HeaderMap, model: &str) -> Option<RateLimitStatus> {
        let now = Utc::now();

        let requests_limit = header_i64(headers, "x-ratelimit-limit-requests");
        let tokens_limit = header_i64(headers, "x-ratelimit-limit-tokens");
        if requests_limit.is_none() && tokens_limit.is_none() {
            return None;
        }

        let mut requests = Bucket::new(
            requests_limit.unwrap_or(0),
            header_i64(headers, "x-ratelimit-remaining-requests").unwrap_or(0),
        );
        requests.resets_at = header_str(headers, "x-ratelimit-reset-requests")
            .and_then(|v| parse_reset(v, now));

        // The tokens headers cover the input side; output has no header and
        // stays unconstrained.
        let mut input_tokens = Bucket::new(
            tokens_limit.unwrap_or(0),
            header_i64(headers, "x-ratelimit-remaining-tokens").unwrap_or(0),
        );
        input_tokens.resets_at =
            header_str(headers, "x-ratelimit-reset-tokens").and_then(|v| parse_reset(v, now));

        let mut status = RateLimitStatus::new("openai", model);
        status.requests = requests;
        status.input_tokens = input_tokens;
        status.output_tokens = Bucket::new(0, 0);
        Some(status)
    }

    fn estimate_cost(&self, model: &str, usage: TokenUsage) -> CostEstimate {
        // USD per million tokens, by model family.
        let (input_rate, output_rate) = if model.starts_with("o1") || model.starts_with("o3") {
            (15.0, 60.0)
        } else if model.contains("mini") {
            (0.15, 0.6)
        } else {
            (2.5, 10.0)
        };
        CostEstimate::from_rates(usage, input_rate, output_rate)
    }
}
