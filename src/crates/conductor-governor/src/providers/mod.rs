//! Provider clients.
//!
//! Each supported vendor gets a client that knows three things: how to probe
//! current limits out-of-band, how to map the vendor's response headers onto
//! the canonical [`RateLimitStatus`], and how to price token usage for spend
//! telemetry.

pub mod anthropic;
pub mod openai;

pub use anthropic::AnthropicClient;
pub use openai::OpenAiClient;

use crate::error::Result;
use crate::status::RateLimitStatus;
use async_trait::async_trait;
use reqwest::header::HeaderMap;

/// Token counts for a completed invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

/// Estimated spend in USD. Telemetry only; never used for gating.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CostEstimate {
    pub input: f64,
    pub output: f64,
    pub total: f64,
}

impl CostEstimate {
    pub fn from_rates(usage: TokenUsage, input_per_mtok: f64, output_per_mtok: f64) -> Self {
        let input = usage.input as f64 / 1_000_000.0 * input_per_mtok;
        let output = usage.output as f64 / 1_000_000.0 * output_per_mtok;
        Self {
            input,
            output,
            total: input + output,
        }
    }
}

/// A pluggable vendor integration.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Canonical provider name, e.g. "anthropic".
    fn name(&self) -> &'static str;

    /// Out-of-band probe (tiny request) used on cold start or when no
    /// response headers are available.
    async fn query_status(&self, model: &str) -> Result<RateLimitStatus>;

    /// Map vendor response headers to the canonical three-bucket status.
    /// Returns `None` when the headers carry no rate-limit information.
    fn parse_headers(&self, headers: &HeaderMap, model: &str) -> Option<RateLimitStatus>;

    /// Price a usage report for spend telemetry.
    fn estimate_cost(&self, model: &str, usage: TokenUsage) -> CostEstimate;
}

pub(crate) fn header_i64(headers: &HeaderMap, name: &str) -> Option<i64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

pub(crate) fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name)?.to_str().ok()
}
