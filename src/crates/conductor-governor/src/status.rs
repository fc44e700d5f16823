//! Canonical three-bucket rate-limit status.
//!
//! Every provider's headers are normalized into the same shape: a requests
//! bucket, an input-tokens bucket, and an output-tokens bucket, each with a
//! limit, a remaining count, and an optional reset time.

use chrono::{DateTime, Utc};
use conductor_store::RateLimitSnapshot;
use serde::{Deserialize, Serialize};

/// One budget bucket. A `limit` of 0 means the provider does not constrain
/// this dimension (it is never treated as exhausted).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub limit: i64,
    pub remaining: i64,
    pub resets_at: Option<DateTime<Utc>>,
}

impl Bucket {
    pub fn new(limit: i64, remaining: i64) -> Self {
        Self {
            limit,
            remaining,
            resets_at: None,
        }
    }

    pub fn with_reset(mut self, resets_at: DateTime<Utc>) -> Self {
        self.resets_at = Some(resets_at);
        self
    }

    /// Remaining capacity as a fraction of the limit. Unconstrained buckets
    /// report 1.0.
    pub fn fraction_remaining(&self) -> f64 {
        if self.limit <= 0 {
            return 1.0;
        }
        (self.remaining.max(0) as f64) / (self.limit as f64)
    }
}

/// Point-in-time budget for one (provider, model) pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub provider: String,
    pub model: String,
    pub requests: Bucket,
    pub input_tokens: Bucket,
    pub output_tokens: Bucket,
    /// Vendor tier name when the headers carry one.
    pub tier: Option<String>,
    /// When this status was observed.
    pub captured_at: DateTime<Utc>,
}

impl RateLimitStatus {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            captured_at: Utc::now(),
            ..Default::default()
        }
    }

    /// Fully unconstrained status, used when a provider surfaces no headers.
    pub fn unconstrained(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self::new(provider, model)
    }

    /// Overall remaining capacity: the minimum fraction across the three
    /// buckets.
    pub fn overall_remaining(&self) -> f64 {
        self.requests
            .fraction_remaining()
            .min(self.input_tokens.fraction_remaining())
            .min(self.output_tokens.fraction_remaining())
    }

    /// True when some constrained bucket has nothing left.
    pub fn is_exhausted(&self) -> bool {
        self.overall_remaining() <= 0.0
    }

    /// Earliest reset time across constrained buckets.
    pub fn earliest_reset(&self) -> Option<DateTime<Utc>> {
        [&self.requests, &self.input_tokens, &self.output_tokens]
            .into_iter()
            .filter(|b| b.limit > 0)
            .filter_map(|b| b.resets_at)
            .min()
    }

    /// Convert to the store's append-only snapshot shape.
    pub fn to_snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            provider: self.provider.clone(),
            model: self.model.clone(),
            requests_limit: self.requests.limit,
            requests_remaining: self.requests.remaining,
            requests_reset_at: self.requests.resets_at.map(|t| t.to_rfc3339()),
            input_tokens_limit: self.input_tokens.limit,
            input_tokens_remaining: self.input_tokens.remaining,
            input_tokens_reset_at: self.input_tokens.resets_at.map(|t| t.to_rfc3339()),
            output_tokens_limit: self.output_tokens.limit,
            output_tokens_remaining: self.output_tokens.remaining,
            output_tokens_reset_at: self.output_tokens.resets_at.map(|t| t.to_rfc3339()),
            tier: self.tier.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_limit_is_unconstrained() {
        let bucket = Bucket::new(0, 0);
        assert_eq!(bucket.fraction_remaining(), 1.0);

        let mut status = RateLimitStatus::new("openai", "gpt-4o");
        status.requests = Bucket::new(100, 50);
        // OpenAI has no output-tokens header; limit 0 must not exhaust.
        status.output_tokens = Bucket::new(0, 0);
        assert_eq!(status.overall_remaining(), 0.5);
        assert!(!status.is_exhausted());
    }

    #[test]
    fn test_overall_remaining_is_min_across_buckets() {
        let mut status = RateLimitStatus::new("anthropic", "claude");
        status.requests = Bucket::new(100, 80);
        status.input_tokens = Bucket::new(1000, 100);
        status.output_tokens = Bucket::new(500, 400);
        assert!((status.overall_remaining() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_exhausted_and_earliest_reset() {
        let soon = Utc::now() + chrono::Duration::seconds(1);
        let later = Utc::now() + chrono::Duration::seconds(60);

        let mut status = RateLimitStatus::new("anthropic", "claude");
        status.requests = Bucket::new(100, 0).with_reset(later);
        status.input_tokens = Bucket::new(1000, 500).with_reset(soon);
        assert!(status.is_exhausted());
        assert_eq!(status.earliest_reset(), Some(soon));
    }

    #[test]
    fn test_negative_remaining_clamps_to_zero() {
        let bucket = Bucket::new(10, -3);
        assert_eq!(bucket.fraction_remaining(), 0.0);
    }

    #[test]
    fn test_snapshot_round_trip_fields() {
        let mut status = RateLimitStatus::new("anthropic", "claude-sonnet");
        status.requests = Bucket::new(100, 5);
        status.tier = Some("scale".into());

        let snapshot = status.to_snapshot();
        assert_eq!(snapshot.provider, "anthropic");
        assert_eq!(snapshot.requests_limit, 100);
        assert_eq!(snapshot.requests_remaining, 5);
        assert_eq!(snapshot.tier.as_deref(), Some("scale"));
    }
}
