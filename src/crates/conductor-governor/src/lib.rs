//! # conductor-governor - Provider-Aware Rate Limiting
//!
//! Two jobs: **know** the remaining capacity for every (provider, model) pair
//! the runtime dispatches against, and **gate** dispatches so the budget is
//! spent smoothly instead of slamming into a 429 wall.
//!
//! ## How capacity is known
//!
//! - **Response headers** are the primary source: after an invocation, the
//!   transport's headers are run through the provider's
//!   [`ProviderClient::parse_headers`] and the canonical three-bucket
//!   [`RateLimitStatus`] is cached and snapshotted to the execution log.
//! - **Out-of-band probes** ([`ProviderClient::query_status`]) cover cold
//!   start and TTL expiry, when no recent headers exist.
//!
//! ## How dispatches are gated
//!
//! [`Governor::acquire`] computes the overall remaining fraction (the minimum
//! across the requests / input-tokens / output-tokens buckets, with limit 0
//! meaning unconstrained) and:
//!
//! - blocks until reset (or fails fast, per [`ThrottleConfig::block_on_limit`])
//!   when the budget is exhausted,
//! - sleeps a bounded, strategy-shaped delay when utilization is past
//!   [`ThrottleConfig::target_utilization`],
//! - passes through untouched otherwise.
//!
//! Applied delays are always within `[min_delay_ms, max_delay_ms]` and are
//! reduced by wall time already elapsed since the previous dispatch.
//!
//! ## Example
//!
//! ```rust,no_run
//! use conductor_governor::{Governor, ThrottleConfig, AnthropicClient};
//! use std::sync::Arc;
//!
//! # async fn example() -> conductor_governor::Result<()> {
//! let mut governor = Governor::new(ThrottleConfig::default());
//! governor.register_provider(Arc::new(AnthropicClient::new()));
//!
//! let applied = governor.acquire("anthropic", "claude-sonnet-4").await?;
//! println!("throttled for {:?}", applied);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod governor;
pub mod policy;
pub mod providers;
pub mod status;

pub use error::{GovernorError, Result};
pub use governor::Governor;
pub use policy::{BackoffStrategy, ThrottleConfig};
pub use providers::{AnthropicClient, CostEstimate, OpenAiClient, ProviderClient, TokenUsage};
pub use status::{Bucket, RateLimitStatus};
