//! The governor: knows remaining capacity, gates dispatches.

use crate::error::{GovernorError, Result};
use crate::policy::ThrottleConfig;
use crate::providers::{CostEstimate, ProviderClient, TokenUsage};
use crate::status::RateLimitStatus;
use chrono::Utc;
use conductor_store::ExecutionLog;
use dashmap::DashMap;
use reqwest::header::HeaderMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Clone)]
struct CachedStatus {
    status: RateLimitStatus,
    fetched_at: Instant,
    last_dispatch: Option<Instant>,
}

/// Cross-provider budget tracker and throttle.
///
/// Holds the latest [`RateLimitStatus`] per (provider, model), refreshes
/// stale entries through the registered [`ProviderClient`]s, and converts
/// remaining capacity into dispatch delays per the [`ThrottleConfig`].
pub struct Governor {
    clients: HashMap<&'static str, Arc<dyn ProviderClient>>,
    statuses: DashMap<(String, String), CachedStatus>,
    config: ThrottleConfig,
    store: Option<Arc<ExecutionLog>>,
}

impl Governor {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            clients: HashMap::new(),
            statuses: DashMap::new(),
            config,
            store: None,
        }
    }

    /// Attach an execution log; every observed status is then persisted as an
    /// append-only snapshot.
    pub fn with_store(mut self, store: Arc<ExecutionLog>) -> Self {
        self.store = Some(store);
        self
    }

    /// Register a provider client. Later registrations replace earlier ones
    /// of the same name.
    pub fn register_provider(&mut self, client: Arc<dyn ProviderClient>) {
        self.clients.insert(client.name(), client);
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// Install a status directly, bypassing any probe. Used on warm start
    /// (rehydrating from the log) and by tests.
    pub fn seed(&self, status: RateLimitStatus) {
        let key = (status.provider.clone(), status.model.clone());
        self.statuses.insert(
            key,
            CachedStatus {
                status,
                fetched_at: Instant::now(),
                last_dispatch: None,
            },
        );
    }

    /// Current cached status, if any.
    pub fn status(&self, provider: &str, model: &str) -> Option<RateLimitStatus> {
        self.statuses
            .get(&(provider.to_string(), model.to_string()))
            .map(|entry| entry.status.clone())
    }

    /// Price a usage report through the provider's client. Telemetry only.
    pub fn estimate_cost(
        &self,
        provider: &str,
        model: &str,
        usage: TokenUsage,
    ) -> Option<CostEstimate> {
        self.clients
            .get(provider)
            .map(|client| client.estimate_cost(model, usage))
    }

    /// Gate one dispatch for (provider, model). Blocks or errors when the
    /// budget is exhausted, sleeps when utilization is past the target, and
    /// returns the delay actually applied.
    pub async fn acquire(&self, provider: &str, model: &str) -> Result<Duration> {
        let key = (provider.to_string(), model.to_string());

        let mut cached = self.fresh_status(&key).await?;

        // Exhausted: wait for the earliest reset, then re-check.
        while cached.status.is_exhausted() {
            let wait = cached
                .status
                .earliest_reset()
                .and_then(|reset| (reset - Utc::now()).to_std().ok())
                .unwrap_or(Duration::from_secs(1));

            if !self.config.block_on_limit {
                return Err(GovernorError::Exhausted {
                    provider: provider.to_string(),
                    model: model.to_string(),
                    resets_at: cached
                        .status
                        .earliest_reset()
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "unknown".into()),
                });
            }

            info!(provider, model, wait_ms = wait.as_millis() as u64, "budget exhausted; blocking until reset");
            tokio::time::sleep(wait).await;

            if let Some(client) = self.clients.get(provider) {
                match client.query_status(model).await {
                    Ok(status) => {
                        self.seed(status);
                    }
                    Err(e) => warn!(provider, model, error = %e, "status re-probe failed after reset"),
                }
                cached = self.fresh_status(&key).await?;
            } else {
                // No client to re-probe: trust the reset time we just slept past.
                let mut status = cached.status.clone();
                status.requests.remaining = status.requests.limit;
                status.input_tokens.remaining = status.input_tokens.limit;
                status.output_tokens.remaining = status.output_tokens.limit;
                status.captured_at = Utc::now();
                self.seed(status);
                cached = self.fresh_status(&key).await?;
            }
        }

        let remaining = cached.status.overall_remaining();
        let mut delay = self.config.delay_for(remaining);

        // Wall time already spent since the previous dispatch counts against
        // the delay, so back-to-back acquires are not double-throttled.
        if let Some(last) = cached.last_dispatch {
            delay = delay.saturating_sub(last.elapsed());
        }

        if !delay.is_zero() {
            debug!(provider, model, delay_ms = delay.as_millis() as u64, remaining, "throttling dispatch");
            tokio::time::sleep(delay).await;
        }

        if let Some(mut entry) = self.statuses.get_mut(&key) {
            entry.last_dispatch = Some(Instant::now());
        }

        Ok(delay)
    }

    /// Update the map from response headers, when the transport surfaced
    /// them, and persist a snapshot.
    pub async fn observe_headers(
        &self,
        provider: &str,
        model: &str,
        headers: &HeaderMap,
    ) -> Result<()> {
        let Some(client) = self.clients.get(provider) else {
            return Err(GovernorError::UnknownProvider(provider.to_string()));
        };
        let Some(status) = client.parse_headers(headers, model) else {
            return Ok(());
        };

        self.record(&status).await?;
        self.seed(status);
        Ok(())
    }

    /// Install a freshly observed status and persist it.
    pub async fn observe_status(&self, status: RateLimitStatus) -> Result<()> {
        self.record(&status).await?;
        self.seed(status);
        Ok(())
    }

    async fn record(&self, status: &RateLimitStatus) -> Result<()> {
        if let Some(store) = &self.store {
            store.record_rate_limit(&status.to_snapshot()).await?;
        }
        Ok(())
    }

    /// Return the cached entry for a key, refreshing it through the provider
    /// client when missing or older than the TTL.
    async fn fresh_status(&self, key: &(String, String)) -> Result<CachedStatus> {
        let ttl = Duration::from_millis(self.config.status_ttl_ms);
        if let Some(entry) = self.statuses.get(key) {
            if entry.fetched_at.elapsed() < ttl {
                return Ok(entry.clone());
            }
        }

        let (provider, model) = (key.0.as_str(), key.1.as_str());
        let status = match self.clients.get(provider) {
            Some(client) => match client.query_status(model).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(provider, model, error = %e, "status probe failed; assuming unconstrained");
                    RateLimitStatus::unconstrained(provider, model)
                }
            },
            // No client registered: nothing to refresh against. A previously
            // seeded (stale) status is better than nothing.
            None => match self.statuses.get(key) {
                Some(entry) => entry.status.clone(),
                None => RateLimitStatus::unconstrained(provider, model),
            },
        };

        let cached = CachedStatus {
            status,
            fetched_at: Instant::now(),
            last_dispatch: self.statuses.get(key).and_then(|e| e.last_dispatch),
        };
        self.statuses.insert(key.clone(), cached.clone());
        Ok(cached)
    }
}

impl std::fmt::Debug for Governor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Governor")
            .field("providers", &self.clients.keys().collect::<Vec<_>>())
            .field("tracked", &self.statuses.len())
            .finish()
    }
}
