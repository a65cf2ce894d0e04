//! Exchange-rate resolution with tiered provider fallback and caching.
//!
//! ## Data Flow
//!
//! ```text
//! lookup ──▶ validate ──▶ cache? ──▶ primary (JSON, date-ranged)
//!                          │              │ on failure
//!                          │              ▼
//!                          │         fallback (HTML table)
//!                          │              │ on failure
//!                          ▼              ▼
//!                      {rate, cached}  RateNotFound
//! ```
//!
//! A missing rate is always the explicit [`LedgerLensError::RateNotFound`]
//! signal, never `0.0` — a legitimate zero rate is not excluded by the
//! domain, so a numeric sentinel would be ambiguous.
//!
//! Concurrent identical lookups are not de-duplicated: under low
//! concurrency the duplicate network cost is acceptable, and because a
//! `(from, to, date)` rate is an immutable historical fact the racing
//! writers store the same value (last-writer-wins, never incorrect).

pub mod cache;
mod providers;

use crate::config::ProcessingConfig;
use crate::error::LedgerLensError;
use cache::TimedCache;
use chrono::NaiveDate;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Identity of one rate: currency pair plus ISO date.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateKey {
    pub from: String,
    pub to: String,
    pub date: NaiveDate,
}

impl RateKey {
    /// Build a key from already-validated parts, normalising case.
    pub fn new(from: &str, to: &str, date: NaiveDate) -> Self {
        Self {
            from: from.to_ascii_uppercase(),
            to: to.to_ascii_uppercase(),
            date,
        }
    }

    /// Validate raw request parameters into a key.
    ///
    /// Currency codes must be three ASCII letters; the date must be a valid
    /// ISO calendar date. Both failures are user errors, distinct from a
    /// later resolution failure.
    pub fn parse(from: &str, to: &str, date: &str) -> Result<Self, LedgerLensError> {
        let validate = |code: &str| -> Result<(), LedgerLensError> {
            if code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic()) {
                Ok(())
            } else {
                Err(LedgerLensError::InvalidCurrency {
                    code: code.to_string(),
                })
            }
        };
        validate(from)?;
        validate(to)?;
        let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|_| {
            LedgerLensError::InvalidDate {
                input: date.to_string(),
            }
        })?;
        Ok(Self::new(from, to, date))
    }

    /// Comma-joined serialisation used as the cache key.
    pub fn cache_key(&self) -> String {
        format!("{},{},{}", self.from, self.to, self.date.format("%Y-%m-%d"))
    }
}

/// Resolves a rate through the tiered provider chain.
pub struct ExchangeRateResolver {
    client: reqwest::Client,
    primary_base_url: String,
    fallback_url: String,
}

impl ExchangeRateResolver {
    pub fn new(config: &ProcessingConfig) -> Result<Self, LedgerLensError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.http_timeout_secs))
            .build()
            .map_err(|e| LedgerLensError::Internal(format!("http client: {e}")))?;
        Ok(Self {
            client,
            primary_base_url: config.primary_rate_base_url.clone(),
            fallback_url: config.fallback_rate_url.clone(),
        })
    }

    /// Resolve one rate: primary provider first, HTML fallback second.
    ///
    /// Both tiers failing yields `RateNotFound`; tier-level errors are
    /// logged but never surfaced individually.
    pub async fn resolve(&self, key: &RateKey) -> Result<f64, LedgerLensError> {
        match providers::fetch_primary(&self.client, &self.primary_base_url, key).await {
            Ok(rate) => {
                debug!("Primary provider resolved {} = {}", key.cache_key(), rate);
                return Ok(rate);
            }
            Err(e) => {
                warn!(
                    "Primary rate provider failed for {} ({}); trying fallback",
                    key.cache_key(),
                    e
                );
            }
        }

        match providers::fetch_fallback(&self.client, &self.fallback_url, key).await {
            Ok(rate) => {
                debug!("Fallback provider resolved {} = {}", key.cache_key(), rate);
                Ok(rate)
            }
            Err(e) => {
                warn!("Fallback rate provider failed for {} ({})", key.cache_key(), e);
                Err(LedgerLensError::RateNotFound {
                    from: key.from.clone(),
                    to: key.to.clone(),
                    date: key.date.format("%Y-%m-%d").to_string(),
                })
            }
        }
    }
}

/// Successful rate lookup, flagging whether it was served from cache.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateLookup {
    pub rate: f64,
    pub cached: bool,
}

/// [`ExchangeRateResolver`] wrapped with a [`TimedCache`].
///
/// The cache instance is owned here and shared via `Arc` so the owning
/// service can start a sweep with [`TimedCache::spawn_sweeper`] and tie its
/// lifetime to the service, not to a global.
pub struct CachedRateResolver {
    resolver: ExchangeRateResolver,
    cache: Arc<TimedCache<f64>>,
    sweep_period: std::time::Duration,
}

impl CachedRateResolver {
    pub fn new(config: &ProcessingConfig) -> Result<Self, LedgerLensError> {
        Ok(Self {
            resolver: ExchangeRateResolver::new(config)?,
            cache: Arc::new(TimedCache::new(config.rate_cache_ttl)),
            sweep_period: config.rate_sweep_period,
        })
    }

    /// The shared cache, for introspection and tests.
    pub fn cache(&self) -> &Arc<TimedCache<f64>> {
        &self.cache
    }

    /// Start the configured background sweep. The owning service holds the
    /// handle; dropping it stops the sweep with the service.
    pub fn spawn_sweeper(&self) -> cache::SweeperHandle {
        self.cache.spawn_sweeper(self.sweep_period)
    }

    /// Validate parameters, then serve from cache or resolve and store.
    ///
    /// Failed resolutions are never cached: the next lookup retries the
    /// provider chain.
    pub async fn lookup(
        &self,
        from: &str,
        to: &str,
        date: &str,
    ) -> Result<RateLookup, LedgerLensError> {
        let key = RateKey::parse(from, to, date)?;

        if let Some(rate) = self.cache.get(&key.cache_key()) {
            return Ok(RateLookup { rate, cached: true });
        }

        let rate = self.resolver.resolve(&key).await?;
        self.cache.set(key.cache_key(), rate);
        Ok(RateLookup {
            rate,
            cached: false,
        })
    }
}
