//! # JWKS Cache
//!
//! This module keeps one refreshable signing-key set per issuer key location and shares
//! it across all requests.
//!
//! ## Key Features
//! - Per-issuer state: a refresh for one issuer never blocks lookups for another
//! - Single-flight fetches: concurrent callers that find the set stale wait for one fetch
//! - Validity window of `max(min_refresh_interval, Cache-Control max-age)`
//! - Serve-stale-on-error: a failed refresh keeps the last good set, reports the
//!   failure to the caller that triggered it, and backs off before trying again
//! - Optional background refresher that stops on a [`CancellationToken`]
//!
//! ## Concurrency Model
//! Each issuer slot has a short-lived `parking_lot::RwLock` around the cached entry and
//! an async mutex that serialises fetches. Readers never wait on a fetch while the
//! cached entry is still usable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use metrics::counter;
use parking_lot::RwLock;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::clock::Clock;
use crate::core::config::JwksConfig;
use crate::core::error::{FetchFailure, GatewayError, GatewayResult};
use crate::observability::metrics::JWKS_FETCHES_TOTAL;

/// A key document as returned by the transport, with its cache lifetime hint
#[derive(Debug, Clone)]
pub struct FetchedKeySet {
    pub keys: JwkSet,
    /// `max-age` from the response's `Cache-Control` header, if any
    pub max_age: Option<Duration>,
}

/// Transport used to download key documents
#[async_trait]
pub trait JwksFetcher: Send + Sync + fmt::Debug {
    async fn fetch(&self, location: &str) -> GatewayResult<FetchedKeySet>;
}

/// Fetches key documents over HTTP with a bounded timeout
#[derive(Debug, Clone)]
pub struct HttpJwksFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpJwksFetcher {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl JwksFetcher for HttpJwksFetcher {
    async fn fetch(&self, location: &str) -> GatewayResult<FetchedKeySet> {
        let timeout_ms = self.timeout.as_millis() as u64;
        let response = self
            .client
            .get(location)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| GatewayError::from_reqwest(location, e, timeout_ms))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::fetch(
                location,
                FetchFailure::Status {
                    status: status.as_u16(),
                },
            ));
        }

        let max_age = cache_control_max_age(
            response
                .headers()
                .get(reqwest::header::CACHE_CONTROL)
                .and_then(|value| value.to_str().ok()),
        );

        let body = response
            .bytes()
            .await
            .map_err(|e| GatewayError::from_reqwest(location, e, timeout_ms))?;

        let keys = parse_key_set(&body)
            .map_err(|message| GatewayError::fetch(location, FetchFailure::Decode { message }))?;

        Ok(FetchedKeySet { keys, max_age })
    }
}

#[derive(Deserialize)]
struct RawKeySet {
    keys: Vec<serde_json::Value>,
}

/// Parse a JWKS document, skipping individual keys this gateway cannot use
pub fn parse_key_set(body: &[u8]) -> Result<JwkSet, String> {
    let raw: RawKeySet = serde_json::from_slice(body).map_err(|e| e.to_string())?;

    let mut keys = Vec::with_capacity(raw.keys.len());
    for value in raw.keys {
        let kid = value
            .get("kid")
            .and_then(|kid| kid.as_str())
            .unwrap_or("<none>")
            .to_string();
        match serde_json::from_value::<Jwk>(value) {
            Ok(jwk) => keys.push(jwk),
            Err(err) => debug!(kid = %kid, error = %err, "Skipping unusable JWK"),
        }
    }

    if keys.is_empty() {
        return Err("key set contains no usable keys".to_string());
    }
    Ok(JwkSet { keys })
}

/// Derive a TTL from a `Cache-Control` header value
///
/// `no-cache` and `no-store` yield a zero TTL so the configured minimum applies.
pub fn cache_control_max_age(value: Option<&str>) -> Option<Duration> {
    let value = value?;
    let mut max_age = None;
    for directive in value.split(',').map(|d| d.trim().to_ascii_lowercase()) {
        if directive == "no-cache" || directive == "no-store" {
            return Some(Duration::ZERO);
        }
        if let Some(seconds) = directive.strip_prefix("max-age=") {
            if let Ok(seconds) = seconds.trim_matches('"').parse::<u64>() {
                max_age = Some(Duration::from_secs(seconds));
            }
        }
    }
    max_age
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}

#[derive(Debug, Clone)]
struct JwksEntry {
    key_set: Arc<JwkSet>,
    valid_until: DateTime<Utc>,
    /// Set after a failed refresh; the stale set is served until then
    retry_not_before: Option<DateTime<Utc>>,
}

impl JwksEntry {
    fn usable_at(&self, now: DateTime<Utc>) -> bool {
        now < self.valid_until || self.retry_not_before.map_or(false, |retry| now < retry)
    }
}

#[derive(Debug)]
struct IssuerSlot {
    location: String,
    min_refresh_interval: Duration,
    entry: RwLock<Option<JwksEntry>>,
    fetch_lock: Mutex<()>,
}

impl IssuerSlot {
    fn new(location: &str, min_refresh_interval: Duration) -> Self {
        Self {
            location: location.to_string(),
            min_refresh_interval,
            entry: RwLock::new(None),
            fetch_lock: Mutex::new(()),
        }
    }

    fn usable(&self, now: DateTime<Utc>) -> Option<Arc<JwkSet>> {
        self.entry
            .read()
            .as_ref()
            .filter(|entry| entry.usable_at(now))
            .map(|entry| entry.key_set.clone())
    }
}

/// Shared signing-key cache keyed by issuer key location
#[derive(Debug)]
pub struct JwksCache {
    fetcher: Arc<dyn JwksFetcher>,
    clock: Arc<dyn Clock>,
    issuers: DashMap<String, Arc<IssuerSlot>>,
    default_min_refresh: Duration,
    failure_backoff: Duration,
}

impl JwksCache {
    pub fn new(fetcher: Arc<dyn JwksFetcher>, clock: Arc<dyn Clock>, config: &JwksConfig) -> Self {
        Self {
            fetcher,
            clock,
            issuers: DashMap::new(),
            default_min_refresh: config.min_refresh_interval,
            failure_backoff: config.failure_backoff,
        }
    }

    /// Register an issuer key location; the first registration's interval wins
    pub fn register(&self, location: &str, min_refresh_interval: Duration) {
        self.issuers
            .entry(location.to_string())
            .or_insert_with(|| Arc::new(IssuerSlot::new(location, min_refresh_interval)));
    }

    /// Locations currently tracked by the cache
    pub fn registered_locations(&self) -> Vec<String> {
        self.issuers.iter().map(|slot| slot.key().clone()).collect()
    }

    // Clones the slot out so no DashMap shard guard is held across an await.
    fn slot(&self, location: &str) -> Arc<IssuerSlot> {
        if let Some(slot) = self.issuers.get(location) {
            return slot.clone();
        }
        self.register(location, self.default_min_refresh);
        self.issuers
            .get(location)
            .map(|slot| slot.clone())
            .unwrap_or_else(|| Arc::new(IssuerSlot::new(location, self.default_min_refresh)))
    }

    /// Get the key set for `location`, fetching it when missing or stale
    pub async fn get(&self, location: &str) -> GatewayResult<Arc<JwkSet>> {
        let slot = self.slot(location);
        if let Some(key_set) = slot.usable(self.clock.now()) {
            return Ok(key_set);
        }

        let _flight = slot.fetch_lock.lock().await;
        if let Some(key_set) = slot.usable(self.clock.now()) {
            debug!(location = %location, "Key set refreshed by a concurrent caller");
            return Ok(key_set);
        }

        self.fetch_and_store(&slot).await
    }

    /// Fetch `location` now regardless of freshness
    pub async fn refresh(&self, location: &str) -> GatewayResult<()> {
        let slot = self.slot(location);
        let _flight = slot.fetch_lock.lock().await;
        self.fetch_and_store(&slot).await.map(|_| ())
    }

    async fn fetch_and_store(&self, slot: &IssuerSlot) -> GatewayResult<Arc<JwkSet>> {
        debug!(location = %slot.location, "Fetching JWKS");
        let result = self.fetcher.fetch(&slot.location).await;
        let now = self.clock.now();

        match result {
            Ok(fetched) => {
                counter!(JWKS_FETCHES_TOTAL, "result" => "success").increment(1);
                let ttl = slot
                    .min_refresh_interval
                    .max(fetched.max_age.unwrap_or(Duration::ZERO));
                let key_set = Arc::new(fetched.keys);
                *slot.entry.write() = Some(JwksEntry {
                    key_set: key_set.clone(),
                    valid_until: now + to_chrono(ttl),
                    retry_not_before: None,
                });
                info!(
                    location = %slot.location,
                    keys = key_set.keys.len(),
                    ttl_secs = ttl.as_secs(),
                    "JWKS refreshed"
                );
                Ok(key_set)
            }
            Err(err) => {
                counter!(JWKS_FETCHES_TOTAL, "result" => "failure").increment(1);
                if let Some(entry) = slot.entry.write().as_mut() {
                    entry.retry_not_before = Some(now + to_chrono(self.failure_backoff));
                    warn!(
                        location = %slot.location,
                        error = %err,
                        "JWKS refresh failed, serving last good key set"
                    );
                } else {
                    warn!(location = %slot.location, error = %err, "JWKS fetch failed");
                }
                Err(err)
            }
        }
    }

    /// Periodically refresh every registered issuer until `cancel` fires
    ///
    /// Failures are logged and the last good key set keeps being served.
    pub fn spawn_refresher(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; requests populate the cache on demand.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("JWKS background refresher stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        for location in cache.registered_locations() {
                            if let Err(err) = cache.refresh(&location).await {
                                warn!(location = %location, error = %err, "Background JWKS refresh failed");
                            }
                        }
                    }
                }
            }
        })
    }
}
