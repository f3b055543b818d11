// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Search Result Cache
//!
//! Read-through cache of full search responses in the fast tier.
//! Entries expire through the tier's own TTL and are never invalidated on
//! write, so a cached response can be up to one TTL stale.
//!
//! # Key layout
//!
//! ```text
//! search:{normalized text}:{sort_field}:{sort_order}
//! ```
//!
//! Sort field and order come from a closed vocabulary without `:`, so the
//! last two segments always parse back unambiguously and two different
//! queries never share a key, whatever the search text contains.
//!
//! # Payload
//!
//! Values are a versioned envelope, `{"schema": 1, "cached_at": .., "payload": ..}`.
//! An entry with another schema (or one that no longer deserializes into
//! the requested type) is reported as a miss and overwritten by the next
//! store.
//!
//! # Failure
//!
//! The cache is advisory. Fast-tier errors turn lookups into misses and
//! stores into no-ops; neither is surfaced to the caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::SearchQuery;
use crate::metrics;
use crate::records::now_millis;
use crate::storage::traits::FastStore;

/// Version of the cached envelope. Bump when the payload shape changes.
pub const SEARCH_CACHE_SCHEMA: u32 = 1;

const KEY_PREFIX: &str = "search:";
const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Envelope stored under each cache key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedPayload<T> {
    pub schema: u32,
    /// Epoch millis when the payload was computed
    pub cached_at: i64,
    pub payload: T,
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct SearchCacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries discarded because of a schema mismatch or undecodable payload
    pub stale: u64,
    /// Fast-tier failures on lookup or store
    pub errors: u64,
    pub stores: u64,
    /// Hit rate (0.0 - 1.0)
    pub hit_rate: f64,
}

pub struct SearchCache {
    fast: Arc<dyn FastStore>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    stale: AtomicU64,
    errors: AtomicU64,
    stores: AtomicU64,
}

impl SearchCache {
    /// Cache with the default 300 second TTL.
    pub fn new(fast: Arc<dyn FastStore>) -> Self {
        Self::with_ttl(fast, DEFAULT_TTL)
    }

    pub fn with_ttl(fast: Arc<dyn FastStore>, ttl: Duration) -> Self {
        Self {
            fast,
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stale: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            stores: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fast-tier key for a query.
    #[must_use]
    pub fn cache_key(query: &SearchQuery) -> String {
        format!(
            "{}{}:{}:{}",
            KEY_PREFIX,
            query.text(),
            query.sort_field(),
            query.sort_order()
        )
    }

    /// Cached response for `query`, or `None` on miss, stale entry or tier failure.
    pub async fn lookup<T: DeserializeOwned>(&self, query: &SearchQuery) -> Option<T> {
        let key = Self::cache_key(query);

        let raw = match self.fast.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache_lookup("miss");
                debug!(key = %key, "Search cache miss");
                return None;
            }
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache_lookup("error");
                warn!(key = %key, error = %e, "Search cache lookup failed, treating as miss");
                return None;
            }
        };

        match decode::<T>(&raw) {
            Some(payload) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache_lookup("hit");
                debug!(key = %key, "Search cache hit");
                Some(payload)
            }
            None => {
                self.stale.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache_lookup("stale_schema");
                debug!(key = %key, "Discarding cached search payload with unexpected shape");
                None
            }
        }
    }

    /// Populate the cache after a miss. Last write wins.
    pub async fn store<T: Serialize>(&self, query: &SearchQuery, response: &T) {
        let key = Self::cache_key(query);
        let envelope = CachedPayload {
            schema: SEARCH_CACHE_SCHEMA,
            cached_at: now_millis(),
            payload: response,
        };

        let raw = match serde_json::to_string(&envelope) {
            Ok(raw) => raw,
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache_store("error");
                warn!(key = %key, error = %e, "Failed to serialize search response for cache");
                return;
            }
        };

        match self.fast.set_with_ttl(&key, &raw, self.ttl).await {
            Ok(()) => {
                self.stores.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache_store("stored");
            }
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache_store("error");
                warn!(key = %key, error = %e, "Failed to populate search cache");
            }
        }
    }

    pub fn stats(&self) -> SearchCacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let stale = self.stale.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        let total = hits + misses + stale + errors;

        SearchCacheStats {
            hits,
            misses,
            stale,
            errors,
            stores: self.stores.load(Ordering::Relaxed),
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

fn decode<T: DeserializeOwned>(raw: &str) -> Option<T> {
    let envelope: CachedPayload<serde_json::Value> = serde_json::from_str(raw).ok()?;
    if envelope.schema != SEARCH_CACHE_SCHEMA {
        return None;
    }
    serde_json::from_value(envelope.payload).ok()
}
