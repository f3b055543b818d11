// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis fast tier.
//!
//! Plain string keys hold search payloads (`SET ... PX`) and view counters
//! (`INCR`). Username reservations live in a single hash. Every key is
//! namespaced with the configured prefix, and scan results come back with
//! the prefix stripped so callers only ever see logical keys.
//!
//! Counter settlement runs as one Lua script so that the read of a counter,
//! the subtraction and the conditional delete happen atomically with respect
//! to concurrent `INCR`s:
//!
//! ```text
//! for each key:  EXISTS? → DECRBY committed → DEL if ≤ 0
//! ```

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, pipe, AsyncCommands, Client, Script};
use tracing::debug;

use super::traits::{CounterSettlement, FastStore, ScanPage, StorageError};
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig};
use crate::resilience::guarded;
use crate::resilience::retry::{retry, RetryConfig};

const TIER: &str = "fast";

const SETTLE_SCRIPT: &str = r"
local deleted = 0
for i, key in ipairs(KEYS) do
    if redis.call('EXISTS', key) == 1 then
        local remaining = redis.call('DECRBY', key, ARGV[i])
        if remaining <= 0 then
            redis.call('DEL', key)
            deleted = deleted + 1
        end
    end
end
return deleted
";

pub struct RedisStore {
    connection: ConnectionManager,
    /// Optional key prefix for namespacing (e.g., "papers:" → "papers:paper_views:<id>")
    prefix: String,
    settle_script: Script,
    circuit: CircuitBreaker,
}

impl RedisStore {
    /// Create a new Redis store without a key prefix.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::with_prefix(connection_string, None).await
    }

    /// Create a new Redis store with an optional key prefix.
    ///
    /// The prefix is prepended to all keys, so several deployments can
    /// share one Redis instance.
    ///
    /// ```rust,no_run
    /// # use paper_sync::storage::redis::RedisStore;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// // Keys will be prefixed: "papers:search:...", "papers:paper_views:..."
    /// let store = RedisStore::with_prefix("redis://localhost", Some("papers:")).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_prefix(connection_string: &str, prefix: Option<&str>) -> Result<Self, StorageError> {
        let client = Client::open(connection_string).map_err(|e| StorageError::Backend(e.to_string()))?;

        // Startup config: fail fast on a bad URL instead of hanging
        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))?;

        Ok(Self {
            connection,
            prefix: prefix.unwrap_or("").to_string(),
            settle_script: Script::new(SETTLE_SCRIPT),
            circuit: CircuitBreaker::new("fast_tier", CircuitConfig::fast_tier()),
        })
    }

    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.prefix, key)
        }
    }

    /// Strip the prefix from a key (for returning logical keys).
    #[inline]
    fn strip_prefix<'a>(&self, key: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            key
        } else {
            key.strip_prefix(&self.prefix).unwrap_or(key)
        }
    }

    /// Get the configured prefix
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    /// Round trip to the server.
    pub async fn ping(&self) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        guarded(&self.circuit, TIER, "ping", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            async move {
                let _: String = cmd("PING").query_async(&mut conn).await?;
                Ok::<_, redis::RedisError>(())
            }
        })
        .await
    }
}

/// Escape glob metacharacters so a literal prefix can be used in `SCAN MATCH`.
fn escape_glob(literal: &str) -> String {
    let mut escaped = String::with_capacity(literal.len());
    for c in literal.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait]
impl FastStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        guarded(&self.circuit, TIER, "get", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let value: Option<String> = conn.get(&key).await?;
                Ok::<_, redis::RedisError>(value)
            }
        })
        .await
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);
        let millis = ttl.as_millis().max(1) as u64;

        guarded(&self.circuit, TIER, "set_with_ttl", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            let value = value.to_string();
            async move {
                let _: () = conn.pset_ex(&key, &value, millis).await?;
                Ok::<_, redis::RedisError>(())
            }
        })
        .await
    }

    async fn incr(&self, key: &str) -> Result<i64, StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        // Single attempt: a retried INCR may count one access twice
        guarded(&self.circuit, TIER, "incr", &RetryConfig::none(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let value: i64 = conn.incr(&key, 1i64).await?;
                Ok::<_, redis::RedisError>(value)
            }
        })
        .await
    }

    async fn scan_prefix(&self, prefix: &str, cursor: u64, count: usize) -> Result<ScanPage, StorageError> {
        let conn = self.connection.clone();
        let pattern = format!("{}*", escape_glob(&self.prefixed_key(prefix)));

        let (next, raw_keys): (u64, Vec<String>) =
            guarded(&self.circuit, TIER, "scan", &RetryConfig::sweep(), || {
                let mut conn = conn.clone();
                let pattern = pattern.clone();
                async move {
                    let page: (u64, Vec<String>) = cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(count.max(1))
                        .query_async(&mut conn)
                        .await?;
                    Ok::<_, redis::RedisError>(page)
                }
            })
            .await?;

        let keys: Vec<String> = raw_keys.iter().map(|k| self.strip_prefix(k).to_string()).collect();
        debug!(cursor, next_cursor = next, keys = keys.len(), "Scanned fast-tier page");

        Ok(ScanPage { cursor: next, keys })
    }

    /// Pipelined GETs, one round trip for the whole page.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, StorageError> {
        if keys.is_empty() {
            return Ok(vec![]);
        }

        let conn = self.connection.clone();
        let prefixed: Vec<String> = keys.iter().map(|k| self.prefixed_key(k)).collect();

        guarded(&self.circuit, TIER, "get_many", &RetryConfig::sweep(), || {
            let mut conn = conn.clone();
            let prefixed = prefixed.clone();
            async move {
                let mut pipeline = pipe();
                for key in &prefixed {
                    pipeline.get(key);
                }
                let values: Vec<Option<String>> = pipeline.query_async(&mut conn).await?;
                Ok::<_, redis::RedisError>(values)
            }
        })
        .await
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64, StorageError> {
        if keys.is_empty() {
            return Ok(0);
        }

        let conn = self.connection.clone();
        let prefixed: Vec<String> = keys.iter().map(|k| self.prefixed_key(k)).collect();

        guarded(&self.circuit, TIER, "delete_many", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let prefixed = prefixed.clone();
            async move {
                let removed: u64 = cmd("DEL").arg(&prefixed).query_async(&mut conn).await?;
                Ok::<_, redis::RedisError>(removed)
            }
        })
        .await
    }

    async fn settle_counters(&self, settlements: &[CounterSettlement]) -> Result<u64, StorageError> {
        if settlements.is_empty() {
            return Ok(0);
        }

        let conn = self.connection.clone();
        let script = self.settle_script.clone();
        let prepared: Vec<(String, i64)> = settlements
            .iter()
            .map(|s| (self.prefixed_key(&s.key), s.amount))
            .collect();

        // Not idempotent either: a replay would subtract twice
        guarded(&self.circuit, TIER, "settle_counters", &RetryConfig::none(), || {
            let mut conn = conn.clone();
            let script = script.clone();
            let prepared = prepared.clone();
            async move {
                let mut invocation = script.prepare_invoke();
                for (key, amount) in &prepared {
                    invocation.key(key).arg(*amount);
                }
                let deleted: u64 = invocation.invoke_async(&mut conn).await?;
                Ok::<_, redis::RedisError>(deleted)
            }
        })
        .await
    }

    async fn hash_exists(&self, hash: &str, field: &str) -> Result<bool, StorageError> {
        let conn = self.connection.clone();
        let hash = self.prefixed_key(hash);

        guarded(&self.circuit, TIER, "hash_exists", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let hash = hash.clone();
            let field = field.to_string();
            async move {
                let exists: bool = conn.hexists(&hash, &field).await?;
                Ok::<_, redis::RedisError>(exists)
            }
        })
        .await
    }

    async fn hash_set(&self, hash: &str, field: &str, value: &str) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        let hash = self.prefixed_key(hash);

        guarded(&self.circuit, TIER, "hash_set", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let hash = hash.clone();
            let field = field.to_string();
            let value = value.to_string();
            async move {
                let _: () = conn.hset(&hash, &field, &value).await?;
                Ok::<_, redis::RedisError>(())
            }
        })
        .await
    }
}
