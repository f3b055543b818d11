use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::records::{Paper, PaperSummary, User};
use crate::search::SearchQuery;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Item not found")]
    NotFound,
    #[error("Storage backend error: {0}")]
    Backend(String),
    /// Unique constraint violation in the durable tier.
    #[error("Duplicate value for unique field '{field}'")]
    Duplicate { field: String },
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Circuit breaker is open for this tier; the call was not attempted.
    #[error("Storage tier unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    #[must_use]
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}

/// One page of a prefix scan.
///
/// `cursor == 0` means the scan is complete. A key may show up on more
/// than one page (Redis `SCAN` semantics), so consumers must tolerate repeats.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    pub cursor: u64,
    pub keys: Vec<String>,
}

impl ScanPage {
    #[must_use]
    pub fn is_last(&self) -> bool {
        self.cursor == 0
    }
}

/// Subtract `amount` from counter `key`, deleting it once it reaches zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterSettlement {
    pub key: String,
    pub amount: i64,
}

/// Fold `delta` into the durable `views` total of `item_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewIncrement {
    pub item_id: String,
    pub delta: u64,
}

/// Outcome of a bulk view increment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkUpdateResult {
    /// Increments submitted
    pub requested: usize,
    /// Increments that hit an existing record (the rest were no-ops)
    pub matched: usize,
}

/// Ephemeral, low-latency key-value tier (Redis in production).
///
/// Keys passed in are logical keys: implementations apply their own
/// namespace prefix and strip it again from scan results.
#[async_trait]
pub trait FastStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Write `value` with an expiry enforced by the tier itself.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError>;

    /// Atomically increment an integer key (created at 0), returning the new value.
    ///
    /// Not idempotent: implementations must not retry this call.
    async fn incr(&self, key: &str) -> Result<i64, StorageError>;

    /// Enumerate keys starting with `prefix`, one page per call.
    /// Start with `cursor = 0`; `count` is a page size hint.
    async fn scan_prefix(&self, prefix: &str, cursor: u64, count: usize) -> Result<ScanPage, StorageError>;

    /// Read many keys at once. Result order matches `keys`.
    /// Default implementation falls back to sequential gets.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, StorageError> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key).await?);
        }
        Ok(values)
    }

    /// Delete keys, returning how many existed.
    async fn delete_many(&self, keys: &[String]) -> Result<u64, StorageError>;

    /// Atomically subtract each settlement amount and delete counters that
    /// reach zero. Missing keys are skipped. Returns the number of keys deleted.
    async fn settle_counters(&self, settlements: &[CounterSettlement]) -> Result<u64, StorageError>;

    async fn hash_exists(&self, hash: &str, field: &str) -> Result<bool, StorageError>;

    async fn hash_set(&self, hash: &str, field: &str, value: &str) -> Result<(), StorageError>;
}

/// Authoritative document store (SQL in production).
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get_paper(&self, id: &str) -> Result<Option<Paper>, StorageError>;

    async fn insert_paper(&self, paper: &Paper) -> Result<(), StorageError>;

    /// Point read by username (case-insensitive).
    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, StorageError>;

    /// Insert a user, failing with [`StorageError::Duplicate`] when the
    /// normalized username or e-mail is already taken.
    async fn insert_user(&self, user: &User) -> Result<(), StorageError>;

    /// Apply all increments as one bulk operation. Ids without a record are
    /// skipped silently. Either every matching record is updated or none is.
    async fn bulk_increment_views(&self, increments: &[ViewIncrement]) -> Result<BulkUpdateResult, StorageError>;

    /// Case-insensitive text search over title, abstract and keywords.
    async fn search_papers(&self, query: &SearchQuery) -> Result<Vec<PaperSummary>, StorageError>;
}
