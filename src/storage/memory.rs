//! In-process implementations of both tiers.
//!
//! Used by unit tests, the demo, and embedders that run without Redis or a
//! database. Semantics follow the real backends where callers can observe
//! them: TTLs expire on read, `incr` and counter settlement are atomic per
//! key, scan cursors survive deletes between pages, and the durable store
//! enforces case-insensitive username and e-mail uniqueness.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

use super::traits::{
    BulkUpdateResult, CounterSettlement, DurableStore, FastStore, ScanPage, StorageError, ViewIncrement,
};
use crate::records::{normalize_username, Paper, PaperSummary, User};
use crate::search::{SearchQuery, SortField, SortOrder};

#[derive(Debug, Clone)]
struct FastEntry {
    value: String,
    expires_at: Option<Instant>,
    /// Creation order, doubles as the scan cursor
    seq: u64,
}

impl FastEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Fast tier kept in a [`DashMap`].
///
/// Expiry uses `tokio::time::Instant`, so tests on a paused clock can step
/// past a TTL with `tokio::time::advance`.
pub struct InMemoryFastStore {
    entries: DashMap<String, FastEntry>,
    hashes: DashMap<String, HashMap<String, String>>,
    next_seq: AtomicU64,
}

impl InMemoryFastStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            hashes: DashMap::new(),
            next_seq: AtomicU64::new(1),
        }
    }

    fn fresh_entry(&self, value: String, expires_at: Option<Instant>) -> FastEntry {
        FastEntry {
            value,
            expires_at,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Number of live keys (hash fields not included)
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.is_live(now)).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write a raw value with no TTL (seeding counters in tests).
    pub fn insert_raw(&self, key: &str, value: &str) {
        let entry = self.fresh_entry(value.to_string(), None);
        self.entries.insert(key.to_string(), entry);
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.hashes.clear();
    }
}

impl Default for InMemoryFastStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FastStore for InMemoryFastStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let now = Instant::now();
        if let Entry::Occupied(occupied) = self.entries.entry(key.to_string()) {
            if occupied.get().is_live(now) {
                return Ok(Some(occupied.get().value.clone()));
            }
            occupied.remove();
        }
        Ok(None)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError> {
        let entry = self.fresh_entry(value.to_string(), Some(Instant::now() + ttl));
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, StorageError> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) if occupied.get().is_live(now) => {
                let current: i64 = occupied
                    .get()
                    .value
                    .parse()
                    .map_err(|_| StorageError::Backend(format!("value at '{}' is not an integer", key)))?;
                let next = current + 1;
                occupied.get_mut().value = next.to_string();
                Ok(next)
            }
            Entry::Occupied(mut occupied) => {
                *occupied.get_mut() = self.fresh_entry("1".to_string(), None);
                Ok(1)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(self.fresh_entry("1".to_string(), None));
                Ok(1)
            }
        }
    }

    async fn scan_prefix(&self, prefix: &str, cursor: u64, count: usize) -> Result<ScanPage, StorageError> {
        let now = Instant::now();
        let mut matching: Vec<(u64, String)> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && e.value().is_live(now) && e.value().seq >= cursor)
            .map(|e| (e.value().seq, e.key().clone()))
            .collect();
        matching.sort_unstable();

        let count = count.max(1);
        let next = if matching.len() > count {
            matching[count].0
        } else {
            0
        };
        let keys = matching.into_iter().take(count).map(|(_, key)| key).collect();

        Ok(ScanPage { cursor: next, keys })
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64, StorageError> {
        let now = Instant::now();
        let mut removed = 0;
        for key in keys {
            if let Some((_, entry)) = self.entries.remove(key) {
                if entry.is_live(now) {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn settle_counters(&self, settlements: &[CounterSettlement]) -> Result<u64, StorageError> {
        let now = Instant::now();
        let mut deleted = 0;
        for settlement in settlements {
            if let Entry::Occupied(mut occupied) = self.entries.entry(settlement.key.clone()) {
                if !occupied.get().is_live(now) {
                    occupied.remove();
                    continue;
                }
                let current: i64 = occupied.get().value.parse().map_err(|_| {
                    StorageError::Backend(format!("value at '{}' is not an integer", settlement.key))
                })?;
                let remaining = current - settlement.amount;
                if remaining <= 0 {
                    occupied.remove();
                    deleted += 1;
                } else {
                    occupied.get_mut().value = remaining.to_string();
                }
            }
        }
        Ok(deleted)
    }

    async fn hash_exists(&self, hash: &str, field: &str) -> Result<bool, StorageError> {
        Ok(self.hashes.get(hash).is_some_and(|h| h.contains_key(field)))
    }

    async fn hash_set(&self, hash: &str, field: &str, value: &str) -> Result<(), StorageError> {
        self.hashes
            .entry(hash.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }
}

/// Durable tier kept in [`DashMap`]s.
pub struct InMemoryDurableStore {
    papers: DashMap<String, Paper>,
    users: DashMap<String, User>,
    /// normalized username → user id
    usernames: DashMap<String, String>,
    /// lowercased e-mail → user id
    emails: DashMap<String, String>,
    bulk_calls: AtomicU64,
}

impl InMemoryDurableStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            papers: DashMap::new(),
            users: DashMap::new(),
            usernames: DashMap::new(),
            emails: DashMap::new(),
            bulk_calls: AtomicU64::new(0),
        }
    }

    /// Bulk increments submitted so far (including empty ones)
    #[must_use]
    pub fn bulk_calls(&self) -> u64 {
        self.bulk_calls.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn paper_count(&self) -> usize {
        self.papers.len()
    }

    #[must_use]
    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

impl Default for InMemoryDurableStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Title hits weigh 3, keyword hits 2, abstract hits 1 (per term).
fn relevance(paper: &Paper, query: &SearchQuery) -> u32 {
    let title = paper.title.to_lowercase();
    let abstract_text = paper.abstract_text.to_lowercase();
    let keywords: Vec<String> = paper.keywords.iter().map(|k| k.to_lowercase()).collect();

    query
        .terms()
        .map(|term| {
            let mut score = 0;
            if title.contains(term) {
                score += 3;
            }
            if keywords.iter().any(|k| k.contains(term)) {
                score += 2;
            }
            if abstract_text.contains(term) {
                score += 1;
            }
            score
        })
        .sum()
}

#[async_trait]
impl DurableStore for InMemoryDurableStore {
    async fn get_paper(&self, id: &str) -> Result<Option<Paper>, StorageError> {
        Ok(self.papers.get(id).map(|p| p.value().clone()))
    }

    async fn insert_paper(&self, paper: &Paper) -> Result<(), StorageError> {
        match self.papers.entry(paper.id.clone()) {
            Entry::Occupied(_) => Err(StorageError::Duplicate { field: "id".into() }),
            Entry::Vacant(vacant) => {
                vacant.insert(paper.clone());
                Ok(())
            }
        }
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, StorageError> {
        let id = match self.usernames.get(&normalize_username(username)) {
            Some(id) => id.value().clone(),
            None => return Ok(None),
        };
        Ok(self.users.get(&id).map(|u| u.value().clone()))
    }

    async fn insert_user(&self, user: &User) -> Result<(), StorageError> {
        let username_slot = match self.usernames.entry(user.username_key()) {
            Entry::Occupied(_) => return Err(StorageError::Duplicate { field: "username".into() }),
            Entry::Vacant(vacant) => vacant,
        };
        let email_slot = match self.emails.entry(user.email.to_lowercase()) {
            Entry::Occupied(_) => return Err(StorageError::Duplicate { field: "email".into() }),
            Entry::Vacant(vacant) => vacant,
        };

        self.users.insert(user.id.clone(), user.clone());
        email_slot.insert(user.id.clone());
        username_slot.insert(user.id.clone());
        Ok(())
    }

    async fn bulk_increment_views(&self, increments: &[ViewIncrement]) -> Result<BulkUpdateResult, StorageError> {
        self.bulk_calls.fetch_add(1, Ordering::Relaxed);

        let mut matched = 0;
        for inc in increments {
            if let Some(mut paper) = self.papers.get_mut(&inc.item_id) {
                paper.views += inc.delta;
                matched += 1;
            }
        }

        Ok(BulkUpdateResult {
            requested: increments.len(),
            matched,
        })
    }

    async fn search_papers(&self, query: &SearchQuery) -> Result<Vec<PaperSummary>, StorageError> {
        let has_text = query.terms().next().is_some();

        let mut scored: Vec<(u32, Paper)> = self
            .papers
            .iter()
            .map(|p| (relevance(p.value(), query), p.value().clone()))
            .filter(|(score, _)| !has_text || *score > 0)
            .collect();

        let descending = query.sort_order() == SortOrder::Desc;
        scored.sort_by(|(sa, a), (sb, b)| {
            let primary = match query.sort_field() {
                SortField::Relevance if has_text => sb.cmp(sa),
                SortField::Relevance => std::cmp::Ordering::Equal,
                SortField::PublicationDate if descending => b.publication_date.cmp(&a.publication_date),
                SortField::PublicationDate => a.publication_date.cmp(&b.publication_date),
            };
            primary
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });

        Ok(scored.into_iter().map(|(_, p)| p.summary()).collect())
    }
}
