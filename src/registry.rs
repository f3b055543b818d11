//! Username reservations in the fast tier.
//!
//! One hash, `usernames`, holds a field per taken (lowercased) username.
//! It is a shortcut in front of the durable uniqueness constraint, not a
//! replacement for it:
//!
//! 1. `exists` pre-check (reject early when the name is known to be taken)
//! 2. durable insert (the constraint decides)
//! 3. `reserve` once the insert succeeded
//!
//! Between 2 and 3 a concurrent signup can pass the pre-check; the durable
//! insert then fails with a duplicate error, which callers must report as a
//! conflict like any other.

use std::sync::Arc;

use tracing::warn;

use crate::metrics;
use crate::records::normalize_username;
use crate::storage::traits::{FastStore, StorageError};

/// Fast-tier hash holding reservations.
pub const USERNAMES_HASH: &str = "usernames";

const RESERVED_MARKER: &str = "1";

pub struct UsernameRegistry {
    fast: Arc<dyn FastStore>,
}

impl UsernameRegistry {
    pub fn new(fast: Arc<dyn FastStore>) -> Self {
        Self { fast }
    }

    /// Whether `username` is known to be taken (case-insensitive).
    ///
    /// Fails closed: if the fast tier cannot answer, reports "free" so the
    /// durable constraint makes the call.
    pub async fn exists(&self, username: &str) -> bool {
        let key = normalize_username(username);
        match self.fast.hash_exists(USERNAMES_HASH, &key).await {
            Ok(true) => {
                metrics::record_registry_check("taken");
                true
            }
            Ok(false) => {
                metrics::record_registry_check("free");
                false
            }
            Err(e) => {
                metrics::record_registry_check("error");
                warn!(username = %key, error = %e, "Username pre-check unavailable, deferring to durable store");
                false
            }
        }
    }

    /// Mark `username` as taken. Call only after the durable insert succeeded.
    pub async fn reserve(&self, username: &str) -> Result<(), StorageError> {
        let key = normalize_username(username);
        match self.fast.hash_set(USERNAMES_HASH, &key, RESERVED_MARKER).await {
            Ok(()) => {
                metrics::record_registry_reserve("reserved");
                Ok(())
            }
            Err(e) => {
                metrics::record_registry_reserve("error");
                Err(e)
            }
        }
    }
}
