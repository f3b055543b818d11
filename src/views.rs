// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-paper view counting.
//!
//! Every access bumps a fast-tier counter (`paper_views:{id}`) with one
//! atomic `INCR`. The durable `views` field only moves when the
//! reconciliation sweep folds those counters in, so the live total is the
//! durable baseline plus whatever delta is still pending:
//!
//! ```text
//! access ──INCR──→ paper_views:{id} = delta      (fast tier)
//!        ──read──→ papers.views      = baseline  (durable tier)
//!        ←─────── baseline + delta
//! ```
//!
//! The total is an estimate. While a sweep is between its commit and its
//! clear, the same delta can be visible in both tiers for a moment.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::metrics;
use crate::records::Paper;
use crate::storage::traits::{DurableStore, FastStore};

/// Namespace of view counter keys in the fast tier.
pub const VIEW_KEY_PREFIX: &str = "paper_views:";

/// Fast-tier key holding the pending delta of `item_id`.
#[must_use]
pub fn key_for(item_id: &str) -> String {
    format!("{}{}", VIEW_KEY_PREFIX, item_id)
}

/// Item id encoded in a view counter key, if it is one.
#[must_use]
pub fn item_id_from_key(key: &str) -> Option<&str> {
    key.strip_prefix(VIEW_KEY_PREFIX).filter(|id| !id.is_empty())
}

/// Live view total: reconciled baseline plus pending fast-tier delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewTotal {
    /// `views` as last reconciled into the durable tier
    pub baseline: u64,
    /// Fast-tier delta after this access, `None` if the increment failed
    pub pending: Option<i64>,
}

impl ViewTotal {
    #[must_use]
    pub fn total(&self) -> u64 {
        self.baseline + self.pending.unwrap_or(0).max(0) as u64
    }

    /// Whether this access was counted.
    #[must_use]
    pub fn counted(&self) -> bool {
        self.pending.is_some()
    }
}

/// A paper as returned to a viewer, with its live view total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewedPaper {
    pub paper: Paper,
    pub views: ViewTotal,
}

pub struct ViewCounter {
    fast: Arc<dyn FastStore>,
    durable: Arc<dyn DurableStore>,
}

impl ViewCounter {
    pub fn new(fast: Arc<dyn FastStore>, durable: Arc<dyn DurableStore>) -> Self {
        Self { fast, durable }
    }

    /// Count one access to `item_id` and load the paper with its live total.
    ///
    /// Returns `None` when no such paper exists or the durable baseline
    /// cannot be read; either way the caller answers "not found". A fast-tier
    /// failure only loses this one count (`pending: None`); the increment is
    /// never retried. A counted increment stays pending for the next sweep
    /// even when the durable read then fails.
    pub async fn record_access(&self, item_id: &str) -> Option<ViewedPaper> {
        let pending = match self.fast.incr(&key_for(item_id)).await {
            Ok(delta) => {
                metrics::record_view_increment("counted");
                Some(delta)
            }
            Err(e) => {
                metrics::record_view_increment("skipped");
                warn!(item_id, error = %e, "View increment failed, access not counted");
                None
            }
        };

        let paper = match self.durable.get_paper(item_id).await {
            Ok(Some(paper)) => paper,
            Ok(None) => {
                debug!(item_id, "View recorded for unknown paper");
                return None;
            }
            Err(e) => {
                warn!(item_id, error = %e, "Durable baseline read failed, reporting paper as not found");
                return None;
            }
        };

        let views = ViewTotal {
            baseline: paper.views,
            pending,
        };
        Some(ViewedPaper { paper, views })
    }
}
