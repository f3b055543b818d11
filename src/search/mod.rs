// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Paper search: query shape and read-through result cache.
//!
//! The durable tier runs the actual text search. This module only owns the
//! normalized query shape (`{text, sort_field, sort_order}`) and the fast-tier
//! cache of search responses.
//!
//! # Flow
//!
//! ```text
//! raw params (search, sort_by, order)
//!       │
//!       ▼
//! SearchQuery::from_params  ── normalize text, validate sort
//!       │
//!       ▼
//! SearchCache::lookup ──hit──→ cached SearchResponse
//!       │ miss
//!       ▼
//! DurableStore::search_papers → SearchCache::store (TTL 300s)
//! ```
//!
//! # Example
//!
//! ```
//! use paper_sync::search::{SearchQuery, SortField, SortOrder};
//!
//! let query = SearchQuery::from_params(Some("  Rust   Async "), None, Some("asc")).unwrap();
//! assert_eq!(query.text(), "rust async");
//! assert_eq!(query.sort_field(), SortField::Relevance);
//! assert_eq!(query.sort_order(), SortOrder::Asc);
//!
//! assert!(SearchQuery::from_params(None, Some("citations"), None).is_err());
//! ```

mod search_cache;

pub use search_cache::{CachedPayload, SearchCache, SearchCacheStats, SEARCH_CACHE_SCHEMA};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::records::PaperSummary;

/// Rejected search parameters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("unsupported sort field '{0}' (expected relevance or publication_date)")]
    SortField(String),
    #[error("unsupported sort order '{0}' (expected asc or desc)")]
    SortOrder(String),
}

/// Field a search is ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    /// Match quality. Only meaningful with non-empty search text.
    Relevance,
    PublicationDate,
}

impl SortField {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Relevance => "relevance",
            Self::PublicationDate => "publication_date",
        }
    }
}

impl fmt::Display for SortField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortField {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "relevance" => Ok(Self::Relevance),
            "publication_date" => Ok(Self::PublicationDate),
            _ => Err(QueryError::SortField(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortOrder {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" => Ok(Self::Asc),
            "desc" => Ok(Self::Desc),
            _ => Err(QueryError::SortOrder(s.to_string())),
        }
    }
}

/// Normalized search request.
///
/// Fields are private so every instance carries normalized text: two
/// queries that differ only in case or whitespace are the same query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SearchQuery {
    text: String,
    sort_field: SortField,
    sort_order: SortOrder,
}

impl SearchQuery {
    pub fn new(text: &str, sort_field: SortField, sort_order: SortOrder) -> Self {
        Self {
            text: normalize_text(text),
            sort_field,
            sort_order,
        }
    }

    /// Build from raw request parameters.
    ///
    /// Defaults: empty text, `relevance`, `desc`.
    pub fn from_params(
        search: Option<&str>,
        sort_by: Option<&str>,
        order: Option<&str>,
    ) -> Result<Self, QueryError> {
        let sort_field = match sort_by {
            Some(s) if !s.trim().is_empty() => s.parse()?,
            _ => SortField::Relevance,
        };
        let sort_order = match order {
            Some(s) if !s.trim().is_empty() => s.parse()?,
            _ => SortOrder::Desc,
        };
        Ok(Self::new(search.unwrap_or(""), sort_field, sort_order))
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn sort_field(&self) -> SortField {
        self.sort_field
    }

    #[must_use]
    pub fn sort_order(&self) -> SortOrder {
        self.sort_order
    }

    /// Search terms (whitespace separated, already lowercased).
    pub fn terms(&self) -> impl Iterator<Item = &str> {
        self.text.split(' ').filter(|t| !t.is_empty())
    }
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self::new("", SortField::Relevance, SortOrder::Desc)
    }
}

/// Trim, collapse internal whitespace, lowercase.
fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Full search response as served to callers and stored in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SearchResponse {
    pub papers: Vec<PaperSummary>,
}
