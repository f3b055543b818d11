//! Domain records stored in the durable tier.
//!
//! [`Paper`] and [`User`] are the canonical records. [`PaperSummary`] is the
//! projection returned by text search (and cached by the search cache).
//! Timestamps are epoch millis, same as everywhere else in the crate.
//!
//! # Example
//!
//! ```
//! use paper_sync::records::{NewPaper, Paper};
//!
//! let paper = Paper::from_new(
//!     NewPaper {
//!         title: "Dual-tier counters".into(),
//!         authors: vec!["A. Author".into()],
//!         abstract_text: "Counting views without losing them.".into(),
//!         publication_date: "2024-05-01".into(),
//!         journal_conference: None,
//!         keywords: vec!["caching".into()],
//!     },
//!     "uploader-id".into(),
//! );
//!
//! assert_eq!(paper.views, 0);
//! assert_eq!(paper.summary().title, "Dual-tier counters");
//! ```

use serde::{Deserialize, Serialize};

/// Current time as epoch millis.
#[must_use]
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Generate a fresh record identifier.
#[must_use]
pub fn new_record_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Lowercased, trimmed form of a username (identity key in both tiers).
#[must_use]
pub fn normalize_username(username: &str) -> String {
    username.trim().to_lowercase()
}

/// A paper as uploaded by a caller (before an id is assigned).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPaper {
    pub title: String,
    pub authors: Vec<String>,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    /// ISO-8601 date (`YYYY-MM-DD`), so lexical order is chronological
    pub publication_date: String,
    #[serde(default)]
    pub journal_conference: Option<String>,
    pub keywords: Vec<String>,
}

/// Canonical paper record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Paper {
    pub id: String,
    pub title: String,
    pub authors: Vec<String>,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    pub publication_date: String,
    #[serde(default)]
    pub journal_conference: Option<String>,
    pub keywords: Vec<String>,
    /// User id of the uploader
    pub uploaded_by: String,
    /// Reconciled view total. Only the reconciliation sweep moves this.
    pub views: u64,
    pub created_at: i64,
}

impl Paper {
    /// Build a record from an upload, assigning a fresh id.
    pub fn from_new(new: NewPaper, uploaded_by: String) -> Self {
        Self {
            id: new_record_id(),
            title: new.title,
            authors: new.authors,
            abstract_text: new.abstract_text,
            publication_date: new.publication_date,
            journal_conference: new.journal_conference,
            keywords: new.keywords,
            uploaded_by,
            views: 0,
            created_at: now_millis(),
        }
    }

    /// Search projection of this paper.
    #[must_use]
    pub fn summary(&self) -> PaperSummary {
        PaperSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            authors: self.authors.clone(),
            publication_date: self.publication_date.clone(),
            journal_conference: self.journal_conference.clone(),
            keywords: self.keywords.clone(),
        }
    }
}

/// Fields returned by text search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaperSummary {
    pub id: String,
    pub title: String,
    pub authors: Vec<String>,
    pub publication_date: String,
    #[serde(default)]
    pub journal_conference: Option<String>,
    pub keywords: Vec<String>,
}

/// A signup request. `password_hash` is opaque: hashing happens upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUser {
    pub username: String,
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub department: String,
}

/// Canonical user record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    /// Username as the user typed it
    pub username: String,
    pub name: String,
    /// Stored lowercased
    pub email: String,
    #[serde(skip_serializing)]
    #[serde(default)]
    pub password_hash: String,
    pub department: String,
    pub created_at: i64,
}

impl User {
    /// Build a record from a signup, assigning a fresh id.
    pub fn from_new(new: NewUser) -> Self {
        Self {
            id: new_record_id(),
            username: new.username.trim().to_string(),
            name: new.name,
            email: new.email.trim().to_lowercase(),
            password_hash: new.password_hash,
            department: new.department,
            created_at: now_millis(),
        }
    }

    /// Identity key shared with the username registry.
    #[must_use]
    pub fn username_key(&self) -> String {
        normalize_username(&self.username)
    }
}
