// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL durable tier (SQLite for local runs and tests, MySQL in production).
//!
//! Schema:
//! ```sql
//! CREATE TABLE users (
//!   id VARCHAR(36) PRIMARY KEY,
//!   username VARCHAR(255) NOT NULL,             -- as typed
//!   username_normalized VARCHAR(255) NOT NULL,  -- lowercased, UNIQUE
//!   name, email (lowercased, UNIQUE), password_hash, department, created_at
//! )
//! CREATE TABLE papers (
//!   id VARCHAR(36) PRIMARY KEY,
//!   title, authors (JSON array), abstract, publication_date,
//!   journal_conference, keywords (JSON array), uploaded_by,
//!   views BIGINT NOT NULL DEFAULT 0,
//!   created_at
//! )
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! List columns are JSON encoded into TEXT, and TEXT columns may come back
//! as BLOB, so every text read falls back to `Vec<u8>`.
//!
//! ## Text search
//!
//! Each search term is matched case-insensitively (`LOWER(col) LIKE`)
//! against title, keywords and abstract. A term hit scores 3 in the title,
//! 2 in keywords and 1 in the abstract; rows scoring zero are filtered out.

use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use tracing::debug;

use super::traits::{BulkUpdateResult, DurableStore, StorageError, ViewIncrement};
use crate::records::{normalize_username, Paper, PaperSummary, User};
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig};
use crate::resilience::guarded;
use crate::resilience::retry::{retry, RetryConfig};
use crate::search::{SearchQuery, SortField, SortOrder};

const TIER: &str = "durable";

const PAPER_COLUMNS: &str =
    "id, title, authors, abstract, publication_date, journal_conference, keywords, uploaded_by, views, created_at";
const SUMMARY_COLUMNS: &str = "id, title, authors, publication_date, journal_conference, keywords";
const USER_COLUMNS: &str = "id, username, name, email, password_hash, department, created_at";

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

pub struct SqlStore {
    pool: AnyPool,
    is_sqlite: bool,
    circuit: CircuitBreaker,
}

impl SqlStore {
    /// Create a new SQL store with startup-mode retry (fails fast if config is wrong).
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");
        // Every connection to an in-memory SQLite database gets its own database
        let max_connections = if connection_string.contains(":memory:") { 1 } else { 20 };

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(max_connections)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        let store = Self {
            pool,
            is_sqlite,
            circuit: CircuitBreaker::new("durable_tier", CircuitConfig::durable_tier()),
        };

        if is_sqlite {
            store.enable_wal_mode().await?;
        }

        store.init_schema().await?;
        Ok(store)
    }

    /// Get a clone of the connection pool.
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    /// WAL lets request-path reads proceed while a sweep commits.
    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements: &[&str] = if self.is_sqlite {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS users (
                    id TEXT PRIMARY KEY,
                    username TEXT NOT NULL,
                    username_normalized TEXT NOT NULL,
                    name TEXT NOT NULL,
                    email TEXT NOT NULL,
                    password_hash TEXT NOT NULL,
                    department TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    CONSTRAINT uq_users_username UNIQUE (username_normalized),
                    CONSTRAINT uq_users_email UNIQUE (email)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS papers (
                    id TEXT PRIMARY KEY,
                    title TEXT NOT NULL,
                    authors TEXT NOT NULL,
                    abstract TEXT NOT NULL,
                    publication_date TEXT NOT NULL,
                    journal_conference TEXT,
                    keywords TEXT NOT NULL,
                    uploaded_by TEXT NOT NULL,
                    views INTEGER NOT NULL DEFAULT 0,
                    created_at INTEGER NOT NULL
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_papers_publication_date ON papers (publication_date)",
            ]
        } else {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS users (
                    id VARCHAR(36) PRIMARY KEY,
                    username VARCHAR(255) NOT NULL,
                    username_normalized VARCHAR(255) NOT NULL,
                    name VARCHAR(255) NOT NULL,
                    email VARCHAR(255) NOT NULL,
                    password_hash VARCHAR(255) NOT NULL,
                    department VARCHAR(255) NOT NULL,
                    created_at BIGINT NOT NULL,
                    CONSTRAINT uq_users_username UNIQUE (username_normalized),
                    CONSTRAINT uq_users_email UNIQUE (email)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS papers (
                    id VARCHAR(36) PRIMARY KEY,
                    title VARCHAR(1024) NOT NULL,
                    authors TEXT NOT NULL,
                    abstract LONGTEXT NOT NULL,
                    publication_date VARCHAR(32) NOT NULL,
                    journal_conference VARCHAR(512),
                    keywords TEXT NOT NULL,
                    uploaded_by VARCHAR(36) NOT NULL,
                    views BIGINT NOT NULL DEFAULT 0,
                    created_at BIGINT NOT NULL,
                    INDEX idx_papers_publication_date (publication_date)
                )
                "#,
            ]
        };

        for sql in statements {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| StorageError::Backend(e.to_string()))
            })
            .await?;
        }

        Ok(())
    }

    fn paper_from_row(row: &AnyRow) -> Result<Paper, StorageError> {
        Ok(Paper {
            id: text(row, "id")?,
            title: text(row, "title")?,
            authors: json_list(row, "authors")?,
            abstract_text: text(row, "abstract")?,
            publication_date: text(row, "publication_date")?,
            journal_conference: optional_text(row, "journal_conference"),
            keywords: json_list(row, "keywords")?,
            uploaded_by: text(row, "uploaded_by")?,
            views: integer(row, "views")?.max(0) as u64,
            created_at: integer(row, "created_at")?,
        })
    }

    fn summary_from_row(row: &AnyRow) -> Result<PaperSummary, StorageError> {
        Ok(PaperSummary {
            id: text(row, "id")?,
            title: text(row, "title")?,
            authors: json_list(row, "authors")?,
            publication_date: text(row, "publication_date")?,
            journal_conference: optional_text(row, "journal_conference"),
            keywords: json_list(row, "keywords")?,
        })
    }

    fn user_from_row(row: &AnyRow) -> Result<User, StorageError> {
        Ok(User {
            id: text(row, "id")?,
            username: text(row, "username")?,
            name: text(row, "name")?,
            email: text(row, "email")?,
            password_hash: text(row, "password_hash")?,
            department: text(row, "department")?,
            created_at: integer(row, "created_at")?,
        })
    }
}

/// Read a TEXT column, falling back to BLOB decoding (sqlx Any quirk).
fn text(row: &AnyRow, column: &str) -> Result<String, StorageError> {
    if let Ok(value) = row.try_get::<String, _>(column) {
        return Ok(value);
    }
    row.try_get::<Vec<u8>, _>(column)
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .map_err(|e| StorageError::Backend(format!("Failed to read column {}: {}", column, e)))
}

fn optional_text(row: &AnyRow, column: &str) -> Option<String> {
    row.try_get::<Option<String>, _>(column)
        .ok()
        .flatten()
        .or_else(|| {
            row.try_get::<Option<Vec<u8>>, _>(column)
                .ok()
                .flatten()
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        })
}

fn integer(row: &AnyRow, column: &str) -> Result<i64, StorageError> {
    row.try_get::<i64, _>(column)
        .map_err(|e| StorageError::Backend(format!("Failed to read column {}: {}", column, e)))
}

fn json_list(row: &AnyRow, column: &str) -> Result<Vec<String>, StorageError> {
    serde_json::from_str(&text(row, column)?)
        .map_err(|e| StorageError::Serialization(format!("column {}: {}", column, e)))
}

fn encode_list(values: &[String]) -> Result<String, StorageError> {
    serde_json::to_string(values).map_err(|e| StorageError::Serialization(e.to_string()))
}

/// Which unique constraint a duplicate-key message refers to.
///
/// Only the constraint identifier is inspected: MySQL echoes the rejected
/// value in its message, and that value is user input.
///
/// - SQLite: `UNIQUE constraint failed: users.username_normalized`
/// - MySQL: `Duplicate entry 'x' for key 'users.uq_users_username'`
fn duplicate_field(message: &str) -> String {
    let constraint = if let Some((_, rest)) = message.rsplit_once("for key '") {
        rest.trim_end_matches('\'')
    } else if let Some((_, rest)) = message.split_once("constraint failed: ") {
        rest
    } else {
        message
    };
    // Older MySQL servers omit the table qualifier
    let name = constraint.rsplit('.').next().unwrap_or(constraint).trim();

    match name {
        "username_normalized" | "uq_users_username" => "username".to_string(),
        "email" | "uq_users_email" => "email".to_string(),
        "id" | "PRIMARY" => "id".to_string(),
        other => other.to_string(),
    }
}

/// `%term%` with LIKE wildcards escaped (`!` is the escape character).
fn like_pattern(term: &str) -> String {
    let mut pattern = String::with_capacity(term.len() + 2);
    pattern.push('%');
    for c in term.chars() {
        if matches!(c, '!' | '%' | '_') {
            pattern.push('!');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// Build the search statement and its LIKE bindings.
fn search_sql(query: &SearchQuery) -> (String, Vec<String>) {
    let terms: Vec<&str> = query.terms().collect();
    let direction = match query.sort_order() {
        SortOrder::Asc => "ASC",
        SortOrder::Desc => "DESC",
    };

    if terms.is_empty() {
        let order_by = match query.sort_field() {
            SortField::PublicationDate => format!("publication_date {}, created_at ASC, id ASC", direction),
            // No text, nothing to rank: keep insertion order
            SortField::Relevance => "created_at ASC, id ASC".to_string(),
        };
        return (format!("SELECT {} FROM papers ORDER BY {}", SUMMARY_COLUMNS, order_by), vec![]);
    }

    let mut score_parts = Vec::with_capacity(terms.len() * 3);
    let mut bindings = Vec::with_capacity(terms.len() * 3);
    for term in &terms {
        let pattern = like_pattern(term);
        for (column, weight) in [("title", 3), ("keywords", 2), ("abstract", 1)] {
            score_parts.push(format!(
                "(CASE WHEN LOWER({}) LIKE ? ESCAPE '!' THEN {} ELSE 0 END)",
                column, weight
            ));
            bindings.push(pattern.clone());
        }
    }

    let order_by = match query.sort_field() {
        SortField::Relevance => "score DESC, created_at ASC, id ASC".to_string(),
        SortField::PublicationDate => format!("publication_date {}, score DESC, id ASC", direction),
    };

    let sql = format!(
        "SELECT {cols} FROM (SELECT {cols}, created_at, {score} AS score FROM papers) scored \
         WHERE score > 0 ORDER BY {order_by}",
        cols = SUMMARY_COLUMNS,
        score = score_parts.join(" + "),
        order_by = order_by,
    );
    (sql, bindings)
}

#[async_trait]
impl DurableStore for SqlStore {
    async fn get_paper(&self, id: &str) -> Result<Option<Paper>, StorageError> {
        let sql = format!("SELECT {} FROM papers WHERE id = ?", PAPER_COLUMNS);

        let row = guarded(&self.circuit, TIER, "get_paper", &RetryConfig::query(), || {
            sqlx::query(&sql).bind(id).fetch_optional(&self.pool)
        })
        .await?;

        row.as_ref().map(Self::paper_from_row).transpose()
    }

    async fn insert_paper(&self, paper: &Paper) -> Result<(), StorageError> {
        let authors = encode_list(&paper.authors)?;
        let keywords = encode_list(&paper.keywords)?;
        let sql = format!(
            "INSERT INTO papers ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            PAPER_COLUMNS
        );

        // Single attempt: an insert whose ack was lost would come back as a duplicate
        guarded(&self.circuit, TIER, "insert_paper", &RetryConfig::none(), || {
            sqlx::query(&sql)
                .bind(&paper.id)
                .bind(&paper.title)
                .bind(&authors)
                .bind(&paper.abstract_text)
                .bind(&paper.publication_date)
                .bind(&paper.journal_conference)
                .bind(&keywords)
                .bind(&paper.uploaded_by)
                .bind(paper.views as i64)
                .bind(paper.created_at)
                .execute(&self.pool)
        })
        .await?;

        Ok(())
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, StorageError> {
        let sql = format!("SELECT {} FROM users WHERE username_normalized = ?", USER_COLUMNS);
        let normalized = normalize_username(username);

        let row = guarded(&self.circuit, TIER, "find_user", &RetryConfig::query(), || {
            sqlx::query(&sql).bind(&normalized).fetch_optional(&self.pool)
        })
        .await?;

        row.as_ref().map(Self::user_from_row).transpose()
    }

    async fn insert_user(&self, user: &User) -> Result<(), StorageError> {
        let normalized = user.username_key();
        let email = user.email.to_lowercase();

        // A unique violation is an answer, not a backend fault: keep it out
        // of the breaker's failure count.
        let outcome = guarded(&self.circuit, TIER, "insert_user", &RetryConfig::none(), || async {
            let result = sqlx::query(
                "INSERT INTO users (id, username, username_normalized, name, email, password_hash, department, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&user.id)
            .bind(&user.username)
            .bind(&normalized)
            .bind(&user.name)
            .bind(&email)
            .bind(&user.password_hash)
            .bind(&user.department)
            .bind(user.created_at)
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => Ok(Ok(())),
                Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                    Ok(Err(StorageError::Duplicate {
                        field: duplicate_field(db_err.message()),
                    }))
                }
                Err(e) => Err(e),
            }
        })
        .await?;

        outcome
    }

    async fn bulk_increment_views(&self, increments: &[ViewIncrement]) -> Result<BulkUpdateResult, StorageError> {
        if increments.is_empty() {
            return Ok(BulkUpdateResult::default());
        }

        // One transaction: all matching rows move or none do. Not retried,
        // a replayed commit would add the deltas twice.
        let matched = guarded(&self.circuit, TIER, "bulk_increment_views", &RetryConfig::none(), || async {
            let mut tx = self.pool.begin().await?;
            let mut matched = 0u64;
            for inc in increments {
                let result = sqlx::query("UPDATE papers SET views = views + ? WHERE id = ?")
                    .bind(inc.delta as i64)
                    .bind(&inc.item_id)
                    .execute(&mut *tx)
                    .await?;
                matched += result.rows_affected();
            }
            tx.commit().await?;
            Ok::<_, sqlx::Error>(matched)
        })
        .await?;

        debug!(requested = increments.len(), matched, "Applied bulk view increment");

        Ok(BulkUpdateResult {
            requested: increments.len(),
            matched: matched as usize,
        })
    }

    async fn search_papers(&self, query: &SearchQuery) -> Result<Vec<PaperSummary>, StorageError> {
        let (sql, bindings) = search_sql(query);

        let rows = guarded(&self.circuit, TIER, "search_papers", &RetryConfig::query(), || {
            let mut q = sqlx::query(&sql);
            for pattern in &bindings {
                q = q.bind(pattern);
            }
            q.fetch_all(&self.pool)
        })
        .await?;

        rows.iter().map(Self::summary_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{NewPaper, NewUser};
    use tempfile::TempDir;

    async fn temp_store(dir: &TempDir) -> SqlStore {
        let path = dir.path().join("papers.db");
        let url = format!("sqlite://{}?mode=rwc", path.display());
        SqlStore::new(&url).await.unwrap()
    }

    fn paper(title: &str, abstract_text: &str, keywords: &[&str], date: &str) -> Paper {
        Paper::from_new(
            NewPaper {
                title: title.into(),
                authors: vec!["Ada Lovelace".into()],
                abstract_text: abstract_text.into(),
                publication_date: date.into(),
                journal_conference: None,
                keywords: keywords.iter().map(|k| k.to_string()).collect(),
            },
            "uploader".into(),
        )
    }

    fn user(username: &str, email: &str) -> User {
        User::from_new(NewUser {
            username: username.into(),
            name: "Test".into(),
            email: email.into(),
            password_hash: "hash".into(),
            department: "CS".into(),
        })
    }

    #[test]
    fn test_like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("rust"), "%rust%");
        assert_eq!(like_pattern("100%_!"), "%100!%!_!!%");
    }

    #[test]
    fn test_duplicate_field_from_message() {
        assert_eq!(duplicate_field("UNIQUE constraint failed: users.username_normalized"), "username");
        assert_eq!(duplicate_field("UNIQUE constraint failed: users.email"), "email");
        assert_eq!(
            duplicate_field("Duplicate entry 'alice' for key 'users.uq_users_username'"),
            "username"
        );
        assert_eq!(duplicate_field("Duplicate entry 'x' for key 'uq_users_email'"), "email");
    }

    #[test]
    fn test_duplicate_field_ignores_the_rejected_value() {
        assert_eq!(
            duplicate_field("Duplicate entry 'username@uni.edu' for key 'users.uq_users_email'"),
            "email"
        );
        assert_eq!(
            duplicate_field("Duplicate entry 'email.username' for key 'users.uq_users_username'"),
            "username"
        );
    }

    #[test]
    fn test_duplicate_field_reports_primary_key() {
        assert_eq!(duplicate_field("UNIQUE constraint failed: users.id"), "id");
        assert_eq!(duplicate_field("UNIQUE constraint failed: papers.id"), "id");
        assert_eq!(duplicate_field("Duplicate entry 'abc' for key 'users.PRIMARY'"), "id");
        assert_eq!(duplicate_field("Duplicate entry 'abc' for key 'PRIMARY'"), "id");
    }

    #[tokio::test]
    async fn test_paper_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = temp_store(&dir).await;

        let mut p = paper("Consistent counters", "abstract", &["redis"], "2023-04-01");
        p.journal_conference = Some("VLDB".into());
        store.insert_paper(&p).await.unwrap();

        let loaded = store.get_paper(&p.id).await.unwrap().unwrap();
        assert_eq!(loaded, p);
        assert!(store.get_paper("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_username_uniqueness_is_case_insensitive() {
        let dir = TempDir::new().unwrap();
        let store = temp_store(&dir).await;

        store.insert_user(&user("Alice", "alice@example.org")).await.unwrap();
        let err = store.insert_user(&user("alice", "other@example.org")).await.unwrap_err();

        assert_eq!(err, StorageError::Duplicate { field: "username".into() });
        assert_eq!(store.circuit().failures(), 0);
    }

    #[tokio::test]
    async fn test_email_uniqueness() {
        let dir = TempDir::new().unwrap();
        let store = temp_store(&dir).await;

        store.insert_user(&user("alice", "alice@example.org")).await.unwrap();
        let err = store.insert_user(&user("bob", "ALICE@example.org")).await.unwrap_err();

        assert_eq!(err, StorageError::Duplicate { field: "email".into() });
    }

    #[tokio::test]
    async fn test_find_user_by_username_any_case() {
        let dir = TempDir::new().unwrap();
        let store = temp_store(&dir).await;

        let u = user("Alice", "alice@example.org");
        store.insert_user(&u).await.unwrap();

        let found = store.find_user_by_username("ALICE").await.unwrap().unwrap();
        assert_eq!(found.id, u.id);
        assert_eq!(found.username, "Alice");
        assert!(store.find_user_by_username("bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bulk_increment_skips_missing_ids() {
        let dir = TempDir::new().unwrap();
        let store = temp_store(&dir).await;

        let p = paper("A", "b", &[], "2020-01-01");
        store.insert_paper(&p).await.unwrap();

        let result = store
            .bulk_increment_views(&[
                ViewIncrement { item_id: p.id.clone(), delta: 5 },
                ViewIncrement { item_id: "gone".into(), delta: 2 },
            ])
            .await
            .unwrap();

        assert_eq!(result, BulkUpdateResult { requested: 2, matched: 1 });
        assert_eq!(store.get_paper(&p.id).await.unwrap().unwrap().views, 5);
    }

    #[tokio::test]
    async fn test_search_matches_title_keywords_and_abstract() {
        let dir = TempDir::new().unwrap();
        let store = temp_store(&dir).await;

        let in_title = paper("Graph Databases", "storage", &["db"], "2021-01-01");
        let in_keywords = paper("Query planning", "optimizers", &["graph"], "2022-01-01");
        let in_abstract = paper("Indexes", "a graph of pages", &["btree"], "2019-01-01");
        let unrelated = paper("Compilers", "parsing", &["llvm"], "2018-01-01");
        for p in [&in_title, &in_keywords, &in_abstract, &unrelated] {
            store.insert_paper(p).await.unwrap();
        }

        let results = store.search_papers(&SearchQuery::new("GRAPH", SortField::Relevance, SortOrder::Desc)).await.unwrap();
        let ids: Vec<&str> = results.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec![in_title.id.as_str(), in_keywords.id.as_str(), in_abstract.id.as_str()]);
    }

    #[tokio::test]
    async fn test_search_by_publication_date_honours_order() {
        let dir = TempDir::new().unwrap();
        let store = temp_store(&dir).await;

        let old = paper("Old", "x", &[], "2001-01-01");
        let new = paper("New", "x", &[], "2024-01-01");
        store.insert_paper(&old).await.unwrap();
        store.insert_paper(&new).await.unwrap();

        let asc = store.search_papers(&SearchQuery::new("", SortField::PublicationDate, SortOrder::Asc)).await.unwrap();
        assert_eq!(asc[0].id, old.id);

        let desc = store.search_papers(&SearchQuery::new("", SortField::PublicationDate, SortOrder::Desc)).await.unwrap();
        assert_eq!(desc[0].id, new.id);
    }
}
