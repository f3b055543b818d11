// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Paper service façade.
//!
//! [`PaperService`] wires the search cache, view counter, username registry
//! and reconciliation scheduler onto one fast tier and one durable tier. It
//! is what a request handler calls; transport concerns stay outside.
//!
//! # Lifecycle
//!
//! ```text
//! connect/new → start (scheduler running) → ... → shutdown (stop + final sweep)
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use paper_sync::{PaperService, PaperSyncConfig};
//! use paper_sync::search::SearchQuery;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PaperSyncConfig {
//!     redis_url: Some("redis://localhost:6379".into()),
//!     sql_url: Some("sqlite:papers.db?mode=rwc".into()),
//!     ..Default::default()
//! };
//!
//! let service = PaperService::connect(&config).await?;
//! service.start()?;
//!
//! let query = SearchQuery::from_params(Some("consensus"), None, None)?;
//! let results = service.search_papers(&query).await?;
//! println!("{} papers", results.papers.len());
//!
//! service.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::PaperSyncConfig;
use crate::metrics;
use crate::reconcile::{ReconciliationScheduler, SchedulerError, SweepConfig};
use crate::records::{NewPaper, NewUser, Paper, User};
use crate::registry::UsernameRegistry;
use crate::search::{QueryError, SearchCache, SearchCacheStats, SearchQuery, SearchResponse};
use crate::storage::redis::RedisStore;
use crate::storage::sql::SqlStore;
use crate::storage::traits::{DurableStore, FastStore, StorageError};
use crate::views::{ViewCounter, ViewedPaper};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// The registry already holds this username.
    #[error("username is already taken")]
    UsernameTaken,
    /// The durable store rejected a duplicate value.
    #[error("a record with this {field} already exists")]
    AlreadyExists { field: String },
    #[error("not found")]
    NotFound,
    #[error("invalid search query: {0}")]
    InvalidQuery(#[from] QueryError),
    #[error("missing configuration: {0}")]
    Config(&'static str),
    #[error(transparent)]
    Storage(StorageError),
}

impl ServiceError {
    /// Whether this is a uniqueness conflict (from either tier).
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::UsernameTaken | Self::AlreadyExists { .. })
    }
}

impl From<StorageError> for ServiceError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Duplicate { field } => Self::AlreadyExists { field },
            StorageError::NotFound => Self::NotFound,
            other => Self::Storage(other),
        }
    }
}

pub struct PaperService {
    durable: Arc<dyn DurableStore>,
    search_cache: SearchCache,
    views: ViewCounter,
    registry: UsernameRegistry,
    scheduler: Arc<ReconciliationScheduler>,
}

impl PaperService {
    /// Build the service over already constructed tiers.
    pub fn new(fast: Arc<dyn FastStore>, durable: Arc<dyn DurableStore>, config: &PaperSyncConfig) -> Self {
        let search_cache = SearchCache::with_ttl(
            Arc::clone(&fast),
            Duration::from_secs(config.search_cache_ttl_secs),
        );
        let views = ViewCounter::new(Arc::clone(&fast), Arc::clone(&durable));
        let registry = UsernameRegistry::new(Arc::clone(&fast));
        let scheduler = Arc::new(ReconciliationScheduler::new(
            fast,
            Arc::clone(&durable),
            SweepConfig::from(config),
        ));

        Self {
            durable,
            search_cache,
            views,
            registry,
            scheduler,
        }
    }

    /// Connect to Redis and the SQL database named in `config`.
    #[tracing::instrument(skip(config))]
    pub async fn connect(config: &PaperSyncConfig) -> Result<Self, ServiceError> {
        let redis_url = config.redis_url.as_deref().ok_or(ServiceError::Config("redis_url"))?;
        let sql_url = config.sql_url.as_deref().ok_or(ServiceError::Config("sql_url"))?;

        info!("Connecting to fast tier (Redis)...");
        let fast = match RedisStore::with_prefix(redis_url, config.redis_prefix.as_deref()).await {
            Ok(store) => {
                metrics::set_backend_healthy("redis", true);
                store
            }
            Err(e) => {
                metrics::set_backend_healthy("redis", false);
                warn!(error = %e, "Fast tier connection failed");
                return Err(e.into());
            }
        };

        info!("Connecting to durable tier (SQL)...");
        let durable = match SqlStore::new(sql_url).await {
            Ok(store) => {
                metrics::set_backend_healthy("sql", true);
                store
            }
            Err(e) => {
                metrics::set_backend_healthy("sql", false);
                warn!(error = %e, "Durable tier connection failed");
                return Err(e.into());
            }
        };

        info!("Paper service connected");
        Ok(Self::new(Arc::new(fast), Arc::new(durable), config))
    }

    /// Launch the periodic view reconciliation.
    pub fn start(&self) -> Result<(), SchedulerError> {
        self.scheduler.start()
    }

    /// Stop reconciliation, running a final sweep if configured.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }

    /// Register a new user.
    ///
    /// The registry answers the common "name taken" case without a durable
    /// round-trip. The durable insert has the final word: a duplicate there
    /// is reported as [`ServiceError::AlreadyExists`] even when the
    /// pre-check passed.
    pub async fn signup(&self, new_user: NewUser) -> Result<User, ServiceError> {
        if self.registry.exists(&new_user.username).await {
            debug!(username = %new_user.username, "Signup rejected by registry");
            return Err(ServiceError::UsernameTaken);
        }

        let user = User::from_new(new_user);
        match self.durable.insert_user(&user).await {
            Ok(()) => {}
            Err(StorageError::Duplicate { field }) => {
                if field == "username" {
                    // Registry missed a name the durable tier has; catch it up
                    metrics::record_registry_false_negative();
                    if let Err(e) = self.registry.reserve(&user.username).await {
                        debug!(username = %user.username, error = %e, "Registry backfill failed");
                    }
                }
                return Err(ServiceError::AlreadyExists { field });
            }
            Err(e) => return Err(ServiceError::Storage(e)),
        }

        if let Err(e) = self.registry.reserve(&user.username).await {
            warn!(
                username = %user.username,
                error = %e,
                "User created but username reservation failed; durable constraint still applies"
            );
        }

        info!(user_id = %user.id, "User registered");
        Ok(user)
    }

    pub async fn find_user(&self, username: &str) -> Result<User, ServiceError> {
        self.durable
            .find_user_by_username(username)
            .await?
            .ok_or(ServiceError::NotFound)
    }

    /// Store a new paper. Cached search results are not invalidated and
    /// pick it up once their TTL runs out.
    pub async fn upload_paper(&self, new_paper: NewPaper, uploaded_by: &str) -> Result<Paper, ServiceError> {
        let paper = Paper::from_new(new_paper, uploaded_by.to_string());
        self.durable.insert_paper(&paper).await?;
        info!(paper_id = %paper.id, uploaded_by, "Paper uploaded");
        Ok(paper)
    }

    /// Text search with a read-through cache.
    pub async fn search_papers(&self, query: &SearchQuery) -> Result<SearchResponse, ServiceError> {
        if let Some(cached) = self.search_cache.lookup::<SearchResponse>(query).await {
            return Ok(cached);
        }

        let papers = self.durable.search_papers(query).await?;
        let response = SearchResponse { papers };
        self.search_cache.store(query, &response).await;
        Ok(response)
    }

    /// Count one view of `id` and return the paper with its live total.
    pub async fn view_paper(&self, id: &str) -> Result<ViewedPaper, ServiceError> {
        if uuid::Uuid::parse_str(id).is_err() {
            debug!(id, "Rejecting malformed paper id");
            return Err(ServiceError::NotFound);
        }

        self.views.record_access(id).await.ok_or(ServiceError::NotFound)
    }

    #[must_use]
    pub fn scheduler(&self) -> &Arc<ReconciliationScheduler> {
        &self.scheduler
    }

    #[must_use]
    pub fn search_cache_stats(&self) -> SearchCacheStats {
        self.search_cache.stats()
    }
}
