//! # Paper Sync
//!
//! Dual-store consistency layer for a paper repository: a fast ephemeral
//! tier (Redis) kept consistent with a slower durable tier (SQL).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       PaperService                          │
//! │  • signup / find_user / upload_paper                       │
//! │  • search_papers (read-through) / view_paper (counted)     │
//! └─────────────────────────────────────────────────────────────┘
//!          │                  │                   │
//!   SearchCache          ViewCounter        UsernameRegistry
//!   search:{q}:{f}:{o}   INCR paper_views:  HSET usernames
//!          │                  │                   │
//!          ▼                  ▼                   ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Fast tier (FastStore)                      │
//! │  • TTL'd search payloads, view deltas, username hash       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!              ReconciliationScheduler (every 10 min)
//!              SCAN → bulk $inc views → settle/delete
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Durable tier (DurableStore)                 │
//! │  • papers (views = reconciled total), users (unique keys)  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use paper_sync::{PaperService, PaperSyncConfig};
//! use paper_sync::records::NewPaper;
//! use paper_sync::storage::memory::{InMemoryDurableStore, InMemoryFastStore};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = PaperSyncConfig::default();
//!     let service = PaperService::new(
//!         Arc::new(InMemoryFastStore::new()),
//!         Arc::new(InMemoryDurableStore::new()),
//!         &config,
//!     );
//!     service.start().expect("scheduler not yet running");
//!
//!     let paper = service
//!         .upload_paper(
//!             NewPaper {
//!                 title: "Counting at scale".into(),
//!                 authors: vec!["A. Author".into()],
//!                 abstract_text: "...".into(),
//!                 publication_date: "2024-03-01".into(),
//!                 journal_conference: None,
//!                 keywords: vec!["counters".into()],
//!             },
//!             "uploader",
//!         )
//!         .await
//!         .expect("upload");
//!
//!     let viewed = service.view_paper(&paper.id).await.expect("view");
//!     assert_eq!(viewed.views.total(), 1);
//!
//!     service.shutdown().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`service`]: the [`PaperService`] façade
//! - [`search`]: query shape and [`SearchCache`](search::SearchCache)
//! - [`views`]: [`ViewCounter`](views::ViewCounter)
//! - [`registry`]: [`UsernameRegistry`](registry::UsernameRegistry)
//! - [`reconcile`]: [`ReconciliationScheduler`](reconcile::ReconciliationScheduler)
//! - [`storage`]: tier traits plus Redis, SQL and in-memory backends
//! - [`resilience`]: circuit breakers and retry logic

pub mod config;
pub mod metrics;
pub mod reconcile;
pub mod records;
pub mod registry;
pub mod resilience;
pub mod search;
pub mod service;
pub mod storage;
pub mod views;

pub use config::{ClearMode, PaperSyncConfig};
pub use metrics::LatencyTimer;
pub use reconcile::{ReconciliationScheduler, SchedulerError, SweepConfig, SweepError, SweepPhase, SweepReport};
pub use registry::UsernameRegistry;
pub use resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
pub use resilience::retry::RetryConfig;
pub use search::{SearchCache, SearchQuery, SearchResponse};
pub use service::{PaperService, ServiceError};
pub use storage::traits::{DurableStore, FastStore, StorageError};
pub use views::{ViewCounter, ViewTotal, ViewedPaper};
