//! Storage tiers.
//!
//! - [`traits`]: the [`FastStore`](traits::FastStore) / [`DurableStore`](traits::DurableStore) seams
//! - [`redis`]: fast tier backed by Redis
//! - [`sql`]: durable tier backed by SQLite or MySQL (sqlx `Any` driver)
//! - [`memory`]: in-process implementations of both tiers

pub mod memory;
pub mod redis;
pub mod sql;
pub mod traits;
