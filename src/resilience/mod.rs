//! Failure handling for backend calls: retry with backoff and circuit breakers.
//!
//! Store clients route every backend call through [`guarded`]: the call is
//! retried per its [`RetryConfig`](retry::RetryConfig) inside the tier's
//! [`CircuitBreaker`](circuit_breaker::CircuitBreaker), timed, and its error
//! folded into [`StorageError`].

pub mod circuit_breaker;
pub mod retry;

use std::fmt::Display;
use std::future::Future;

use circuit_breaker::{CircuitBreaker, CircuitError};
use retry::{retry, RetryConfig};

use crate::metrics::{self, LatencyTimer};
use crate::storage::traits::StorageError;

/// Run one backend operation with retry, circuit breaking and latency timing.
///
/// A whole retry sequence counts as a single call for the breaker, so a
/// call that recovers after one retry does not push the circuit open.
pub(crate) async fn guarded<T, E, F, Fut>(
    circuit: &CircuitBreaker,
    tier: &'static str,
    operation: &'static str,
    config: &RetryConfig,
    op: F,
) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let _timer = LatencyTimer::new(tier, operation);

    match circuit.call(|| retry(operation, config, op)).await {
        Ok(value) => Ok(value),
        Err(CircuitError::Rejected) => {
            metrics::record_error(tier, operation, "circuit_open");
            Err(StorageError::Unavailable(format!("{} circuit open", circuit.name())))
        }
        Err(CircuitError::Inner(e)) => {
            metrics::record_error(tier, operation, "backend");
            Err(StorageError::Backend(e.to_string()))
        }
    }
}
