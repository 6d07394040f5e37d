//! Deadline Guard (spec §4.4): the lifetime clock and read clock applied to
//! every upstream connection.
//!
//! Thin `tokio::time` composition, in the same spirit as the
//! timeout-wrapped reads the teacher crate already used in its duplex loop
//! (`tokio::time::timeout(.., stream.read_buf(..))`), just factored out so
//! the Forward and Tunnel Engines can share one deadline type instead of
//! re-deriving the two clocks inline.

use crate::error::ProxyError;
use std::future::Future;
use std::time::{Duration, Instant};

/// Tracks the two independent clocks spec §4.4 describes for a single
/// upstream connection: a wall-clock lifetime from dial, and a read-idle
/// timer reset on every successful read.
pub struct DeadlineGuard {
    deadline: Instant,
    read_timeout: Duration,
}

impl DeadlineGuard {
    /// Starts both clocks at dial time.
    pub fn new(connection_lifetime: Duration, read_timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + connection_lifetime,
            read_timeout,
        }
    }

    /// Runs `fut` (expected to be a single upstream read) bounded by
    /// whichever of the two clocks fires first. Returns
    /// [`ProxyError::DeadlineExpired`] naming which clock fired.
    pub async fn guard<F, T>(&self, fut: F) -> Result<T, ProxyError>
    where
        F: Future<Output = T>,
    {
        let now = Instant::now();
        if now >= self.deadline {
            return Err(ProxyError::DeadlineExpired("lifetime"));
        }
        let remaining_lifetime = self.deadline - now;
        let bound = remaining_lifetime.min(self.read_timeout);

        match tokio::time::timeout(bound, fut).await {
            Ok(v) => Ok(v),
            Err(_) => {
                if Instant::now() >= self.deadline {
                    Err(ProxyError::DeadlineExpired("lifetime"))
                } else {
                    Err(ProxyError::DeadlineExpired("read_timeout"))
                }
            }
        }
    }

    /// Whether the lifetime clock has already fired, independent of any
    /// read in flight.
    pub fn lifetime_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_timeout_fires_before_generous_lifetime() {
        let guard = DeadlineGuard::new(Duration::from_secs(60), Duration::from_millis(20));
        let result = guard
            .guard(async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                42
            })
            .await;
        match result {
            Err(ProxyError::DeadlineExpired(which)) => assert_eq!(which, "read_timeout"),
            other => panic!("expected read_timeout expiry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn lifetime_fires_before_generous_read_timeout() {
        let guard = DeadlineGuard::new(Duration::from_millis(20), Duration::from_secs(60));
        let result = guard
            .guard(async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                42
            })
            .await;
        match result {
            Err(ProxyError::DeadlineExpired(which)) => assert_eq!(which, "lifetime"),
            other => panic!("expected lifetime expiry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn completes_normally_within_both_budgets() {
        let guard = DeadlineGuard::new(Duration::from_secs(60), Duration::from_secs(60));
        let result = guard.guard(async { 7 }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
