//! Connection Pool (§4.C): per-backend, holds at most one live connection.
//!
//! Modeled as a small hand-rolled state machine rather than a generic pool
//! crate (`bb8`/`deadpool`) — those don't express the spec's
//! Idle/Claimed/Broken/Connecting/Failed states or the forcibly-closed vs.
//! released distinction §4.F requires. The reconnect backoff reuses
//! [`RetryPolicy`]/[`RetryState`], the same primitives the teacher's
//! scheduler used for its own retry bookkeeping.

use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, warn};

use crate::client::{BackendClient, ConnectParams};
use crate::error::{MusterError, RetryPolicy, RetryState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolState {
    Idle,
    Claimed,
    Broken,
    Failed,
}

/// A per-backend connection pool. `max size 1` is a core invariant, not a
/// configurable pool-size parameter — see [`crate::config::Config::validate`].
pub struct Pool {
    params: ConnectParams,
    connect_retries: u32,
    connect_timeout_ms: u64,
    state: PoolState,
    client: Option<BackendClient>,
    retry: RetryState,
    policy: RetryPolicy,
}

impl Pool {
    pub fn new(params: ConnectParams, connect_retries: u32, connect_timeout_ms: u64) -> Self {
        Self {
            params,
            connect_retries,
            connect_timeout_ms,
            state: PoolState::Idle,
            client: None,
            retry: RetryState::new(),
            policy: RetryPolicy {
                base_delay_ms: 1_000,
                max_delay_ms: 5_000,
                max_attempts: connect_retries,
            },
        }
    }

    /// Claim a connection, building one if necessary. Retries with
    /// exponential backoff (1s initial, 5s max) up to `connect_retries`,
    /// the whole attempt bounded by `connect_timeout_ms`.
    pub async fn claim(&mut self) -> Result<&mut BackendClient, MusterError> {
        if self.state == PoolState::Claimed {
            return Err(MusterError::PoolFailed("connection already claimed".into()));
        }

        if let Some(client) = &self.client {
            if !client.is_destroyed() {
                self.state = PoolState::Claimed;
                return Ok(self.client.as_mut().unwrap());
            }
            self.client = None;
        }

        let deadline = Instant::now() + Duration::from_millis(self.connect_timeout_ms);
        let mut attempt = 0u32;
        loop {
            if Instant::now() >= deadline {
                self.state = PoolState::Failed;
                return Err(MusterError::ClaimTimeout(self.connect_timeout_ms));
            }

            match BackendClient::connect(&self.params).await {
                Ok(client) => {
                    self.retry.reset();
                    self.client = Some(client);
                    self.state = PoolState::Claimed;
                    return Ok(self.client.as_mut().unwrap());
                }
                Err(e) => {
                    attempt += 1;
                    warn!(backend = %self.params.host, attempt, error = %e, "connect attempt failed");
                    if attempt >= self.connect_retries {
                        self.state = PoolState::Failed;
                        return Err(MusterError::PoolFailed(format!(
                            "exhausted {} connect retries: {e}",
                            self.connect_retries
                        )));
                    }
                    let backoff = self.policy.backoff_ms(attempt - 1);
                    sleep(Duration::from_millis(backoff)).await;
                }
            }
        }
    }

    /// Return a healthy connection to `Idle` so the next `claim` reuses it.
    pub fn release(&mut self) {
        if self.state == PoolState::Claimed {
            self.state = PoolState::Idle;
        }
    }

    /// Forcibly close the connection rather than release it — used when a
    /// query timed out (§4.F: "forcibly close the connection, not release").
    pub fn close(&mut self) {
        if let Some(client) = &mut self.client {
            client.destroy();
        }
        self.client = None;
        self.state = PoolState::Broken;
        debug!(backend = %self.params.host, "connection forcibly closed");
    }

    pub fn is_broken(&self) -> bool {
        self.state == PoolState::Broken || self.state == PoolState::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ConnectParams {
        ConnectParams {
            host: "127.0.0.1".into(),
            port: 1, // nothing listens here; connect always fails in tests
            database: "postgres".into(),
            user: "pg_muster_monitor".into(),
            password: "secret".into(),
            connect_timeout_ms: 200,
        }
    }

    #[test]
    fn test_new_pool_starts_idle() {
        let pool = Pool::new(params(), 3, 200);
        assert_eq!(pool.state, PoolState::Idle);
        assert!(!pool.is_broken());
    }

    #[tokio::test]
    async fn test_claim_fails_after_exhausting_retries_within_deadline() {
        let mut pool = Pool::new(params(), 2, 50);
        let result = pool.claim().await;
        assert!(result.is_err());
        assert!(pool.is_broken());
    }

    #[test]
    fn test_close_marks_broken() {
        let mut pool = Pool::new(params(), 3, 200);
        pool.close();
        assert!(pool.is_broken());
    }

    #[test]
    fn test_release_returns_to_idle() {
        let mut pool = Pool::new(params(), 3, 200);
        pool.state = PoolState::Claimed;
        pool.release();
        assert_eq!(pool.state, PoolState::Idle);
    }
}
