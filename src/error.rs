//! Error types for pg-muster.
//!
//! Every failure in the collection pipeline is represented by [`MusterError`].
//! Errors are propagated via `Result<T, MusterError>` throughout the crate.
//!
//! # Error Classification
//!
//! - **Config** — invalid catalog or configuration. Fatal at startup.
//! - **Connect** — TCP/handshake failure. Retried by the pool with backoff.
//! - **Pool** — a claim could not be satisfied (still connecting, exhausted
//!   retries, or draining). Treated as a non-destructive per-tick skip.
//! - **Query** — SQL-level failures: timeout, generic error, bad value.
//! - **Bootstrap** — failures while installing the monitoring role/views.
//!
//! # Retry Policy
//!
//! [`RetryPolicy`] encapsulates exponential backoff with jitter, shared by the
//! connection pool's reconnect loop and the backend-teardown drain wait.

use std::fmt;

/// Primary error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum MusterError {
    // ── Config errors — fatal at startup ─────────────────────────────────
    /// The configuration document failed to parse or validate.
    #[error("config error: {0}")]
    ConfigError(String),

    // ── Connect errors — retried by the pool ─────────────────────────────
    /// TCP connect or startup handshake failed.
    #[error("connect error: {0}")]
    ConnectError(String),

    // ── Pool errors — non-destructive per-tick skip ──────────────────────
    /// The pool could not produce a connection (all retries exhausted).
    #[error("pool failed: {0}")]
    PoolFailed(String),

    /// `claim` did not complete within `connect_timeout_ms`.
    #[error("claim timed out after {0}ms")]
    ClaimTimeout(u64),

    /// The pool is draining/shutting down and will not hand out connections.
    #[error("pool is stopping")]
    PoolStopping,

    // ── Query errors ──────────────────────────────────────────────────────
    /// A query did not complete within `query_timeout_ms`.
    #[error("query {query} timed out after {timeout_ms}ms")]
    QueryTimeout { query: String, timeout_ms: u64 },

    /// Any other SQL-level failure.
    #[error("query {query} failed: {source}")]
    QueryError {
        query: String,
        source: tokio_postgres::Error,
    },

    /// A numeric column could not be parsed as a number.
    #[error("column {column} in query {query} is not a number")]
    NaNValue { query: String, column: String },

    /// An expected-numeric column returned NULL (not itself an error, but
    /// modeled here so callers can pattern-match it alongside NaNValue).
    #[error("column {column} in query {query} is NULL")]
    NullValue { query: String, column: String },

    // ── Bootstrap errors ───────────────────────────────────────────────────
    /// The backend reported `pg_is_in_recovery() = true`.
    #[error("backend {0} is a standby (pg_is_in_recovery)")]
    PostgresInRecovery(String),

    /// Bootstrap DDL (role/view creation) failed.
    #[error("bootstrap failed for {backend}: {source}")]
    BootstrapFailed {
        backend: String,
        source: tokio_postgres::Error,
    },

    // ── Internal errors ────────────────────────────────────────────────────
    /// An unexpected internal error. Indicates a bug.
    #[error("internal error: {0}")]
    InternalError(String),
}

impl MusterError {
    /// Whether this error is retryable by the connection pool.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MusterError::ConnectError(_)
                | MusterError::PoolFailed(_)
                | MusterError::ClaimTimeout(_)
        )
    }

    /// Whether this error should force-close the owning connection rather
    /// than let it be released back to the pool.
    pub fn requires_connection_close(&self) -> bool {
        matches!(self, MusterError::QueryTimeout { .. })
    }
}

/// Classification of error kind, used for the internal `pg_*_error` metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MusterErrorKind {
    Config,
    Connect,
    Pool,
    QueryTimeout,
    QueryError,
    NaN,
    Null,
    Recovery,
    Bootstrap,
    Internal,
}

impl fmt::Display for MusterErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MusterErrorKind::Config => write!(f, "CONFIG"),
            MusterErrorKind::Connect => write!(f, "CONNECT"),
            MusterErrorKind::Pool => write!(f, "POOL"),
            MusterErrorKind::QueryTimeout => write!(f, "QUERY_TIMEOUT"),
            MusterErrorKind::QueryError => write!(f, "QUERY_ERROR"),
            MusterErrorKind::NaN => write!(f, "NAN"),
            MusterErrorKind::Null => write!(f, "NULL"),
            MusterErrorKind::Recovery => write!(f, "RECOVERY"),
            MusterErrorKind::Bootstrap => write!(f, "BOOTSTRAP"),
            MusterErrorKind::Internal => write!(f, "INTERNAL"),
        }
    }
}

impl MusterError {
    pub fn kind(&self) -> MusterErrorKind {
        match self {
            MusterError::ConfigError(_) => MusterErrorKind::Config,
            MusterError::ConnectError(_) => MusterErrorKind::Connect,
            MusterError::PoolFailed(_) | MusterError::ClaimTimeout(_) | MusterError::PoolStopping => {
                MusterErrorKind::Pool
            }
            MusterError::QueryTimeout { .. } => MusterErrorKind::QueryTimeout,
            MusterError::QueryError { .. } => MusterErrorKind::QueryError,
            MusterError::NaNValue { .. } => MusterErrorKind::NaN,
            MusterError::NullValue { .. } => MusterErrorKind::Null,
            MusterError::PostgresInRecovery(_) => MusterErrorKind::Recovery,
            MusterError::BootstrapFailed { .. } => MusterErrorKind::Bootstrap,
            MusterError::InternalError(_) => MusterErrorKind::Internal,
        }
    }
}

// ── Retry Policy ───────────────────────────────────────────────────────────

/// Exponential backoff with jitter, shared by the pool's reconnect loop and
/// the teardown drain wait (each instantiates it with its own parameters).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Base delay in milliseconds (doubled each attempt).
    pub base_delay_ms: u64,
    /// Maximum delay in milliseconds (cap for backoff).
    pub max_delay_ms: u64,
    /// Maximum number of retry attempts before giving up.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 5_000,
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Backoff for the teardown drain wait: two attempts starting at 1s.
    pub fn teardown_drain() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 2_000,
            max_attempts: 2,
        }
    }

    /// Calculate the backoff delay in milliseconds for the given attempt
    /// number (0-based). Exponential: `base * 2^attempt`, capped at
    /// `max_delay`, jittered ±25% based on attempt parity.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let delay = self.base_delay_ms.saturating_mul(1u64 << attempt.min(16));
        let capped = delay.min(self.max_delay_ms);

        if attempt.is_multiple_of(2) {
            capped.saturating_mul(3) / 4
        } else {
            capped.saturating_mul(5) / 4
        }
    }

    /// Whether the given attempt (0-based) is within the retry limit.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

// ── Per-backend retry state ────────────────────────────────────────────────

/// Tracks reconnect retry state for a single backend's pool.
#[derive(Debug, Clone)]
pub struct RetryState {
    pub attempts: u32,
    pub next_retry_at_ms: u64,
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryState {
    pub fn new() -> Self {
        Self {
            attempts: 0,
            next_retry_at_ms: 0,
        }
    }

    /// Record a retryable failure and compute the next retry time.
    ///
    /// Returns `true` if another retry is allowed, `false` if attempts are
    /// exhausted.
    pub fn record_failure(&mut self, policy: &RetryPolicy, now_ms: u64) -> bool {
        self.attempts += 1;
        if policy.should_retry(self.attempts) {
            self.next_retry_at_ms = now_ms + policy.backoff_ms(self.attempts - 1);
            true
        } else {
            false
        }
    }

    /// Reset retry state after a successful connect.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.next_retry_at_ms = 0;
    }

    /// Whether the backend is currently in a retry-backoff period.
    pub fn is_in_backoff(&self, now_ms: u64) -> bool {
        self.attempts > 0 && now_ms < self.next_retry_at_ms
    }
}
