//! Backend identity and per-backend runtime state (§3).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::catalog::ResolvedQuery;

/// Stable identity assigned by discovery. Not reused across `removed`/`added`
/// cycles for a logically different instance.
pub type BackendKey = String;

/// One Postgres instance being monitored. Created on discovery `added`,
/// destroyed on `removed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backend {
    pub key: BackendKey,
    pub display_name: String,
    pub address: String,
    pub port: u16,
    pub target_database: String,
}

/// A single result row's identifying key within a query (`row[statkey]`, or
/// the query name itself when the query has no `statkey`).
pub type RowKey = String;

/// A snapshot of one result row, keyed by column name, used for delta
/// computation against the prior tick's observation of the same row.
pub type Row = HashMap<String, serde_json::Value>;

/// Per-backend runtime state, owned exclusively by the task currently
/// responsible for that backend (§5: "Backend runtime state is touched only
/// by the single task currently owning that backend").
pub struct BackendState {
    pub backend: Backend,
    /// True until the Bootstrapper completes successfully for this backend.
    pub needs_setup: bool,
    /// Non-reentrancy latch for the bootstrapper.
    pub setting_up: bool,
    pub server_version: Option<i32>,
    pub queries: Vec<ResolvedQuery>,
    /// `query.name -> (row_key -> last observed row)`.
    pub last_rows: HashMap<String, HashMap<RowKey, Row>>,
    /// `query.name -> Some(start_timestamp_ms)` while that query is executing.
    pub in_flight: HashMap<String, Option<u64>>,
    /// Set by the bootstrapper when `pg_is_in_recovery()` is true; per the
    /// spec's recommended resolution of the standby Open Question, the
    /// engine skips all collection for this backend until it is
    /// re-discovered (next `added`).
    pub is_standby: bool,
}

impl BackendState {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            needs_setup: true,
            setting_up: false,
            server_version: None,
            queries: Vec::new(),
            last_rows: HashMap::new(),
            in_flight: HashMap::new(),
            is_standby: false,
        }
    }

    /// Whether this backend should be skipped entirely this tick: still
    /// needs setup (handled as a distinct branch by the engine), mid-setup,
    /// or known to be a standby.
    pub fn should_skip_collection(&self) -> bool {
        self.setting_up || self.is_standby
    }
}
