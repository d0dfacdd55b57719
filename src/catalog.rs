//! The query catalog (§3, §4.A, §6): a declarative, version-gated list of
//! introspection queries plus the row → metric mapping rules for each.
//!
//! The catalog itself is a data literal (`catalog()`), not a builder
//! function — version dispatch is a separate pure function
//! ([`Query::resolve`]) so the two concerns (what to ask, which SQL text to
//! use for a given server) stay independently testable.

use crate::error::MusterError;

/// One exposed counter derived from a result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterSpec {
    pub attr: &'static str,
    pub help: &'static str,
    pub unit: Option<&'static str>,
}

/// One exposed gauge derived from a result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GaugeSpec {
    pub attr: &'static str,
    pub help: &'static str,
    pub unit: Option<&'static str>,
    pub expires: bool,
}

/// Version gating for a query's SQL text: either one SQL string that applies
/// to every server version, or a set of `(min_server_version, sql)` tiers.
/// Mixing the two within one query is a catalog bug, caught by
/// [`validate_catalog`].
#[derive(Debug, Clone)]
pub enum VersionGate {
    All(&'static str),
    Tiered(&'static [(i32, &'static str)]),
}

#[derive(Debug, Clone)]
pub struct Query {
    pub name: &'static str,
    /// Result column that uniquely identifies a row across ticks. `None`
    /// means the query yields exactly one synthetic row keyed by the query
    /// name (§3).
    pub statkey: Option<&'static str>,
    pub metadata_columns: &'static [&'static str],
    pub version_to_sql: VersionGate,
    pub counters: &'static [CounterSpec],
    pub gauges: &'static [GaugeSpec],
}

/// A query with its SQL text and gauge expiry periods resolved for one
/// particular server version — what the engine actually dispatches.
#[derive(Debug, Clone)]
pub struct ResolvedQuery {
    pub name: String,
    pub sql: String,
    pub statkey: Option<String>,
    pub metadata_columns: Vec<String>,
    pub counters: Vec<ResolvedCounterSpec>,
    pub gauges: Vec<ResolvedGaugeSpec>,
}

#[derive(Debug, Clone)]
pub struct ResolvedCounterSpec {
    pub attr: String,
    pub metric_name: String,
}

#[derive(Debug, Clone)]
pub struct ResolvedGaugeSpec {
    pub attr: String,
    pub metric_name: String,
    pub expires: bool,
    pub expiry_period_ms: Option<u64>,
}

fn metric_name(query_name: &str, attr: &str, unit: Option<&str>) -> String {
    match unit {
        Some(u) => format!("{query_name}_{attr}_{u}"),
        None => format!("{query_name}_{attr}"),
    }
}

impl Query {
    /// Resolve the SQL tier applicable to `server_version_num`: the tier
    /// with the largest threshold `<= server_version_num`, or the `All`
    /// variant. Returns `None` if the query has no tier at or below this
    /// server's version (query omitted entirely for this backend).
    pub fn sql_for_version(&self, server_version_num: i32) -> Option<&'static str> {
        match &self.version_to_sql {
            VersionGate::All(sql) => Some(sql),
            VersionGate::Tiered(tiers) => tiers
                .iter()
                .filter(|(min_version, _)| *min_version <= server_version_num)
                .max_by_key(|(min_version, _)| *min_version)
                .map(|(_, sql)| *sql),
        }
    }

    /// Resolve this catalog entry into a dispatchable [`ResolvedQuery`] for
    /// `server_version_num`, with transient-gauge expiry periods set to
    /// `poll_interval_ms + 30_000`. Returns `None` if no version tier
    /// applies.
    pub fn resolve(&self, server_version_num: i32, poll_interval_ms: u64) -> Option<ResolvedQuery> {
        let sql = self.sql_for_version(server_version_num)?;
        Some(ResolvedQuery {
            name: self.name.to_string(),
            sql: normalize_whitespace(sql),
            statkey: self.statkey.map(str::to_string),
            metadata_columns: self.metadata_columns.iter().map(|s| s.to_string()).collect(),
            counters: self
                .counters
                .iter()
                .map(|c| ResolvedCounterSpec {
                    attr: c.attr.to_string(),
                    metric_name: metric_name(self.name, c.attr, c.unit),
                })
                .collect(),
            gauges: self
                .gauges
                .iter()
                .map(|g| ResolvedGaugeSpec {
                    attr: g.attr.to_string(),
                    metric_name: metric_name(self.name, g.attr, g.unit),
                    expires: g.expires,
                    expiry_period_ms: g.expires.then_some(poll_interval_ms + 30_000),
                })
                .collect(),
        })
    }
}

/// Collapse internal whitespace so equal queries trace identically across
/// backends regardless of catalog source formatting.
fn normalize_whitespace(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Validate the catalog against the schema in §3. Called once at startup
/// (fatal `ConfigError` on violation) and exercised directly by tests.
pub fn validate_catalog(queries: &[Query]) -> Result<(), MusterError> {
    for q in queries {
        if q.name.is_empty() {
            return Err(MusterError::ConfigError("catalog entry has empty name".into()));
        }
        match &q.version_to_sql {
            VersionGate::All(sql) if sql.is_empty() => {
                return Err(MusterError::ConfigError(format!(
                    "query {}: `all` SQL entry is empty",
                    q.name
                )));
            }
            VersionGate::Tiered(tiers) if tiers.is_empty() => {
                return Err(MusterError::ConfigError(format!(
                    "query {}: tiered version_to_sql has no entries",
                    q.name
                )));
            }
            _ => {}
        }
        // Every metadata column referenced must be unique — collisions make
        // rows indistinguishable in the label set (§4.F row ordering note).
        let mut seen = std::collections::HashSet::new();
        for col in q.metadata_columns {
            if !seen.insert(*col) {
                return Err(MusterError::ConfigError(format!(
                    "query {}: metadata column {} listed more than once",
                    q.name, col
                )));
            }
        }
    }
    Ok(())
}

/// `get_applicable_queries(server_version_num, poll_interval_ms)`: the
/// version-resolved, expiry-populated subset of the catalog for one backend
/// (§4.A). Validates the catalog on every call, as specified.
pub fn get_applicable_queries(
    server_version_num: i32,
    poll_interval_ms: u64,
) -> Result<Vec<ResolvedQuery>, MusterError> {
    let entries = catalog();
    validate_catalog(&entries)?;
    Ok(entries
        .iter()
        .filter_map(|q| q.resolve(server_version_num, poll_interval_ms))
        .collect())
}

/// The canonical catalog (§6 "Catalog coverage").
pub fn catalog() -> Vec<Query> {
    vec![
        Query {
            name: "pg_stat_user_tables",
            statkey: Some("relid"),
            metadata_columns: &["schemaname", "relname"],
            version_to_sql: VersionGate::All(
                "SELECT relid, schemaname, relname, seq_scan, seq_tup_read, idx_scan, \
                 idx_tup_fetch, n_tup_ins, n_tup_upd, n_tup_del, n_tup_hot_upd, \
                 n_live_tup, n_dead_tup, vacuum_count, autovacuum_count, \
                 analyze_count, autoanalyze_count FROM pg_stat_user_tables",
            ),
            counters: &[
                CounterSpec { attr: "seq_scan", help: "sequential scans initiated", unit: None },
                CounterSpec { attr: "seq_tup_read", help: "live rows fetched by sequential scans", unit: None },
                CounterSpec { attr: "idx_scan", help: "index scans initiated", unit: None },
                CounterSpec { attr: "idx_tup_fetch", help: "live rows fetched by index scans", unit: None },
                CounterSpec { attr: "n_tup_ins", help: "rows inserted", unit: None },
                CounterSpec { attr: "n_tup_upd", help: "rows updated", unit: None },
                CounterSpec { attr: "n_tup_del", help: "rows deleted", unit: None },
                CounterSpec { attr: "n_tup_hot_upd", help: "rows HOT updated", unit: None },
                CounterSpec { attr: "vacuum_count", help: "times manually vacuumed", unit: None },
                CounterSpec { attr: "autovacuum_count", help: "times vacuumed by autovacuum", unit: None },
                CounterSpec { attr: "analyze_count", help: "times manually analyzed", unit: None },
                CounterSpec { attr: "autoanalyze_count", help: "times analyzed by autoanalyze", unit: None },
            ],
            gauges: &[
                GaugeSpec { attr: "n_live_tup", help: "estimated live rows", unit: None, expires: false },
                GaugeSpec { attr: "n_dead_tup", help: "estimated dead rows", unit: None, expires: false },
            ],
        },
        Query {
            name: "pg_statio_user_tables",
            statkey: Some("relid"),
            metadata_columns: &["schemaname", "relname"],
            version_to_sql: VersionGate::All(
                "SELECT relid, schemaname, relname, heap_blks_read, heap_blks_hit, \
                 idx_blks_read, idx_blks_hit, toast_blks_read, toast_blks_hit, \
                 tidx_blks_read, tidx_blks_hit FROM pg_statio_user_tables",
            ),
            counters: &[
                CounterSpec { attr: "heap_blks_read", help: "heap blocks read from disk", unit: None },
                CounterSpec { attr: "heap_blks_hit", help: "heap blocks found in cache", unit: None },
                CounterSpec { attr: "idx_blks_read", help: "index blocks read from disk", unit: None },
                CounterSpec { attr: "idx_blks_hit", help: "index blocks found in cache", unit: None },
                CounterSpec { attr: "toast_blks_read", help: "TOAST blocks read from disk", unit: None },
                CounterSpec { attr: "toast_blks_hit", help: "TOAST blocks found in cache", unit: None },
            ],
            gauges: &[],
        },
        Query {
            name: "pg_statio_user_indexes",
            statkey: Some("indexrelid"),
            metadata_columns: &["schemaname", "relname", "indexrelname"],
            version_to_sql: VersionGate::All(
                "SELECT indexrelid, schemaname, relname, indexrelname, idx_blks_read, \
                 idx_blks_hit FROM pg_statio_user_indexes",
            ),
            counters: &[
                CounterSpec { attr: "idx_blks_read", help: "index blocks read from disk", unit: None },
                CounterSpec { attr: "idx_blks_hit", help: "index blocks found in cache", unit: None },
            ],
            gauges: &[],
        },
        Query {
            name: "pg_stat_replication",
            statkey: Some("pid"),
            metadata_columns: &["application_name", "sync_state"],
            version_to_sql: VersionGate::Tiered(&[
                (
                    90400,
                    "SELECT pid, application_name, sync_state, \
                     sent_location - '0/0'::pg_lsn AS wal_sent, \
                     write_location - '0/0'::pg_lsn AS replica_wal_written, \
                     flush_location - '0/0'::pg_lsn AS replica_wal_flushed, \
                     replay_location - '0/0'::pg_lsn AS replica_wal_replayed \
                     FROM get_stat_replication()",
                ),
                (
                    100000,
                    "SELECT pid, application_name, sync_state, \
                     sent_lsn - '0/0'::pg_lsn AS wal_sent, \
                     write_lsn - '0/0'::pg_lsn AS replica_wal_written, \
                     flush_lsn - '0/0'::pg_lsn AS replica_wal_flushed, \
                     replay_lsn - '0/0'::pg_lsn AS replica_wal_replayed \
                     FROM get_stat_replication()",
                ),
            ]),
            counters: &[],
            gauges: &[
                // Absolute WAL byte positions since backend start: exposed as
                // gauges per the v2 wire semantics (§9 Open Question).
                GaugeSpec { attr: "wal_sent", help: "WAL bytes sent to this replica", unit: Some("bytes"), expires: false },
                GaugeSpec { attr: "replica_wal_written", help: "WAL bytes written by this replica", unit: Some("bytes"), expires: false },
                GaugeSpec { attr: "replica_wal_flushed", help: "WAL bytes flushed by this replica", unit: Some("bytes"), expires: false },
                GaugeSpec { attr: "replica_wal_replayed", help: "WAL bytes replayed by this replica", unit: Some("bytes"), expires: false },
            ],
        },
        Query {
            name: "pg_recovery",
            statkey: None,
            metadata_columns: &[],
            version_to_sql: VersionGate::All(
                "SELECT pg_is_in_recovery() AS in_recovery, \
                 CASE WHEN pg_is_in_recovery() THEN NULL ELSE pg_current_wal_insert_lsn() - '0/0'::pg_lsn END AS wal_insert, \
                 CASE WHEN pg_is_in_recovery() THEN NULL ELSE pg_current_wal_flush_lsn() - '0/0'::pg_lsn END AS wal_flush, \
                 CASE WHEN pg_is_in_recovery() THEN pg_last_wal_replay_lsn() - '0/0'::pg_lsn ELSE NULL END AS wal_replay, \
                 CASE WHEN pg_is_in_recovery() THEN pg_last_wal_receive_lsn() - '0/0'::pg_lsn ELSE NULL END AS wal_receive",
            ),
            counters: &[],
            gauges: &[
                GaugeSpec { attr: "wal_insert", help: "WAL bytes inserted (primary only)", unit: Some("bytes"), expires: false },
                GaugeSpec { attr: "wal_flush", help: "WAL bytes flushed (primary only)", unit: Some("bytes"), expires: false },
                GaugeSpec { attr: "wal_replay", help: "WAL bytes replayed (standby only)", unit: Some("bytes"), expires: false },
                GaugeSpec { attr: "wal_receive", help: "WAL bytes received (standby only)", unit: Some("bytes"), expires: false },
            ],
        },
        Query {
            name: "pg_stat_activity",
            statkey: None,
            metadata_columns: &["datname", "state"],
            version_to_sql: VersionGate::All(
                "SELECT d.datname, s.state, COUNT(a.*) AS connections \
                 FROM pg_database d \
                 CROSS JOIN (VALUES ('active'), ('idle'), ('idle in transaction'), \
                             ('idle in transaction (aborted)'), ('fastpath function call'), \
                             ('disabled')) AS s(state) \
                 LEFT JOIN (SELECT * FROM get_stat_activity()) a \
                   ON a.datname = d.datname AND a.state = s.state \
                 WHERE d.datname NOT LIKE 'template%' \
                 GROUP BY d.datname, s.state",
            ),
            counters: &[],
            gauges: &[
                GaugeSpec { attr: "connections", help: "backends in this state", unit: None, expires: false },
            ],
        },
        Query {
            name: "pg_stat_database",
            statkey: Some("datname"),
            metadata_columns: &["datname"],
            version_to_sql: VersionGate::All(
                "SELECT datname, numbackends, xact_commit, xact_rollback, blks_read, \
                 blks_hit, tup_returned, tup_fetched, tup_inserted, tup_updated, \
                 tup_deleted, conflicts, temp_files, temp_bytes, deadlocks \
                 FROM pg_stat_database \
                 WHERE datname NOT IN ('postgres') AND datname NOT LIKE 'template%'",
            ),
            counters: &[
                CounterSpec { attr: "xact_commit", help: "transactions committed", unit: None },
                CounterSpec { attr: "xact_rollback", help: "transactions rolled back", unit: None },
                CounterSpec { attr: "blks_read", help: "disk blocks read", unit: None },
                CounterSpec { attr: "blks_hit", help: "buffer cache hits", unit: None },
                CounterSpec { attr: "tup_returned", help: "rows returned by queries", unit: None },
                CounterSpec { attr: "tup_fetched", help: "rows fetched by queries", unit: None },
                CounterSpec { attr: "tup_inserted", help: "rows inserted", unit: None },
                CounterSpec { attr: "tup_updated", help: "rows updated", unit: None },
                CounterSpec { attr: "tup_deleted", help: "rows deleted", unit: None },
                CounterSpec { attr: "conflicts", help: "queries canceled by recovery conflicts", unit: None },
                CounterSpec { attr: "temp_files", help: "temporary files created", unit: None },
                CounterSpec { attr: "temp_bytes", help: "data written to temporary files", unit: Some("bytes") },
                CounterSpec { attr: "deadlocks", help: "deadlocks detected", unit: None },
            ],
            gauges: &[
                GaugeSpec { attr: "numbackends", help: "backends currently connected", unit: None, expires: false },
            ],
        },
        Query {
            name: "pg_relation_size",
            statkey: Some("oid"),
            metadata_columns: &["schemaname", "relname"],
            version_to_sql: VersionGate::All(
                "SELECT c.oid, n.nspname AS schemaname, c.relname, c.reltuples AS row_estimate, \
                 pg_total_relation_size(c.oid) AS total_size, \
                 pg_indexes_size(c.oid) AS index_size, \
                 coalesce(pg_total_relation_size(c.reltoastrelid), 0) AS toast_size \
                 FROM pg_class c JOIN pg_namespace n ON n.oid = c.relnamespace \
                 WHERE c.relkind IN ('r', 'm') AND n.nspname = ANY($1)",
            ),
            counters: &[],
            gauges: &[
                GaugeSpec { attr: "row_estimate", help: "estimated row count", unit: None, expires: false },
                GaugeSpec { attr: "total_size", help: "total on-disk size", unit: Some("bytes"), expires: false },
                GaugeSpec { attr: "index_size", help: "index on-disk size", unit: Some("bytes"), expires: false },
                GaugeSpec { attr: "toast_size", help: "TOAST on-disk size", unit: Some("bytes"), expires: false },
            ],
        },
        Query {
            name: "pg_stat_bgwriter",
            statkey: None,
            metadata_columns: &[],
            version_to_sql: VersionGate::All(
                "SELECT checkpoints_timed, checkpoints_req, checkpoint_write_time, \
                 checkpoint_sync_time, buffers_checkpoint, buffers_clean, \
                 maxwritten_clean, buffers_backend, buffers_backend_fsync, \
                 buffers_alloc FROM pg_stat_bgwriter",
            ),
            counters: &[
                CounterSpec { attr: "checkpoints_timed", help: "scheduled checkpoints performed", unit: None },
                CounterSpec { attr: "checkpoints_req", help: "requested checkpoints performed", unit: None },
                CounterSpec { attr: "checkpoint_write_time", help: "time writing checkpoint files", unit: Some("ms") },
                CounterSpec { attr: "checkpoint_sync_time", help: "time syncing checkpoint files", unit: Some("ms") },
                CounterSpec { attr: "buffers_checkpoint", help: "buffers written during checkpoints", unit: None },
                CounterSpec { attr: "buffers_clean", help: "buffers written by the background writer", unit: None },
                CounterSpec { attr: "maxwritten_clean", help: "times the bgwriter stopped on the limit", unit: None },
                CounterSpec { attr: "buffers_backend", help: "buffers written directly by a backend", unit: None },
                CounterSpec { attr: "buffers_backend_fsync", help: "fsyncs done directly by a backend", unit: None },
                CounterSpec { attr: "buffers_alloc", help: "buffers allocated", unit: None },
            ],
            gauges: &[],
        },
        Query {
            name: "pg_vacuum",
            statkey: Some("relid"),
            metadata_columns: &["schemaname", "relname"],
            version_to_sql: VersionGate::All(
                "SELECT c.oid AS relid, n.nspname AS schemaname, c.relname, \
                 age(c.relfrozenxid) AS xid_age, \
                 2146483648 - age(c.relfrozenxid) AS tx_until_wraparound_autovacuum \
                 FROM pg_class c JOIN pg_namespace n ON n.oid = c.relnamespace \
                 WHERE c.relkind IN ('r', 'm') AND n.nspname NOT IN ('pg_catalog', 'information_schema')",
            ),
            counters: &[],
            gauges: &[
                GaugeSpec { attr: "xid_age", help: "transaction id age of this relation", unit: None, expires: false },
                GaugeSpec { attr: "tx_until_wraparound_autovacuum", help: "transactions remaining before forced autovacuum", unit: None, expires: false },
            ],
        },
        Query {
            name: "pg_stat_progress_vacuum",
            statkey: Some("pid"),
            metadata_columns: &["datname", "relid", "phase"],
            version_to_sql: VersionGate::Tiered(&[(
                90600,
                "SELECT pid, datname, relid, phase, heap_blks_total, heap_blks_scanned, \
                 heap_blks_vacuumed, index_vacuum_count, max_dead_tuples, num_dead_tuples \
                 FROM pg_stat_progress_vacuum",
            )]),
            counters: &[],
            gauges: &[
                GaugeSpec { attr: "heap_blks_total", help: "total heap blocks", unit: None, expires: true },
                GaugeSpec { attr: "heap_blks_scanned", help: "heap blocks scanned so far", unit: None, expires: true },
                GaugeSpec { attr: "heap_blks_vacuumed", help: "heap blocks vacuumed so far", unit: None, expires: true },
                GaugeSpec { attr: "index_vacuum_count", help: "completed index vacuum cycles", unit: None, expires: true },
                GaugeSpec { attr: "max_dead_tuples", help: "dead tuples this vacuum can store", unit: None, expires: true },
                GaugeSpec { attr: "num_dead_tuples", help: "dead tuples collected so far", unit: None, expires: true },
            ],
        },
    ]
}
