//! Delta Recorder (§4.F "Delta Recorder", §3 invariants): turns a raw result
//! set into counter-delta / gauge-set updates, handling stats-reset
//! detection, first-observation suppression, and NaN/null columns.
//!
//! Grounded on rpglot's `pg_collector`: a `prev`/`_first_collect`-style cache
//! per query, diffed row by row on each poll.

use std::collections::HashMap;

use serde_json::Value;
use tokio_postgres::Row as PgRow;
use tracing::{debug, info};

use crate::backend::{BackendState, Row, RowKey};
use crate::catalog::ResolvedQuery;

#[derive(Debug, Clone)]
pub enum MetricUpdateKind {
    CounterAdd(f64),
    GaugeSet { value: f64, expiry_period_ms: Option<u64> },
}

#[derive(Debug, Clone)]
pub struct MetricUpdate {
    pub metric_name: String,
    pub labels: Vec<(String, String)>,
    pub kind: MetricUpdateKind,
}

#[derive(Debug, Default)]
pub struct DeltaOutcome {
    pub updates: Vec<MetricUpdate>,
    /// Columns that failed numeric parsing this tick, with how many times
    /// each one did (`name` label on `pg_NaN_error`, §6).
    pub nan_columns: Vec<(String, u32)>,
}

impl DeltaOutcome {
    fn record_nan(&mut self, column: &str) {
        match self.nan_columns.iter_mut().find(|(c, _)| c == column) {
            Some((_, count)) => *count += 1,
            None => self.nan_columns.push((column.to_string(), 1)),
        }
    }
}

/// A float read back from Postgres as IEEE NaN renders through `to_string()`
/// as this literal (`'NaN'::float8::text`); `serde_json::Value` has no NaN
/// number variant, so [`column_to_json`] tags it this way to keep it
/// distinguishable from a genuine SQL NULL. `value_to_f64` rejects
/// non-`Value::Number` values, so a tagged column naturally lands in the
/// NaN-error path below rather than the null-skip one.
const NAN_MARKER: &str = "NaN";

/// Best-effort typed extraction: try the common numeric/text/bool shapes a
/// Postgres introspection query can return, in the order they're most
/// likely to appear (ints first, since most catalog columns are counters).
fn column_to_json(row: &PgRow, idx: usize) -> Value {
    if let Ok(Some(v)) = row.try_get::<_, Option<i64>>(idx) {
        return Value::from(v);
    }
    if let Ok(Some(v)) = row.try_get::<_, Option<i32>>(idx) {
        return Value::from(v);
    }
    if let Ok(Some(v)) = row.try_get::<_, Option<f64>>(idx) {
        if v.is_nan() {
            return Value::String(NAN_MARKER.to_string());
        }
        return serde_json::Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null);
    }
    if let Ok(Some(v)) = row.try_get::<_, Option<bool>>(idx) {
        return Value::Bool(v);
    }
    if let Ok(Some(v)) = row.try_get::<_, Option<String>>(idx) {
        return Value::String(v);
    }
    Value::Null
}

/// Convert a raw `tokio_postgres::Row` into the crate's internal row
/// representation, keyed by column name.
pub fn extract_row(pg_row: &PgRow) -> Row {
    let mut row: Row = HashMap::new();
    for (idx, col) in pg_row.columns().iter().enumerate() {
        row.insert(col.name().to_string(), column_to_json(pg_row, idx));
    }
    row
}

fn row_key(row: &Row, query: &ResolvedQuery) -> RowKey {
    match &query.statkey {
        Some(key) => row
            .get(key)
            .map(value_to_string)
            .unwrap_or_else(|| format!("{}-missing-statkey", query.name)),
        None => query.name.clone(),
    }
}

fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn value_to_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn labels_for(row: &Row, query: &ResolvedQuery, backend_label: &str, fixed_labels: &[(String, String)]) -> Vec<(String, String)> {
    let mut labels: Vec<(String, String)> = vec![("backend".to_string(), backend_label.to_string())];
    labels.extend(fixed_labels.iter().cloned());
    for col in &query.metadata_columns {
        let value = row.get(col).map(value_to_string).unwrap_or_default();
        labels.push((col.clone(), value));
    }
    labels
}

/// Diff `new_rows` for one `(backend, query)` against the prior tick's
/// observation, producing the registry updates this tick should apply.
/// Mutates `state.last_rows[query.name]` in place.
pub fn record(
    state: &mut BackendState,
    query: &ResolvedQuery,
    pg_rows: Vec<PgRow>,
    backend_label: &str,
    fixed_labels: &[(String, String)],
) -> DeltaOutcome {
    let mut outcome = DeltaOutcome::default();
    let prev_rows = state.last_rows.remove(&query.name).unwrap_or_default();
    let mut new_rows: HashMap<RowKey, Row> = HashMap::with_capacity(pg_rows.len());

    for pg_row in &pg_rows {
        let row = extract_row(pg_row);
        let key = row_key(&row, query);

        let prev = prev_rows.get(&key);

        let stats_reset = match (prev.and_then(|p| p.get("stats_reset")), row.get("stats_reset")) {
            (Some(old), Some(new)) => value_to_f64(new) > value_to_f64(old),
            _ => false,
        };

        if stats_reset {
            info!(backend = backend_label, query = %query.name, row = %key, "stats reset detected, skipping tick");
        } else if prev.is_none() {
            debug!(backend = backend_label, query = %query.name, row = %key, "row observed for the first time, no delta yet");
        } else {
            let prev = prev.unwrap();
            let labels = labels_for(&row, query, backend_label, fixed_labels);

            for counter in &query.counters {
                match (prev.get(&counter.attr), row.get(&counter.attr)) {
                    (_, None) => {}
                    (_, Some(Value::Null)) => {
                        debug!(backend = backend_label, query = %query.name, column = %counter.attr, "null counter column, skipping");
                    }
                    (old, Some(new_v)) => match value_to_f64(new_v) {
                        None => {
                            outcome.record_nan(&counter.attr);
                        }
                        Some(new_val) => {
                            let old_val = old.and_then(value_to_f64).unwrap_or(0.0);
                            if old_val > new_val {
                                info!(backend = backend_label, query = %query.name, column = %counter.attr, "implicit counter reset, skipping");
                            } else {
                                outcome.updates.push(MetricUpdate {
                                    metric_name: counter.metric_name.clone(),
                                    labels: labels.clone(),
                                    kind: MetricUpdateKind::CounterAdd(new_val - old_val),
                                });
                            }
                        }
                    },
                }
            }

            for gauge in &query.gauges {
                match row.get(&gauge.attr) {
                    None | Some(Value::Null) => {
                        debug!(backend = backend_label, query = %query.name, column = %gauge.attr, "null gauge column, skipping");
                    }
                    Some(new_v) => match value_to_f64(new_v) {
                        None => {
                            outcome.record_nan(&gauge.attr);
                        }
                        Some(value) => {
                            outcome.updates.push(MetricUpdate {
                                metric_name: gauge.metric_name.clone(),
                                labels: labels.clone(),
                                kind: MetricUpdateKind::GaugeSet {
                                    value,
                                    expiry_period_ms: gauge.expiry_period_ms,
                                },
                            });
                        }
                    },
                }
            }
        }

        new_rows.insert(key, row);
    }

    state.last_rows.insert(query.name.clone(), new_rows);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::catalog::{ResolvedCounterSpec, ResolvedGaugeSpec};

    fn backend_state() -> BackendState {
        BackendState::new(Backend {
            key: "db1".into(),
            display_name: "db1".into(),
            address: "10.0.0.1".into(),
            port: 5432,
            target_database: "postgres".into(),
        })
    }

    fn query() -> ResolvedQuery {
        ResolvedQuery {
            name: "q".into(),
            sql: "SELECT 1".into(),
            statkey: Some("id".into()),
            metadata_columns: vec!["name".into()],
            counters: vec![ResolvedCounterSpec { attr: "hits".into(), metric_name: "q_hits".into() }],
            gauges: vec![ResolvedGaugeSpec {
                attr: "live".into(),
                metric_name: "q_live".into(),
                expires: false,
                expiry_period_ms: None,
            }],
        }
    }

    fn row(id: i64, name: &str, hits: i64, live: i64) -> Row {
        let mut r: Row = HashMap::new();
        r.insert("id".into(), Value::from(id));
        r.insert("name".into(), Value::from(name));
        r.insert("hits".into(), Value::from(hits));
        r.insert("live".into(), Value::from(live));
        r
    }

    /// Manually drive the diff logic without a real `tokio_postgres::Row`
    /// (which cannot be constructed outside a live connection) by exercising
    /// the row-level helpers the same way `record` composes them.
    fn diff_rows(prev: Option<&Row>, new: &Row, q: &ResolvedQuery) -> DeltaOutcome {
        let mut outcome = DeltaOutcome::default();
        if let Some(prev) = prev {
            let labels = labels_for(new, q, "db1", &[]);
            for counter in &q.counters {
                let old_val = prev.get(&counter.attr).and_then(value_to_f64).unwrap_or(0.0);
                let new_val = new.get(&counter.attr).and_then(value_to_f64).unwrap();
                if new_val >= old_val {
                    outcome.updates.push(MetricUpdate {
                        metric_name: counter.metric_name.clone(),
                        labels: labels.clone(),
                        kind: MetricUpdateKind::CounterAdd(new_val - old_val),
                    });
                }
            }
        }
        outcome
    }

    #[test]
    fn test_nan_marker_is_not_numeric() {
        assert_eq!(value_to_f64(&Value::String(NAN_MARKER.to_string())), None);
    }

    #[test]
    fn test_record_nan_accumulates_per_column() {
        let mut outcome = DeltaOutcome::default();
        outcome.record_nan("hits");
        outcome.record_nan("hits");
        outcome.record_nan("live");
        assert_eq!(outcome.nan_columns, vec![("hits".to_string(), 2), ("live".to_string(), 1)]);
    }

    #[test]
    fn test_first_observation_produces_no_updates() {
        let q = query();
        let outcome = diff_rows(None, &row(1, "t", 5, 10), &q);
        assert!(outcome.updates.is_empty());
    }

    #[test]
    fn test_counter_delta_is_nonnegative() {
        let q = query();
        let outcome = diff_rows(Some(&row(1, "t", 5, 10)), &row(1, "t", 8, 10), &q);
        assert_eq!(outcome.updates.len(), 1);
        match outcome.updates[0].kind {
            MetricUpdateKind::CounterAdd(delta) => assert_eq!(delta, 3.0),
            _ => panic!("expected counter update"),
        }
    }

    #[test]
    fn test_implicit_reset_skips_delta() {
        let q = query();
        let outcome = diff_rows(Some(&row(1, "t", 8, 10)), &row(1, "t", 2, 10), &q);
        assert!(outcome.updates.is_empty());
    }

    #[test]
    fn test_row_key_uses_statkey_column() {
        let q = query();
        assert_eq!(row_key(&row(42, "t", 0, 0), &q), "42");
    }

    #[test]
    fn test_row_key_falls_back_to_query_name_without_statkey() {
        let mut q = query();
        q.statkey = None;
        assert_eq!(row_key(&row(1, "t", 0, 0), &q), "q");
    }

    #[test]
    fn test_labels_include_backend_and_metadata_columns() {
        let q = query();
        let labels = labels_for(&row(1, "t", 0, 0), &q, "db1", &[("dc".to_string(), "us-east".to_string())]);
        assert!(labels.contains(&("backend".to_string(), "db1".to_string())));
        assert!(labels.contains(&("dc".to_string(), "us-east".to_string())));
        assert!(labels.contains(&("name".to_string(), "t".to_string())));
    }

    #[test]
    fn test_record_persists_rows_for_next_tick() {
        let mut state = backend_state();
        let q = query();
        state
            .last_rows
            .insert(q.name.clone(), HashMap::from([("1".to_string(), row(1, "t", 5, 10))]));
        // Without a live PgRow we exercise the bookkeeping path directly via
        // the same map state.record() would leave behind.
        assert_eq!(state.last_rows.get(&q.name).unwrap().len(), 1);
    }
}
