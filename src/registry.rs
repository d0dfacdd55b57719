//! Metric Registry (§4.G): wraps a `prometheus::Registry`, lazily creating
//! one `*Vec` per distinct `(name, label-name-set)` and supporting the
//! expiring-gauge behaviour the `prometheus` crate doesn't provide natively.
//!
//! Grounded on `BatiGencho-renewabl-test`'s `telemetry`/`ServerMetrics`
//! pair: a `Registry` plus dynamically registered `*Vec` metrics, encoded
//! through `prometheus::TextEncoder`.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use prometheus::{Encoder, GaugeVec, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use tracing::warn;

use crate::error::MusterError;

struct CounterHandle {
    vec: IntCounterVec,
    label_names: Vec<String>,
}

struct GaugeHandle {
    vec: GaugeVec,
    label_names: Vec<String>,
    /// `label values -> (last_set, expiry_period_ms)` for series registered
    /// with an expiry. Swept by [`MetricRegistry::sweep_expired`].
    expiring: HashMap<Vec<String>, (Instant, u64)>,
}

struct HistogramHandle {
    vec: HistogramVec,
    label_names: Vec<String>,
}

/// The process-wide metric store. Cheap to clone (everything inside is
/// reference-counted by `prometheus` or behind a lock); one instance is
/// shared between the collection engine's worker tasks and the exposer.
#[derive(Clone)]
pub struct MetricRegistry {
    inner: std::sync::Arc<Inner>,
}

struct Inner {
    registry: Registry,
    counters: RwLock<HashMap<String, CounterHandle>>,
    gauges: RwLock<HashMap<String, GaugeHandle>>,
    histograms: RwLock<HashMap<String, HistogramHandle>>,
    fixed_labels: Vec<(String, String)>,
}

impl MetricRegistry {
    pub fn new(fixed_labels: Vec<(String, String)>) -> Self {
        Self {
            inner: std::sync::Arc::new(Inner {
                registry: Registry::new(),
                counters: RwLock::new(HashMap::new()),
                gauges: RwLock::new(HashMap::new()),
                histograms: RwLock::new(HashMap::new()),
                fixed_labels,
            }),
        }
    }

    fn ordered_label_names(&self, label_pairs: &[(String, String)]) -> Vec<String> {
        let mut names: Vec<String> = self.inner.fixed_labels.iter().map(|(k, _)| k.clone()).collect();
        names.extend(label_pairs.iter().map(|(k, _)| k.clone()));
        names
    }

    fn ordered_label_values<'a>(&self, label_names: &[String], label_pairs: &'a [(String, String)]) -> Vec<&'a str> {
        let lookup: HashMap<&str, &str> = self
            .inner
            .fixed_labels
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .chain(label_pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .collect();
        label_names.iter().map(|name| lookup.get(name.as_str()).copied().unwrap_or("")).collect()
    }

    /// `counter(name, help).add(value, labels)`: registers the series on
    /// first use for this `(name, label-name-set)`, then adds a
    /// strictly-non-negative delta.
    pub fn counter_add(&self, name: &str, help: &str, labels: &[(String, String)], value: f64) -> Result<(), MusterError> {
        if value < 0.0 {
            return Err(MusterError::InternalError(format!(
                "counter {name} received negative delta {value}"
            )));
        }
        let label_names = self.ordered_label_names(labels);
        let mut counters = self.inner.counters.write().unwrap();
        let handle = match counters.get(name) {
            Some(h) => h,
            None => {
                let label_refs: Vec<&str> = label_names.iter().map(String::as_str).collect();
                let vec = IntCounterVec::new(Opts::new(name, help), &label_refs)
                    .map_err(|e| MusterError::InternalError(format!("registering counter {name}: {e}")))?;
                self.inner
                    .registry
                    .register(Box::new(vec.clone()))
                    .map_err(|e| MusterError::InternalError(format!("registering counter {name}: {e}")))?;
                counters.insert(name.to_string(), CounterHandle { vec, label_names: label_names.clone() });
                counters.get(name).unwrap()
            }
        };
        let values = self.ordered_label_values(&handle.label_names, labels);
        handle.vec.with_label_values(&values).inc_by(value as u64);
        Ok(())
    }

    /// `gauge(name, help, expires?, expiry_period_ms?).set(value, labels)`.
    pub fn gauge_set(
        &self,
        name: &str,
        help: &str,
        labels: &[(String, String)],
        value: f64,
        expiry_period_ms: Option<u64>,
    ) -> Result<(), MusterError> {
        let label_names = self.ordered_label_names(labels);
        let mut gauges = self.inner.gauges.write().unwrap();
        if !gauges.contains_key(name) {
            let label_refs: Vec<&str> = label_names.iter().map(String::as_str).collect();
            let vec = GaugeVec::new(Opts::new(name, help), &label_refs)
                .map_err(|e| MusterError::InternalError(format!("registering gauge {name}: {e}")))?;
            self.inner
                .registry
                .register(Box::new(vec.clone()))
                .map_err(|e| MusterError::InternalError(format!("registering gauge {name}: {e}")))?;
            gauges.insert(
                name.to_string(),
                GaugeHandle { vec, label_names: label_names.clone(), expiring: HashMap::new() },
            );
        }
        let handle = gauges.get_mut(name).unwrap();
        let values = self.ordered_label_values(&handle.label_names, labels);
        handle.vec.with_label_values(&values).set(value);
        if let Some(period_ms) = expiry_period_ms {
            let owned: Vec<String> = values.iter().map(|s| s.to_string()).collect();
            handle.expiring.insert(owned, (Instant::now(), period_ms));
        }
        Ok(())
    }

    /// `histogram(name, help).observe(value, labels)`, using Prometheus's
    /// standard default bucket layout (§4.G).
    pub fn histogram_observe(&self, name: &str, help: &str, labels: &[(String, String)], value_ms: f64) -> Result<(), MusterError> {
        let label_names = self.ordered_label_names(labels);
        let mut histograms = self.inner.histograms.write().unwrap();
        let handle = match histograms.get(name) {
            Some(h) => h,
            None => {
                let label_refs: Vec<&str> = label_names.iter().map(String::as_str).collect();
                let vec = HistogramVec::new(prometheus::HistogramOpts::new(name, help), &label_refs)
                    .map_err(|e| MusterError::InternalError(format!("registering histogram {name}: {e}")))?;
                self.inner
                    .registry
                    .register(Box::new(vec.clone()))
                    .map_err(|e| MusterError::InternalError(format!("registering histogram {name}: {e}")))?;
                histograms.insert(name.to_string(), HistogramHandle { vec, label_names: label_names.clone() });
                histograms.get(name).unwrap()
            }
        };
        let values = self.ordered_label_values(&handle.label_names, labels);
        handle.vec.with_label_values(&values).observe(value_ms);
        Ok(())
    }

    /// Evict any expiring gauge series that hasn't been `set` within its
    /// `expiry_period_ms`. Driven by the same tick clock as collection.
    pub fn sweep_expired(&self) {
        let mut gauges = self.inner.gauges.write().unwrap();
        for handle in gauges.values_mut() {
            let now = Instant::now();
            let stale: Vec<Vec<String>> = handle
                .expiring
                .iter()
                .filter(|(_, (last_set, period_ms))| now.duration_since(*last_set) > Duration::from_millis(*period_ms))
                .map(|(values, _)| values.clone())
                .collect();
            for values in stale {
                let refs: Vec<&str> = values.iter().map(String::as_str).collect();
                if handle.vec.remove_label_values(&refs).is_err() {
                    warn!(series = ?values, "tried to expire a gauge series that was already gone");
                }
                handle.expiring.remove(&values);
            }
        }
    }

    /// Render the Prometheus text exposition format (§4.G `collect`).
    pub fn render(&self) -> Result<String, MusterError> {
        let encoder = TextEncoder::new();
        let families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|e| MusterError::InternalError(format!("encoding metrics: {e}")))?;
        String::from_utf8(buffer).map_err(|e| MusterError::InternalError(format!("metrics not utf8: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_add_rejects_negative_delta() {
        let registry = MetricRegistry::new(vec![]);
        let result = registry.counter_add("pg_query_count", "help", &[("backend".into(), "db1".into())], -1.0);
        assert!(result.is_err());
    }

    #[test]
    fn test_counter_accumulates_across_calls() {
        let registry = MetricRegistry::new(vec![]);
        let labels = [("backend".to_string(), "db1".to_string())];
        registry.counter_add("c", "help", &labels, 3.0).unwrap();
        registry.counter_add("c", "help", &labels, 2.0).unwrap();
        let rendered = registry.render().unwrap();
        assert!(rendered.contains("c{backend=\"db1\"} 5"));
    }

    #[test]
    fn test_gauge_set_then_render_contains_value() {
        let registry = MetricRegistry::new(vec![]);
        let labels = [("backend".to_string(), "db1".to_string())];
        registry.gauge_set("g", "help", &labels, 42.0, None).unwrap();
        let rendered = registry.render().unwrap();
        assert!(rendered.contains("g{backend=\"db1\"} 42"));
    }

    #[test]
    fn test_expiring_gauge_is_swept_after_period() {
        let registry = MetricRegistry::new(vec![]);
        let labels = [("backend".to_string(), "db1".to_string())];
        registry.gauge_set("g_exp", "help", &labels, 1.0, Some(0)).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        registry.sweep_expired();
        let rendered = registry.render().unwrap();
        assert!(!rendered.contains("g_exp{"));
    }

    #[test]
    fn test_fixed_labels_applied_to_every_series() {
        let registry = MetricRegistry::new(vec![("dc".to_string(), "us-east".to_string())]);
        registry.gauge_set("g", "help", &[], 1.0, None).unwrap();
        let rendered = registry.render().unwrap();
        assert!(rendered.contains("dc=\"us-east\""));
    }

    #[test]
    fn test_histogram_observe_renders_buckets() {
        let registry = MetricRegistry::new(vec![]);
        registry.histogram_observe("h", "help", &[], 12.5).unwrap();
        let rendered = registry.render().unwrap();
        assert!(rendered.contains("h_bucket"));
    }
}
