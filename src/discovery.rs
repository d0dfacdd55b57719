//! Discovery (§4.D): emits `added(key, backend)` / `removed(key)` events.
//! Two bundled providers — `StaticDiscovery` and `InventoryDiscovery` — both
//! implement the same [`Discovery`] trait so the engine never knows which
//! one is wired in.
//!
//! The trait-object-friendly async interface follows the teacher's own
//! `pgtrickle-relay` dependency on `async-trait`; the polling/diffing loop
//! for the inventory provider is grounded on `vector`'s interval-driven
//! collection loop in `postgresql_metrics.rs`, adapted from "re-collect
//! metrics" to "re-resolve fleet membership".

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendKey};
use crate::config::{Config, VmapiTags};
use crate::error::MusterError;

#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    Added(BackendKey, Backend),
    Removed(BackendKey),
}

#[async_trait]
pub trait Discovery: Send {
    /// Start emitting events on `tx`. Returns once the provider has nothing
    /// further to emit on its own (static discovery returns immediately
    /// after its one-time burst; inventory discovery runs until the
    /// `tx` receiver is dropped).
    async fn run(&mut self, tx: mpsc::Sender<DiscoveryEvent>) -> Result<(), MusterError>;
}

/// Build the active discovery provider per configuration. `vmapi` wins when
/// both are present (§6).
pub fn build(config: &Config) -> Result<Box<dyn Discovery>, MusterError> {
    if let Some(vmapi) = &config.vmapi {
        return Ok(Box::new(InventoryDiscovery::new(
            vmapi.url.clone(),
            vmapi.poll_interval_ms,
            vmapi.tags.clone(),
            config.backend_port,
            config.database.clone(),
        )));
    }
    if let Some(static_cfg) = &config.r#static {
        return Ok(Box::new(StaticDiscovery::new(
            static_cfg.dbs.clone(),
            config.backend_port,
            config.database.clone(),
        )));
    }
    Err(MusterError::ConfigError(
        "no discovery source configured".into(),
    ))
}

/// Emits `added` once per configured entry at startup; never emits
/// `removed`.
pub struct StaticDiscovery {
    entries: Vec<crate::config::StaticBackendEntry>,
    backend_port: u16,
    database: String,
}

impl StaticDiscovery {
    pub fn new(entries: Vec<crate::config::StaticBackendEntry>, backend_port: u16, database: String) -> Self {
        Self {
            entries,
            backend_port,
            database,
        }
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn run(&mut self, tx: mpsc::Sender<DiscoveryEvent>) -> Result<(), MusterError> {
        for entry in &self.entries {
            let backend = Backend {
                key: entry.name.clone(),
                display_name: entry.name.clone(),
                address: entry.ip.clone(),
                port: self.backend_port,
                target_database: self.database.clone(),
            };
            info!(backend = %entry.name, "static discovery: added");
            if tx
                .send(DiscoveryEvent::Added(entry.name.clone(), backend))
                .await
                .is_err()
            {
                break;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct VmapiInstance {
    uuid: String,
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    nics: Vec<VmapiNic>,
}

#[derive(Debug, Deserialize)]
struct VmapiNic {
    #[serde(default)]
    nic_tag: Option<String>,
    ip: String,
}

/// Polls an external fleet-inventory HTTP service and diffs successive
/// responses into `added`/`removed`. Selects instances whose tags match the
/// configured `{tag_name, tag_value, nic_tag}`.
pub struct InventoryDiscovery {
    url: String,
    poll_interval_ms: u64,
    tags: VmapiTags,
    backend_port: u16,
    database: String,
    http: reqwest::Client,
}

impl InventoryDiscovery {
    pub fn new(url: String, poll_interval_ms: u64, tags: VmapiTags, backend_port: u16, database: String) -> Self {
        Self {
            url,
            poll_interval_ms,
            tags,
            backend_port,
            database,
            http: reqwest::Client::new(),
        }
    }

    async fn fetch(&self) -> Result<Vec<VmapiInstance>, MusterError> {
        let url = format!(
            "{}?tag.{}={}",
            self.url, self.tags.vm_tag_name, self.tags.vm_tag_value
        );
        self.http
            .get(&url)
            .send()
            .await
            .map_err(|e| MusterError::InternalError(format!("vmapi request failed: {e}")))?
            .json()
            .await
            .map_err(|e| MusterError::InternalError(format!("vmapi response decode failed: {e}")))
    }

    fn resolve_backend(&self, instance: &VmapiInstance) -> Option<Backend> {
        let nic = instance
            .nics
            .iter()
            .find(|n| n.nic_tag.as_deref() == Some(self.tags.nic_tag.as_str()))?;
        Some(Backend {
            key: instance.uuid.clone(),
            display_name: instance.hostname.clone().unwrap_or_else(|| instance.uuid.clone()),
            address: nic.ip.clone(),
            port: self.backend_port,
            target_database: self.database.clone(),
        })
    }
}

#[async_trait]
impl Discovery for InventoryDiscovery {
    async fn run(&mut self, tx: mpsc::Sender<DiscoveryEvent>) -> Result<(), MusterError> {
        let mut known: HashMap<BackendKey, Backend> = HashMap::new();
        let mut interval = tokio::time::interval(Duration::from_millis(self.poll_interval_ms));

        loop {
            interval.tick().await;

            let instances = match self.fetch().await {
                Ok(instances) => instances,
                Err(e) => {
                    warn!(error = %e, "vmapi poll failed, keeping prior membership");
                    continue;
                }
            };

            let resolved: HashMap<BackendKey, Backend> = instances
                .iter()
                .filter_map(|i| self.resolve_backend(i))
                .map(|b| (b.key.clone(), b))
                .collect();

            let known_keys: HashSet<&BackendKey> = known.keys().collect();
            let resolved_keys: HashSet<&BackendKey> = resolved.keys().collect();

            for key in resolved_keys.difference(&known_keys) {
                let backend = resolved[*key].clone();
                debug!(backend = %backend.display_name, "vmapi discovery: added");
                if tx.send(DiscoveryEvent::Added((*key).clone(), backend)).await.is_err() {
                    return Ok(());
                }
            }
            for key in known_keys.difference(&resolved_keys) {
                debug!(backend = %key, "vmapi discovery: removed");
                if tx.send(DiscoveryEvent::Removed((*key).clone())).await.is_err() {
                    return Ok(());
                }
            }

            known = resolved;
        }
    }
}
