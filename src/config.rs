//! Process configuration, loaded from a single JSON document at startup.
//!
//! The schema mirrors the external configuration contract: a flat `interval`,
//! a `connections` block, discovery via either `static` or `vmapi` (mutually
//! exclusive in intent — `vmapi` wins when both are present), and a `target`
//! block describing the HTTP exposer.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::MusterError;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Tick period, milliseconds.
    pub interval: u64,

    #[serde(default)]
    pub connections: ConnectionsConfig,

    /// Postgres port used for discovered backends.
    pub backend_port: u16,

    /// Monitoring role created and reused on every backend.
    pub user: String,

    /// Password for the monitoring role (and the superuser bootstrap
    /// connection, which uses a distinct superuser/password pair supplied
    /// separately in `bootstrap`).
    pub password: String,

    /// Default target database.
    pub database: String,

    /// Schema allow-list applied to `pg_relation_size` (§6). Defaults to
    /// `["public"]` when omitted.
    #[serde(default = "default_schemas")]
    pub schemas: Vec<String>,

    pub bootstrap: BootstrapConfig,

    #[serde(default)]
    pub r#static: Option<StaticDiscoveryConfig>,

    #[serde(default)]
    pub vmapi: Option<VmapiDiscoveryConfig>,

    pub target: TargetConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionsConfig {
    #[serde(rename = "query_timeout")]
    pub query_timeout_ms: u64,
    #[serde(rename = "connect_timeout")]
    pub connect_timeout_ms: u64,
    pub connect_retries: u32,
    /// Pool max. The core pool is single-connection; any value other than 1
    /// is rejected by [`Config::validate`].
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    1
}

fn default_schemas() -> Vec<String> {
    vec!["public".to_string()]
}

impl Default for ConnectionsConfig {
    fn default() -> Self {
        Self {
            query_timeout_ms: 5_000,
            connect_timeout_ms: 5_000,
            connect_retries: 3,
            max_connections: 1,
        }
    }
}

/// Superuser credentials used only for the one-shot bootstrap connection
/// (§4.E): distinct from the long-lived monitoring role.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BootstrapConfig {
    pub superuser: String,
    pub superuser_password: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StaticDiscoveryConfig {
    pub dbs: Vec<StaticBackendEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StaticBackendEntry {
    pub name: String,
    pub ip: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VmapiDiscoveryConfig {
    pub url: String,
    #[serde(rename = "pollInterval")]
    pub poll_interval_ms: u64,
    pub tags: VmapiTags,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VmapiTags {
    pub vm_tag_name: String,
    pub vm_tag_value: String,
    pub nic_tag: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetConfig {
    pub ip: String,
    pub port: u16,
    #[serde(default = "default_route")]
    pub route: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

fn default_route() -> String {
    "/metrics".to_string()
}

impl Config {
    /// Load and validate configuration from a JSON file on disk.
    pub fn load(path: &Path) -> Result<Self, MusterError> {
        let raw = fs::read_to_string(path)
            .map_err(|e| MusterError::ConfigError(format!("reading {}: {e}", path.display())))?;
        let config: Config = serde_json::from_str(&raw)
            .map_err(|e| MusterError::ConfigError(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate invariants that `serde` alone cannot express.
    pub fn validate(&self) -> Result<(), MusterError> {
        if self.interval == 0 {
            return Err(MusterError::ConfigError("interval must be > 0".into()));
        }
        if self.connections.max_connections != 1 {
            return Err(MusterError::ConfigError(format!(
                "connections.max_connections must be 1 (single-connection pool invariant), got {}",
                self.connections.max_connections
            )));
        }
        if self.r#static.is_none() && self.vmapi.is_none() {
            return Err(MusterError::ConfigError(
                "at least one of `static` or `vmapi` discovery must be configured".into(),
            ));
        }
        if self.target.route.is_empty() || !self.target.route.starts_with('/') {
            return Err(MusterError::ConfigError(format!(
                "target.route must start with '/', got {:?}",
                self.target.route
            )));
        }
        let addr = format!("{}:{}", self.target.ip, self.target.port);
        if addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(MusterError::ConfigError(format!("target.ip/target.port do not form a valid socket address: {addr:?}")));
        }
        Ok(())
    }

    /// The expiry window applied to transient gauges: `interval + 30s`.
    pub fn default_expiry_period_ms(&self) -> u64 {
        self.interval + 30_000
    }

    /// `vmapi` wins when both discovery sources are configured (§6).
    pub fn discovery_is_vmapi(&self) -> bool {
        self.vmapi.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            interval: 10_000,
            connections: ConnectionsConfig::default(),
            backend_port: 5432,
            user: "pg_muster_monitor".into(),
            password: "secret".into(),
            database: "postgres".into(),
            schemas: default_schemas(),
            bootstrap: BootstrapConfig {
                superuser: "postgres".into(),
                superuser_password: "postgres".into(),
            },
            r#static: Some(StaticDiscoveryConfig {
                dbs: vec![StaticBackendEntry {
                    name: "db1".into(),
                    ip: "10.0.0.1".into(),
                }],
            }),
            vmapi: None,
            target: TargetConfig {
                ip: "0.0.0.0".into(),
                port: 9187,
                route: "/metrics".into(),
                metadata: BTreeMap::new(),
            },
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut c = base_config();
        c.interval = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_max_connections_other_than_one_rejected() {
        let mut c = base_config();
        c.connections.max_connections = 4;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_no_discovery_source_rejected() {
        let mut c = base_config();
        c.r#static = None;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_route_must_be_absolute() {
        let mut c = base_config();
        c.target.route = "metrics".into();
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_target_address_must_be_parseable() {
        let mut c = base_config();
        c.target.ip = "not-an-ip".into();
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_vmapi_wins_when_both_present() {
        let mut c = base_config();
        c.vmapi = Some(VmapiDiscoveryConfig {
            url: "http://vmapi.local".into(),
            poll_interval_ms: 30_000,
            tags: VmapiTags {
                vm_tag_name: "role".into(),
                vm_tag_value: "postgres".into(),
                nic_tag: "admin".into(),
            },
        });
        assert!(c.discovery_is_vmapi());
    }

    #[test]
    fn test_default_expiry_period_adds_30s() {
        let c = base_config();
        assert_eq!(c.default_expiry_period_ms(), 10_000 + 30_000);
    }

    #[test]
    fn test_load_rejects_malformed_json() {
        let dir = std::env::temp_dir().join("pg_muster_config_test_malformed.json");
        fs::write(&dir, "{ not json").unwrap();
        let result = Config::load(&dir);
        assert!(result.is_err());
        let _ = fs::remove_file(&dir);
    }
}
