//! Integration tests for the Backend Bootstrapper (§4.E) against a real
//! PostgreSQL instance.

mod common;

use common::TestBackend;
use pg_muster::backend::{Backend, BackendState};
use pg_muster::config::{BootstrapConfig, Config, ConnectionsConfig, StaticBackendEntry, StaticDiscoveryConfig, TargetConfig};

fn config_for(db: &TestBackend) -> Config {
    Config {
        interval: 60_000,
        connections: ConnectionsConfig {
            query_timeout_ms: 5_000,
            connect_timeout_ms: 5_000,
            connect_retries: 3,
            max_connections: 1,
        },
        backend_port: db.port,
        user: "pg_muster_monitor".into(),
        password: "monitor-secret".into(),
        database: "postgres".into(),
        schemas: vec!["public".into()],
        bootstrap: BootstrapConfig {
            superuser: "postgres".into(),
            superuser_password: "postgres".into(),
        },
        r#static: Some(StaticDiscoveryConfig {
            dbs: vec![StaticBackendEntry { name: "db1".into(), ip: db.host.clone() }],
        }),
        vmapi: None,
        target: TargetConfig {
            ip: "0.0.0.0".into(),
            port: 0,
            route: "/metrics".into(),
            metadata: Default::default(),
        },
    }
}

fn backend_state(db: &TestBackend) -> BackendState {
    BackendState::new(Backend {
        key: "db1".into(),
        display_name: "db1".into(),
        address: db.host.clone(),
        port: db.port,
        target_database: "postgres".into(),
    })
}

#[tokio::test]
async fn bootstrap_creates_monitoring_role() {
    let db = TestBackend::start().await;
    let config = config_for(&db);
    let mut state = backend_state(&db);

    pg_muster::bootstrap::bootstrap(&config, &mut state).await.unwrap();

    let row = db
        .query_one("SELECT EXISTS(SELECT 1 FROM pg_roles WHERE rolname = 'pg_muster_monitor')")
        .await;
    let exists: bool = row.get(0);
    assert!(exists, "bootstrap must create the monitoring role");
}

#[tokio::test]
async fn bootstrap_installs_helper_views() {
    let db = TestBackend::start().await;
    let config = config_for(&db);
    let mut state = backend_state(&db);

    pg_muster::bootstrap::bootstrap(&config, &mut state).await.unwrap();

    let row = db
        .query_one(
            "SELECT EXISTS(SELECT 1 FROM pg_proc WHERE proname = 'get_stat_activity') \
             AND EXISTS(SELECT 1 FROM pg_proc WHERE proname = 'get_stat_replication')",
        )
        .await;
    let exists: bool = row.get(0);
    assert!(exists, "bootstrap must install the SECURITY DEFINER helper views");
}

#[tokio::test]
async fn bootstrap_is_idempotent() {
    let db = TestBackend::start().await;
    let config = config_for(&db);
    let mut state = backend_state(&db);

    pg_muster::bootstrap::bootstrap(&config, &mut state).await.unwrap();
    // "already exists" must be treated as success, not an error (§4.E step 4).
    pg_muster::bootstrap::bootstrap(&config, &mut state).await.unwrap();
}

#[tokio::test]
async fn bootstrap_clears_needs_setup_and_resolves_applicable_queries() {
    let db = TestBackend::start().await;
    let config = config_for(&db);
    let mut state = backend_state(&db);

    pg_muster::bootstrap::bootstrap(&config, &mut state).await.unwrap();

    assert!(!state.needs_setup);
    assert!(!state.setting_up);
    assert!(state.server_version.unwrap() > 0);
    assert!(!state.queries.is_empty());
}
