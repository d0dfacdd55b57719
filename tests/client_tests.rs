//! Deterministic Backend Client / Connection Pool tests (§4.B, §4.C) against
//! a real PostgreSQL instance, including the query-timeout scenario (S4).

mod common;

use common::TestBackend;
use pg_muster::client::{BackendClient, ConnectParams};
use pg_muster::error::MusterError;
use pg_muster::pool::Pool;

fn params(db: &TestBackend) -> ConnectParams {
    ConnectParams {
        host: db.host.clone(),
        port: db.port,
        database: "postgres".into(),
        user: "postgres".into(),
        password: "postgres".into(),
        connect_timeout_ms: 5_000,
    }
}

#[tokio::test]
async fn s4_slow_query_returns_query_timeout() {
    let db = TestBackend::start().await;
    let client = BackendClient::connect(&params(&db)).await.unwrap();

    let result = client.query("SELECT pg_sleep(1)", 50).await;

    assert!(matches!(result, Err(MusterError::QueryTimeout { timeout_ms: 50, .. })));
}

#[tokio::test]
async fn query_within_deadline_succeeds() {
    let db = TestBackend::start().await;
    let client = BackendClient::connect(&params(&db)).await.unwrap();

    let rows = client.query("SELECT 1 AS one", 2_000).await.unwrap();

    assert_eq!(rows.len(), 1);
    let value: i32 = rows[0].get("one");
    assert_eq!(value, 1);
}

#[tokio::test]
async fn destroyed_client_rejects_further_queries() {
    let db = TestBackend::start().await;
    let mut client = BackendClient::connect(&params(&db)).await.unwrap();
    client.destroy();

    let result = client.query("SELECT 1", 1_000).await;

    assert!(result.is_err());
}

#[tokio::test]
async fn pool_claim_then_close_forces_reconnect_on_next_claim() {
    let db = TestBackend::start().await;
    let mut pool = Pool::new(params(&db), 3, 5_000);

    let first_pid: i32 = {
        let client = pool.claim().await.unwrap();
        let rows = client.query("SELECT pg_backend_pid() AS pid", 1_000).await.unwrap();
        rows[0].get("pid")
    };
    pool.close();
    assert!(pool.is_broken());

    // A subsequent claim must build a fresh connection rather than reuse
    // the destroyed one.
    let second_pid: i32 = {
        let client = pool.claim().await.unwrap();
        let rows = client.query("SELECT pg_backend_pid() AS pid", 1_000).await.unwrap();
        rows[0].get("pid")
    };
    assert_ne!(first_pid, second_pid, "close must force a fresh connection on the next claim");
}

#[tokio::test]
async fn pool_release_then_claim_reuses_the_same_connection() {
    let db = TestBackend::start().await;
    let mut pool = Pool::new(params(&db), 3, 5_000);

    let first_pid: i32 = {
        let client = pool.claim().await.unwrap();
        let rows = client.query("SELECT pg_backend_pid() AS pid", 1_000).await.unwrap();
        rows[0].get("pid")
    };
    pool.release();
    assert!(!pool.is_broken());

    let second_pid: i32 = {
        let client = pool.claim().await.unwrap();
        let rows = client.query("SELECT pg_backend_pid() AS pid", 1_000).await.unwrap();
        rows[0].get("pid")
    };

    assert_eq!(first_pid, second_pid, "release then claim should reuse the same backend connection");
}
