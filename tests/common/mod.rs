//! Shared test helpers for integration tests that exercise pg-muster against
//! a real PostgreSQL instance via Testcontainers.

#![allow(dead_code)]

use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio_postgres::{Client, NoTls, Row};

/// A disposable PostgreSQL 16 instance with a superuser client connected to
/// it. The container is torn down when `TestBackend` is dropped.
pub struct TestBackend {
    pub client: Client,
    pub host: String,
    pub port: u16,
    _container: ContainerAsync<Postgres>,
}

impl TestBackend {
    /// Start a fresh container and connect as the default `postgres`
    /// superuser.
    pub async fn start() -> Self {
        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .expect("failed to start postgres container");

        let port = container
            .get_host_port_ipv4(5432)
            .await
            .expect("failed to map postgres port");
        let host = "127.0.0.1".to_string();

        let (client, connection) = tokio_postgres::Config::new()
            .host(&host)
            .port(port)
            .user("postgres")
            .password("postgres")
            .dbname("postgres")
            .connect(NoTls)
            .await
            .expect("failed to connect to test postgres container");

        tokio::spawn(async move {
            let _ = connection.await;
        });

        Self {
            client,
            host,
            port,
            _container: container,
        }
    }

    pub async fn execute(&self, sql: &str) {
        self.client
            .batch_execute(sql)
            .await
            .unwrap_or_else(|e| panic!("SQL execution failed: {e}\nSQL: {sql}"));
    }

    pub async fn query(&self, sql: &str) -> Vec<Row> {
        self.client
            .query(sql, &[])
            .await
            .unwrap_or_else(|e| panic!("query failed: {e}\nSQL: {sql}"))
    }

    pub async fn query_one(&self, sql: &str) -> Row {
        self.client
            .query_one(sql, &[])
            .await
            .unwrap_or_else(|e| panic!("query_one failed: {e}\nSQL: {sql}"))
    }

    /// Open a second, independent connection to the same database — used by
    /// scenarios that need a client distinct from the monitoring connection
    /// (e.g. S2's extra idle connection).
    pub async fn second_connection(&self) -> Client {
        let (client, connection) = tokio_postgres::Config::new()
            .host(&self.host)
            .port(self.port)
            .user("postgres")
            .password("postgres")
            .dbname("postgres")
            .connect(NoTls)
            .await
            .expect("failed to open second connection");
        tokio::spawn(async move {
            let _ = connection.await;
        });
        client
    }
}
