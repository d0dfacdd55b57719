//! Backend Client (§4.B): a single-connection wrapper over `tokio_postgres`
//! exposing connect / query-with-timeout / destroy.
//!
//! Grounded on the connection-handling idiom in `vector`'s
//! `postgresql_metrics` source: build a `tokio_postgres::Config`, spawn the
//! connection future on the runtime, and treat any I/O error on that future
//! as reason to drop the client and let the caller reconnect.

use std::time::Duration;

use futures_util::StreamExt;
use tokio_postgres::{Client, NoTls, Row};
use tracing::warn;

use crate::error::MusterError;

/// Connection parameters for one backend (§3 `Backend` + process-wide
/// monitoring credentials).
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub connect_timeout_ms: u64,
}

impl ConnectParams {
    fn config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .dbname(&self.database)
            .user(&self.user)
            .password(&self.password)
            .connect_timeout(Duration::from_millis(self.connect_timeout_ms));
        config
    }
}

/// A single live connection to one backend. Not `Clone`: ownership moves
/// through the pool's claim/release cycle (§4.C).
pub struct BackendClient {
    client: Client,
    destroyed: bool,
}

impl BackendClient {
    /// Establish a TCP + startup handshake connection. The connection
    /// background task is spawned onto the current runtime; if it errors,
    /// subsequent queries on `client` will fail and the caller should treat
    /// the client as destroyed.
    pub async fn connect(params: &ConnectParams) -> Result<Self, MusterError> {
        let (client, connection) = params
            .config()
            .connect(NoTls)
            .await
            .map_err(|e| MusterError::ConnectError(format!("{}:{}: {e}", params.host, params.port)))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "postgres connection task ended with error");
            }
        });

        Ok(Self {
            client,
            destroyed: false,
        })
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Mark this client unusable. The pool will not release it; a fresh
    /// connection will be built on the next claim.
    pub fn destroy(&mut self) {
        self.destroyed = true;
    }

    /// Issue `sql` and stream back all rows, bounded by `query_timeout_ms`.
    /// Whitespace in `sql` is already normalized by the catalog layer before
    /// it reaches here (§4.B: "so that tracing can match equal queries
    /// across backends").
    pub async fn query(&self, sql: &str, query_timeout_ms: u64) -> Result<Vec<Row>, MusterError> {
        if self.destroyed {
            return Err(MusterError::InternalError(
                "query issued against a destroyed client".into(),
            ));
        }

        let fut = async {
            let stream = self
                .client
                .query_raw::<_, &str, _>(sql, std::iter::empty())
                .await
                .map_err(|source| MusterError::QueryError {
                    query: sql.to_string(),
                    source,
                })?;
            tokio::pin!(stream);
            let mut rows = Vec::new();
            while let Some(row) = stream.next().await {
                rows.push(row.map_err(|source| MusterError::QueryError {
                    query: sql.to_string(),
                    source,
                })?);
            }
            Ok(rows)
        };

        match tokio::time::timeout(Duration::from_millis(query_timeout_ms), fut).await {
            Ok(result) => result,
            Err(_) => Err(MusterError::QueryTimeout {
                query: sql.to_string(),
                timeout_ms: query_timeout_ms,
            }),
        }
    }

    /// Typed extraction of a named column, wrapping the panic-prone
    /// `Row::get` so a missing/mistyped column becomes a catalog bug report
    /// rather than a process abort.
    pub fn row_get_value<'a, T>(row: &'a Row, column: &str) -> Result<Option<T>, MusterError>
    where
        T: tokio_postgres::types::FromSql<'a>,
    {
        let idx = row
            .columns()
            .iter()
            .position(|c| c.name() == column)
            .ok_or_else(|| MusterError::InternalError(format!("column {column} not present in row")))?;
        row.try_get::<_, Option<T>>(idx)
            .map_err(|e| MusterError::InternalError(format!("column {column}: {e}")))
    }
}
