//! Backend Bootstrapper (§4.E): on first contact with a backend (as
//! superuser), detect standby, create the restricted monitoring role,
//! install the `SECURITY DEFINER` helper views/functions the catalog's
//! queries depend on, and compute the applicable query set.
//!
//! The DDL strings are part of the external contract (§6): their exact
//! wire-level text is carried verbatim because query SQL in the catalog
//! references the names they define (`get_stat_activity()`).

use std::time::Duration;

use tokio_postgres::NoTls;
use tracing::{info, warn};

use crate::backend::BackendState;
use crate::catalog::get_applicable_queries;
use crate::config::Config;
use crate::error::MusterError;

const CREATE_MONITORING_ROLE: &str = "
    DO $$
    BEGIN
        IF NOT EXISTS (SELECT FROM pg_roles WHERE rolname = '$role$') THEN
            CREATE ROLE $role$ WITH NOSUPERUSER NOCREATEDB NOCREATEROLE NOINHERIT
                NOREPLICATION CONNECTION LIMIT 2 LOGIN PASSWORD $pass$;
        END IF;
    END
    $$;";

const GRANT_PG_MONITOR: &str = "GRANT pg_monitor TO $role$;";

const CREATE_GET_STAT_ACTIVITY: &str = "
    CREATE OR REPLACE FUNCTION public.get_stat_activity()
    RETURNS SETOF pg_stat_activity AS
    'SELECT * FROM pg_catalog.pg_stat_activity;'
    LANGUAGE SQL VOLATILE SECURITY DEFINER;";

const CREATE_GET_STAT_REPLICATION: &str = "
    CREATE OR REPLACE FUNCTION public.get_stat_replication()
    RETURNS SETOF pg_stat_replication AS
    'SELECT * FROM pg_catalog.pg_stat_replication;'
    LANGUAGE SQL VOLATILE SECURITY DEFINER;";

const CREATE_GET_STAT_PROGRESS_VACUUM: &str = "
    CREATE OR REPLACE FUNCTION public.get_stat_progress_vacuum()
    RETURNS SETOF pg_stat_progress_vacuum AS
    'SELECT * FROM pg_catalog.pg_stat_progress_vacuum;'
    LANGUAGE SQL VOLATILE SECURITY DEFINER;";

/// Run the bootstrap sequence of §4.E against `state`. On success, clears
/// `needs_setup` and populates `server_version`/`queries`/`is_standby`. On
/// failure, leaves `needs_setup` set so the engine retries on the next tick.
pub async fn bootstrap(config: &Config, state: &mut BackendState) -> Result<(), MusterError> {
    if state.setting_up {
        return Ok(());
    }
    state.setting_up = true;
    let result = run(config, state).await;
    state.setting_up = false;
    result
}

async fn run(config: &Config, state: &mut BackendState) -> Result<(), MusterError> {
    let mut pg_config = tokio_postgres::Config::new();
    pg_config
        .host(&state.backend.address)
        .port(state.backend.port)
        .dbname(&state.backend.target_database)
        .user(&config.bootstrap.superuser)
        .password(&config.bootstrap.superuser_password)
        .connect_timeout(Duration::from_millis(config.connections.connect_timeout_ms));

    let (client, connection) = pg_config
        .connect(NoTls)
        .await
        .map_err(|source| MusterError::BootstrapFailed {
            backend: state.backend.display_name.clone(),
            source,
        })?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!(error = %e, "bootstrap connection task ended with error");
        }
    });

    let query_timeout = Duration::from_millis(config.connections.query_timeout_ms);

    let in_recovery: bool = tokio::time::timeout(query_timeout, client.query_one("SELECT pg_is_in_recovery()", &[]))
        .await
        .map_err(|_| MusterError::ConfigError("bootstrap query timed out checking pg_is_in_recovery".into()))?
        .map_err(|source| MusterError::BootstrapFailed {
            backend: state.backend.display_name.clone(),
            source,
        })?
        .get(0);

    if in_recovery {
        info!(backend = %state.backend.display_name, "bootstrap: backend is a standby, skipping collection");
        state.is_standby = true;
        state.needs_setup = false;
        return Err(MusterError::PostgresInRecovery(state.backend.display_name.clone()));
    }

    let version_row = client
        .query_one("SHOW server_version_num", &[])
        .await
        .map_err(|source| MusterError::BootstrapFailed {
            backend: state.backend.display_name.clone(),
            source,
        })?;
    let version_str: String = version_row.get(0);
    let server_version: i32 = version_str
        .parse()
        .map_err(|_| MusterError::InternalError(format!("unparsable server_version_num: {version_str}")))?;

    let role_ddl = CREATE_MONITORING_ROLE
        .replace("$role$", &config.user)
        .replace("$pass$", &format!("'{}'", config.password.replace('\'', "''")));
    execute_tolerant(&client, &role_ddl, state, "create monitoring role").await?;

    if server_version >= 100000 {
        let grant_ddl = GRANT_PG_MONITOR.replace("$role$", &config.user);
        if let Err(e) = client.batch_execute(&grant_ddl).await {
            warn!(backend = %state.backend.display_name, error = %e, "failed granting pg_monitor to monitoring role");
        }
    }

    execute_tolerant(&client, CREATE_GET_STAT_ACTIVITY, state, "install get_stat_activity").await?;
    execute_tolerant(&client, CREATE_GET_STAT_REPLICATION, state, "install get_stat_replication").await?;

    if server_version >= 90600 {
        if let Err(e) = client.batch_execute(CREATE_GET_STAT_PROGRESS_VACUUM).await {
            warn!(backend = %state.backend.display_name, error = %e, "skipping progress_vacuum wrapper: missing catalog item");
        }
    }

    state.server_version = Some(server_version);
    state.queries = get_applicable_queries(server_version, config.interval)?;
    if let Some(q) = state.queries.iter_mut().find(|q| q.name == "pg_relation_size") {
        q.sql = q.sql.replace("$1", &schema_array_literal(&config.schemas));
    }
    state.needs_setup = false;

    info!(
        backend = %state.backend.display_name,
        server_version,
        query_count = state.queries.len(),
        "bootstrap complete"
    );

    Ok(())
}

/// Render the configured schema allow-list as a literal `name[]` array,
/// substituted into `pg_relation_size`'s `$1` placeholder (§6: "configuration
/// may enumerate a schema allow-list"). Values come from operator
/// configuration, not request input, so literal substitution follows the
/// same tolerance as the role DDL above.
fn schema_array_literal(schemas: &[String]) -> String {
    let quoted: Vec<String> = schemas
        .iter()
        .map(|s| format!("'{}'", s.replace('\'', "''")))
        .collect();
    format!("ARRAY[{}]::name[]", quoted.join(", "))
}

async fn execute_tolerant(
    client: &tokio_postgres::Client,
    ddl: &str,
    state: &BackendState,
    step: &str,
) -> Result<(), MusterError> {
    client.batch_execute(ddl).await.map_err(|source| {
        warn!(backend = %state.backend.display_name, step, error = %source, "bootstrap step failed");
        MusterError::BootstrapFailed {
            backend: state.backend.display_name.clone(),
            source,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_ddl_substitution_quotes_password() {
        let ddl = CREATE_MONITORING_ROLE
            .replace("$role$", "pg_muster_monitor")
            .replace("$pass$", &format!("'{}'", "o'brien".replace('\'', "''")));
        assert!(ddl.contains("pg_muster_monitor"));
        assert!(ddl.contains("o''brien"));
        assert!(!ddl.contains("$role$"));
        // The existence check compares a string literal, not a bare
        // identifier, or every bootstrap attempt fails with "column
        // pg_muster_monitor does not exist".
        assert!(ddl.contains("rolname = 'pg_muster_monitor'"));
    }

    #[test]
    fn test_grant_ddl_substitution_names_monitoring_role() {
        let ddl = GRANT_PG_MONITOR.replace("$role$", "pg_muster_monitor");
        assert_eq!(ddl, "GRANT pg_monitor TO pg_muster_monitor;");
    }

    #[test]
    fn test_schema_array_literal_quotes_and_escapes() {
        let literal = schema_array_literal(&["public".to_string(), "o'brien".to_string()]);
        assert_eq!(literal, "ARRAY['public', 'o''brien']::name[]");
    }

    #[test]
    fn test_ddl_strings_reference_names_used_by_catalog_queries() {
        assert!(CREATE_GET_STAT_ACTIVITY.contains("get_stat_activity"));
        assert!(CREATE_GET_STAT_REPLICATION.contains("get_stat_replication"));
        assert!(CREATE_GET_STAT_PROGRESS_VACUUM.contains("get_stat_progress_vacuum"));
    }
}
