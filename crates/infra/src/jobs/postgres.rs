//! Production adapters: tenant listing and the per-tenant ETL procedure.
//!
//! Both calls go through the shared Postgres circuit breaker with a retry
//! executor inside it, so a flapping database costs one breaker failure per
//! exhausted retry sequence rather than one per attempt.

use std::sync::Arc;

use sqlx::{PgPool, Row};
use tracing::debug;

use finpulse_core::{DomainError, LogicalDate, TenantId};
use finpulse_resilience::{CircuitBreaker, RetryPolicy, retry_with_backoff};

use super::types::{PipelineError, UnitPipeline, UnitStats, WorkUnit, WorkUnitSource};
use crate::db::DbError;

/// Stored procedure run for each tenant when none is configured.
pub const DEFAULT_PROCEDURE: &str = "etl_process_tenant";

/// Lists active tenants as work units.
pub struct PostgresWorkUnitSource {
    pool: PgPool,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
}

impl PostgresWorkUnitSource {
    pub fn new(pool: PgPool, breaker: Arc<CircuitBreaker>, retry: RetryPolicy) -> Self {
        Self {
            pool,
            breaker,
            retry,
        }
    }
}

#[async_trait::async_trait]
impl WorkUnitSource for PostgresWorkUnitSource {
    async fn list_units(&self) -> Result<Vec<WorkUnit>, PipelineError> {
        let pool = &self.pool;
        let units = self
            .breaker
            .execute(|| {
                retry_with_backoff(&self.retry, || async move {
                    let rows = sqlx::query(
                        r#"
                        SELECT id, name
                        FROM tenants
                        WHERE active
                        ORDER BY name ASC
                        "#,
                    )
                    .fetch_all(pool)
                    .await
                    .map_err(|e| DbError::new("list_units", e))?;

                    rows.iter()
                        .map(|row| {
                            Ok(WorkUnit::new(
                                TenantId::from_uuid(row.try_get("id")?),
                                row.try_get::<String, _>("name")?,
                            ))
                        })
                        .collect::<Result<Vec<_>, sqlx::Error>>()
                        .map_err(|e| DbError::new("decode_unit", e))
                })
            })
            .await?;

        debug!(units = units.len(), "listed work units");
        Ok(units)
    }
}

/// Runs the per-tenant ETL stored procedure.
///
/// The procedure takes `(tenant_id uuid, run_date date)` and returns the
/// number of records it inserted. It must be idempotent per tenant and date,
/// since a retried run calls it again for units that already succeeded.
pub struct SqlUnitPipeline {
    pool: PgPool,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    statement: String,
}

impl SqlUnitPipeline {
    pub fn new(pool: PgPool, breaker: Arc<CircuitBreaker>, retry: RetryPolicy) -> Self {
        Self {
            pool,
            breaker,
            retry,
            statement: call_statement(DEFAULT_PROCEDURE),
        }
    }

    /// Call `procedure` instead of [`DEFAULT_PROCEDURE`].
    ///
    /// The name is interpolated into SQL, so only `[A-Za-z0-9_.]` is accepted.
    pub fn with_procedure(mut self, procedure: &str) -> Result<Self, DomainError> {
        let valid = !procedure.is_empty()
            && procedure
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
        if !valid {
            return Err(DomainError::validation(format!(
                "invalid procedure name: {procedure:?}"
            )));
        }
        self.statement = call_statement(procedure);
        Ok(self)
    }
}

fn call_statement(procedure: &str) -> String {
    format!("SELECT {procedure}($1, $2) AS records_inserted")
}

#[async_trait::async_trait]
impl UnitPipeline for SqlUnitPipeline {
    async fn run_unit(
        &self,
        unit: &WorkUnit,
        logical_date: LogicalDate,
    ) -> Result<UnitStats, PipelineError> {
        let pool = &self.pool;
        let statement = self.statement.as_str();
        let tenant = *unit.id.as_uuid();
        let run_date = logical_date.as_naive();

        let inserted: i64 = self
            .breaker
            .execute(|| {
                retry_with_backoff(&self.retry, || async move {
                    let row = sqlx::query(statement)
                        .bind(tenant)
                        .bind(run_date)
                        .fetch_one(pool)
                        .await
                        .map_err(|e| DbError::new("run_unit", e))?;
                    row.try_get::<Option<i64>, _>("records_inserted")
                        .map(|n| n.unwrap_or(0))
                        .map_err(|e| DbError::new("run_unit", e))
                })
            })
            .await?;

        debug!(unit_id = %unit.id, unit = %unit.name, inserted, "work unit processed");
        Ok(UnitStats {
            records_inserted: inserted.max(0) as u64,
        })
    }
}
