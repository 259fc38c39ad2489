//! Postgres-backed run store.
//!
//! ## Uniqueness
//!
//! A partial unique index on `(run_type, run_date)` covering `RUNNING` and
//! `SUCCESS` rows allows at most one live or successful run per key while
//! leaving `FAILED`/`PARTIAL` history in place for retries. Two processes that
//! both pass the idempotency check race on the insert; the loser gets `23505`,
//! which maps to [`RunStoreError::Conflict`].
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | RunStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (other) | Any other | `Storage` |
//! | Other | N/A | `Storage` |

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use finpulse_core::LogicalDate;

use super::store::{RunStore, RunStoreError};
use super::types::{RunId, RunRecord, RunStatus};
use crate::db::DbError;

/// DDL for the run table, applied statement by statement.
pub const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS job_runs (
        id UUID PRIMARY KEY,
        run_type TEXT NOT NULL,
        run_date DATE NOT NULL,
        status TEXT NOT NULL CHECK (status IN ('RUNNING', 'SUCCESS', 'FAILED', 'PARTIAL')),
        started_at TIMESTAMPTZ NOT NULL,
        finished_at TIMESTAMPTZ,
        trigger_source TEXT NOT NULL,
        error_message TEXT,
        units_processed INTEGER NOT NULL DEFAULT 0,
        records_inserted BIGINT NOT NULL DEFAULT 0,
        duration_seconds DOUBLE PRECISION
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS job_runs_claim_uniq
        ON job_runs (run_type, run_date)
        WHERE status IN ('RUNNING', 'SUCCESS')
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS job_runs_lookup_idx
        ON job_runs (run_type, run_date, started_at DESC)
    "#,
];

const SELECT_COLUMNS: &str = "id, run_type, run_date, status, started_at, finished_at, \
     trigger_source, error_message, units_processed, records_inserted, duration_seconds";

#[derive(Debug, Clone)]
pub struct PostgresRunStore {
    pool: PgPool,
}

impl PostgresRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the table and indexes if missing.
    pub async fn ensure_schema(&self) -> Result<(), RunStoreError> {
        for statement in SCHEMA.iter().copied() {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl RunStore for PostgresRunStore {
    #[instrument(skip(self, record), fields(run_id = %record.id, run_type = %record.run_type), err)]
    async fn insert(&self, record: &RunRecord) -> Result<(), RunStoreError> {
        sqlx::query(
            r#"
            INSERT INTO job_runs (
                id, run_type, run_date, status, started_at, finished_at,
                trigger_source, error_message, units_processed, records_inserted, duration_seconds
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(record.id.0)
        .bind(&record.run_type)
        .bind(record.logical_date.as_naive())
        .bind(record.status.as_str())
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(&record.trigger_source)
        .bind(record.error_message.as_deref())
        .bind(units_to_db(record.units_processed))
        .bind(records_to_db(record.records_inserted))
        .bind(record.duration_seconds)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            let err = DbError::new("insert_run", e);
            if err.is_unique_violation() {
                RunStoreError::Conflict {
                    run_type: record.run_type.clone(),
                    logical_date: record.logical_date,
                }
            } else {
                RunStoreError::Storage(err.to_string())
            }
        })?;

        Ok(())
    }

    async fn get(&self, run_id: RunId) -> Result<Option<RunRecord>, RunStoreError> {
        let row = sqlx::query(&format!("SELECT {SELECT_COLUMNS} FROM job_runs WHERE id = $1"))
            .bind(run_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_run", e))?;

        row.map(|r| RunRow::from_row(&r)).transpose()
    }

    async fn latest_for(
        &self,
        run_type: &str,
        logical_date: LogicalDate,
    ) -> Result<Option<RunRecord>, RunStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM job_runs \
             WHERE run_type = $1 AND run_date = $2 \
             ORDER BY started_at DESC, id DESC \
             LIMIT 1"
        ))
        .bind(run_type)
        .bind(logical_date.as_naive())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("latest_run", e))?;

        row.map(|r| RunRow::from_row(&r)).transpose()
    }

    #[instrument(skip(self, record, expected), fields(run_id = %record.id, status = %record.status), err)]
    async fn update(&self, record: &RunRecord, expected: &[RunStatus]) -> Result<bool, RunStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE job_runs
            SET status = $2,
                finished_at = $3,
                error_message = $4,
                units_processed = $5,
                records_inserted = $6,
                duration_seconds = $7
            WHERE id = $1 AND status = ANY($8)
            "#,
        )
        .bind(record.id.0)
        .bind(record.status.as_str())
        .bind(record.finished_at)
        .bind(record.error_message.as_deref())
        .bind(units_to_db(record.units_processed))
        .bind(records_to_db(record.records_inserted))
        .bind(record.duration_seconds)
        .bind(status_list(expected))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            let err = DbError::new("update_run", e);
            if err.is_unique_violation() {
                RunStoreError::Conflict {
                    run_type: record.run_type.clone(),
                    logical_date: record.logical_date,
                }
            } else {
                RunStoreError::Storage(err.to_string())
            }
        })?;

        // Zero rows: the id is gone or its status is no longer in `expected`.
        // Callers re-read to tell which.
        Ok(result.rows_affected() == 1)
    }

    async fn delete_for_date(
        &self,
        run_type: &str,
        logical_date: LogicalDate,
    ) -> Result<u64, RunStoreError> {
        let result = sqlx::query("DELETE FROM job_runs WHERE run_type = $1 AND run_date = $2")
            .bind(run_type)
            .bind(logical_date.as_naive())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_runs", e))?;

        Ok(result.rows_affected())
    }
}

fn status_list(statuses: &[RunStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

fn units_to_db(units: u32) -> i32 {
    i32::try_from(units).unwrap_or(i32::MAX)
}

fn records_to_db(records: u64) -> i64 {
    i64::try_from(records).unwrap_or(i64::MAX)
}

fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> RunStoreError {
    RunStoreError::Storage(DbError::new(operation, err).to_string())
}

// SQLx row types

#[derive(Debug)]
struct RunRow {
    id: Uuid,
    run_type: String,
    run_date: NaiveDate,
    status: String,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    trigger_source: String,
    error_message: Option<String>,
    units_processed: i32,
    records_inserted: i64,
    duration_seconds: Option<f64>,
}

impl RunRow {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<RunRecord, RunStoreError> {
        let decode = |e: sqlx::Error| map_sqlx_error("decode_run", e);
        let raw = RunRow {
            id: row.try_get("id").map_err(decode)?,
            run_type: row.try_get("run_type").map_err(decode)?,
            run_date: row.try_get("run_date").map_err(decode)?,
            status: row.try_get("status").map_err(decode)?,
            started_at: row.try_get("started_at").map_err(decode)?,
            finished_at: row.try_get("finished_at").map_err(decode)?,
            trigger_source: row.try_get("trigger_source").map_err(decode)?,
            error_message: row.try_get("error_message").map_err(decode)?,
            units_processed: row.try_get("units_processed").map_err(decode)?,
            records_inserted: row.try_get("records_inserted").map_err(decode)?,
            duration_seconds: row.try_get("duration_seconds").map_err(decode)?,
        };
        raw.try_into()
    }
}

impl TryFrom<RunRow> for RunRecord {
    type Error = RunStoreError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        let status: RunStatus = row
            .status
            .parse()
            .map_err(|e| RunStoreError::Storage(format!("run {}: {e}", row.id)))?;

        Ok(RunRecord {
            id: RunId::from_uuid(row.id),
            run_type: row.run_type,
            logical_date: LogicalDate::new(row.run_date),
            status,
            started_at: row.started_at,
            finished_at: row.finished_at,
            trigger_source: row.trigger_source,
            error_message: row.error_message,
            units_processed: row.units_processed.max(0) as u32,
            records_inserted: row.records_inserted.max(0) as u64,
            duration_seconds: row.duration_seconds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_declares_the_partial_claim_index() {
        let ddl = SCHEMA.join("\n");
        assert!(ddl.contains("CREATE UNIQUE INDEX IF NOT EXISTS job_runs_claim_uniq"));
        assert!(ddl.contains("WHERE status IN ('RUNNING', 'SUCCESS')"));
    }

    #[test]
    fn rows_with_unknown_status_are_rejected() {
        let row = RunRow {
            id: Uuid::now_v7(),
            run_type: "ETL_DAILY".into(),
            run_date: NaiveDate::from_ymd_opt(2025, 11, 10).unwrap(),
            status: "DONE".into(),
            started_at: Utc::now(),
            finished_at: None,
            trigger_source: "cron".into(),
            error_message: None,
            units_processed: 0,
            records_inserted: 0,
            duration_seconds: None,
        };
        assert!(matches!(RunRecord::try_from(row), Err(RunStoreError::Storage(_))));
    }

    #[test]
    fn expected_statuses_bind_as_column_values() {
        assert_eq!(
            status_list(&[RunStatus::Running, RunStatus::Partial]),
            vec!["RUNNING".to_string(), "PARTIAL".to_string()]
        );
    }

    #[test]
    fn counters_saturate_into_column_types() {
        assert_eq!(units_to_db(u32::MAX), i32::MAX);
        assert_eq!(records_to_db(42), 42);
    }
}
