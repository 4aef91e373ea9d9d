//! Job configuration and sweeper run metrics repository
//!
//! The sweeper schedule lives in a table so operators can retune it without
//! a redeploy; the sweeper re-reads it on every loop pass.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::{Error, Result};

/// A tunable background job row
#[derive(Debug, Clone, FromRow)]
pub struct JobConfigRow {
    pub job_name: String,
    pub schedule: String,
    pub enabled: bool,
    pub updated_at: DateTime<Utc>,
}

/// Metrics recorded for one sweeper run
#[derive(Debug, Clone, Default)]
pub struct SweeperRunRecord {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub subscriptions_found: i64,
    pub tasks_created: i64,
    pub trial_ends_scheduled: i64,
    pub period_ends_processed: i64,
    pub errors: i64,
}

/// Job repository trait
#[async_trait]
pub trait JobRepository: Send + Sync + 'static {
    /// Fetch a job's current schedule
    async fn get_config(&self, job_name: &str) -> Result<Option<JobConfigRow>>;

    /// Update a job's schedule
    async fn set_schedule(&self, job_name: &str, schedule: &str, enabled: bool) -> Result<()>;

    /// Record one sweeper run's metrics
    async fn record_sweeper_run(&self, run: &SweeperRunRecord) -> Result<()>;
}

/// PostgreSQL implementation of the job repository
#[derive(Clone)]
pub struct PostgresJobRepository {
    pool: sqlx::PgPool,
}

impl PostgresJobRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepository for PostgresJobRepository {
    async fn get_config(&self, job_name: &str) -> Result<Option<JobConfigRow>> {
        let row = sqlx::query_as::<_, JobConfigRow>(
            "SELECT * FROM job_configs WHERE job_name = $1",
        )
        .bind(job_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row)
    }

    async fn set_schedule(&self, job_name: &str, schedule: &str, enabled: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job_configs (job_name, schedule, enabled)
            VALUES ($1, $2, $3)
            ON CONFLICT (job_name) DO UPDATE SET
                schedule = EXCLUDED.schedule,
                enabled = EXCLUDED.enabled,
                updated_at = NOW()
            "#,
        )
        .bind(job_name)
        .bind(schedule)
        .bind(enabled)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(())
    }

    async fn record_sweeper_run(&self, run: &SweeperRunRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sweeper_runs (
                started_at, finished_at, subscriptions_found, tasks_created,
                trial_ends_scheduled, period_ends_processed, errors
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(run.started_at.unwrap_or_else(Utc::now))
        .bind(run.finished_at.unwrap_or_else(Utc::now))
        .bind(run.subscriptions_found)
        .bind(run.tasks_created)
        .bind(run.trial_ends_scheduled)
        .bind(run.period_ends_processed)
        .bind(run.errors)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(())
    }
}
