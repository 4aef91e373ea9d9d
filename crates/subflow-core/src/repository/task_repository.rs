//! Task queue repository
//!
//! All scheduling state lives in the `scheduled_tasks` table. Claiming uses
//! `FOR UPDATE SKIP LOCKED` so any number of workers can pull batches without
//! coordinating; the `(tenant_id, task_key)` unique constraint collapses
//! duplicate enqueues and, together with the claim lease, gives at-most-one
//! in-flight execution per logical task.

use async_trait::async_trait;
use sqlx::PgConnection;
use std::time::Duration;
use uuid::Uuid;

use crate::models::{NewTask, ScheduledTask, TaskStatus};
use crate::tenant::TenantContext;
use crate::{Error, Result};

/// Task queue operations
#[async_trait]
pub trait TaskRepository: Send + Sync + 'static {
    /// Enqueue a task, or reschedule the existing row for its key.
    ///
    /// A claimed row is left untouched (the running lease wins) and `None`
    /// is returned; any other state is reset to ready with refreshed
    /// `due_at` and `payload`.
    async fn enqueue(&self, ctx: &TenantContext, task: NewTask) -> Result<Option<ScheduledTask>>;

    /// Claim up to `limit` due tasks for `worker_id`, across tenants.
    ///
    /// One statement; rows locked by concurrent claimers are skipped.
    async fn claim_batch(
        &self,
        worker_id: &str,
        limit: i64,
        lease: Duration,
    ) -> Result<Vec<ScheduledTask>>;

    /// Mark a claimed task completed
    async fn complete(&self, task_id: Uuid) -> Result<()>;

    /// Record a transient failure: back to ready with backoff, or failed
    /// once attempts are exhausted. Returns the updated row.
    async fn fail(
        &self,
        task_id: Uuid,
        error: &str,
        backoff: Duration,
    ) -> Result<Option<ScheduledTask>>;

    /// Record a terminal failure regardless of remaining attempts
    async fn fail_terminal(&self, task_id: Uuid, error: &str) -> Result<Option<ScheduledTask>>;

    /// Extend the lease of a claimed task owned by `worker_id`
    async fn extend_lease(&self, task_id: Uuid, worker_id: &str, lease: Duration) -> Result<bool>;

    /// Return claimed tasks whose lease has lapsed to ready. Crash recovery;
    /// runs across tenants. Returns the number of rows recovered.
    async fn reap_expired(&self, limit: i64) -> Result<u64>;

    /// Cancel a ready or claimed task. A claimed cancellation does not
    /// interrupt the running handler; its completion is simply discarded.
    async fn cancel(&self, ctx: &TenantContext, task_key: &str) -> Result<bool>;

    /// Find a task by its key
    async fn find_by_key(&self, ctx: &TenantContext, task_key: &str) -> Result<Option<ScheduledTask>>;

    /// Count tasks per status, across tenants (operator view)
    async fn count_by_status(&self) -> Result<Vec<(TaskStatus, i64)>>;
}

/// Insert-or-reschedule on an open transaction.
///
/// Shared by the pool-level `enqueue` and by flows that co-commit a task with
/// other writes (invoice creation, payment fan-out, delivery creation).
pub(crate) async fn enqueue_on(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    task: &NewTask,
) -> Result<Option<ScheduledTask>> {
    let row = sqlx::query_as::<_, ScheduledTask>(
        r#"
        INSERT INTO scheduled_tasks (
            tenant_id, task_type, task_key, status, due_at,
            attempt_count, max_attempts, payload
        ) VALUES ($1, $2, $3, 'ready', $4, 0, $5, $6)
        ON CONFLICT (tenant_id, task_key) DO UPDATE SET
            status = 'ready',
            due_at = EXCLUDED.due_at,
            payload = EXCLUDED.payload,
            max_attempts = EXCLUDED.max_attempts,
            attempt_count = CASE
                WHEN scheduled_tasks.status = 'ready' THEN scheduled_tasks.attempt_count
                ELSE 0
            END,
            locked_until = NULL,
            lock_owner = NULL,
            last_error = NULL,
            completed_at = NULL,
            updated_at = NOW()
        WHERE scheduled_tasks.status <> 'claimed'
        RETURNING *
        "#,
    )
    .bind(tenant_id)
    .bind(task.task_type)
    .bind(&task.task_key)
    .bind(task.due_at)
    .bind(task.max_attempts)
    .bind(&task.payload)
    .fetch_optional(conn)
    .await
    .map_err(Error::Database)?;

    Ok(row)
}

/// Cancel a task only while it is still ready. Used on an open transaction
/// when cancelling a delivery must also cancel its pending order task.
pub(crate) async fn cancel_if_ready_on(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    task_key: &str,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE scheduled_tasks
        SET status = 'cancelled', locked_until = NULL, lock_owner = NULL, updated_at = NOW()
        WHERE tenant_id = $1 AND task_key = $2 AND status = 'ready'
        "#,
    )
    .bind(tenant_id)
    .bind(task_key)
    .execute(conn)
    .await
    .map_err(Error::Database)?;

    Ok(result.rows_affected() > 0)
}

/// PostgreSQL implementation of the task queue
#[derive(Clone)]
pub struct PostgresTaskRepository {
    pool: sqlx::PgPool,
}

impl PostgresTaskRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskRepository for PostgresTaskRepository {
    async fn enqueue(&self, ctx: &TenantContext, task: NewTask) -> Result<Option<ScheduledTask>> {
        let mut conn = self.pool.acquire().await.map_err(Error::Database)?;
        enqueue_on(&mut conn, ctx.tenant_id, &task).await
    }

    async fn claim_batch(
        &self,
        worker_id: &str,
        limit: i64,
        lease: Duration,
    ) -> Result<Vec<ScheduledTask>> {
        let tasks = sqlx::query_as::<_, ScheduledTask>(
            r#"
            UPDATE scheduled_tasks
            SET status = 'claimed',
                locked_until = NOW() + make_interval(secs => $1),
                lock_owner = $2,
                updated_at = NOW()
            WHERE id IN (
                SELECT id FROM scheduled_tasks
                WHERE status = 'ready'
                  AND due_at <= NOW()
                  AND (locked_until IS NULL OR locked_until < NOW())
                ORDER BY due_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(lease.as_secs_f64())
        .bind(worker_id)
        .bind(limit.min(100))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(tasks)
    }

    async fn complete(&self, task_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scheduled_tasks
            SET status = 'completed',
                locked_until = NULL,
                lock_owner = NULL,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'claimed'
            "#,
        )
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(())
    }

    async fn fail(
        &self,
        task_id: Uuid,
        error: &str,
        backoff: Duration,
    ) -> Result<Option<ScheduledTask>> {
        let task = sqlx::query_as::<_, ScheduledTask>(
            r#"
            UPDATE scheduled_tasks
            SET attempt_count = attempt_count + 1,
                last_error = $2,
                status = CASE
                    WHEN attempt_count + 1 >= max_attempts THEN 'failed'::task_status
                    ELSE 'ready'::task_status
                END,
                due_at = CASE
                    WHEN attempt_count + 1 >= max_attempts THEN due_at
                    ELSE NOW() + make_interval(secs => $3)
                END,
                locked_until = NULL,
                lock_owner = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'claimed'
            RETURNING *
            "#,
        )
        .bind(task_id)
        .bind(error)
        .bind(backoff.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(task)
    }

    async fn fail_terminal(&self, task_id: Uuid, error: &str) -> Result<Option<ScheduledTask>> {
        let task = sqlx::query_as::<_, ScheduledTask>(
            r#"
            UPDATE scheduled_tasks
            SET status = 'failed',
                attempt_count = attempt_count + 1,
                last_error = $2,
                locked_until = NULL,
                lock_owner = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'claimed'
            RETURNING *
            "#,
        )
        .bind(task_id)
        .bind(error)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(task)
    }

    async fn extend_lease(&self, task_id: Uuid, worker_id: &str, lease: Duration) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_tasks
            SET locked_until = NOW() + make_interval(secs => $3), updated_at = NOW()
            WHERE id = $1 AND lock_owner = $2 AND status = 'claimed'
            "#,
        )
        .bind(task_id)
        .bind(worker_id)
        .bind(lease.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn reap_expired(&self, limit: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_tasks
            SET status = 'ready',
                locked_until = NULL,
                lock_owner = NULL,
                updated_at = NOW()
            WHERE id IN (
                SELECT id FROM scheduled_tasks
                WHERE status = 'claimed' AND locked_until < NOW()
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            "#,
        )
        .bind(limit)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected())
    }

    async fn cancel(&self, ctx: &TenantContext, task_key: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_tasks
            SET status = 'cancelled', updated_at = NOW()
            WHERE tenant_id = $1 AND task_key = $2 AND status IN ('ready', 'claimed')
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(task_key)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_by_key(&self, ctx: &TenantContext, task_key: &str) -> Result<Option<ScheduledTask>> {
        let task = sqlx::query_as::<_, ScheduledTask>(
            "SELECT * FROM scheduled_tasks WHERE tenant_id = $1 AND task_key = $2",
        )
        .bind(ctx.tenant_id)
        .bind(task_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(task)
    }

    async fn count_by_status(&self) -> Result<Vec<(TaskStatus, i64)>> {
        let counts = sqlx::query_as::<_, (TaskStatus, i64)>(
            "SELECT status, COUNT(*) FROM scheduled_tasks GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(counts)
    }
}
