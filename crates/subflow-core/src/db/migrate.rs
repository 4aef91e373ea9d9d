//! Database migration system for subflow
//!
//! This module provides automatic database schema management:
//! - Runs migrations on startup
//! - Tracks applied migrations

use sqlx::{PgPool, Row};
use tracing::{error, info, warn};

use crate::{Error, Result};

/// Migration record tracking applied migrations
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i64,
    pub name: String,
    pub applied_at: chrono::DateTime<chrono::Utc>,
}

/// Database migration manager
pub struct Migrator {
    pool: PgPool,
}

impl Migrator {
    /// Create a new migrator instance
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Initialize migration tracking table
    async fn init_migration_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                version BIGINT PRIMARY KEY,
                name VARCHAR(255) NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(())
    }

    /// Get list of applied migrations
    async fn get_applied_migrations(&self) -> Result<Vec<Migration>> {
        let rows = sqlx::query(r#"SELECT version, name, applied_at FROM _migrations ORDER BY version"#)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        let migrations = rows
            .into_iter()
            .map(|row| Migration {
                version: row.get("version"),
                name: row.get("name"),
                applied_at: row.get("applied_at"),
            })
            .collect();

        Ok(migrations)
    }

    /// Record a migration as applied
    async fn record_migration(&self, version: i64, name: &str) -> Result<()> {
        sqlx::query(r#"INSERT INTO _migrations (version, name) VALUES ($1, $2) ON CONFLICT DO NOTHING"#)
            .bind(version)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(())
    }

    /// Run all pending migrations
    pub async fn migrate(&self) -> Result<()> {
        info!("Initializing migration system...");
        self.init_migration_table().await?;

        let applied = self.get_applied_migrations().await?;
        info!("Found {} applied migrations", applied.len());

        let migrations = vec![
            (
                1,
                "initial_schema",
                include_str!("../../migrations/001_initial_schema.sql"),
            ),
            (
                2,
                "job_config_and_sweeper_runs",
                include_str!("../../migrations/002_job_config_and_sweeper_runs.sql"),
            ),
        ];

        for (version, name, sql) in migrations {
            if applied.iter().any(|m| m.version == version) {
                info!("Migration {} ({}) already applied, skipping", version, name);
                continue;
            }

            info!("Applying migration {} ({})...", version, name);

            // Execute the entire migration SQL as a single batch
            sqlx::raw_sql(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    error!("Failed to execute migration {}: {}", version, e);
                    Error::Database(e)
                })?;

            self.record_migration(version, name).await?;
            info!("Migration {} ({}) applied successfully", version, name);
        }

        info!("All migrations completed successfully!");
        Ok(())
    }

    /// Reset database (drop all tables and re-run migrations)
    pub async fn reset(&self) -> Result<()> {
        warn!("RESETTING DATABASE - This will delete all data!");

        sqlx::query(
            r#"
            DO $$ DECLARE
                r RECORD;
            BEGIN
                FOR r IN (SELECT tablename FROM pg_tables WHERE schemaname = 'public') LOOP
                    EXECUTE 'DROP TABLE IF EXISTS ' || quote_ident(r.tablename) || ' CASCADE';
                END LOOP;
            END $$;
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        sqlx::query(
            r#"
            DO $$ DECLARE
                r RECORD;
            BEGIN
                FOR r IN (SELECT typname FROM pg_type WHERE typtype = 'e' AND typnamespace = 'public'::regnamespace) LOOP
                    EXECUTE 'DROP TYPE IF EXISTS ' || quote_ident(r.typname) || ' CASCADE';
                END LOOP;
            END $$;
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        info!("Database reset complete. Re-running migrations...");
        self.migrate().await?;

        Ok(())
    }

    /// Get database status
    pub async fn status(&self) -> Result<DbStatus> {
        self.init_migration_table().await?;

        let applied = self.get_applied_migrations().await?;

        let subscription_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM subscriptions")
            .fetch_one(&self.pool)
            .await
            .unwrap_or(0);

        let ready_task_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM scheduled_tasks WHERE status = 'ready'")
                .fetch_one(&self.pool)
                .await
                .unwrap_or(0);

        let failed_task_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM scheduled_tasks WHERE status = 'failed'")
                .fetch_one(&self.pool)
                .await
                .unwrap_or(0);

        let unpublished_event_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM outbox_events WHERE published_at IS NULL")
                .fetch_one(&self.pool)
                .await
                .unwrap_or(0);

        Ok(DbStatus {
            applied_migrations: applied.len() as i64,
            subscription_count,
            ready_task_count,
            failed_task_count,
            unpublished_event_count,
        })
    }
}

/// Database status summary for operators
#[derive(Debug, Clone)]
pub struct DbStatus {
    pub applied_migrations: i64,
    pub subscription_count: i64,
    pub ready_task_count: i64,
    pub failed_task_count: i64,
    pub unpublished_event_count: i64,
}

/// Run migrations on startup
pub async fn auto_migrate(pool: &PgPool) -> Result<()> {
    Migrator::new(pool.clone()).migrate().await
}
