use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// One governor sample. `ts` is unix seconds (UTC), `flow` L/min.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, sqlx::FromRow)]
pub struct FlowSample {
    pub ts: i64,
    pub flow: f64,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/rig/rig.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal);

        // Every connection to ":memory:" opens its own empty database.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Flow measurement log
    // ----------------------------

    /// Append a sample and prune everything older than `retention_secs`
    /// before it.
    pub async fn insert_sample(&self, sample: FlowSample, retention_secs: i64) -> Result<()> {
        sqlx::query("INSERT INTO flow_samples (ts, flow) VALUES (?, ?)")
            .bind(sample.ts)
            .bind(sample.flow)
            .execute(&self.pool)
            .await
            .context("insert_sample failed")?;

        let pruned = sqlx::query("DELETE FROM flow_samples WHERE ts < ?")
            .bind(sample.ts - retention_secs)
            .execute(&self.pool)
            .await
            .context("prune flow_samples failed")?
            .rows_affected();
        if pruned > 0 {
            tracing::debug!(pruned, "old flow samples removed");
        }
        Ok(())
    }

    /// The newest `n` samples, oldest first.
    pub async fn recent_samples(&self, n: i64) -> Result<Vec<FlowSample>> {
        sqlx::query_as::<_, FlowSample>(
            r#"
            SELECT ts, flow FROM (
              SELECT id, ts, flow FROM flow_samples
              ORDER BY id DESC
              LIMIT ?
            )
            ORDER BY id ASC
            "#,
        )
        .bind(n)
        .fetch_all(&self.pool)
        .await
        .context("recent_samples failed")
    }
}

// ===========================================================================
// Tests
// ===========================================================================
