//! Account store: a typed facade over a single embedded SQLite database file.
//!
//! Every mutation here is expected to be called from inside the async
//! writer (`crate::writer`), never directly from the request path — the
//! request path only ever calls the `list`/`get` reads, which may be
//! snapshot-stale by up to one flush interval.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqlitePoolOptions, SqliteConnectOptions},
    ConnectOptions, Executor, Sqlite, SqlitePool, Transaction,
};
use std::path::Path;
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

use crate::models::{Account, PageParams, UsageRecord};

pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(database_path: &Path) -> Result<Self> {
        let url = format!("sqlite://{}?mode=rwc", database_path.display());
        let options = SqliteConnectOptions::from_str(&url)
            .with_context(|| format!("invalid database path {}", database_path.display()))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .context("failed to open sqlite database")?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run database migrations")?;
        info!("database migrations up to date");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Test-only: an ephemeral in-memory database, migrated and ready.
    /// Pinned to a single connection — SQLite's `:memory:` database is
    /// per-connection, so a pool free to open more than one would silently
    /// scatter reads and writes across unrelated empty databases.
    #[cfg(test)]
    pub async fn connect_in_memory() -> Self {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite connects");
        let store = Self { pool };
        store.migrate().await.expect("migrations apply");
        store
    }

    // ---- reads (selection-time; may be stale) ----

    pub async fn list_accounts(&self) -> Result<Vec<Account>> {
        let rows = sqlx::query_as::<_, Account>("SELECT * FROM accounts")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn get_account(&self, id: Uuid) -> Result<Option<Account>> {
        let row = sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn get_account_by_name(&self, name: &str) -> Result<Option<Account>> {
        let row = sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn list_usage(&self, page: &PageParams) -> Result<(Vec<UsageRecord>, i64)> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM requests")
            .fetch_one(&self.pool)
            .await?;
        let rows = sqlx::query_as::<_, UsageRecord>(
            "SELECT * FROM requests ORDER BY timestamp DESC LIMIT ? OFFSET ?",
        )
        .bind(page.limit_or_default())
        .bind(page.offset_or_default())
        .fetch_all(&self.pool)
        .await?;
        Ok((rows, total))
    }

    // ---- mutations (called only from the async writer) ----

    pub async fn insert_account(&self, account: &Account) -> Result<()> {
        sqlx::query(
            "INSERT INTO accounts (id, name, provider, tier, auth_type, refresh_token, \
             access_token, expires_at, api_key, base_url, paused, session_request_count, \
             request_count, total_requests) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0, 0)",
        )
        .bind(account.id.to_string())
        .bind(&account.name)
        .bind(&account.provider)
        .bind(account.tier.weight())
        .bind(&account.auth_type_raw)
        .bind(&account.refresh_token)
        .bind(&account.access_token)
        .bind(account.expires_at)
        .bind(&account.api_key)
        .bind(&account.base_url)
        .bind(account.paused)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_account_by_name(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM accounts WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Generic over `sqlx::Executor` so callers can run it against either
    /// the pool directly or a `Transaction` opened by the async writer —
    /// see `begin()`'s one-transaction-per-drain contract.
    pub async fn update_tokens<'e, E>(
        &self,
        executor: E,
        id: Uuid,
        access_token: &str,
        expires_at: DateTime<Utc>,
        refresh_token: Option<&str>,
    ) -> Result<()>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        if let Some(refresh_token) = refresh_token {
            sqlx::query(
                "UPDATE accounts SET access_token = ?, expires_at = ?, refresh_token = ? WHERE id = ?",
            )
            .bind(access_token)
            .bind(expires_at)
            .bind(refresh_token)
            .bind(id.to_string())
            .execute(executor)
            .await?;
        } else {
            sqlx::query("UPDATE accounts SET access_token = ?, expires_at = ? WHERE id = ?")
                .bind(access_token)
                .bind(expires_at)
                .bind(id.to_string())
                .execute(executor)
                .await?;
        }
        Ok(())
    }

    pub async fn mark_rate_limited<'e, E>(
        &self,
        executor: E,
        id: Uuid,
        reset_at: DateTime<Utc>,
    ) -> Result<()>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query("UPDATE accounts SET rate_limit_reset_at = ? WHERE id = ?")
            .bind(reset_at)
            .bind(id.to_string())
            .execute(executor)
            .await?;
        Ok(())
    }

    pub async fn clear_rate_limit<'e, E>(
        &self,
        executor: E,
        id: Uuid,
        reset_request_count: bool,
    ) -> Result<()>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        if reset_request_count {
            sqlx::query(
                "UPDATE accounts SET rate_limit_reset_at = NULL, request_count = 0 WHERE id = ?",
            )
            .bind(id.to_string())
            .execute(executor)
            .await?;
        } else {
            sqlx::query("UPDATE accounts SET rate_limit_reset_at = NULL WHERE id = ?")
                .bind(id.to_string())
                .execute(executor)
                .await?;
        }
        Ok(())
    }

    pub async fn update_rate_limit_meta<'e, E>(
        &self,
        executor: E,
        id: Uuid,
        status_tag: Option<&str>,
        reset_at: Option<DateTime<Utc>>,
        remaining: Option<i64>,
    ) -> Result<()>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query(
            "UPDATE accounts SET rate_limit_status = COALESCE(?, rate_limit_status), \
             rate_limit_reset_at = COALESCE(?, rate_limit_reset_at), \
             rate_limit_remaining = COALESCE(?, rate_limit_remaining) WHERE id = ?",
        )
        .bind(status_tag)
        .bind(reset_at)
        .bind(remaining)
        .bind(id.to_string())
        .execute(executor)
        .await?;
        Ok(())
    }

    /// `start_new_session` forces `session_start` (and `session_request_count`)
    /// to reset to this call rather than continue whatever session is
    /// already recorded; the caller sets it whenever the account wasn't
    /// already the live session leader. Without it, an account whose first
    /// success is long past would never look like a fresh session again,
    /// since `session_start` would otherwise only ever be set once.
    pub async fn increment_usage<'e, E>(
        &self,
        executor: E,
        id: Uuid,
        by: i64,
        mark_session: bool,
        start_new_session: bool,
    ) -> Result<()>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        if mark_session && start_new_session {
            sqlx::query(
                "UPDATE accounts SET request_count = request_count + ?, \
                 total_requests = total_requests + ?, \
                 session_request_count = ?, \
                 session_start = ? WHERE id = ?",
            )
            .bind(by)
            .bind(by)
            .bind(by)
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(executor)
            .await?;
        } else if mark_session {
            sqlx::query(
                "UPDATE accounts SET request_count = request_count + ?, \
                 total_requests = total_requests + ?, \
                 session_request_count = session_request_count + ?, \
                 session_start = COALESCE(session_start, ?) WHERE id = ?",
            )
            .bind(by)
            .bind(by)
            .bind(by)
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(executor)
            .await?;
        } else {
            sqlx::query(
                "UPDATE accounts SET request_count = request_count + ?, \
                 total_requests = total_requests + ? WHERE id = ?",
            )
            .bind(by)
            .bind(by)
            .bind(id.to_string())
            .execute(executor)
            .await?;
        }
        Ok(())
    }

    pub async fn set_tier<'e, E>(&self, executor: E, id: Uuid, tier: i64) -> Result<()>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query("UPDATE accounts SET tier = ? WHERE id = ?")
            .bind(tier)
            .bind(id.to_string())
            .execute(executor)
            .await?;
        Ok(())
    }

    pub async fn set_paused(&self, id: Uuid, paused: bool) -> Result<()> {
        sqlx::query("UPDATE accounts SET paused = ? WHERE id = ?")
            .bind(paused)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn rename(&self, id: Uuid, name: &str) -> Result<()> {
        sqlx::query("UPDATE accounts SET name = ? WHERE id = ?")
            .bind(name)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_rate_limit_override(
        &self,
        id: Uuid,
        limit: Option<i64>,
        window_minutes: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE accounts SET rate_limit_override_limit = ?, \
             rate_limit_override_window_minutes = ? WHERE id = ?",
        )
        .bind(limit)
        .bind(window_minutes)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_usage_record<'e, E>(&self, executor: E, record: &UsageRecord) -> Result<()>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query(
            "INSERT INTO requests (request_id, account_id, path, method, status, timestamp, \
             duration_ms, input_tokens, output_tokens, cost_estimate, agent, attempts, truncated) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.request_id.to_string())
        .bind(record.account_id.map(|id| id.to_string()))
        .bind(&record.path)
        .bind(&record.method)
        .bind(record.status)
        .bind(record.timestamp)
        .bind(record.duration_ms)
        .bind(record.input_tokens)
        .bind(record.output_tokens)
        .bind(record.cost_estimate)
        .bind(&record.agent)
        .bind(record.attempts)
        .bind(record.truncated)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Opens a transaction for the async writer's batched flush. Every op
    /// in a drain applies inside this one transaction and commits atomically.
    pub async fn begin(&self) -> Result<Transaction<'_, Sqlite>> {
        Ok(self.pool.begin().await?)
    }
}
