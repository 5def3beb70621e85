/// SQLite-backed store for the coordination engine.
///
/// Single-writer relational storage with WAL journaling and enforced
/// foreign keys. The store is the only source of identity (UUIDs are
/// minted on insert) and the only shared mutable resource in the process;
/// every mutating operation runs inside one transaction obtained from
/// [`SqliteStore::begin`].
use crate::errors::{EngineError, EngineResult};
use crate::model::{ChannelType, GENERAL_CHANNEL_ID};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Transaction};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Shared handle to the engine database.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    db_path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `db_path`, apply the
    /// migration sequence, and seed initial rows.
    pub async fn open<P: AsRef<Path>>(db_path: P) -> EngineResult<Self> {
        let db_path = db_path.as_ref().to_path_buf();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let connect_options = SqliteConnectOptions::from_str(db_path.to_string_lossy().as_ref())
            .map_err(EngineError::Database)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        // Concurrent handlers each run short transactions; WAL plus the
        // busy timeout serializes writers at the database, not at the pool.
        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(connect_options)
            .await?;

        let store = Self {
            pool,
            db_path: Some(db_path),
        };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory store for tests. WAL does not apply to `:memory:`
    /// databases; everything else behaves identically.
    pub async fn open_in_memory() -> EngineResult<Self> {
        let connect_options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(EngineError::Database)?
            .foreign_keys(true);

        // A single connection keeps the in-memory database alive and shared.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await?;

        let store = Self {
            pool,
            db_path: None,
        };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Start a transaction. The caller commits; dropping rolls back.
    pub async fn begin(&self) -> EngineResult<Transaction<'static, sqlx::Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    /// Apply the migration sequence. Every step is additive and safe to
    /// reapply: create-table-if-missing, create-index-if-missing,
    /// add-column-if-missing, conditional id rewrites for legacy rows.
    async fn migrate(&self) -> EngineResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                is_lead INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'idle'
                    CHECK (status IN ('idle', 'busy', 'offline')),
                role TEXT,
                description TEXT,
                capabilities TEXT,
                max_tasks INTEGER NOT NULL DEFAULT 1 CHECK (max_tasks >= 1),
                created_at TEXT NOT NULL,
                last_updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agent_tasks (
                id TEXT PRIMARY KEY,
                task TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'unassigned'
                    CHECK (status IN ('backlog', 'unassigned', 'offered', 'pending',
                                      'in_progress', 'paused', 'reviewing',
                                      'completed', 'failed', 'cancelled')),
                source TEXT NOT NULL DEFAULT 'mcp'
                    CHECK (source IN ('mcp', 'slack', 'api', 'system')),
                agent_id TEXT REFERENCES agents(id) ON DELETE CASCADE,
                creator_agent_id TEXT,
                offered_to TEXT,
                offered_at TEXT,
                accepted_at TEXT,
                rejection_reason TEXT,
                task_type TEXT,
                tags TEXT,
                priority INTEGER NOT NULL DEFAULT 50,
                depends_on TEXT,
                parent_task_id TEXT,
                created_at TEXT NOT NULL,
                last_updated_at TEXT NOT NULL,
                finished_at TEXT,
                output TEXT,
                failure_reason TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS channels (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                description TEXT,
                channel_type TEXT NOT NULL DEFAULT 'public'
                    CHECK (channel_type IN ('public', 'dm')),
                created_by TEXT,
                participants TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS channel_messages (
                id TEXT PRIMARY KEY,
                channel_id TEXT NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
                agent_id TEXT REFERENCES agents(id) ON DELETE SET NULL,
                content TEXT NOT NULL,
                reply_to_id TEXT,
                mentions TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS channel_read_state (
                agent_id TEXT NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
                channel_id TEXT NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
                last_read_at TEXT NOT NULL,
                PRIMARY KEY (agent_id, channel_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS services (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                port INTEGER NOT NULL,
                url TEXT,
                health_check_path TEXT NOT NULL DEFAULT '/health',
                status TEXT NOT NULL DEFAULT 'starting'
                    CHECK (status IN ('starting', 'healthy', 'unhealthy', 'stopped')),
                script TEXT NOT NULL,
                cwd TEXT,
                interpreter TEXT,
                args TEXT,
                env TEXT,
                metadata TEXT,
                created_at TEXT NOT NULL,
                last_updated_at TEXT NOT NULL,
                UNIQUE (agent_id, name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scheduled_tasks (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                description TEXT,
                task_template TEXT NOT NULL,
                task_type TEXT,
                tags TEXT,
                priority INTEGER NOT NULL DEFAULT 50,
                target_agent_id TEXT,
                cron_expression TEXT,
                interval_ms INTEGER,
                timezone TEXT NOT NULL DEFAULT 'UTC',
                enabled INTEGER NOT NULL DEFAULT 1,
                last_run_at TEXT,
                next_run_at TEXT,
                created_by_agent_id TEXT,
                created_at TEXT NOT NULL,
                last_updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS epics (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                goal TEXT NOT NULL,
                description TEXT,
                prd TEXT,
                plan TEXT,
                status TEXT NOT NULL DEFAULT 'draft'
                    CHECK (status IN ('draft', 'active', 'paused', 'completed', 'cancelled')),
                priority INTEGER NOT NULL DEFAULT 50,
                tags TEXT,
                lead_agent_id TEXT,
                created_by_agent_id TEXT,
                channel_id TEXT,
                external_refs TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Append-only, so no foreign keys: log rows outlive every entity
        // they mention.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agent_log (
                id TEXT PRIMARY KEY,
                event_type TEXT NOT NULL,
                agent_id TEXT,
                task_id TEXT,
                old_value TEXT,
                new_value TEXT,
                metadata TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS inbox_messages (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
                content TEXT NOT NULL,
                slack_channel_id TEXT,
                slack_thread_ts TEXT,
                slack_user_id TEXT,
                delegated_task_id TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Columns added after the initial schema shipped. Reapplied safely
        // on every open.
        self.add_column_if_missing("agent_tasks", "epic_id", "TEXT")
            .await?;
        self.add_column_if_missing("agent_tasks", "external_context", "TEXT")
            .await?;
        self.add_column_if_missing("agent_tasks", "progress", "TEXT")
            .await?;

        self.create_indexes().await?;
        self.seed_general_channel().await?;

        Ok(())
    }

    async fn create_indexes(&self) -> EngineResult<()> {
        let statements = [
            "CREATE INDEX IF NOT EXISTS idx_agent_tasks_agent_id ON agent_tasks(agent_id)",
            "CREATE INDEX IF NOT EXISTS idx_agent_tasks_status ON agent_tasks(status)",
            "CREATE INDEX IF NOT EXISTS idx_agent_tasks_offered_to ON agent_tasks(offered_to)",
            "CREATE INDEX IF NOT EXISTS idx_agent_tasks_task_type ON agent_tasks(task_type)",
            "CREATE INDEX IF NOT EXISTS idx_agent_log_agent_id ON agent_log(agent_id)",
            "CREATE INDEX IF NOT EXISTS idx_agent_log_task_id ON agent_log(task_id)",
            "CREATE INDEX IF NOT EXISTS idx_agent_log_event_type ON agent_log(event_type)",
            "CREATE INDEX IF NOT EXISTS idx_agent_log_created_at ON agent_log(created_at)",
            "CREATE INDEX IF NOT EXISTS idx_channel_messages_channel_id ON channel_messages(channel_id)",
            "CREATE INDEX IF NOT EXISTS idx_channel_messages_agent_id ON channel_messages(agent_id)",
            "CREATE INDEX IF NOT EXISTS idx_channel_messages_created_at ON channel_messages(created_at)",
            "CREATE INDEX IF NOT EXISTS idx_services_agent_id ON services(agent_id)",
            "CREATE INDEX IF NOT EXISTS idx_services_status ON services(status)",
        ];
        for stmt in statements {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Additive column migration. SQLite has no ADD COLUMN IF NOT EXISTS,
    /// so consult table_info first.
    async fn add_column_if_missing(
        &self,
        table: &str,
        column: &str,
        decl: &str,
    ) -> EngineResult<()> {
        let rows = sqlx::query(&format!("PRAGMA table_info({})", table))
            .fetch_all(&self.pool)
            .await?;
        let exists = rows
            .iter()
            .any(|row| row.get::<String, _>("name") == column);
        if !exists {
            sqlx::query(&format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                table, column, decl
            ))
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Seeding
    // -----------------------------------------------------------------------

    /// Ensure the `general` channel exists under its fixed UUID. A legacy
    /// row under any other id is rewritten in one pass, together with the
    /// messages and read-state rows that reference it.
    async fn seed_general_channel(&self) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;

        // The id rewrite updates a parent key ahead of its children; defer
        // enforcement to commit so the pass stays a single transaction.
        sqlx::query("PRAGMA defer_foreign_keys = ON")
            .execute(&mut *tx)
            .await?;

        let existing: Option<String> =
            sqlx::query_scalar("SELECT id FROM channels WHERE name = 'general'")
                .fetch_optional(&mut *tx)
                .await?;

        match existing {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO channels (id, name, description, channel_type, created_at)
                    VALUES (?1, 'general', 'Default channel for the whole swarm', ?2, ?3)
                    "#,
                )
                .bind(GENERAL_CHANNEL_ID.to_string())
                .bind(ChannelType::Public.to_string())
                .bind(Utc::now())
                .execute(&mut *tx)
                .await?;
            }
            Some(legacy_id) if legacy_id != GENERAL_CHANNEL_ID.to_string() => {
                let new_id = GENERAL_CHANNEL_ID.to_string();
                sqlx::query("UPDATE channels SET id = ?1 WHERE id = ?2")
                    .bind(&new_id)
                    .bind(&legacy_id)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("UPDATE channel_messages SET channel_id = ?1 WHERE channel_id = ?2")
                    .bind(&new_id)
                    .bind(&legacy_id)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("UPDATE channel_read_state SET channel_id = ?1 WHERE channel_id = ?2")
                    .bind(&new_id)
                    .bind(&legacy_id)
                    .execute(&mut *tx)
                    .await?;
                tracing::info!(legacy_id, "migrated general channel to fixed id");
            }
            Some(_) => {}
        }

        tx.commit().await?;
        Ok(())
    }
}

/// Mint a fresh row id. All identity comes from the store at insert time.
pub fn new_id() -> Uuid {
    Uuid::new_v4()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        // A second pass over an already-migrated database must be a no-op.
        store.migrate().await.unwrap();
        store.migrate().await.unwrap();
    }

    #[tokio::test]
    async fn general_channel_is_seeded_with_fixed_id() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let id: String = sqlx::query_scalar("SELECT id FROM channels WHERE name = 'general'")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(id, GENERAL_CHANNEL_ID.to_string());
    }

    #[tokio::test]
    async fn legacy_general_channel_id_is_rewritten() {
        let store = SqliteStore::open_in_memory().await.unwrap();

        // Simulate a database from before channel ids were UUIDs.
        sqlx::query("DELETE FROM channels WHERE name = 'general'")
            .execute(store.pool())
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO channels (id, name, channel_type, created_at) \
             VALUES ('general', 'general', 'public', ?1)",
        )
        .bind(Utc::now())
        .execute(store.pool())
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO channel_messages (id, channel_id, content, created_at) \
             VALUES (?1, 'general', 'hello', ?2)",
        )
        .bind(new_id().to_string())
        .bind(Utc::now())
        .execute(store.pool())
        .await
        .unwrap();

        store.seed_general_channel().await.unwrap();

        let id: String = sqlx::query_scalar("SELECT id FROM channels WHERE name = 'general'")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(id, GENERAL_CHANNEL_ID.to_string());

        let message_channel: String =
            sqlx::query_scalar("SELECT channel_id FROM channel_messages LIMIT 1")
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert_eq!(message_channel, GENERAL_CHANNEL_ID.to_string());
    }

    #[tokio::test]
    async fn on_disk_store_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("swarm.db");
        let store = SqliteStore::open(&path).await.unwrap();
        assert!(path.exists());
        store.close().await;
    }

    #[tokio::test]
    async fn add_column_if_missing_is_reapplicable() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store
            .add_column_if_missing("agent_tasks", "progress", "TEXT")
            .await
            .unwrap();
        store
            .add_column_if_missing("agent_tasks", "progress", "TEXT")
            .await
            .unwrap();
    }
}
