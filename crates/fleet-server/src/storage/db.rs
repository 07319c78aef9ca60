//! SQLite database layer (embedded, no external dependencies)

use anyhow::{Context, Result};
use crate::config::InventoryConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_core::ports::{InstanceDirectory, RecordingStore};
use fleet_core::{AgentRecord, FleetError, Instance, RecordingCompletion, TerminalRecording};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::sync::Arc;

pub struct Database {
    pool: Arc<SqlitePool>,
}

fn db_err(e: sqlx::Error) -> FleetError {
    FleetError::Database(e.to_string())
}

impl Database {
    pub async fn new(database_path: &Path) -> Result<Self> {
        tracing::info!("Opening SQLite database at: {}", database_path.display());

        let parent = database_path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Invalid database path: no parent directory"))?;
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create database directory: {}", parent.display()))?;

        // Fail early with a clear message instead of a cryptic SQLITE_CANTOPEN
        let test_file = parent.join(".write_test");
        match tokio::fs::write(&test_file, b"test").await {
            Ok(_) => {
                let _ = tokio::fs::remove_file(&test_file).await;
            }
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "Database directory is not writable: {}: {}",
                    parent.display(),
                    e
                ));
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| {
                format!(
                    "Failed to connect to SQLite database at: {}",
                    database_path.display()
                )
            })?;

        tracing::info!("SQLite connection established, running migrations...");

        Self::run_migrations(&pool)
            .await
            .context("Failed to run database migrations")?;

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<()> {
        // Agents table
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                host_id TEXT NOT NULL,
                name TEXT NOT NULL,
                last_seen DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(pool)
        .await?;

        // Instances table
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                name TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        // Terminal recordings: end_* columns are written once at finalization
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS terminal_recordings (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL UNIQUE,
                instance_id TEXT NOT NULL,
                container_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                username TEXT NOT NULL,
                client_ip TEXT,
                shell TEXT NOT NULL,
                rows INTEGER NOT NULL,
                cols INTEGER NOT NULL,
                start_time DATETIME NOT NULL,
                end_time DATETIME,
                duration REAL,
                format TEXT NOT NULL DEFAULT 'asciinema',
                storage_path TEXT,
                file_size INTEGER
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_recordings_instance
            ON terminal_recordings (instance_id, start_time)
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    // Inventory operations

    /// Upsert the configured inventory, agents first so instance rows never
    /// point at a missing agent. Returns the number of rows written.
    pub async fn seed_inventory(&self, inventory: &InventoryConfig) -> Result<usize> {
        for agent in &inventory.agents {
            self.upsert_agent(&agent.id, &agent.host_id, &agent.name)
                .await
                .with_context(|| format!("Failed to seed agent {}", agent.id))?;
        }
        for instance in &inventory.instances {
            self.upsert_instance(&instance.id, &instance.agent_id, &instance.name)
                .await
                .with_context(|| format!("Failed to seed instance {}", instance.id))?;
        }
        Ok(inventory.agents.len() + inventory.instances.len())
    }

    pub async fn upsert_agent(&self, id: &str, host_id: &str, name: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO agents (id, host_id, name, last_seen)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO UPDATE SET host_id = excluded.host_id, name = excluded.name
            "#,
        )
        .bind(id)
        .bind(host_id)
        .bind(name)
        .bind(Utc::now())
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    pub async fn upsert_instance(&self, id: &str, agent_id: &str, name: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO instances (id, agent_id, name)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET agent_id = excluded.agent_id, name = excluded.name
            "#,
        )
        .bind(id)
        .bind(agent_id)
        .bind(name)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl InstanceDirectory for Database {
    async fn get_instance(&self, id: &str) -> fleet_core::Result<Option<Instance>> {
        let row: Option<(String, String, String)> = sqlx::query_as(
            r#"
            SELECT id, agent_id, name FROM instances WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(|(id, agent_id, name)| Instance { id, agent_id, name }))
    }

    async fn get_agent(&self, id: &str) -> fleet_core::Result<Option<AgentRecord>> {
        let row: Option<AgentRow> = sqlx::query_as(
            r#"
            SELECT id, host_id, name, last_seen FROM agents WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(|r| r.into()))
    }

    async fn touch_agent(&self, id: &str) -> fleet_core::Result<()> {
        sqlx::query(
            r#"
            UPDATE agents SET last_seen = ?1 WHERE id = ?2
            "#,
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&*self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }
}

const RECORDING_COLUMNS: &str = "id, session_id, instance_id, container_id, user_id, username, \
     client_ip, shell, rows, cols, start_time, end_time, duration, format, storage_path, file_size";

#[async_trait]
impl RecordingStore for Database {
    async fn create_recording(&self, recording: &TerminalRecording) -> fleet_core::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO terminal_recordings
                (id, session_id, instance_id, container_id, user_id, username,
                 client_ip, shell, rows, cols, start_time, format)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(&recording.id)
        .bind(&recording.session_id)
        .bind(&recording.instance_id)
        .bind(&recording.container_id)
        .bind(&recording.user_id)
        .bind(&recording.username)
        .bind(&recording.client_ip)
        .bind(&recording.shell)
        .bind(recording.rows as i64)
        .bind(recording.cols as i64)
        .bind(recording.start_time)
        .bind(&recording.format)
        .execute(&*self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn get_recording(&self, id: &str) -> fleet_core::Result<Option<TerminalRecording>> {
        let row: Option<RecordingRow> = sqlx::query_as(&format!(
            "SELECT {} FROM terminal_recordings WHERE id = ?1",
            RECORDING_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(|r| r.into()))
    }

    async fn get_recording_by_session(
        &self,
        session_id: &str,
    ) -> fleet_core::Result<Option<TerminalRecording>> {
        let row: Option<RecordingRow> = sqlx::query_as(&format!(
            "SELECT {} FROM terminal_recordings WHERE session_id = ?1",
            RECORDING_COLUMNS
        ))
        .bind(session_id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(|r| r.into()))
    }

    async fn complete_recording(
        &self,
        id: &str,
        completion: &RecordingCompletion,
    ) -> fleet_core::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE terminal_recordings
            SET end_time = ?1, duration = ?2, storage_path = ?3, file_size = ?4
            WHERE id = ?5 AND end_time IS NULL
            "#,
        )
        .bind(completion.end_time)
        .bind(completion.duration)
        .bind(&completion.storage_path)
        .bind(completion.file_size)
        .bind(id)
        .execute(&*self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_recordings(
        &self,
        instance_id: Option<&str>,
        limit: i64,
    ) -> fleet_core::Result<Vec<TerminalRecording>> {
        let rows: Vec<RecordingRow> = match instance_id {
            Some(instance_id) => sqlx::query_as(&format!(
                "SELECT {} FROM terminal_recordings WHERE instance_id = ?1 \
                 ORDER BY start_time DESC LIMIT ?2",
                RECORDING_COLUMNS
            ))
            .bind(instance_id)
            .bind(limit)
            .fetch_all(&*self.pool)
            .await
            .map_err(db_err)?,
            None => sqlx::query_as(&format!(
                "SELECT {} FROM terminal_recordings ORDER BY start_time DESC LIMIT ?1",
                RECORDING_COLUMNS
            ))
            .bind(limit)
            .fetch_all(&*self.pool)
            .await
            .map_err(db_err)?,
        };

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }
}

#[derive(sqlx::FromRow)]
struct AgentRow {
    id: String,
    host_id: String,
    name: String,
    last_seen: DateTime<Utc>,
}

impl From<AgentRow> for AgentRecord {
    fn from(r: AgentRow) -> Self {
        AgentRecord {
            id: r.id,
            host_id: r.host_id,
            name: r.name,
            last_seen: r.last_seen,
        }
    }
}

#[derive(sqlx::FromRow)]
struct RecordingRow {
    id: String,
    session_id: String,
    instance_id: String,
    container_id: String,
    user_id: String,
    username: String,
    client_ip: Option<String>,
    shell: String,
    rows: i64,
    cols: i64,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    duration: Option<f64>,
    format: String,
    storage_path: Option<String>,
    file_size: Option<i64>,
}

impl From<RecordingRow> for TerminalRecording {
    fn from(r: RecordingRow) -> Self {
        TerminalRecording {
            id: r.id,
            session_id: r.session_id,
            instance_id: r.instance_id,
            container_id: r.container_id,
            user_id: r.user_id,
            username: r.username,
            client_ip: r.client_ip,
            shell: r.shell,
            rows: r.rows.clamp(0, u16::MAX as i64) as u16,
            cols: r.cols.clamp(0, u16::MAX as i64) as u16,
            start_time: r.start_time,
            end_time: r.end_time,
            duration: r.duration,
            format: r.format,
            storage_path: r.storage_path,
            file_size: r.file_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentEntry, InstanceEntry};

    fn sample_recording(id: &str, session_id: &str) -> TerminalRecording {
        TerminalRecording {
            id: id.to_string(),
            session_id: session_id.to_string(),
            instance_id: "inst-1".to_string(),
            container_id: "c1".to_string(),
            user_id: "u1".to_string(),
            username: "alice".to_string(),
            client_ip: Some("10.0.0.5".to_string()),
            shell: "/bin/sh".to_string(),
            rows: 24,
            cols: 80,
            start_time: Utc::now(),
            end_time: None,
            duration: None,
            format: fleet_core::RECORDING_FORMAT.to_string(),
            storage_path: None,
            file_size: None,
        }
    }

    #[tokio::test]
    async fn test_route_lookups() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let db = Database::new(&temp_dir.path().join("fleet.db")).await?;

        db.upsert_agent("agent-1", "host-1", "edge").await?;
        db.upsert_instance("inst-1", "agent-1", "docker-a").await?;

        let instance = db.get_instance("inst-1").await?.unwrap();
        assert_eq!(instance.agent_id, "agent-1");
        let agent = db.get_agent("agent-1").await?.unwrap();
        assert_eq!(agent.host_id, "host-1");
        assert!(db.get_instance("missing").await?.is_none());

        Ok(())
    }

    #[tokio::test]
    async fn test_seed_inventory_is_idempotent() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let db = Database::new(&temp_dir.path().join("fleet.db")).await?;

        let mut inventory = InventoryConfig {
            agents: vec![AgentEntry {
                id: "agent-1".into(),
                host_id: "host-1".into(),
                name: "edge".into(),
            }],
            instances: vec![InstanceEntry {
                id: "inst-1".into(),
                agent_id: "agent-1".into(),
                name: "docker-a".into(),
            }],
        };
        assert_eq!(db.seed_inventory(&inventory).await?, 2);

        // A restart with a moved agent rewrites the route
        inventory.agents[0].host_id = "host-2".into();
        db.seed_inventory(&inventory).await?;
        assert_eq!(db.get_agent("agent-1").await?.unwrap().host_id, "host-2");
        assert_eq!(db.get_instance("inst-1").await?.unwrap().agent_id, "agent-1");

        Ok(())
    }

    #[tokio::test]
    async fn test_completion_is_written_once() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let db = Database::new(&temp_dir.path().join("fleet.db")).await?;

        db.create_recording(&sample_recording("r1", "s1")).await?;
        let pending = db.get_recording_by_session("s1").await?.unwrap();
        assert!(!pending.is_finalized());
        assert_eq!(pending.rows, 24);

        let first = RecordingCompletion {
            end_time: Utc::now(),
            duration: 12.5,
            storage_path: "/rec/2026-01-01/r1.cast".to_string(),
            file_size: 2048,
        };
        assert!(db.complete_recording("r1", &first).await?);

        let second = RecordingCompletion {
            storage_path: "/elsewhere.cast".to_string(),
            file_size: 1,
            ..first.clone()
        };
        assert!(!db.complete_recording("r1", &second).await?);

        let done = db.get_recording("r1").await?.unwrap();
        assert_eq!(done.storage_path.as_deref(), Some("/rec/2026-01-01/r1.cast"));
        assert_eq!(done.file_size, Some(2048));
        assert_eq!(db.list_recordings(Some("inst-1"), 10).await?.len(), 1);
        assert!(db.list_recordings(Some("inst-2"), 10).await?.is_empty());

        Ok(())
    }
}
