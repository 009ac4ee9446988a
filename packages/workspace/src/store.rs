// ABOUTME: Durable project records and the workspace state transitions they persist
// ABOUTME: SQLite implementation of the ProjectStore trait with embedded migrations

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("Project not found: {0}")]
    NotFound(String),
    #[error("Invalid workspace status: {0}")]
    InvalidStatus(String),
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    Inactive,
    Active,
    Archiving,
}

impl WorkspaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Active => "active",
            Self::Archiving => "archiving",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "inactive" => Ok(Self::Inactive),
            "active" => Ok(Self::Active),
            "archiving" => Ok(Self::Archiving),
            _ => Err(StorageError::InvalidStatus(s.to_string())),
        }
    }
}

impl fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub id: String,
    pub user_id: i64,
    pub workspace_status: WorkspaceStatus,
    pub storage_link: Option<String>,
    pub last_heartbeat: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// State transitions the lifecycle controller persists.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn insert(
        &self,
        project_id: &str,
        user_id: i64,
        status: WorkspaceStatus,
    ) -> Result<Project>;

    async fn get(&self, project_id: &str) -> Result<Project>;

    async fn update_status(&self, project_id: &str, status: WorkspaceStatus) -> Result<()>;

    async fn update_heartbeat(&self, project_id: &str) -> Result<()>;

    async fn update_storage_link(&self, project_id: &str, key: &str) -> Result<()>;

    /// Active projects whose heartbeat is older than `timeout`.
    async fn find_stale(&self, timeout: Duration) -> Result<Vec<Project>>;
}

/// Fixed-width UTC form so that lexical order in SQLite equals time order.
pub fn encode_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn decode_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StorageError::InvalidTimestamp(raw.to_string()))
}

#[derive(Debug, Clone)]
pub struct SqliteProjectStore {
    pool: SqlitePool,
}

impl SqliteProjectStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect and bring the schema up to date.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Single-connection in-memory database, used by tests and dry runs.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Set the heartbeat to an explicit instant.
    pub async fn touch_at(&self, project_id: &str, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE projects
            SET last_heartbeat = ?1, updated_at = ?2
            WHERE uuid = ?3
            "#,
        )
        .bind(encode_timestamp(at))
        .bind(encode_timestamp(Utc::now()))
        .bind(project_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(project_id.to_string()));
        }
        Ok(())
    }

    fn row_to_project(row: SqliteRow) -> Result<Project> {
        Ok(Project {
            id: row.get("uuid"),
            user_id: row.get("user_id"),
            workspace_status: WorkspaceStatus::from_str(
                &row.get::<String, _>("workspace_status"),
            )?,
            storage_link: row.get("storage_link"),
            last_heartbeat: decode_timestamp(&row.get::<String, _>("last_heartbeat"))?,
            created_at: decode_timestamp(&row.get::<String, _>("created_at"))?,
            updated_at: decode_timestamp(&row.get::<String, _>("updated_at"))?,
        })
    }
}

#[async_trait]
impl ProjectStore for SqliteProjectStore {
    async fn insert(
        &self,
        project_id: &str,
        user_id: i64,
        status: WorkspaceStatus,
    ) -> Result<Project> {
        let now = encode_timestamp(Utc::now());

        sqlx::query(
            r#"
            INSERT INTO projects (uuid, user_id, workspace_status, last_heartbeat, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?4, ?4)
            "#,
        )
        .bind(project_id)
        .bind(user_id)
        .bind(status.as_str())
        .bind(&now)
        .execute(&self.pool)
        .await?;

        debug!("Inserted project {} for user {}", project_id, user_id);
        self.get(project_id).await
    }

    async fn get(&self, project_id: &str) -> Result<Project> {
        let row = sqlx::query(
            r#"
            SELECT uuid, user_id, workspace_status, storage_link,
                   last_heartbeat, created_at, updated_at
            FROM projects
            WHERE uuid = ?1
            "#,
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::row_to_project(row),
            None => Err(StorageError::NotFound(project_id.to_string())),
        }
    }

    async fn update_status(&self, project_id: &str, status: WorkspaceStatus) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE projects
            SET workspace_status = ?1, updated_at = ?2
            WHERE uuid = ?3
            "#,
        )
        .bind(status.as_str())
        .bind(encode_timestamp(Utc::now()))
        .bind(project_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(project_id.to_string()));
        }
        debug!("Project {} is now {}", project_id, status);
        Ok(())
    }

    async fn update_heartbeat(&self, project_id: &str) -> Result<()> {
        self.touch_at(project_id, Utc::now()).await
    }

    async fn update_storage_link(&self, project_id: &str, key: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE projects
            SET storage_link = ?1, updated_at = ?2
            WHERE uuid = ?3
            "#,
        )
        .bind(key)
        .bind(encode_timestamp(Utc::now()))
        .bind(project_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(project_id.to_string()));
        }
        Ok(())
    }

    async fn find_stale(&self, timeout: Duration) -> Result<Vec<Project>> {
        let timeout = chrono::Duration::from_std(timeout)
            .map_err(|_| StorageError::InvalidTimestamp(format!("{:?}", timeout)))?;
        let cutoff = Utc::now()
            .checked_sub_signed(timeout)
            .ok_or_else(|| StorageError::InvalidTimestamp(format!("now minus {}", timeout)))?;
        let cutoff = encode_timestamp(cutoff);

        let rows = sqlx::query(
            r#"
            SELECT uuid, user_id, workspace_status, storage_link,
                   last_heartbeat, created_at, updated_at
            FROM projects
            WHERE workspace_status = 'active' AND last_heartbeat < ?1
            ORDER BY last_heartbeat ASC
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_project).collect()
    }
}
