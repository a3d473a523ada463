//! SQLite and in-memory state stores
//!
//! The two durable records of the engine (branch health, RAG index
//! status) are stored with exactly their domain field sets, so the rows
//! double as the externally readable API surface and stay stable across
//! restarts. [`MemoryStateStore`] backs tests and embedders that manage
//! durability themselves.

use crate::rag::check_invariant;
use crate::traits::{BranchHealthStore, RagIndexStore};
use crate::{CoreError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use codecrow_protocol::{BranchHealth, HealthStatus, IndexState, ProjectId, RagIndexStatus};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// SQLite-backed store for the durable engine state
#[derive(Clone)]
pub struct SqliteStateStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStateStore {
    /// Open (and migrate) the store at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("opening state store at {:?}", path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::Storage(e.to_string()))?;
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::migrate(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory store (tests, throwaway embedders)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn migrate(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS branch_health (
                project_id INTEGER NOT NULL,
                branch TEXT NOT NULL,
                last_successful_commit_hash TEXT,
                health_status TEXT NOT NULL,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                last_health_check_at TEXT,
                PRIMARY KEY (project_id, branch)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS rag_index_status (
                project_id INTEGER PRIMARY KEY,
                status TEXT NOT NULL,
                indexed_branch TEXT,
                indexed_commit_hash TEXT,
                total_files_indexed INTEGER NOT NULL DEFAULT 0,
                last_indexed_at TEXT,
                error_message TEXT,
                collection_name TEXT NOT NULL,
                failed_incremental_count INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;

        Ok(())
    }
}

fn health_status_str(status: HealthStatus) -> &'static str {
    match status {
        HealthStatus::Unknown => "UNKNOWN",
        HealthStatus::Healthy => "HEALTHY",
        HealthStatus::Degraded => "DEGRADED",
        HealthStatus::Failing => "FAILING",
    }
}

fn parse_health_status(raw: &str) -> Result<HealthStatus> {
    match raw {
        "UNKNOWN" => Ok(HealthStatus::Unknown),
        "HEALTHY" => Ok(HealthStatus::Healthy),
        "DEGRADED" => Ok(HealthStatus::Degraded),
        "FAILING" => Ok(HealthStatus::Failing),
        other => Err(CoreError::Storage(format!(
            "unknown health status in store: {other}"
        ))),
    }
}

fn index_state_str(state: IndexState) -> &'static str {
    match state {
        IndexState::NotIndexed => "NOT_INDEXED",
        IndexState::Indexing => "INDEXING",
        IndexState::Indexed => "INDEXED",
        IndexState::Stale => "STALE",
        IndexState::Failed => "FAILED",
    }
}

fn parse_index_state(raw: &str) -> Result<IndexState> {
    match raw {
        "NOT_INDEXED" => Ok(IndexState::NotIndexed),
        "INDEXING" => Ok(IndexState::Indexing),
        "INDEXED" => Ok(IndexState::Indexed),
        "STALE" => Ok(IndexState::Stale),
        "FAILED" => Ok(IndexState::Failed),
        other => Err(CoreError::Storage(format!(
            "unknown index state in store: {other}"
        ))),
    }
}

fn parse_timestamp(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| CoreError::Storage(format!("bad timestamp in store: {e}")))
    })
    .transpose()
}

#[async_trait]
impl BranchHealthStore for SqliteStateStore {
    async fn load_branch_health(
        &self,
        project: ProjectId,
        branch: &str,
    ) -> Result<Option<BranchHealth>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT last_successful_commit_hash, health_status, consecutive_failures,
                        last_health_check_at
                 FROM branch_health WHERE project_id = ?1 AND branch = ?2",
                params![project.0, branch],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, u32>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(anchor, status, failures, checked_at)| -> Result<BranchHealth> {
            Ok(BranchHealth {
                project,
                branch: branch.to_string(),
                last_successful_commit_hash: anchor,
                health_status: parse_health_status(&status)?,
                consecutive_failures: failures,
                last_health_check_at: parse_timestamp(checked_at)?,
            })
        })
        .transpose()
    }

    async fn save_branch_health(&self, health: &BranchHealth) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO branch_health
                (project_id, branch, last_successful_commit_hash, health_status,
                 consecutive_failures, last_health_check_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                health.project.0,
                health.branch,
                health.last_successful_commit_hash,
                health_status_str(health.health_status),
                health.consecutive_failures,
                health.last_health_check_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    async fn delete_branch_health(&self, project: ProjectId) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM branch_health WHERE project_id = ?1",
            params![project.0],
        )?;
        Ok(())
    }
}

#[async_trait]
impl RagIndexStore for SqliteStateStore {
    async fn load_index_status(&self, project: ProjectId) -> Result<Option<RagIndexStatus>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT status, indexed_branch, indexed_commit_hash, total_files_indexed,
                        last_indexed_at, error_message, collection_name, failed_incremental_count
                 FROM rag_index_status WHERE project_id = ?1",
                params![project.0],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, u32>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, u32>(7)?,
                    ))
                },
            )
            .optional()?;

        row.map(
            |(status, branch, commit, files, indexed_at, error, collection, failed)| -> Result<RagIndexStatus> {
                let status = RagIndexStatus {
                    project,
                    status: parse_index_state(&status)?,
                    indexed_branch: branch,
                    indexed_commit_hash: commit,
                    total_files_indexed: files,
                    last_indexed_at: parse_timestamp(indexed_at)?,
                    error_message: error,
                    collection_name: collection,
                    failed_incremental_count: failed,
                };
                check_invariant(&status).map_err(CoreError::Invariant)?;
                Ok(status)
            },
        )
        .transpose()
    }

    async fn save_index_status(&self, status: &RagIndexStatus) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO rag_index_status
                (project_id, status, indexed_branch, indexed_commit_hash, total_files_indexed,
                 last_indexed_at, error_message, collection_name, failed_incremental_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                status.project.0,
                index_state_str(status.status),
                status.indexed_branch,
                status.indexed_commit_hash,
                status.total_files_indexed,
                status.last_indexed_at.map(|t| t.to_rfc3339()),
                status.error_message,
                status.collection_name,
                status.failed_incremental_count,
            ],
        )?;
        Ok(())
    }

    async fn delete_index_status(&self, project: ProjectId) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM rag_index_status WHERE project_id = ?1",
            params![project.0],
        )?;
        Ok(())
    }
}

/// In-memory store for tests and embedders without a database
#[derive(Default, Clone)]
pub struct MemoryStateStore {
    branches: Arc<Mutex<HashMap<(ProjectId, String), BranchHealth>>>,
    indexes: Arc<Mutex<HashMap<ProjectId, RagIndexStatus>>>,
}

impl MemoryStateStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BranchHealthStore for MemoryStateStore {
    async fn load_branch_health(
        &self,
        project: ProjectId,
        branch: &str,
    ) -> Result<Option<BranchHealth>> {
        Ok(self
            .branches
            .lock()
            .get(&(project, branch.to_string()))
            .cloned())
    }

    async fn save_branch_health(&self, health: &BranchHealth) -> Result<()> {
        self.branches
            .lock()
            .insert((health.project, health.branch.clone()), health.clone());
        Ok(())
    }

    async fn delete_branch_health(&self, project: ProjectId) -> Result<()> {
        self.branches.lock().retain(|(p, _), _| *p != project);
        Ok(())
    }
}

#[async_trait]
impl RagIndexStore for MemoryStateStore {
    async fn load_index_status(&self, project: ProjectId) -> Result<Option<RagIndexStatus>> {
        let status = self.indexes.lock().get(&project).cloned();
        if let Some(status) = &status {
            check_invariant(status).map_err(CoreError::Invariant)?;
        }
        Ok(status)
    }

    async fn save_index_status(&self, status: &RagIndexStatus) -> Result<()> {
        self.indexes.lock().insert(status.project, status.clone());
        Ok(())
    }

    async fn delete_index_status(&self, project: ProjectId) -> Result<()> {
        self.indexes.lock().remove(&project);
        Ok(())
    }
}
