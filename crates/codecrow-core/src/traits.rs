//! Collaborator interfaces
//!
//! The engine talks to the outside world through these narrow traits:
//! the actual scan, the actual RAG build, the freshness signal, and the
//! durable stores. Implementations (HTTP clients, vector databases,
//! JPA-backed services on the platform side) are out of scope here.
//!
//! Analysis and indexing failures are ordinary values, not `Err`: the
//! engine recovers them into health/status transitions, and a collabora-
//! tor timeout is indistinguishable from any other failure outcome.

use crate::Result;
use async_trait::async_trait;
use codecrow_protocol::{
    BranchHealth, Issue, IndexingMode, ProjectId, RagIndexStatus, ScanRange, VcsConnectionConfig,
};

/// Result of one analysis attempt
#[derive(Debug, Clone)]
pub enum AnalysisAttempt {
    /// The whole range was analyzed
    Completed {
        /// Issues found in the range
        issues: Vec<Issue>,
        /// Branch head the analysis reached
        head_commit_hash: String,
    },
    /// The attempt produced some issues before failing
    Partial {
        /// Issues found before the failure
        issues: Vec<Issue>,
        /// Head the attempt reached before failing, if known; informational
        /// only, the delta anchor moves on full success alone
        head_commit_hash: Option<String>,
        /// What went wrong
        error: String,
    },
    /// Nothing usable was produced
    Failed {
        /// What went wrong
        error: String,
    },
}

/// Result of one indexing attempt
#[derive(Debug, Clone)]
pub enum IndexAttempt {
    /// The index now matches the branch head
    Completed {
        /// Files covered by the pass
        files_indexed: u32,
        /// Commit the index corresponds to
        head_commit_hash: String,
    },
    /// The pass failed; the index is not to be trusted
    Failed {
        /// What went wrong
        error: String,
    },
}

/// The actual code analysis scan
#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    /// Analyze the given commit range of a branch
    async fn run_analysis(
        &self,
        config: &VcsConnectionConfig,
        branch: &str,
        range: &ScanRange,
    ) -> AnalysisAttempt;
}

/// The actual RAG index build
#[async_trait]
pub trait IndexBackend: Send + Sync {
    /// Build or update the vector index for a branch
    async fn build_index(
        &self,
        config: &VcsConnectionConfig,
        branch: &str,
        mode: IndexingMode,
        range: &ScanRange,
    ) -> IndexAttempt;
}

/// Source freshness signal for the INDEXED -> STALE transition
#[async_trait]
pub trait StalenessProbe: Send + Sync {
    /// Whether new commits exist beyond the indexed commit
    async fn detect_staleness(&self, project: ProjectId) -> anyhow::Result<bool>;
}

/// Durable store for per-branch health records
///
/// Updates are transactional per single entity; the persisted layout is
/// the externally readable record surfaced through the platform API.
#[async_trait]
pub trait BranchHealthStore: Send + Sync {
    /// Load the record for one branch, if it exists
    async fn load_branch_health(
        &self,
        project: ProjectId,
        branch: &str,
    ) -> Result<Option<BranchHealth>>;

    /// Create or replace the record for one branch
    async fn save_branch_health(&self, health: &BranchHealth) -> Result<()>;

    /// Delete all branch records of a project
    async fn delete_branch_health(&self, project: ProjectId) -> Result<()>;
}

/// Durable store for per-project RAG index status records
#[async_trait]
pub trait RagIndexStore: Send + Sync {
    /// Load the record for one project, if it exists
    async fn load_index_status(&self, project: ProjectId) -> Result<Option<RagIndexStatus>>;

    /// Create or replace the record for one project
    async fn save_index_status(&self, status: &RagIndexStatus) -> Result<()>;

    /// Delete the record of a project
    async fn delete_index_status(&self, project: ProjectId) -> Result<()>;
}

/// Lookup of the active VCS integration for a project
pub trait VcsConfigStore: Send + Sync {
    /// The active configuration, normalized, or `ConfigNotFound`
    fn resolve(&self, project: ProjectId) -> Result<VcsConnectionConfig>;

    /// Drop the integration of a deleted project
    fn remove(&self, project: ProjectId);
}
