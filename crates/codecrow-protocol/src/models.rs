//! Domain models for the Codecrow orchestration engine

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Public GitLab host used when a self-hosted base URL is not configured
pub const PUBLIC_GITLAB_HOST: &str = "https://gitlab.com";

/// Identifier of a project tracked by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub i64);

impl std::fmt::Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// VCS provider connection configuration for a project
///
/// A closed, tagged union: exactly one variant is active per project and
/// the discriminant is immutable once the project integration is created.
/// Re-authentication replaces the whole value, it never mutates in place.
///
/// Access tokens are held as [`SecretString`] and are never serialized;
/// configurations only deserialize (polymorphically, by the `provider`
/// tag) from the integration setup payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "provider")]
pub enum VcsConnectionConfig {
    /// GitHub (github.com) integration
    #[serde(rename = "github")]
    GitHub {
        /// Personal access token or installation token
        access_token: SecretString,
        /// Owner or organization scope the token is valid for
        owner: String,
    },
    /// GitLab integration, self-hosted or gitlab.com
    #[serde(rename = "gitlab")]
    GitLab {
        /// Group- or project-scoped access token
        access_token: SecretString,
        /// Group id the integration is rooted at
        group_id: String,
        /// Repositories within the group this integration may touch
        #[serde(default)]
        allowed_repos: HashSet<String>,
        /// Base URL for self-hosted instances; `None`/blank means gitlab.com
        #[serde(default)]
        base_url: Option<String>,
    },
    /// Bitbucket Cloud integration
    #[serde(rename = "bitbucket_cloud")]
    BitbucketCloud {
        /// Bitbucket username the app password belongs to
        username: String,
        /// App password used for API access
        app_password: SecretString,
        /// Workspace the integration is rooted at
        workspace: String,
    },
}

impl VcsConnectionConfig {
    /// Short provider name for logging and event payloads
    pub fn provider_name(&self) -> &'static str {
        match self {
            VcsConnectionConfig::GitHub { .. } => "github",
            VcsConnectionConfig::GitLab { .. } => "gitlab",
            VcsConnectionConfig::BitbucketCloud { .. } => "bitbucket_cloud",
        }
    }

    /// Effective API base URL for GitLab configurations
    ///
    /// Returns the configured `base_url` unless it is absent or blank, in
    /// which case the public GitLab host is returned. Non-GitLab variants
    /// return `None`; their API surface is fixed by the provider.
    pub fn effective_base_url(&self) -> Option<String> {
        match self {
            VcsConnectionConfig::GitLab { base_url, .. } => Some(
                base_url
                    .as_deref()
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .unwrap_or(PUBLIC_GITLAB_HOST)
                    .to_string(),
            ),
            _ => None,
        }
    }
}

/// Health state of a tracked branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    /// No analysis attempt recorded yet for a known branch
    Unknown,
    /// Last analysis succeeded
    Healthy,
    /// Failing, but below the configured escalation threshold
    Degraded,
    /// At or above the configured consecutive-failure threshold
    Failing,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Unknown => write!(f, "UNKNOWN"),
            HealthStatus::Healthy => write!(f, "HEALTHY"),
            HealthStatus::Degraded => write!(f, "DEGRADED"),
            HealthStatus::Failing => write!(f, "FAILING"),
        }
    }
}

/// Per-branch health record
///
/// Created lazily on the first analysis of a branch and mutated only by
/// the branch health tracker. `last_successful_commit_hash` is the delta
/// scan anchor: it is set on fully successful analyses only and is never
/// rolled back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchHealth {
    /// Owning project
    pub project: ProjectId,
    /// Branch name
    pub branch: String,
    /// 40-hex hash of the last fully analyzed commit, if any
    pub last_successful_commit_hash: Option<String>,
    /// Current health state
    pub health_status: HealthStatus,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// When the health record was last updated
    pub last_health_check_at: Option<DateTime<Utc>>,
}

impl BranchHealth {
    /// Create the initial record for a known branch
    pub fn new(project: ProjectId, branch: impl Into<String>) -> Self {
        Self {
            project,
            branch: branch.into(),
            last_successful_commit_hash: None,
            health_status: HealthStatus::Unknown,
            consecutive_failures: 0,
            last_health_check_at: None,
        }
    }
}

/// Freshness state of a project's RAG index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndexState {
    /// No indexing attempt recorded yet
    NotIndexed,
    /// An indexing pass is in flight
    Indexing,
    /// Index matches the recorded commit
    Indexed,
    /// New commits exist on the indexed branch
    Stale,
    /// The last indexing pass failed
    Failed,
}

impl std::fmt::Display for IndexState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexState::NotIndexed => write!(f, "NOT_INDEXED"),
            IndexState::Indexing => write!(f, "INDEXING"),
            IndexState::Indexed => write!(f, "INDEXED"),
            IndexState::Stale => write!(f, "STALE"),
            IndexState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Per-project RAG index status record
///
/// Invariant: `error_message` is present iff `status == Failed`, and
/// `failed_incremental_count` resets to zero on any successful indexing
/// pass, full or incremental.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RagIndexStatus {
    /// Owning project
    pub project: ProjectId,
    /// Current freshness state
    pub status: IndexState,
    /// Branch the index was (or is being) built from
    pub indexed_branch: Option<String>,
    /// Commit the index content corresponds to
    pub indexed_commit_hash: Option<String>,
    /// Files covered by the last successful pass
    pub total_files_indexed: u32,
    /// When the last successful pass finished
    pub last_indexed_at: Option<DateTime<Utc>>,
    /// Failure detail, present only while `status == Failed`
    pub error_message: Option<String>,
    /// Backing vector collection identifier
    pub collection_name: String,
    /// Consecutive failed incremental attempts since the last success
    pub failed_incremental_count: u32,
}

impl RagIndexStatus {
    /// Create the initial record for a project that has never been indexed
    pub fn new(project: ProjectId, collection_name: impl Into<String>) -> Self {
        Self {
            project,
            status: IndexState::NotIndexed,
            indexed_branch: None,
            indexed_commit_hash: None,
            total_files_indexed: 0,
            last_indexed_at: None,
            error_message: None,
            collection_name: collection_name.into(),
            failed_incremental_count: 0,
        }
    }
}

/// Severity of a review issue
///
/// The set is closed by contract with the analysis backend; values
/// outside it are an upstream contract violation, not handled here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueSeverity {
    /// Must be addressed before merge
    High,
    /// Should be addressed
    Medium,
    /// Minor issue
    Low,
}

impl std::fmt::Display for IssueSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IssueSeverity::High => write!(f, "HIGH"),
            IssueSeverity::Medium => write!(f, "MEDIUM"),
            IssueSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// A single issue produced by an analysis pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    /// Severity assigned by the analysis backend
    pub severity: IssueSeverity,
    /// Free-text category (e.g. "Security/OWASP"); may be absent
    pub category: Option<String>,
    /// One-line issue title
    pub title: String,
    /// File the issue was found in, if file-scoped
    pub file_path: Option<String>,
    /// Line number within the file, if line-scoped
    pub line_number: Option<u32>,
}

/// Severity and category counts derived from a finished issue set
///
/// Recomputed on demand; never persisted as its own entity. Category
/// counts use case-insensitive substring containment on the free-text
/// category, so one issue may count toward several categories; issues
/// without a category contribute to the total only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuesSummary {
    /// Total number of issues
    pub total_issues: u32,
    /// Issues with severity HIGH
    pub high_count: u32,
    /// Issues with severity MEDIUM
    pub medium_count: u32,
    /// Issues with severity LOW
    pub low_count: u32,
    /// Issues whose category mentions security
    pub security_count: u32,
    /// Issues whose category mentions quality
    pub quality_count: u32,
    /// Issues whose category mentions performance
    pub performance_count: u32,
    /// Issues whose category mentions style
    pub style_count: u32,
}

/// Commit range an analysis pass should cover
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScanRange {
    /// Analyze the whole branch from scratch
    Full,
    /// Analyze `(from, to]` only
    Delta {
        /// Last successfully analyzed commit (exclusive)
        from: String,
        /// Branch head to analyze up to (inclusive)
        to: String,
    },
}

impl std::fmt::Display for ScanRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanRange::Full => write!(f, "full"),
            ScanRange::Delta { from, to } => write!(f, "delta({}..{}]", from, to),
        }
    }
}

/// Outcome of one analysis attempt, as fed to the health tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisOutcome {
    /// The attempt completed fully
    Success,
    /// Some of the range was analyzed before the attempt failed
    PartialFailure,
    /// Nothing usable was produced (timeouts included)
    FullFailure,
}

impl AnalysisOutcome {
    /// Whether this outcome counts as a failure for health accounting
    pub fn is_failure(&self) -> bool {
        !matches!(self, AnalysisOutcome::Success)
    }
}

/// Mode of a RAG indexing pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndexingMode {
    /// Rebuild the collection from scratch
    Full,
    /// Update only files changed since the indexed commit
    Incremental,
}

impl std::fmt::Display for IndexingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexingMode::Full => write!(f, "FULL"),
            IndexingMode::Incremental => write!(f, "INCREMENTAL"),
        }
    }
}
