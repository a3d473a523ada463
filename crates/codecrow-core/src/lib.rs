//! Codecrow Core - Branch health, RAG index tracking, and collaborator interfaces
//!
//! This crate holds the state-machine logic of the orchestration engine:
//! the per-branch health tracker that decides full-vs-delta analysis, the
//! per-project RAG index status tracker with incremental-failure
//! accounting, issue summary aggregation, and the narrow interfaces the
//! engine depends on (analysis backend, index backend, staleness probe,
//! durable stores).
//!
//! # Modules
//!
//! - [`health`] - Branch health transitions and scan-range decisions
//! - [`rag`] - RAG index status transitions and mode selection
//! - [`summary`] - Issue summary aggregation
//! - [`vcs`] - VCS connection configuration resolution
//! - [`traits`] - Collaborator interfaces
//! - [`persistence`] - SQLite and in-memory state stores

#![warn(missing_docs)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

pub mod health;
pub mod persistence;
pub mod rag;
pub mod summary;
pub mod traits;
pub mod vcs;

pub use health::*;
pub use persistence::*;
pub use rag::*;
pub use summary::*;
pub use traits::*;
pub use vcs::*;

use codecrow_protocol::ProjectId;
use thiserror::Error;

/// Core error type for the orchestration engine
///
/// Only configuration/addressing problems are errors at this boundary.
/// Analysis and indexing failures are absorbed into branch health and
/// index status transitions instead, so a single failed scan never
/// aborts the request cycle that triggered it.
#[derive(Debug, Error)]
pub enum CoreError {
    /// No VCS integration is configured for the project
    #[error("no VCS integration configured for project {0}")]
    ConfigNotFound(ProjectId),

    /// No health record exists and the branch is not known to exist
    #[error("branch {branch} not found for project {project}")]
    BranchNotFound {
        /// Project the lookup was for
        project: ProjectId,
        /// Branch that has no record
        branch: String,
    },

    /// Durable store operation failed
    #[error("storage error: {0}")]
    Storage(String),

    /// A persisted record violates a domain invariant
    #[error("invariant violation: {0}")]
    Invariant(String),
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::Storage(err.to_string())
    }
}

/// Result type alias using [`CoreError`]
pub type Result<T> = std::result::Result<T, CoreError>;
