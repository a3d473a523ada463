//! RAG index status transitions and mode selection
//!
//! Pure transitions over [`RagIndexStatus`]. The incremental-failure cap
//! mirrors the branch-health escalation policy: once incremental updates
//! have failed often enough, the next attempt is forced to be a full
//! rebuild so incremental drift cannot compound silently.

use chrono::{DateTime, Utc};
use codecrow_protocol::{IndexState, IndexingMode, RagIndexStatus};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Escalation policy for incremental indexing failures
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IndexPolicy {
    /// Failed incremental attempts after which the next pass must be full
    pub max_incremental_failures: u32,
}

impl Default for IndexPolicy {
    fn default() -> Self {
        Self {
            max_incremental_failures: 5,
        }
    }
}

/// Choose full vs incremental for the next indexing pass
///
/// Incremental is only available when a previous pass committed an
/// indexed commit to diff against and the incremental failure streak is
/// still under the configured cap. `force_full` always wins.
pub fn choose_mode(status: &RagIndexStatus, force_full: bool, policy: &IndexPolicy) -> IndexingMode {
    if force_full {
        return IndexingMode::Full;
    }
    if status.failed_incremental_count >= policy.max_incremental_failures {
        return IndexingMode::Full;
    }
    match status.status {
        IndexState::Indexed | IndexState::Stale | IndexState::Failed
            if status.indexed_commit_hash.is_some() =>
        {
            IndexingMode::Incremental
        }
        _ => IndexingMode::Full,
    }
}

/// INDEXING transition: record the intended target, commit nothing yet
///
/// A leftover error from a previous failed pass is cleared here so the
/// error-iff-FAILED invariant holds while the pass is in flight.
pub fn begin_indexing(status: &mut RagIndexStatus, branch: &str) {
    status.status = IndexState::Indexing;
    status.indexed_branch = Some(branch.to_string());
    status.error_message = None;
    debug!(project = %status.project, branch, "indexing started");
}

/// INDEXING -> INDEXED: commit the pass and clear failure bookkeeping
pub fn complete_indexing(
    status: &mut RagIndexStatus,
    files_indexed: u32,
    head_commit_hash: &str,
    now: DateTime<Utc>,
) {
    status.status = IndexState::Indexed;
    status.indexed_commit_hash = Some(head_commit_hash.to_string());
    status.total_files_indexed = files_indexed;
    status.last_indexed_at = Some(now);
    status.error_message = None;
    status.failed_incremental_count = 0;
    debug!(
        project = %status.project,
        files_indexed,
        head_commit_hash,
        "indexing completed"
    );
}

/// INDEXING -> FAILED: record the error
///
/// Only incremental failures feed the escalation streak; a failed full
/// rebuild is a distinct condition that forcing another full rebuild
/// would not fix.
pub fn fail_indexing(status: &mut RagIndexStatus, error: &str, mode: IndexingMode) {
    status.status = IndexState::Failed;
    status.error_message = Some(error.to_string());
    if mode == IndexingMode::Incremental {
        status.failed_incremental_count += 1;
    }
    debug!(
        project = %status.project,
        %mode,
        failed_incremental_count = status.failed_incremental_count,
        "indexing failed"
    );
}

/// INDEXED -> STALE when new commits are detected on the indexed branch
///
/// Consumes the external freshness signal only; any other state is left
/// unchanged (an in-flight or failed index is already not fresh).
pub fn mark_stale(status: &mut RagIndexStatus) -> bool {
    if status.status == IndexState::Indexed {
        status.status = IndexState::Stale;
        debug!(project = %status.project, "index marked stale");
        true
    } else {
        false
    }
}

/// Check the error-iff-FAILED record invariant on a loaded row
///
/// `error_message` must be present iff the status is FAILED. A breach
/// means the store was modified outside the tracker.
pub fn check_invariant(status: &RagIndexStatus) -> std::result::Result<(), String> {
    let failed = status.status == IndexState::Failed;
    if failed != status.error_message.is_some() {
        return Err(format!(
            "project {}: error_message {} while status is {}",
            status.project,
            if status.error_message.is_some() {
                "set"
            } else {
                "missing"
            },
            status.status
        ));
    }
    Ok(())
}
