//! Branch health transitions and scan-range decisions
//!
//! The tracker is a pure state machine over [`BranchHealth`]: analysis
//! outcomes move a branch between UNKNOWN, HEALTHY, DEGRADED, and
//! FAILING, and the current record decides whether the next analysis
//! pass is a cheap delta scan or a full re-baseline.

use chrono::{DateTime, Utc};
use codecrow_protocol::{AnalysisOutcome, BranchHealth, HealthStatus, ScanRange};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Escalation policy for consecutive analysis failures
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HealthPolicy {
    /// Consecutive failures at which a branch becomes FAILING
    ///
    /// Below this a failing branch is DEGRADED. The value is
    /// deployment configuration, not a property of the tracker.
    pub failing_threshold: u32,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            failing_threshold: 3,
        }
    }
}

/// Apply one analysis outcome to a branch health record
///
/// SUCCESS resets the failure streak, marks the branch HEALTHY, and
/// advances the delta anchor to `new_head`. Failures increment the
/// streak and degrade the branch; the anchor is left untouched so a
/// later delta scan still covers everything since the last success.
pub fn apply_outcome(
    health: &mut BranchHealth,
    outcome: AnalysisOutcome,
    new_head: Option<&str>,
    now: DateTime<Utc>,
    policy: &HealthPolicy,
) {
    match outcome {
        AnalysisOutcome::Success => {
            health.consecutive_failures = 0;
            health.health_status = HealthStatus::Healthy;
            if let Some(head) = new_head {
                health.last_successful_commit_hash = Some(head.to_string());
            }
        }
        AnalysisOutcome::PartialFailure | AnalysisOutcome::FullFailure => {
            health.consecutive_failures += 1;
            health.health_status = if health.consecutive_failures >= policy.failing_threshold {
                HealthStatus::Failing
            } else {
                HealthStatus::Degraded
            };
        }
    }
    health.last_health_check_at = Some(now);

    debug!(
        project = %health.project,
        branch = %health.branch,
        status = %health.health_status,
        consecutive_failures = health.consecutive_failures,
        "applied analysis outcome"
    );
}

/// Decide the commit range the next analysis pass should cover
///
/// Delta `(last_successful_commit_hash, head]` when an anchor exists and
/// the branch is not FAILING; otherwise a full scan. A FAILING branch is
/// forcibly re-baselined so unreviewed history cannot accumulate behind
/// a broken incremental state.
pub fn decide_scan_range(health: &BranchHealth, head: &str) -> ScanRange {
    match &health.last_successful_commit_hash {
        Some(anchor) if health.health_status != HealthStatus::Failing => ScanRange::Delta {
            from: anchor.clone(),
            to: head.to_string(),
        },
        _ => ScanRange::Full,
    }
}
