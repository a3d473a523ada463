//! Event envelope, kinds, and payload variants

use chrono::{DateTime, Utc};
use codecrow_protocol::{
    AnalysisOutcome, HealthStatus, IndexingMode, IssuesSummary, ProjectId, ScanRange,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Discriminant for the event payload variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// An analysis pass started for a branch
    AnalysisStarted,
    /// An analysis pass completed successfully
    AnalysisCompleted,
    /// An analysis pass failed (partially or fully)
    AnalysisFailed,
    /// A RAG indexing pass started
    IndexingStarted,
    /// A RAG indexing pass completed successfully
    IndexingCompleted,
    /// A RAG indexing pass failed
    IndexingFailed,
    /// New commits were detected on the indexed branch
    IndexMarkedStale,
    /// A project and its tracked state were removed
    ProjectDeleted,
    /// A downstream notification should be produced
    NotificationRequested,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EventKind::AnalysisStarted => "analysis_started",
            EventKind::AnalysisCompleted => "analysis_completed",
            EventKind::AnalysisFailed => "analysis_failed",
            EventKind::IndexingStarted => "indexing_started",
            EventKind::IndexingCompleted => "indexing_completed",
            EventKind::IndexingFailed => "indexing_failed",
            EventKind::IndexMarkedStale => "index_marked_stale",
            EventKind::ProjectDeleted => "project_deleted",
            EventKind::NotificationRequested => "notification_requested",
        };
        write!(f, "{}", name)
    }
}

/// Payload carried by one event, one variant per [`EventKind`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventPayload {
    /// An analysis pass started
    AnalysisStarted {
        /// Project being analyzed
        project: ProjectId,
        /// Branch being analyzed
        branch: String,
        /// Range the pass will cover
        range: ScanRange,
    },
    /// An analysis pass completed successfully
    AnalysisCompleted {
        /// Project that was analyzed
        project: ProjectId,
        /// Branch that was analyzed
        branch: String,
        /// Head commit the analysis reached
        head_commit_hash: String,
        /// Severity/category counts of the produced issues
        summary: IssuesSummary,
        /// Health state after the success transition
        health: HealthStatus,
    },
    /// An analysis pass failed
    AnalysisFailed {
        /// Project that was analyzed
        project: ProjectId,
        /// Branch that was analyzed
        branch: String,
        /// Partial or full failure
        outcome: AnalysisOutcome,
        /// Failure streak after the transition
        consecutive_failures: u32,
        /// Health state after the failure transition
        health: HealthStatus,
    },
    /// A RAG indexing pass started
    IndexingStarted {
        /// Project being indexed
        project: ProjectId,
        /// Branch the index is built from
        branch: String,
        /// Full rebuild or incremental update
        mode: IndexingMode,
    },
    /// A RAG indexing pass completed
    IndexingCompleted {
        /// Project that was indexed
        project: ProjectId,
        /// Files covered by the pass
        files_indexed: u32,
        /// Commit the index now corresponds to
        head_commit_hash: String,
    },
    /// A RAG indexing pass failed
    IndexingFailed {
        /// Project the pass was for
        project: ProjectId,
        /// Mode of the failed pass
        mode: IndexingMode,
        /// Failure detail
        error: String,
        /// Incremental failure streak after the transition
        failed_incremental_count: u32,
    },
    /// The index fell behind its branch head
    IndexMarkedStale {
        /// Project whose index went stale
        project: ProjectId,
        /// Branch with new commits
        branch: String,
    },
    /// A project was removed along with its tracked state
    ProjectDeleted {
        /// The removed project
        project: ProjectId,
    },
    /// A downstream notification should be produced
    NotificationRequested {
        /// Project the notification concerns
        project: ProjectId,
        /// One-line subject
        subject: String,
        /// Human-readable body
        body: String,
    },
}

impl EventPayload {
    /// The kind discriminant for this payload
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::AnalysisStarted { .. } => EventKind::AnalysisStarted,
            EventPayload::AnalysisCompleted { .. } => EventKind::AnalysisCompleted,
            EventPayload::AnalysisFailed { .. } => EventKind::AnalysisFailed,
            EventPayload::IndexingStarted { .. } => EventKind::IndexingStarted,
            EventPayload::IndexingCompleted { .. } => EventKind::IndexingCompleted,
            EventPayload::IndexingFailed { .. } => EventKind::IndexingFailed,
            EventPayload::IndexMarkedStale { .. } => EventKind::IndexMarkedStale,
            EventPayload::ProjectDeleted { .. } => EventKind::ProjectDeleted,
            EventPayload::NotificationRequested { .. } => EventKind::NotificationRequested,
        }
    }

    /// Project the payload concerns
    pub fn project(&self) -> ProjectId {
        match self {
            EventPayload::AnalysisStarted { project, .. }
            | EventPayload::AnalysisCompleted { project, .. }
            | EventPayload::AnalysisFailed { project, .. }
            | EventPayload::IndexingStarted { project, .. }
            | EventPayload::IndexingCompleted { project, .. }
            | EventPayload::IndexingFailed { project, .. }
            | EventPayload::IndexMarkedStale { project, .. }
            | EventPayload::ProjectDeleted { project }
            | EventPayload::NotificationRequested { project, .. } => *project,
        }
    }
}

/// Immutable envelope for one emitted event
///
/// Root events get `correlation_id == event_id`; events emitted in
/// reaction to another event keep the parent's correlation id, forming a
/// reconstructable causal chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique id of this event
    pub event_id: Uuid,
    /// When the event was constructed
    pub timestamp: DateTime<Utc>,
    /// Id shared by all events of one causal chain
    pub correlation_id: Uuid,
    /// Payload discriminant
    pub kind: EventKind,
    /// Event data
    pub payload: EventPayload,
}

impl EventEnvelope {
    /// Build a root event; the correlation id defaults to the event id
    pub fn root(payload: EventPayload) -> Self {
        let event_id = Uuid::new_v4();
        Self {
            event_id,
            timestamp: Utc::now(),
            correlation_id: event_id,
            kind: payload.kind(),
            payload,
        }
    }

    /// Build an event caused by an existing correlation chain
    pub fn correlated(correlation_id: Uuid, payload: EventPayload) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            correlation_id,
            kind: payload.kind(),
            payload,
        }
    }
}
