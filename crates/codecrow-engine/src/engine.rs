//! Orchestration engine
//!
//! Serializes state transitions per (project, branch) for health and per
//! project for indexing, absorbs analysis/indexing failures into state,
//! and publishes correlated events at each transition.

use chrono::Utc;
use codecrow_core::{
    apply_outcome, begin_indexing, check_invariant, choose_mode, complete_indexing,
    decide_scan_range, fail_indexing, mark_stale, summarize_issues, AnalysisAttempt,
    AnalysisBackend, BranchHealthStore, CoreError, HealthPolicy, IndexAttempt, IndexBackend,
    IndexPolicy, RagIndexStore, StalenessProbe, VcsConfigStore,
};
use codecrow_events::{EventBus, EventEnvelope, EventPayload};
use codecrow_protocol::{
    AnalysisOutcome, BranchHealth, HealthStatus, IndexState, IndexingMode, IssuesSummary,
    ProjectId, RagIndexStatus, ScanRange,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Symbolic branch head used in scan ranges before the backend pins one
const HEAD_REF: &str = "HEAD";

/// Engine-wide policy configuration
///
/// Both thresholds are deployment configuration; the trackers never
/// hard-code them.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Branch health escalation policy
    #[serde(default)]
    pub health: HealthPolicy,
    /// Incremental indexing escalation policy
    #[serde(default)]
    pub index: IndexPolicy,
}

/// Outcome of one orchestrated scan, returned to the trigger
#[derive(Debug, Clone)]
pub struct ScanReport {
    /// How the analysis attempt ended
    pub outcome: AnalysisOutcome,
    /// Counts over the issues the attempt produced
    pub summary: IssuesSummary,
    /// Branch health after the transition
    pub health: BranchHealth,
    /// Correlation id of the event chain this scan produced
    pub correlation_id: Uuid,
}

type BranchKey = (ProjectId, String);

/// The branch health & incremental-indexing orchestration engine
pub struct Engine {
    configs: Arc<dyn VcsConfigStore>,
    health_store: Arc<dyn BranchHealthStore>,
    index_store: Arc<dyn RagIndexStore>,
    analysis: Arc<dyn AnalysisBackend>,
    indexer: Arc<dyn IndexBackend>,
    staleness: Arc<dyn StalenessProbe>,
    bus: EventBus,
    config: EngineConfig,
    branch_locks: Mutex<HashMap<BranchKey, Arc<tokio::sync::Mutex<()>>>>,
    project_locks: Mutex<HashMap<ProjectId, Arc<tokio::sync::Mutex<()>>>>,
    indexing_in_flight: Arc<Mutex<HashSet<ProjectId>>>,
}

/// Removes a project from the in-flight set when the pass ends
struct InFlightGuard {
    set: Arc<Mutex<HashSet<ProjectId>>>,
    project: ProjectId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.lock().remove(&self.project);
    }
}

impl Engine {
    /// Build the engine from its collaborators
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        configs: Arc<dyn VcsConfigStore>,
        health_store: Arc<dyn BranchHealthStore>,
        index_store: Arc<dyn RagIndexStore>,
        analysis: Arc<dyn AnalysisBackend>,
        indexer: Arc<dyn IndexBackend>,
        staleness: Arc<dyn StalenessProbe>,
        bus: EventBus,
    ) -> Self {
        Self {
            configs,
            health_store,
            index_store,
            analysis,
            indexer,
            staleness,
            bus,
            config,
            branch_locks: Mutex::new(HashMap::new()),
            project_locks: Mutex::new(HashMap::new()),
            indexing_in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// The bus downstream consumers subscribe on
    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    fn branch_lock(&self, project: ProjectId, branch: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.branch_locks.lock();
        locks
            .entry((project, branch.to_string()))
            .or_default()
            .clone()
    }

    fn project_lock(&self, project: ProjectId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.project_locks.lock();
        locks.entry(project).or_default().clone()
    }

    /// Start tracking a known branch without analyzing it
    ///
    /// Creates the UNKNOWN health record if none exists, so later
    /// [`decide_scan_range`](Engine::decide_scan_range) calls succeed.
    pub async fn track_branch(
        &self,
        project: ProjectId,
        branch: &str,
    ) -> codecrow_core::Result<BranchHealth> {
        let lock = self.branch_lock(project, branch);
        let _guard = lock.lock().await;

        if let Some(existing) = self.health_store.load_branch_health(project, branch).await? {
            return Ok(existing);
        }
        let health = BranchHealth::new(project, branch);
        self.health_store.save_branch_health(&health).await?;
        Ok(health)
    }

    /// Commit range the next analysis pass for a branch should cover
    ///
    /// Fails with `BranchNotFound` when the branch has no health record
    /// at all; a record in UNKNOWN state is a known branch and decides
    /// to a full scan.
    pub async fn decide_scan_range(
        &self,
        project: ProjectId,
        branch: &str,
    ) -> codecrow_core::Result<ScanRange> {
        let health = self
            .health_store
            .load_branch_health(project, branch)
            .await?
            .ok_or_else(|| CoreError::BranchNotFound {
                project,
                branch: branch.to_string(),
            })?;
        Ok(decide_scan_range(&health, HEAD_REF))
    }

    /// Record an analysis outcome observed outside the engine
    ///
    /// Serialized per (project, branch). Creates the health record
    /// lazily on the first recorded attempt. The published completion
    /// event carries no issue counts; scans run through
    /// [`run_scan`](Engine::run_scan) publish the aggregated summary.
    pub async fn record_analysis_outcome(
        &self,
        project: ProjectId,
        branch: &str,
        outcome: AnalysisOutcome,
        new_head: Option<&str>,
        correlation: Option<Uuid>,
    ) -> codecrow_core::Result<BranchHealth> {
        let lock = self.branch_lock(project, branch);
        let _guard = lock.lock().await;

        let mut health = self
            .health_store
            .load_branch_health(project, branch)
            .await?
            .unwrap_or_else(|| BranchHealth::new(project, branch));

        let correlation = correlation.unwrap_or_else(Uuid::new_v4);
        self.apply_outcome_locked(
            &mut health,
            outcome,
            new_head,
            IssuesSummary::default(),
            correlation,
        )
        .await?;
        Ok(health)
    }

    /// Transition + persist + events for one outcome; caller holds the
    /// branch lock.
    async fn apply_outcome_locked(
        &self,
        health: &mut BranchHealth,
        outcome: AnalysisOutcome,
        new_head: Option<&str>,
        summary: IssuesSummary,
        correlation: Uuid,
    ) -> codecrow_core::Result<()> {
        let was_failing = health.health_status == HealthStatus::Failing;
        apply_outcome(health, outcome, new_head, Utc::now(), &self.config.health);
        self.health_store.save_branch_health(health).await?;

        let payload = if outcome.is_failure() {
            EventPayload::AnalysisFailed {
                project: health.project,
                branch: health.branch.clone(),
                outcome,
                consecutive_failures: health.consecutive_failures,
                health: health.health_status,
            }
        } else {
            EventPayload::AnalysisCompleted {
                project: health.project,
                branch: health.branch.clone(),
                head_commit_hash: health
                    .last_successful_commit_hash
                    .clone()
                    .unwrap_or_default(),
                summary,
                health: health.health_status,
            }
        };
        self.bus
            .publish(&EventEnvelope::correlated(correlation, payload))
            .await;

        if !was_failing && health.health_status == HealthStatus::Failing {
            self.bus
                .publish(&EventEnvelope::correlated(
                    correlation,
                    EventPayload::NotificationRequested {
                        project: health.project,
                        subject: format!("Branch {} is failing", health.branch),
                        body: format!(
                            "Branch {} of project {} reached {} consecutive failed analyses \
                             and was degraded to FAILING; the next pass will be a full scan.",
                            health.branch, health.project, health.consecutive_failures
                        ),
                    },
                ))
                .await;
        }
        Ok(())
    }

    /// Run one full analysis pass for a branch
    ///
    /// Resolves the VCS integration, picks the scan range under the
    /// branch key lock, runs the analysis backend, aggregates the
    /// issues, applies the health transition, and publishes the
    /// correlated lifecycle events. Analysis failures degrade the
    /// branch but do not fail this call; only a missing VCS integration
    /// does.
    #[instrument(skip(self), fields(%project, branch))]
    pub async fn run_scan(
        &self,
        project: ProjectId,
        branch: &str,
        correlation: Option<Uuid>,
    ) -> codecrow_core::Result<ScanReport> {
        let vcs_config = self.configs.resolve(project)?;
        info!(provider = vcs_config.provider_name(), "starting analysis pass");

        let lock = self.branch_lock(project, branch);
        let _guard = lock.lock().await;

        let mut health = self
            .health_store
            .load_branch_health(project, branch)
            .await?
            .unwrap_or_else(|| BranchHealth::new(project, branch));
        let range = decide_scan_range(&health, HEAD_REF);

        let started = match correlation {
            Some(parent) => EventEnvelope::correlated(
                parent,
                EventPayload::AnalysisStarted {
                    project,
                    branch: branch.to_string(),
                    range: range.clone(),
                },
            ),
            None => EventEnvelope::root(EventPayload::AnalysisStarted {
                project,
                branch: branch.to_string(),
                range: range.clone(),
            }),
        };
        let correlation = started.correlation_id;
        self.bus.publish(&started).await;

        let attempt = self.analysis.run_analysis(&vcs_config, branch, &range).await;
        let (outcome, summary, new_head) = match attempt {
            AnalysisAttempt::Completed {
                issues,
                head_commit_hash,
            } => (
                AnalysisOutcome::Success,
                summarize_issues(&issues),
                Some(head_commit_hash),
            ),
            AnalysisAttempt::Partial {
                issues,
                head_commit_hash,
                error,
            } => {
                warn!(
                    %project,
                    branch,
                    reached = head_commit_hash.as_deref().unwrap_or("unknown"),
                    "analysis partially failed: {error}"
                );
                (
                    AnalysisOutcome::PartialFailure,
                    summarize_issues(&issues),
                    None,
                )
            }
            AnalysisAttempt::Failed { error } => {
                warn!(%project, branch, "analysis failed: {error}");
                (AnalysisOutcome::FullFailure, IssuesSummary::default(), None)
            }
        };

        self.apply_outcome_locked(
            &mut health,
            outcome,
            new_head.as_deref(),
            summary,
            correlation,
        )
        .await?;
        drop(_guard);

        // The freshness signal is independent of how the attempt ended;
        // a degraded branch can still accumulate commits behind the index.
        self.refresh_staleness(project, correlation).await?;

        Ok(ScanReport {
            outcome,
            summary,
            health,
            correlation_id: correlation,
        })
    }

    /// Consume the freshness signal and flip INDEXED -> STALE
    ///
    /// A probe error is logged and treated as "not stale": a broken
    /// freshness signal must not flip state.
    async fn refresh_staleness(
        &self,
        project: ProjectId,
        correlation: Uuid,
    ) -> codecrow_core::Result<()> {
        let stale = match self.staleness.detect_staleness(project).await {
            Ok(stale) => stale,
            Err(err) => {
                warn!(%project, "staleness probe failed, assuming fresh: {err:#}");
                return Ok(());
            }
        };
        if !stale {
            return Ok(());
        }

        let lock = self.project_lock(project);
        let _guard = lock.lock().await;

        let Some(mut status) = self.index_store.load_index_status(project).await? else {
            return Ok(());
        };
        if mark_stale(&mut status) {
            self.index_store.save_index_status(&status).await?;
            self.bus
                .publish(&EventEnvelope::correlated(
                    correlation,
                    EventPayload::IndexMarkedStale {
                        project,
                        branch: status.indexed_branch.clone().unwrap_or_default(),
                    },
                ))
                .await;
        }
        Ok(())
    }

    /// Trigger a RAG indexing pass for a project
    ///
    /// At most one pass per project is ever in flight: a trigger that
    /// arrives while one is running coalesces into it and returns the
    /// in-flight snapshot. Otherwise the pass runs to exactly one
    /// terminal transition (INDEXED or FAILED); the incremental-failure
    /// cap forces a full rebuild once incremental drift has compounded.
    #[instrument(skip(self), fields(%project, branch, force_full))]
    pub async fn trigger_indexing(
        &self,
        project: ProjectId,
        branch: &str,
        force_full: bool,
        correlation: Option<Uuid>,
    ) -> codecrow_core::Result<RagIndexStatus> {
        let vcs_config = self.configs.resolve(project)?;

        // The set guard must not live across an await point.
        let coalesced = !self.indexing_in_flight.lock().insert(project);
        if coalesced {
            info!(%project, "indexing already in flight, coalescing trigger");
            let mut snapshot = self.current_index_status(project).await?;
            // The running pass may not have written its INDEXING row yet.
            if snapshot.status != IndexState::Indexing {
                snapshot.status = IndexState::Indexing;
                snapshot.error_message = None;
            }
            return Ok(snapshot);
        }
        let _in_flight = InFlightGuard {
            set: self.indexing_in_flight.clone(),
            project,
        };

        let lock = self.project_lock(project);
        let _guard = lock.lock().await;

        let mut status = self
            .index_store
            .load_index_status(project)
            .await?
            .unwrap_or_else(|| RagIndexStatus::new(project, default_collection_name(project)));

        let mode = choose_mode(&status, force_full, &self.config.index);
        let range = match (mode, &status.indexed_commit_hash) {
            (IndexingMode::Incremental, Some(anchor)) => ScanRange::Delta {
                from: anchor.clone(),
                to: HEAD_REF.to_string(),
            },
            _ => ScanRange::Full,
        };

        begin_indexing(&mut status, branch);
        self.index_store.save_index_status(&status).await?;

        let started = match correlation {
            Some(parent) => EventEnvelope::correlated(
                parent,
                EventPayload::IndexingStarted {
                    project,
                    branch: branch.to_string(),
                    mode,
                },
            ),
            None => EventEnvelope::root(EventPayload::IndexingStarted {
                project,
                branch: branch.to_string(),
                mode,
            }),
        };
        let correlation = started.correlation_id;
        self.bus.publish(&started).await;
        info!(%mode, %range, "indexing pass started");

        let attempt = self
            .indexer
            .build_index(&vcs_config, branch, mode, &range)
            .await;
        match attempt {
            IndexAttempt::Completed {
                files_indexed,
                head_commit_hash,
            } => {
                complete_indexing(&mut status, files_indexed, &head_commit_hash, Utc::now());
                self.index_store.save_index_status(&status).await?;
                self.bus
                    .publish(&EventEnvelope::correlated(
                        correlation,
                        EventPayload::IndexingCompleted {
                            project,
                            files_indexed,
                            head_commit_hash,
                        },
                    ))
                    .await;
            }
            IndexAttempt::Failed { error } => {
                warn!(%project, %mode, "indexing failed: {error}");
                fail_indexing(&mut status, &error, mode);
                self.index_store.save_index_status(&status).await?;
                self.bus
                    .publish(&EventEnvelope::correlated(
                        correlation,
                        EventPayload::IndexingFailed {
                            project,
                            mode,
                            error: error.clone(),
                            failed_incremental_count: status.failed_incremental_count,
                        },
                    ))
                    .await;
                self.bus
                    .publish(&EventEnvelope::correlated(
                        correlation,
                        EventPayload::NotificationRequested {
                            project,
                            subject: format!("Indexing failed for project {}", project),
                            body: error,
                        },
                    ))
                    .await;
            }
        }

        debug_assert!(check_invariant(&status).is_ok());
        Ok(status)
    }

    /// Snapshot of the current RAG index status
    ///
    /// Projects that were never indexed report a NOT_INDEXED record.
    pub async fn current_index_status(
        &self,
        project: ProjectId,
    ) -> codecrow_core::Result<RagIndexStatus> {
        Ok(self
            .index_store
            .load_index_status(project)
            .await?
            .unwrap_or_else(|| RagIndexStatus::new(project, default_collection_name(project))))
    }

    /// Remove every trace of a deleted project
    #[instrument(skip(self), fields(%project))]
    pub async fn remove_project(
        &self,
        project: ProjectId,
        correlation: Option<Uuid>,
    ) -> codecrow_core::Result<()> {
        let lock = self.project_lock(project);
        let _guard = lock.lock().await;

        self.health_store.delete_branch_health(project).await?;
        self.index_store.delete_index_status(project).await?;
        self.configs.remove(project);
        self.branch_locks.lock().retain(|(p, _), _| *p != project);
        self.project_locks.lock().remove(&project);

        let payload = EventPayload::ProjectDeleted { project };
        let event = match correlation {
            Some(parent) => EventEnvelope::correlated(parent, payload),
            None => EventEnvelope::root(payload),
        };
        self.bus.publish(&event).await;
        info!("project state removed");
        Ok(())
    }
}

fn default_collection_name(project: ProjectId) -> String {
    format!("codecrow-project-{}", project)
}
