//! End-to-end tests for the orchestration engine with scripted
//! collaborators and an in-memory store.

use async_trait::async_trait;
use codecrow_core::{
    AnalysisAttempt, AnalysisBackend, BranchHealthStore, CoreError, IndexAttempt, IndexBackend,
    MemoryStateStore, RagIndexStore, StalenessProbe, VcsConfigRegistry, VcsConfigStore,
};
use codecrow_engine::{Engine, EngineConfig};
use codecrow_events::{EventBus, EventEnvelope, EventHandler, EventKind};
use codecrow_protocol::{
    AnalysisOutcome, HealthStatus, IndexState, IndexingMode, Issue, IssueSeverity, ProjectId,
    RagIndexStatus, ScanRange, VcsConnectionConfig,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

const PROJECT: ProjectId = ProjectId(1);
const HEAD_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
const HEAD_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

fn completed(head: &str, issues: Vec<Issue>) -> AnalysisAttempt {
    AnalysisAttempt::Completed {
        issues,
        head_commit_hash: head.to_string(),
    }
}

fn security_issue() -> Issue {
    Issue {
        severity: IssueSeverity::High,
        category: Some("Security/OWASP".to_string()),
        title: "hardcoded credential".to_string(),
        file_path: Some("src/config.rs".to_string()),
        line_number: Some(17),
    }
}

/// Analysis backend that pops scripted attempts and records ranges.
#[derive(Default)]
struct ScriptedAnalysis {
    attempts: Mutex<VecDeque<AnalysisAttempt>>,
    ranges: Mutex<Vec<ScanRange>>,
}

impl ScriptedAnalysis {
    fn push(&self, attempt: AnalysisAttempt) {
        self.attempts.lock().push_back(attempt);
    }

    fn ranges(&self) -> Vec<ScanRange> {
        self.ranges.lock().clone()
    }
}

#[async_trait]
impl AnalysisBackend for ScriptedAnalysis {
    async fn run_analysis(
        &self,
        _config: &VcsConnectionConfig,
        _branch: &str,
        range: &ScanRange,
    ) -> AnalysisAttempt {
        self.ranges.lock().push(range.clone());
        self.attempts
            .lock()
            .pop_front()
            .unwrap_or_else(|| completed(HEAD_A, vec![]))
    }
}

/// Index backend that pops scripted attempts, records modes, and can be
/// gated so a pass stays in flight until the test releases it.
#[derive(Default)]
struct ScriptedIndexer {
    attempts: Mutex<VecDeque<IndexAttempt>>,
    modes: Mutex<Vec<IndexingMode>>,
    started: Notify,
    release: Notify,
    gated: Mutex<bool>,
}

impl ScriptedIndexer {
    fn push(&self, attempt: IndexAttempt) {
        self.attempts.lock().push_back(attempt);
    }

    fn modes(&self) -> Vec<IndexingMode> {
        self.modes.lock().clone()
    }

    fn gate(&self) {
        *self.gated.lock() = true;
    }
}

#[async_trait]
impl IndexBackend for ScriptedIndexer {
    async fn build_index(
        &self,
        _config: &VcsConnectionConfig,
        _branch: &str,
        mode: IndexingMode,
        _range: &ScanRange,
    ) -> IndexAttempt {
        self.modes.lock().push(mode);
        let gated = *self.gated.lock();
        if gated {
            self.started.notify_one();
            self.release.notified().await;
        }
        self.attempts.lock().pop_front().unwrap_or(IndexAttempt::Completed {
            files_indexed: 100,
            head_commit_hash: HEAD_A.to_string(),
        })
    }
}

/// Index store whose first save blocks until released, so a pass can be
/// frozen between claiming the in-flight slot and writing its row.
struct GatedIndexStore {
    inner: MemoryStateStore,
    armed: Mutex<bool>,
    started: Notify,
    release: Notify,
}

impl GatedIndexStore {
    fn new() -> Self {
        Self {
            inner: MemoryStateStore::new(),
            armed: Mutex::new(true),
            started: Notify::new(),
            release: Notify::new(),
        }
    }
}

#[async_trait]
impl RagIndexStore for GatedIndexStore {
    async fn load_index_status(
        &self,
        project: ProjectId,
    ) -> codecrow_core::Result<Option<RagIndexStatus>> {
        self.inner.load_index_status(project).await
    }

    async fn save_index_status(&self, status: &RagIndexStatus) -> codecrow_core::Result<()> {
        let armed = std::mem::take(&mut *self.armed.lock());
        if armed {
            self.started.notify_one();
            self.release.notified().await;
        }
        self.inner.save_index_status(status).await
    }

    async fn delete_index_status(&self, project: ProjectId) -> codecrow_core::Result<()> {
        self.inner.delete_index_status(project).await
    }
}

struct FixedProbe {
    stale: bool,
}

#[async_trait]
impl StalenessProbe for FixedProbe {
    async fn detect_staleness(&self, _project: ProjectId) -> anyhow::Result<bool> {
        Ok(self.stale)
    }
}

/// Records every delivered event.
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<EventEnvelope>>,
}

impl Recorder {
    fn events(&self) -> Vec<EventEnvelope> {
        self.events.lock().clone()
    }

    fn of_kind(&self, kind: EventKind) -> Vec<EventEnvelope> {
        self.events().into_iter().filter(|e| e.kind == kind).collect()
    }
}

#[async_trait]
impl EventHandler for Recorder {
    async fn handle(&self, event: EventEnvelope) -> anyhow::Result<()> {
        self.events.lock().push(event);
        Ok(())
    }
}

const ALL_KINDS: [EventKind; 9] = [
    EventKind::AnalysisStarted,
    EventKind::AnalysisCompleted,
    EventKind::AnalysisFailed,
    EventKind::IndexingStarted,
    EventKind::IndexingCompleted,
    EventKind::IndexingFailed,
    EventKind::IndexMarkedStale,
    EventKind::ProjectDeleted,
    EventKind::NotificationRequested,
];

struct Fixture {
    engine: Arc<Engine>,
    analysis: Arc<ScriptedAnalysis>,
    indexer: Arc<ScriptedIndexer>,
    recorder: Arc<Recorder>,
    store: MemoryStateStore,
    configs: Arc<VcsConfigRegistry>,
}

async fn fixture_with_probe(stale: bool) -> Fixture {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("codecrow=debug")
        .try_init();

    let configs = Arc::new(VcsConfigRegistry::new());
    let config: VcsConnectionConfig = serde_json::from_str(
        r#"{"provider":"gitlab","access_token":"glpat-test","group_id":"42"}"#,
    )
    .unwrap();
    configs.register(PROJECT, config);

    let store = MemoryStateStore::new();
    let analysis = Arc::new(ScriptedAnalysis::default());
    let indexer = Arc::new(ScriptedIndexer::default());
    let recorder = Arc::new(Recorder::default());

    let bus = EventBus::new();
    for kind in ALL_KINDS {
        bus.subscribe(kind, "recorder", recorder.clone()).await;
    }

    let engine = Arc::new(Engine::new(
        EngineConfig::default(),
        configs.clone(),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        analysis.clone(),
        indexer.clone(),
        Arc::new(FixedProbe { stale }),
        bus,
    ));

    Fixture {
        engine,
        analysis,
        indexer,
        recorder,
        store,
        configs,
    }
}

async fn fixture() -> Fixture {
    fixture_with_probe(false).await
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn first_scan_is_full_then_delta() {
    let fx = fixture().await;
    fx.analysis.push(completed(HEAD_A, vec![security_issue()]));
    fx.analysis.push(completed(HEAD_B, vec![]));

    let first = fx.engine.run_scan(PROJECT, "main", None).await.unwrap();
    assert_eq!(first.outcome, AnalysisOutcome::Success);
    assert_eq!(first.summary.total_issues, 1);
    assert_eq!(first.summary.high_count, 1);
    assert_eq!(first.summary.security_count, 1);
    assert_eq!(first.health.health_status, HealthStatus::Healthy);

    let second = fx.engine.run_scan(PROJECT, "main", None).await.unwrap();
    assert_eq!(
        second.health.last_successful_commit_hash.as_deref(),
        Some(HEAD_B)
    );

    assert_eq!(
        fx.analysis.ranges(),
        vec![
            ScanRange::Full,
            ScanRange::Delta {
                from: HEAD_A.to_string(),
                to: "HEAD".to_string(),
            },
        ]
    );
}

#[tokio::test]
async fn repeated_failures_escalate_and_force_a_full_rebaseline() {
    let fx = fixture().await;
    fx.analysis.push(completed(HEAD_A, vec![]));
    for _ in 0..3 {
        fx.analysis.push(AnalysisAttempt::Failed {
            error: "scanner timed out".to_string(),
        });
    }

    fx.engine.run_scan(PROJECT, "main", None).await.unwrap();
    for expected in 1..=3u32 {
        let report = fx.engine.run_scan(PROJECT, "main", None).await.unwrap();
        assert_eq!(report.health.consecutive_failures, expected);
        let expected_status = if expected >= 3 {
            HealthStatus::Failing
        } else {
            HealthStatus::Degraded
        };
        assert_eq!(report.health.health_status, expected_status);
        // The anchor survives every failure.
        assert_eq!(
            report.health.last_successful_commit_hash.as_deref(),
            Some(HEAD_A)
        );
    }

    // FAILING forces the next pass back to a full scan.
    fx.engine.run_scan(PROJECT, "main", None).await.unwrap();
    let ranges = fx.analysis.ranges();
    assert_eq!(ranges[0], ScanRange::Full);
    assert!(matches!(ranges[1], ScanRange::Delta { .. }));
    assert!(matches!(ranges[2], ScanRange::Delta { .. }));
    assert!(matches!(ranges[3], ScanRange::Delta { .. }));
    assert_eq!(ranges[4], ScanRange::Full);

    settle().await;
    let notifications = fx.recorder.of_kind(EventKind::NotificationRequested);
    assert_eq!(notifications.len(), 1, "one notification, on entering FAILING");
}

#[tokio::test]
async fn scan_events_share_one_correlation_chain() {
    let fx = fixture_with_probe(true).await;

    // An index that can go stale after the successful scan.
    fx.engine
        .trigger_indexing(PROJECT, "main", false, None)
        .await
        .unwrap();

    fx.analysis.push(completed(HEAD_A, vec![]));
    let report = fx.engine.run_scan(PROJECT, "main", None).await.unwrap();
    settle().await;

    let started = fx.recorder.of_kind(EventKind::AnalysisStarted);
    assert_eq!(started.len(), 1);
    // Root event: correlation id defaults to the event id.
    assert_eq!(started[0].correlation_id, started[0].event_id);
    assert_eq!(started[0].correlation_id, report.correlation_id);

    let completed = fx.recorder.of_kind(EventKind::AnalysisCompleted);
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].correlation_id, report.correlation_id);

    // The staleness reaction stays on the same causal chain.
    let stale = fx.recorder.of_kind(EventKind::IndexMarkedStale);
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].correlation_id, report.correlation_id);
    assert_ne!(stale[0].event_id, started[0].event_id);

    let status = fx.engine.current_index_status(PROJECT).await.unwrap();
    assert_eq!(status.status, IndexState::Stale);
}

#[tokio::test]
async fn caller_supplied_correlation_is_propagated() {
    let fx = fixture().await;
    let parent = uuid::Uuid::new_v4();

    fx.analysis.push(completed(HEAD_A, vec![]));
    let report = fx
        .engine
        .run_scan(PROJECT, "main", Some(parent))
        .await
        .unwrap();
    assert_eq!(report.correlation_id, parent);

    settle().await;
    for event in fx.recorder.events() {
        assert_eq!(event.correlation_id, parent);
    }
}

#[tokio::test]
async fn indexing_success_commits_the_pass() {
    let fx = fixture().await;
    fx.indexer.push(IndexAttempt::Completed {
        files_indexed: 345,
        head_commit_hash: HEAD_A.to_string(),
    });

    let status = fx
        .engine
        .trigger_indexing(PROJECT, "main", false, None)
        .await
        .unwrap();

    assert_eq!(status.status, IndexState::Indexed);
    assert_eq!(status.indexed_branch.as_deref(), Some("main"));
    assert_eq!(status.indexed_commit_hash.as_deref(), Some(HEAD_A));
    assert_eq!(status.total_files_indexed, 345);
    assert!(status.last_indexed_at.is_some());
    assert_eq!(status.error_message, None);
    assert_eq!(status.failed_incremental_count, 0);
    assert_eq!(fx.indexer.modes(), vec![IndexingMode::Full]);

    settle().await;
    assert_eq!(fx.recorder.of_kind(EventKind::IndexingStarted).len(), 1);
    assert_eq!(fx.recorder.of_kind(EventKind::IndexingCompleted).len(), 1);
}

#[tokio::test]
async fn incremental_failure_streak_forces_a_full_rebuild() {
    let fx = fixture().await;

    // Baseline index, then five failing incremental updates.
    fx.engine
        .trigger_indexing(PROJECT, "main", false, None)
        .await
        .unwrap();
    for run in 1..=5u32 {
        fx.indexer.push(IndexAttempt::Failed {
            error: "embedding service unavailable".to_string(),
        });
        let status = fx
            .engine
            .trigger_indexing(PROJECT, "main", false, None)
            .await
            .unwrap();
        assert_eq!(status.status, IndexState::Failed);
        assert_eq!(status.failed_incremental_count, run);
        assert_eq!(
            status.error_message.as_deref(),
            Some("embedding service unavailable")
        );
    }

    // Sixth trigger must be a full rebuild, and success clears the streak.
    let status = fx
        .engine
        .trigger_indexing(PROJECT, "main", false, None)
        .await
        .unwrap();
    assert_eq!(status.status, IndexState::Indexed);
    assert_eq!(status.failed_incremental_count, 0);

    let modes = fx.indexer.modes();
    assert_eq!(modes[0], IndexingMode::Full);
    assert_eq!(
        modes[1..6],
        [IndexingMode::Incremental; 5],
        "failures under the cap stay incremental"
    );
    assert_eq!(modes[6], IndexingMode::Full, "cap reached, full forced");
}

#[tokio::test]
async fn concurrent_triggers_coalesce_into_one_pass() {
    let fx = fixture().await;
    fx.indexer.gate();

    let engine = fx.engine.clone();
    let first = tokio::spawn(async move {
        engine
            .trigger_indexing(PROJECT, "main", false, None)
            .await
            .unwrap()
    });

    // Wait for the first pass to be inside the backend call.
    fx.indexer.started.notified().await;

    let second = fx
        .engine
        .trigger_indexing(PROJECT, "main", false, None)
        .await
        .unwrap();
    assert_eq!(second.status, IndexState::Indexing, "in-flight snapshot");

    fx.indexer.release.notify_one();
    let first = first.await.unwrap();
    assert_eq!(first.status, IndexState::Indexed);

    // Exactly one backend call and one terminal transition.
    assert_eq!(fx.indexer.modes().len(), 1);
    settle().await;
    assert_eq!(fx.recorder.of_kind(EventKind::IndexingStarted).len(), 1);
    assert_eq!(fx.recorder.of_kind(EventKind::IndexingCompleted).len(), 1);
    assert_eq!(fx.recorder.of_kind(EventKind::IndexingFailed).len(), 0);
}

#[tokio::test]
async fn failed_scan_still_consumes_the_freshness_signal() {
    let fx = fixture_with_probe(true).await;
    fx.engine
        .trigger_indexing(PROJECT, "main", false, None)
        .await
        .unwrap();

    fx.analysis.push(AnalysisAttempt::Partial {
        issues: vec![security_issue()],
        head_commit_hash: Some(HEAD_B.to_string()),
        error: "scanner crashed mid-range".to_string(),
    });
    let report = fx.engine.run_scan(PROJECT, "main", None).await.unwrap();
    assert_eq!(report.outcome, AnalysisOutcome::PartialFailure);
    assert_eq!(report.summary.total_issues, 1);
    // The head a partial attempt reached never becomes the delta anchor.
    assert_eq!(report.health.last_successful_commit_hash, None);

    // New commits flip the index to STALE even though the scan failed.
    let status = fx.engine.current_index_status(PROJECT).await.unwrap();
    assert_eq!(status.status, IndexState::Stale);
    settle().await;
    assert_eq!(fx.recorder.of_kind(EventKind::IndexMarkedStale).len(), 1);
}

#[tokio::test]
async fn coalesced_trigger_reports_indexing_before_the_row_lands() {
    let configs = Arc::new(VcsConfigRegistry::new());
    let config: VcsConnectionConfig = serde_json::from_str(
        r#"{"provider":"gitlab","access_token":"glpat-test","group_id":"42"}"#,
    )
    .unwrap();
    configs.register(PROJECT, config);

    let index_store = Arc::new(GatedIndexStore::new());
    let engine = Arc::new(Engine::new(
        EngineConfig::default(),
        configs,
        Arc::new(MemoryStateStore::new()),
        index_store.clone(),
        Arc::new(ScriptedAnalysis::default()),
        Arc::new(ScriptedIndexer::default()),
        Arc::new(FixedProbe { stale: false }),
        EventBus::new(),
    ));

    let running = engine.clone();
    let first = tokio::spawn(async move {
        running
            .trigger_indexing(PROJECT, "main", false, None)
            .await
            .unwrap()
    });

    // The pass holds the in-flight slot but its INDEXING row is unwritten.
    index_store.started.notified().await;
    let second = engine
        .trigger_indexing(PROJECT, "main", false, None)
        .await
        .unwrap();
    assert_eq!(second.status, IndexState::Indexing);

    index_store.release.notify_one();
    assert_eq!(first.await.unwrap().status, IndexState::Indexed);
}

#[tokio::test]
async fn concurrent_scans_of_one_branch_are_serialized() {
    let fx = fixture().await;
    fx.analysis.push(completed(HEAD_A, vec![]));
    fx.analysis.push(completed(HEAD_B, vec![]));

    let a = fx.engine.clone();
    let b = fx.engine.clone();
    let reports = futures::future::join_all([
        tokio::spawn(async move { a.run_scan(PROJECT, "main", None).await.unwrap() }),
        tokio::spawn(async move { b.run_scan(PROJECT, "main", None).await.unwrap() }),
    ])
    .await;
    for report in reports {
        assert_eq!(report.unwrap().outcome, AnalysisOutcome::Success);
    }

    // The second scan must see the first one's anchor, not race it.
    assert_eq!(
        fx.analysis.ranges(),
        vec![
            ScanRange::Full,
            ScanRange::Delta {
                from: HEAD_A.to_string(),
                to: "HEAD".to_string(),
            },
        ]
    );
}

#[tokio::test]
async fn missing_integration_is_fatal_to_the_trigger() {
    let fx = fixture().await;
    let err = fx
        .engine
        .run_scan(ProjectId(404), "main", None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ConfigNotFound(ProjectId(404))));

    let err = fx
        .engine
        .trigger_indexing(ProjectId(404), "main", false, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ConfigNotFound(ProjectId(404))));
}

#[tokio::test]
async fn unknown_branch_is_distinct_from_untracked_health() {
    let fx = fixture().await;

    let err = fx
        .engine
        .decide_scan_range(PROJECT, "feature/x")
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::BranchNotFound { .. }));

    // A tracked branch in UNKNOWN state is valid and scans fully.
    let health = fx.engine.track_branch(PROJECT, "feature/x").await.unwrap();
    assert_eq!(health.health_status, HealthStatus::Unknown);
    let range = fx
        .engine
        .decide_scan_range(PROJECT, "feature/x")
        .await
        .unwrap();
    assert_eq!(range, ScanRange::Full);
}

#[tokio::test]
async fn recorded_outcomes_drive_health_like_run_scan() {
    let fx = fixture().await;

    let health = fx
        .engine
        .record_analysis_outcome(PROJECT, "main", AnalysisOutcome::Success, Some(HEAD_A), None)
        .await
        .unwrap();
    assert_eq!(health.health_status, HealthStatus::Healthy);
    assert_eq!(health.last_successful_commit_hash.as_deref(), Some(HEAD_A));

    let health = fx
        .engine
        .record_analysis_outcome(PROJECT, "main", AnalysisOutcome::PartialFailure, None, None)
        .await
        .unwrap();
    assert_eq!(health.health_status, HealthStatus::Degraded);
    assert_eq!(health.consecutive_failures, 1);

    settle().await;
    assert_eq!(fx.recorder.of_kind(EventKind::AnalysisCompleted).len(), 1);
    assert_eq!(fx.recorder.of_kind(EventKind::AnalysisFailed).len(), 1);
}

#[tokio::test]
async fn remove_project_deletes_state_and_announces_it() {
    let fx = fixture().await;
    fx.analysis.push(completed(HEAD_A, vec![]));
    fx.engine.run_scan(PROJECT, "main", None).await.unwrap();
    fx.engine
        .trigger_indexing(PROJECT, "main", false, None)
        .await
        .unwrap();

    fx.engine.remove_project(PROJECT, None).await.unwrap();

    assert!(fx
        .store
        .load_branch_health(PROJECT, "main")
        .await
        .unwrap()
        .is_none());
    assert_eq!(
        fx.engine.current_index_status(PROJECT).await.unwrap().status,
        IndexState::NotIndexed
    );
    assert!(fx.configs.resolve(PROJECT).is_err());

    settle().await;
    assert_eq!(fx.recorder.of_kind(EventKind::ProjectDeleted).len(), 1);

    // Per-key locks were pruned with the project; a re-onboarded project
    // starts from scratch.
    let config: VcsConnectionConfig = serde_json::from_str(
        r#"{"provider":"gitlab","access_token":"glpat-new","group_id":"42"}"#,
    )
    .unwrap();
    fx.configs.register(PROJECT, config);
    let status = fx
        .engine
        .trigger_indexing(PROJECT, "main", false, None)
        .await
        .unwrap();
    assert_eq!(status.status, IndexState::Indexed);
    let report = fx.engine.run_scan(PROJECT, "main", None).await.unwrap();
    assert_eq!(report.health.health_status, HealthStatus::Healthy);
}
