//! The finalization workflow.
//!
//! Each tick runs three journaled steps:
//!
//! ```text
//! select ──> NoCandidate | NotRipe | EmptyLog | Skipped      (terminal, benign)
//!   │
//!   └─ Ripe ──> claim ──> LostRace                            (terminal, benign)
//!                 │
//!                 └─ Won ──> forward ──> Delivered            (terminal)
//!                              │
//!                              └─ failed: pending for recovery, or Dropped
//! ```
//!
//! `select` scans for one device and evaluates it. `claim` deletes the log and
//! records the resulting snapshot, so a resumed workflow never claims twice
//! and never re-derives the snapshot from the store. Only `forward` is retried
//! after the claim.
//!
//! Any number of ticks may run at once, in this process or others sharing the
//! store. They do not coordinate; the claim decides which one owns a session.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::claim::{Claim, DeleteClaim};
use crate::coordinator::{ClaimRecord, Coordinator};
use crate::durable::{DurableRun, Journal, JournalError, RetryPolicy, WorkflowError, WorkflowStatus};
use crate::evaluate::{EvalError, SessionCandidate, SessionEvaluator};
use crate::log::{DeviceLogs, EventLog, KeyNamespace, StoreError};
use crate::scan::CandidateScanner;
use crate::sink::{SessionSnapshot, Sink};
use crate::types::DeviceId;

/// Lease taken on a workflow while an instance runs or replays it.
const DEFAULT_LEASE: TimeDelta = TimeDelta::minutes(5);

/// Journaled steps per finalization workflow.
const STEPS: u32 = 3;

/// Finalizer settings.
#[derive(Debug, Clone)]
pub struct FinalizerConfig {
    pub namespace: KeyNamespace,
    /// Minimum idle time before a session is finalized.
    pub session_delay: TimeDelta,
    pub retry: RetryPolicy,
    /// How long a run owns its workflow. The lease is not renewed, so it must
    /// outlast the slowest possible run; a run that overruns it can be
    /// replayed by another instance while still forwarding. See
    /// [`FinalizerConfig::lease_covering`].
    pub lease: TimeDelta,
}

impl FinalizerConfig {
    /// A lease that covers one run in which every step uses all of its
    /// attempts, each taking up to `attempt_timeout` plus the longest
    /// backoff. Never shorter than five minutes.
    pub fn lease_covering(retry: &RetryPolicy, attempt_timeout: Duration) -> TimeDelta {
        let per_attempt = attempt_timeout.saturating_add(retry.max_backoff);
        let worst_run = per_attempt.saturating_mul(retry.max_attempts.saturating_mul(STEPS));
        TimeDelta::from_std(worst_run).map_or(TimeDelta::MAX, |run| run.max(DEFAULT_LEASE))
    }
}

impl Default for FinalizerConfig {
    fn default() -> Self {
        Self {
            namespace: KeyNamespace::default(),
            session_delay: TimeDelta::seconds(30),
            retry: RetryPolicy::default(),
            lease: DEFAULT_LEASE,
        }
    }
}

/// Input recorded with each workflow so replays see the same tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickInput {
    /// The instant the tick was triggered for; ripeness is judged against it.
    pub now: DateTime<Utc>,
    /// Device examined by the previous tick, used as a scan hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<DeviceId>,
}

/// Checkpointed result of the `select` step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "selection", rename_all = "snake_case")]
pub enum Selection {
    NoCandidate,
    NotRipe { device_id: DeviceId },
    EmptyLog { device_id: DeviceId },
    /// The log holds a value that is not a timestamp. It stays in the store.
    Malformed { device_id: DeviceId, value: String },
    Ripe { candidate: SessionCandidate },
}

/// How a tick ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    NoCandidate,
    NotRipe { device_id: DeviceId },
    EmptyLog { device_id: DeviceId },
    Skipped { device_id: DeviceId },
    LostRace { device_id: DeviceId },
    Delivered { snapshot: SessionSnapshot },
}

impl TickOutcome {
    /// The device this tick examined, if any.
    pub const fn device(&self) -> Option<&DeviceId> {
        match self {
            Self::NoCandidate => None,
            Self::NotRipe { device_id }
            | Self::EmptyLog { device_id }
            | Self::Skipped { device_id }
            | Self::LostRace { device_id } => Some(device_id),
            Self::Delivered { snapshot } => Some(&snapshot.device_id),
        }
    }
}

impl fmt::Display for TickOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoCandidate => write!(f, "no candidate"),
            Self::NotRipe { device_id } => write!(f, "{device_id}: not ripe"),
            Self::EmptyLog { device_id } => write!(f, "{device_id}: empty log"),
            Self::Skipped { device_id } => write!(f, "{device_id}: skipped (malformed log)"),
            Self::LostRace { device_id } => write!(f, "{device_id}: lost race"),
            Self::Delivered { snapshot } => write!(
                f,
                "{}: delivered {} .. {}",
                snapshot.device_id,
                snapshot.session_start.to_rfc3339_opts(SecondsFormat::AutoSi, true),
                snapshot.session_end.to_rfc3339_opts(SecondsFormat::AutoSi, true)
            ),
        }
    }
}

/// A finished tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub workflow_id: String,
    pub outcome: TickOutcome,
}

/// Runs finalization ticks against injected store, sink and journal handles.
pub struct Finalizer {
    scanner: CandidateScanner,
    evaluator: SessionEvaluator,
    coordinator: Coordinator,
    sink: Arc<dyn Sink>,
    journal: Arc<dyn Journal>,
    retry: RetryPolicy,
    lease: TimeDelta,
    instance: String,
}

impl fmt::Debug for Finalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Finalizer")
            .field("instance", &self.instance)
            .field("session_delay", &self.evaluator.session_delay())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Finalizer {
    pub fn new(
        store: Arc<dyn EventLog>,
        sink: Arc<dyn Sink>,
        journal: Arc<dyn Journal>,
        config: FinalizerConfig,
    ) -> Self {
        let logs = DeviceLogs::new(store, config.namespace);
        let claim: Arc<dyn Claim> = Arc::new(DeleteClaim::new(logs.clone()));
        Self {
            scanner: CandidateScanner::new(logs.clone()),
            evaluator: SessionEvaluator::new(logs, config.session_delay),
            coordinator: Coordinator::new(claim, sink.clone()),
            sink,
            journal,
            retry: config.retry,
            lease: config.lease,
            instance: format!("finalizer-{}", Uuid::new_v4().simple()),
        }
    }

    /// Substitutes the claim capability (e.g. a lock service instead of
    /// delete-as-claim).
    #[must_use]
    pub fn with_claim(mut self, claim: Arc<dyn Claim>) -> Self {
        self.coordinator = Coordinator::new(claim, self.sink.clone());
        self
    }

    /// Identifies this finalizer as a lease owner in the journal.
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Starts a new workflow for a tick triggered at `now`.
    pub async fn tick(
        &self,
        now: DateTime<Utc>,
        cursor: Option<&DeviceId>,
    ) -> Result<TickReport, WorkflowError> {
        let workflow_id = format!(
            "tick-{}-{}",
            now.to_rfc3339_opts(SecondsFormat::Millis, true),
            Uuid::new_v4().simple()
        );
        let input = TickInput {
            now,
            cursor: cursor.cloned(),
        };
        let outcome = self.run(&workflow_id, &input).await?;
        Ok(TickReport {
            workflow_id,
            outcome,
        })
    }

    /// Runs or resumes `workflow_id`.
    ///
    /// A workflow that already exists keeps its recorded input; `input` is
    /// only used when the id is new.
    pub async fn run(
        &self,
        workflow_id: &str,
        input: &TickInput,
    ) -> Result<TickOutcome, WorkflowError> {
        let input = serde_json::to_value(input).map_err(|source| WorkflowError::Checkpoint {
            step: "input".to_string(),
            source,
        })?;
        let Some(record) = self
            .journal
            .acquire(workflow_id, &input, &self.instance, Utc::now(), self.lease)
            .await?
        else {
            return Err(WorkflowError::Unavailable(workflow_id.to_string()));
        };
        let input: TickInput =
            serde_json::from_value(record.input).map_err(|source| WorkflowError::Checkpoint {
                step: "input".to_string(),
                source,
            })?;

        let result = self.execute(workflow_id, &input).await;
        match &result {
            Ok(outcome) => {
                let detail = journal_detail(workflow_id, outcome);
                self.journal
                    .finish(workflow_id, WorkflowStatus::Completed, detail.as_ref())
                    .await?;
            }
            Err(WorkflowError::Dropped { snapshot, .. }) => {
                let detail = journal_detail(workflow_id, snapshot);
                self.journal
                    .finish(workflow_id, WorkflowStatus::Dropped, detail.as_ref())
                    .await?;
            }
            Err(err) => {
                tracing::warn!(workflow = workflow_id, error = %err, "workflow left pending for recovery");
                if let Err(release) = self.journal.release(workflow_id, &self.instance).await {
                    tracing::warn!(workflow = workflow_id, error = %release, "failed to release workflow lease");
                }
            }
        }
        result
    }

    /// Resumes every pending workflow not leased by another live instance.
    pub async fn recover(
        &self,
    ) -> Result<Vec<(String, Result<TickOutcome, WorkflowError>)>, JournalError> {
        let pending = self.journal.list(WorkflowStatus::Pending).await?;
        let mut results = Vec::with_capacity(pending.len());
        for record in pending {
            let input = match serde_json::from_value::<TickInput>(record.input.clone()) {
                Ok(input) => input,
                Err(err) => {
                    tracing::warn!(workflow = %record.id, error = %err, "pending workflow has unreadable input");
                    continue;
                }
            };
            match self.run(&record.id, &input).await {
                Err(WorkflowError::Unavailable(_)) => {
                    tracing::debug!(workflow = %record.id, "pending workflow is leased elsewhere");
                }
                result => {
                    tracing::info!(workflow = %record.id, ok = result.is_ok(), "recovered workflow");
                    results.push((record.id, result));
                }
            }
        }
        Ok(results)
    }

    /// Forgets completed workflows last updated before `before`.
    pub async fn prune(&self, before: DateTime<Utc>) -> Result<usize, JournalError> {
        let removed = self.journal.prune(before).await?;
        if removed > 0 {
            tracing::info!(removed, before = %before, "pruned completed workflows");
        }
        Ok(removed)
    }

    /// Scans for one device and evaluates it at `input.now`.
    pub async fn select(&self, input: &TickInput) -> Result<Selection, StoreError> {
        let Some(device) = self.scanner.scan_one(input.cursor.as_ref()).await? else {
            tracing::debug!("no device logs to examine");
            return Ok(Selection::NoCandidate);
        };
        match self.evaluator.evaluate(&device, input.now).await {
            Ok(candidate) => Ok(Selection::Ripe { candidate }),
            Err(EvalError::NotRipe { device, idle, delay }) => {
                tracing::debug!(%device, %idle, %delay, "session not ripe");
                Ok(Selection::NotRipe { device_id: device })
            }
            Err(EvalError::EmptyLog { device }) => {
                tracing::info!(%device, "device log emptied before evaluation");
                Ok(Selection::EmptyLog { device_id: device })
            }
            Err(EvalError::MalformedTimestamp {
                device,
                value,
                source,
            }) => {
                tracing::warn!(
                    %device,
                    %value,
                    error = %source,
                    "skipping device log with malformed timestamp; left in place for inspection"
                );
                Ok(Selection::Malformed {
                    device_id: device,
                    value,
                })
            }
            Err(EvalError::Store(err)) => Err(err),
        }
    }

    async fn execute(
        &self,
        workflow_id: &str,
        input: &TickInput,
    ) -> Result<TickOutcome, WorkflowError> {
        let mut run = DurableRun::new(self.journal.as_ref(), workflow_id, self.retry);

        let candidate = match run.step("select", || self.select(input)).await? {
            Selection::Ripe { candidate } => candidate,
            Selection::NoCandidate => return Ok(TickOutcome::NoCandidate),
            Selection::NotRipe { device_id } => return Ok(TickOutcome::NotRipe { device_id }),
            Selection::EmptyLog { device_id } => return Ok(TickOutcome::EmptyLog { device_id }),
            Selection::Malformed { device_id, .. } => {
                return Ok(TickOutcome::Skipped { device_id });
            }
        };

        let claimed = run
            .step("claim", || self.coordinator.claim(&candidate))
            .await?;
        let snapshot = match claimed {
            ClaimRecord::Won { snapshot } => snapshot,
            ClaimRecord::LostRace => {
                return Ok(TickOutcome::LostRace {
                    device_id: candidate.device_id,
                });
            }
        };

        let forwarded = run
            .step("forward", || self.coordinator.forward(&snapshot))
            .await;
        match forwarded {
            Ok(ack) => {
                tracing::info!(
                    workflow = workflow_id,
                    device = %snapshot.device_id,
                    ack = %ack.detail,
                    "session delivered"
                );
                Ok(TickOutcome::Delivered { snapshot })
            }
            Err(WorkflowError::Sink(source)) if source.is_permanent() => {
                tracing::error!(
                    target: "sessionizer::dropped",
                    workflow = workflow_id,
                    device = %snapshot.device_id,
                    session_start = %snapshot.session_start,
                    session_end = %snapshot.session_end,
                    error = %source,
                    "snapshot dropped after claim"
                );
                Err(WorkflowError::Dropped { snapshot, source })
            }
            Err(err) => Err(err),
        }
    }
}

/// Serializes a terminal detail; a failure leaves the workflow without one.
fn journal_detail<T: Serialize>(workflow_id: &str, detail: &T) -> Option<serde_json::Value> {
    match serde_json::to_value(detail) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(workflow = workflow_id, error = %err, "could not serialize workflow detail");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use tokio::sync::Barrier;

    use crate::claim::ClaimOutcome;
    use crate::durable::MemoryJournal;
    use crate::event::Event;
    use crate::ingest::Ingestor;
    use crate::memory::MemoryEventLog;
    use crate::sink::{MemorySink, SinkError};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + TimeDelta::seconds(secs)
    }

    fn device(id: &str) -> DeviceId {
        DeviceId::new(id).unwrap()
    }

    struct Fixture {
        store: Arc<MemoryEventLog>,
        sink: Arc<MemorySink>,
        journal: Arc<MemoryJournal>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(MemoryEventLog::new()),
                sink: Arc::new(MemorySink::new()),
                journal: Arc::new(MemoryJournal::new()),
            }
        }

        fn finalizer(&self) -> Finalizer {
            let config = FinalizerConfig {
                retry: RetryPolicy::none(),
                ..FinalizerConfig::default()
            };
            Finalizer::new(
                self.store.clone(),
                self.sink.clone(),
                self.journal.clone(),
                config,
            )
        }

        fn logs(&self) -> DeviceLogs {
            DeviceLogs::new(self.store.clone(), KeyNamespace::default())
        }

        async fn ingest(&self, id: &str, secs: &[i64]) {
            let events: Vec<Event> = secs.iter().map(|s| Event::new(device(id), t(*s))).collect();
            Ingestor::new(self.logs()).ingest(&events).await.unwrap();
        }
    }

    /// Holds every claimant at a barrier so they all contend at once.
    struct GatedClaim {
        inner: DeleteClaim,
        gate: Barrier,
    }

    #[async_trait]
    impl Claim for GatedClaim {
        async fn claim(&self, candidate: &SessionCandidate) -> Result<ClaimOutcome, StoreError> {
            self.gate.wait().await;
            self.inner.claim(candidate).await
        }
    }

    /// Fails the first claim attempt with an outage.
    struct FlakyClaim {
        inner: DeleteClaim,
        failed: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl Claim for FlakyClaim {
        async fn claim(&self, candidate: &SessionCandidate) -> Result<ClaimOutcome, StoreError> {
            if !self.failed.swap(true, std::sync::atomic::Ordering::SeqCst) {
                return Err(StoreError::Unavailable("claim timed out".into()));
            }
            self.inner.claim(candidate).await
        }
    }

    #[tokio::test]
    async fn tick_finalizes_only_after_session_delay() {
        let fx = Fixture::new();
        fx.ingest("m1", &[0, 1, 2]).await;
        let finalizer = fx.finalizer();

        let early = finalizer.tick(t(5), None).await.unwrap();
        assert_eq!(
            early.outcome,
            TickOutcome::NotRipe {
                device_id: device("m1")
            }
        );
        assert_eq!(fx.store.keys(), vec!["device:m1".to_string()]);

        let late = finalizer.tick(t(35), None).await.unwrap();
        let expected = SessionSnapshot {
            device_id: device("m1"),
            session_start: t(0),
            session_end: t(2),
        };
        assert_eq!(
            late.outcome,
            TickOutcome::Delivered {
                snapshot: expected.clone()
            }
        );
        assert!(fx.store.keys().is_empty());
        assert_eq!(fx.sink.delivered(), vec![expected]);

        let done = fx.journal.get(&late.workflow_id).await.unwrap().unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn empty_store_ends_with_no_candidate() {
        let fx = Fixture::new();
        let report = fx.finalizer().tick(t(0), None).await.unwrap();
        assert_eq!(report.outcome, TickOutcome::NoCandidate);
        assert_eq!(report.outcome.device(), None);
    }

    #[tokio::test]
    async fn malformed_log_is_skipped_and_kept() {
        let fx = Fixture::new();
        fx.store.append("device:m1", "half past").await.unwrap();

        let report = fx.finalizer().tick(t(100), None).await.unwrap();

        assert_eq!(
            report.outcome,
            TickOutcome::Skipped {
                device_id: device("m1")
            }
        );
        assert_eq!(fx.store.value_count(), 1);
    }

    #[tokio::test]
    async fn cursor_moves_past_a_stuck_device() {
        let fx = Fixture::new();
        fx.store.append("device:a", "half past").await.unwrap();
        fx.ingest("b", &[0]).await;
        let finalizer = fx.finalizer();

        let first = finalizer.tick(t(100), None).await.unwrap();
        assert_eq!(first.outcome.device(), Some(&device("a")));
        let second = finalizer
            .tick(t(100), first.outcome.device())
            .await
            .unwrap();
        assert!(matches!(second.outcome, TickOutcome::Delivered { .. }));
    }

    #[tokio::test]
    async fn concurrent_ticks_on_one_device_deliver_once() {
        let fx = Fixture::new();
        fx.ingest("m1", &[0, 1, 2]).await;
        let gated: Arc<dyn Claim> = Arc::new(GatedClaim {
            inner: DeleteClaim::new(fx.logs()),
            gate: Barrier::new(2),
        });
        let a = fx.finalizer().with_claim(gated.clone());
        let b = fx.finalizer().with_claim(gated);

        let (ra, rb) = tokio::join!(a.tick(t(35), None), b.tick(t(35), None));
        let mut outcomes = [ra.unwrap().outcome, rb.unwrap().outcome];
        outcomes.sort_by_key(|o| matches!(o, TickOutcome::Delivered { .. }));

        assert_eq!(
            outcomes[0],
            TickOutcome::LostRace {
                device_id: device("m1")
            }
        );
        assert!(matches!(outcomes[1], TickOutcome::Delivered { .. }));
        assert_eq!(fx.sink.delivered().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn many_instances_deliver_each_session_once() {
        let fx = Fixture::new();
        for id in ["m1", "m2", "m3", "m4"] {
            fx.ingest(id, &[0, 1]).await;
        }
        let finalizers: Vec<Arc<Finalizer>> = (0..8).map(|_| Arc::new(fx.finalizer())).collect();

        let mut handles = Vec::new();
        for finalizer in finalizers {
            handles.push(tokio::spawn(async move {
                let mut cursor: Option<DeviceId> = None;
                for _ in 0..10 {
                    let report = finalizer.tick(t(60), cursor.as_ref()).await.unwrap();
                    cursor = report.outcome.device().cloned();
                    if report.outcome == TickOutcome::NoCandidate {
                        break;
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut delivered: Vec<String> = fx
            .sink
            .delivered()
            .into_iter()
            .map(|s| s.device_id.to_string())
            .collect();
        delivered.sort();
        assert_eq!(delivered, vec!["m1", "m2", "m3", "m4"]);
        assert!(fx.store.keys().is_empty());
    }

    #[tokio::test]
    async fn forward_failure_resumes_without_reclaiming() {
        let fx = Fixture::new();
        fx.ingest("m1", &[0, 2]).await;
        fx.sink.fail_next(SinkError::Unavailable("connection refused".into()));
        let finalizer = fx.finalizer();

        let err = finalizer.tick(t(35), None).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Sink(SinkError::Unavailable(_))));
        assert!(fx.store.keys().is_empty());
        assert_eq!(fx.journal.list(WorkflowStatus::Pending).await.unwrap().len(), 1);

        let recovered = finalizer.recover().await.unwrap();
        assert_eq!(recovered.len(), 1);
        let outcome = recovered[0].1.as_ref().unwrap();
        assert!(matches!(outcome, TickOutcome::Delivered { snapshot } if snapshot.session_end == t(2)));
        assert_eq!(fx.sink.delivered().len(), 1);
        assert!(fx.journal.list(WorkflowStatus::Pending).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claim_failure_resumes_with_recorded_selection() {
        let fx = Fixture::new();
        fx.ingest("m5", &[0]).await;
        let flaky: Arc<dyn Claim> = Arc::new(FlakyClaim {
            inner: DeleteClaim::new(fx.logs()),
            failed: std::sync::atomic::AtomicBool::new(false),
        });
        let finalizer = fx.finalizer().with_claim(flaky);

        let err = finalizer.tick(t(35), None).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Store(_)));

        // A fresh scan would now pick m1 first; the replay must stick with m5.
        fx.ingest("m1", &[0]).await;
        let recovered = finalizer.recover().await.unwrap();
        let outcome = recovered[0].1.as_ref().unwrap();
        assert_eq!(outcome.device(), Some(&device("m5")));
        assert_eq!(fx.store.keys(), vec!["device:m1".to_string()]);
    }

    #[tokio::test]
    async fn transient_forward_failures_are_retried_in_place() {
        let fx = Fixture::new();
        fx.ingest("m1", &[0]).await;
        fx.sink.fail_next(SinkError::Unavailable("503".into()));
        let config = FinalizerConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(1),
            },
            ..FinalizerConfig::default()
        };
        let finalizer = Finalizer::new(fx.store.clone(), fx.sink.clone(), fx.journal.clone(), config);

        let report = finalizer.tick(t(35), None).await.unwrap();
        assert!(matches!(report.outcome, TickOutcome::Delivered { .. }));
    }

    #[tokio::test]
    async fn permanent_forward_failure_is_recorded_as_dropped() {
        let fx = Fixture::new();
        fx.ingest("m1", &[0]).await;
        fx.sink.fail_next(SinkError::Rejected("422 unprocessable".into()));

        let err = fx.finalizer().tick(t(35), None).await.unwrap_err();

        let WorkflowError::Dropped { snapshot, .. } = err else {
            panic!("expected dropped snapshot, got {err:?}");
        };
        assert_eq!(snapshot.device_id, device("m1"));
        let dropped = fx.journal.list(WorkflowStatus::Dropped).await.unwrap();
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].detail, Some(serde_json::to_value(&snapshot).unwrap()));
        assert!(fx.journal.list(WorkflowStatus::Pending).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn finished_workflow_cannot_be_rerun() {
        let fx = Fixture::new();
        let finalizer = fx.finalizer();
        let report = finalizer.tick(t(0), None).await.unwrap();

        let input = TickInput {
            now: t(0),
            cursor: None,
        };
        let err = finalizer.run(&report.workflow_id, &input).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Unavailable(_)));
    }

    #[test]
    fn lease_covers_the_slowest_run() {
        let retry = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        };
        assert_eq!(
            FinalizerConfig::lease_covering(&retry, Duration::from_secs(10)),
            TimeDelta::minutes(5)
        );
        assert_eq!(
            FinalizerConfig::lease_covering(&retry, Duration::from_secs(60)),
            TimeDelta::seconds(3 * 3 * 65)
        );
        assert_eq!(
            FinalizerConfig::lease_covering(&retry, Duration::MAX),
            TimeDelta::MAX
        );
    }

    #[tokio::test]
    async fn stale_selection_does_not_claim_a_newer_session() {
        let fx = Fixture::new();
        fx.ingest("m1", &[0, 1, 2]).await;
        let flaky: Arc<dyn Claim> = Arc::new(FlakyClaim {
            inner: DeleteClaim::new(fx.logs()),
            failed: std::sync::atomic::AtomicBool::new(false),
        });
        let stalled = fx.finalizer().with_claim(flaky);
        assert!(stalled.tick(t(35), None).await.is_err());

        let other = fx.finalizer().tick(t(35), None).await.unwrap();
        assert!(matches!(other.outcome, TickOutcome::Delivered { .. }));
        fx.ingest("m1", &[100]).await;

        let recovered = stalled.recover().await.unwrap();
        assert_eq!(
            recovered[0].1.as_ref().unwrap(),
            &TickOutcome::LostRace {
                device_id: device("m1")
            }
        );
        assert_eq!(fx.sink.delivered().len(), 1);
        assert_eq!(fx.store.value_count(), 1);
    }

    #[test]
    fn unserializable_detail_is_stored_as_null() {
        let unserializable = std::collections::BTreeMap::from([(vec![1_u8], "x")]);
        assert_eq!(journal_detail("wf", &unserializable), None);
        assert_eq!(
            journal_detail("wf", &device("m1")),
            Some(serde_json::Value::String("m1".into()))
        );
    }

    #[test]
    fn outcome_display_is_readable() {
        let outcome = TickOutcome::Delivered {
            snapshot: SessionSnapshot {
                device_id: device("m1"),
                session_start: t(0),
                session_end: t(2),
            },
        };
        assert_eq!(
            outcome.to_string(),
            "m1: delivered 2025-01-01T00:00:00Z .. 2025-01-01T00:00:02Z"
        );
    }
}
