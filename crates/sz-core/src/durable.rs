//! Checkpointed workflow execution.
//!
//! A workflow is an ordered series of steps. Each step's output is written to
//! a [`Journal`] before the next step starts; when a workflow is run again
//! under the same id, recorded steps return their stored output instead of
//! running. Failed steps are never recorded, so a resumed workflow retries
//! exactly the step that failed.
//!
//! The journal also hands out a time-limited lease per workflow so two
//! processes do not replay the same workflow at once. Leases only guard
//! replay of a single workflow id; they are not a lock on device logs.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::log::StoreError;
use crate::sink::{SessionSnapshot, SinkError};

/// Lifecycle of a journaled workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Started and not yet finished; eligible for recovery.
    Pending,
    /// Reached a terminal outcome.
    Completed,
    /// Claimed a session whose snapshot the sink permanently refused.
    Dropped,
}

impl WorkflowStatus {
    /// Returns the string representation for storage.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Dropped => "dropped",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "dropped" => Ok(Self::Dropped),
            _ => Err(format!("invalid workflow status: {s}")),
        }
    }
}

/// A journaled workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowRecord {
    pub id: String,
    pub status: WorkflowStatus,
    /// Input the workflow was started with; replays reuse it.
    pub input: Value,
    /// Terminal detail (outcome, or the dropped snapshot).
    pub detail: Option<Value>,
    pub owner: Option<String>,
    pub lease_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A recorded step output.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub name: String,
    pub output: Value,
}

/// Journal errors.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal unavailable: {0}")]
    Unavailable(String),
    #[error("journal error: {0}")]
    Backend(String),
    #[error("workflow {0} is not journaled")]
    UnknownWorkflow(String),
    /// Someone else recorded this step first.
    #[error("step {index} of workflow {workflow_id} is already recorded")]
    StepConflict { workflow_id: String, index: u32 },
}

/// Durable storage for workflow progress.
#[async_trait]
pub trait Journal: Send + Sync {
    /// Starts or resumes `workflow_id` on behalf of `owner`.
    ///
    /// An unknown id is created as [`WorkflowStatus::Pending`] with `input`.
    /// Returns the record when `owner` now holds the lease until
    /// `now + lease`; returns `None` when the workflow is finished or another
    /// owner holds an unexpired lease.
    async fn acquire(
        &self,
        workflow_id: &str,
        input: &Value,
        owner: &str,
        now: DateTime<Utc>,
        lease: TimeDelta,
    ) -> Result<Option<WorkflowRecord>, JournalError>;

    /// Gives up `owner`'s lease without finishing the workflow.
    async fn release(&self, workflow_id: &str, owner: &str) -> Result<(), JournalError>;

    async fn step_output(
        &self,
        workflow_id: &str,
        index: u32,
    ) -> Result<Option<StepRecord>, JournalError>;

    /// Records a step output. Fails with [`JournalError::StepConflict`] if the
    /// step is already recorded.
    async fn record_step(
        &self,
        workflow_id: &str,
        index: u32,
        name: &str,
        output: &Value,
    ) -> Result<(), JournalError>;

    /// Moves the workflow to a terminal status and clears its lease.
    async fn finish(
        &self,
        workflow_id: &str,
        status: WorkflowStatus,
        detail: Option<&Value>,
    ) -> Result<(), JournalError>;

    async fn get(&self, workflow_id: &str) -> Result<Option<WorkflowRecord>, JournalError>;

    /// Workflows in `status`, oldest first.
    async fn list(&self, status: WorkflowStatus) -> Result<Vec<WorkflowRecord>, JournalError>;

    /// Deletes [`WorkflowStatus::Completed`] workflows last updated before
    /// `before`, with their steps, and returns how many were removed.
    ///
    /// Pending and dropped workflows are kept whatever their age.
    async fn prune(&self, before: DateTime<Utc>) -> Result<usize, JournalError>;
}

/// `9999-12-31T23:59:59.999999Z`, the last instant with a four-digit year.
const LATEST_LEASE_END_MICROS: i64 = 253_402_300_799_999_999;

/// End of a lease taken at `now`, saturating at the end of year 9999 so it
/// still fits a plain RFC 3339 timestamp.
pub fn lease_until(now: DateTime<Utc>, lease: TimeDelta) -> DateTime<Utc> {
    let latest = DateTime::from_timestamp_micros(LATEST_LEASE_END_MICROS)
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    now.checked_add_signed(lease).map_or(latest, |end| end.min(latest))
}

/// Errors whose failed operation may succeed if simply tried again.
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

impl Retryable for StoreError {
    fn is_transient(&self) -> bool {
        Self::is_transient(self)
    }
}

impl Retryable for SinkError {
    fn is_transient(&self) -> bool {
        Self::is_transient(self)
    }
}

/// How often and how patiently a step retries transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per step, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before the attempt following failed attempt number `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1_u32 << attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Workflow execution errors.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error("checkpoint for step {step} is not valid: {source}")]
    Checkpoint {
        step: String,
        #[source]
        source: serde_json::Error,
    },
    /// The recorded step at this position has a different name than the one
    /// being run; the workflow definition changed under a pending workflow.
    #[error("workflow {workflow_id} diverged at step {index}: recorded {recorded:?}, running {running:?}")]
    Diverged {
        workflow_id: String,
        index: u32,
        recorded: String,
        running: String,
    },
    /// Another instance holds the workflow's lease, or it already finished.
    #[error("workflow {0} is not available to this instance")]
    Unavailable(String),
    /// The session was claimed and the sink refused it for good.
    #[error("snapshot for {} dropped after claim: {source}", snapshot.device_id)]
    Dropped {
        snapshot: SessionSnapshot,
        #[source]
        source: SinkError,
    },
}

/// One execution of a journaled workflow.
pub struct DurableRun<'a> {
    journal: &'a dyn Journal,
    workflow_id: &'a str,
    retry: RetryPolicy,
    next_step: u32,
}

impl fmt::Debug for DurableRun<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DurableRun")
            .field("workflow_id", &self.workflow_id)
            .field("next_step", &self.next_step)
            .finish_non_exhaustive()
    }
}

impl<'a> DurableRun<'a> {
    pub const fn new(journal: &'a dyn Journal, workflow_id: &'a str, retry: RetryPolicy) -> Self {
        Self {
            journal,
            workflow_id,
            retry,
            next_step: 0,
        }
    }

    pub const fn workflow_id(&self) -> &str {
        self.workflow_id
    }

    /// Runs the next step, or returns its recorded output when replaying.
    ///
    /// Transient failures are retried per the run's [`RetryPolicy`]. Any other
    /// failure, or the last transient one, is returned unrecorded.
    pub async fn step<T, E, F, Fut>(&mut self, name: &'static str, mut op: F) -> Result<T, WorkflowError>
    where
        T: Serialize + DeserializeOwned,
        E: Retryable + fmt::Display + Into<WorkflowError>,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let index = self.next_step;
        self.next_step += 1;

        if let Some(record) = self.journal.step_output(self.workflow_id, index).await? {
            if record.name != name {
                return Err(WorkflowError::Diverged {
                    workflow_id: self.workflow_id.to_string(),
                    index,
                    recorded: record.name,
                    running: name.to_string(),
                });
            }
            tracing::debug!(workflow = self.workflow_id, step = name, "replaying recorded step");
            return serde_json::from_value(record.output).map_err(|source| {
                WorkflowError::Checkpoint {
                    step: name.to_string(),
                    source,
                }
            });
        }

        let mut attempt = 1;
        let value = loop {
            match op().await {
                Ok(value) => break value,
                Err(err) if err.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    tracing::warn!(
                        workflow = self.workflow_id,
                        step = name,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "transient step failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        };

        let output = serde_json::to_value(&value).map_err(|source| WorkflowError::Checkpoint {
            step: name.to_string(),
            source,
        })?;
        self.journal
            .record_step(self.workflow_id, index, name, &output)
            .await?;
        Ok(value)
    }
}

#[derive(Debug)]
struct JournalEntry {
    record: WorkflowRecord,
    steps: BTreeMap<u32, StepRecord>,
}

/// A [`Journal`] that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    entries: Mutex<HashMap<String, JournalEntry>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, JournalEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Journal for MemoryJournal {
    async fn acquire(
        &self,
        workflow_id: &str,
        input: &Value,
        owner: &str,
        now: DateTime<Utc>,
        lease: TimeDelta,
    ) -> Result<Option<WorkflowRecord>, JournalError> {
        let mut entries = self.entries();
        let entry = entries
            .entry(workflow_id.to_string())
            .or_insert_with(|| JournalEntry {
                record: WorkflowRecord {
                    id: workflow_id.to_string(),
                    status: WorkflowStatus::Pending,
                    input: input.clone(),
                    detail: None,
                    owner: None,
                    lease_until: None,
                    created_at: now,
                    updated_at: now,
                },
                steps: BTreeMap::new(),
            });
        let record = &mut entry.record;
        if record.status != WorkflowStatus::Pending {
            return Ok(None);
        }
        let free = match (&record.owner, record.lease_until) {
            (Some(holder), Some(until)) => holder == owner || until <= now,
            _ => true,
        };
        if !free {
            return Ok(None);
        }
        record.owner = Some(owner.to_string());
        record.lease_until = Some(lease_until(now, lease));
        record.updated_at = now;
        Ok(Some(record.clone()))
    }

    async fn release(&self, workflow_id: &str, owner: &str) -> Result<(), JournalError> {
        if let Some(entry) = self.entries().get_mut(workflow_id) {
            if entry.record.owner.as_deref() == Some(owner) {
                entry.record.owner = None;
                entry.record.lease_until = None;
            }
        }
        Ok(())
    }

    async fn step_output(
        &self,
        workflow_id: &str,
        index: u32,
    ) -> Result<Option<StepRecord>, JournalError> {
        Ok(self
            .entries()
            .get(workflow_id)
            .and_then(|entry| entry.steps.get(&index).cloned()))
    }

    async fn record_step(
        &self,
        workflow_id: &str,
        index: u32,
        name: &str,
        output: &Value,
    ) -> Result<(), JournalError> {
        let mut entries = self.entries();
        let entry = entries
            .get_mut(workflow_id)
            .ok_or_else(|| JournalError::UnknownWorkflow(workflow_id.to_string()))?;
        if entry.steps.contains_key(&index) {
            return Err(JournalError::StepConflict {
                workflow_id: workflow_id.to_string(),
                index,
            });
        }
        entry.steps.insert(
            index,
            StepRecord {
                name: name.to_string(),
                output: output.clone(),
            },
        );
        Ok(())
    }

    async fn finish(
        &self,
        workflow_id: &str,
        status: WorkflowStatus,
        detail: Option<&Value>,
    ) -> Result<(), JournalError> {
        let mut entries = self.entries();
        let entry = entries
            .get_mut(workflow_id)
            .ok_or_else(|| JournalError::UnknownWorkflow(workflow_id.to_string()))?;
        entry.record.status = status;
        entry.record.detail = detail.cloned();
        entry.record.owner = None;
        entry.record.lease_until = None;
        entry.record.updated_at = Utc::now();
        Ok(())
    }

    async fn get(&self, workflow_id: &str) -> Result<Option<WorkflowRecord>, JournalError> {
        Ok(self
            .entries()
            .get(workflow_id)
            .map(|entry| entry.record.clone()))
    }

    async fn list(&self, status: WorkflowStatus) -> Result<Vec<WorkflowRecord>, JournalError> {
        let mut records: Vec<WorkflowRecord> = self
            .entries()
            .values()
            .filter(|entry| entry.record.status == status)
            .map(|entry| entry.record.clone())
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn prune(&self, before: DateTime<Utc>) -> Result<usize, JournalError> {
        let mut entries = self.entries();
        let count = entries.len();
        entries.retain(|_, entry| {
            entry.record.status != WorkflowStatus::Completed || entry.record.updated_at >= before
        });
        Ok(count - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};

    use chrono::TimeZone;
    use serde_json::json;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + TimeDelta::seconds(secs)
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    async fn started(journal: &MemoryJournal, id: &str) {
        journal
            .acquire(id, &json!({}), "me", t(0), TimeDelta::seconds(60))
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(40), Duration::from_millis(350));
    }

    #[test]
    fn status_round_trips_strings() {
        for status in [
            WorkflowStatus::Pending,
            WorkflowStatus::Completed,
            WorkflowStatus::Dropped,
        ] {
            assert_eq!(status.as_str().parse::<WorkflowStatus>(), Ok(status));
        }
        assert!("done".parse::<WorkflowStatus>().is_err());
    }

    #[tokio::test]
    async fn recorded_step_is_not_rerun() {
        let journal = MemoryJournal::new();
        started(&journal, "wf").await;
        let calls = AtomicU32::new(0);

        for _ in 0..2 {
            let mut run = DurableRun::new(&journal, "wf", RetryPolicy::none());
            let value: u32 = run
                .step("count", || async {
                    Ok::<_, StoreError>(calls.fetch_add(1, Ordering::SeqCst) + 10)
                })
                .await
                .unwrap();
            assert_eq!(value, 10);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_then_recorded() {
        let journal = MemoryJournal::new();
        started(&journal, "wf").await;
        let calls = AtomicU32::new(0);

        let mut run = DurableRun::new(&journal, "wf", fast_retry(3));
        let value: String = run
            .step("flaky", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StoreError::Unavailable("blip".into()))
                } else {
                    Ok("done".to_string())
                }
            })
            .await
            .unwrap();

        assert_eq!(value, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let record = journal.step_output("wf", 0).await.unwrap().unwrap();
        assert_eq!(record.output, json!("done"));
    }

    #[tokio::test]
    async fn failures_are_not_recorded() {
        let journal = MemoryJournal::new();
        started(&journal, "wf").await;
        let calls = AtomicU32::new(0);

        let mut run = DurableRun::new(&journal, "wf", fast_retry(5));
        let result: Result<u32, _> = run
            .step("broken", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Backend("constraint".into()))
            })
            .await;

        assert!(matches!(result, Err(WorkflowError::Store(StoreError::Backend(_)))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(journal.step_output("wf", 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn exhausted_retries_return_last_error() {
        let journal = MemoryJournal::new();
        started(&journal, "wf").await;

        let mut run = DurableRun::new(&journal, "wf", fast_retry(2));
        let result: Result<u32, _> = run
            .step("down", || async { Err(SinkError::Unavailable("503".into())) })
            .await;

        assert!(matches!(result, Err(WorkflowError::Sink(SinkError::Unavailable(_)))));
    }

    #[tokio::test]
    async fn renamed_step_is_reported_as_divergence() {
        let journal = MemoryJournal::new();
        started(&journal, "wf").await;
        journal
            .record_step("wf", 0, "select", &json!(null))
            .await
            .unwrap();

        let mut run = DurableRun::new(&journal, "wf", RetryPolicy::none());
        let result: Result<Option<u32>, _> = run
            .step("claim", || async { Ok::<_, StoreError>(None) })
            .await;

        assert!(matches!(result, Err(WorkflowError::Diverged { index: 0, .. })));
    }

    #[tokio::test]
    async fn lease_excludes_other_owners_until_expiry() {
        let journal = MemoryJournal::new();
        let lease = TimeDelta::seconds(60);
        let input = json!({"n": 1});

        assert!(journal.acquire("wf", &input, "a", t(0), lease).await.unwrap().is_some());
        assert!(journal.acquire("wf", &input, "b", t(10), lease).await.unwrap().is_none());
        assert!(journal.acquire("wf", &input, "a", t(10), lease).await.unwrap().is_some());

        let taken = journal.acquire("wf", &json!({}), "b", t(71), lease).await.unwrap();
        assert_eq!(taken.unwrap().input, input);
    }

    #[tokio::test]
    async fn released_and_finished_workflows() {
        let journal = MemoryJournal::new();
        let lease = TimeDelta::seconds(60);
        started(&journal, "wf").await;

        journal.release("wf", "me").await.unwrap();
        assert!(journal.acquire("wf", &json!({}), "other", t(1), lease).await.unwrap().is_some());

        journal
            .finish("wf", WorkflowStatus::Completed, Some(&json!("ok")))
            .await
            .unwrap();
        assert!(journal.acquire("wf", &json!({}), "other", t(2), lease).await.unwrap().is_none());
        assert!(journal.list(WorkflowStatus::Pending).await.unwrap().is_empty());
        let done = journal.list(WorkflowStatus::Completed).await.unwrap();
        assert_eq!(done[0].detail, Some(json!("ok")));
    }

    #[tokio::test]
    async fn prune_removes_only_old_completed_workflows() {
        let journal = MemoryJournal::new();
        for id in ["done", "failed", "open"] {
            started(&journal, id).await;
        }
        journal.record_step("done", 0, "select", &json!(null)).await.unwrap();
        journal.finish("done", WorkflowStatus::Completed, None).await.unwrap();
        journal.finish("failed", WorkflowStatus::Dropped, None).await.unwrap();

        assert_eq!(journal.prune(t(0)).await.unwrap(), 0);
        let later = Utc::now() + TimeDelta::seconds(1);
        assert_eq!(journal.prune(later).await.unwrap(), 1);

        assert!(journal.get("done").await.unwrap().is_none());
        assert!(journal.step_output("done", 0).await.unwrap().is_none());
        assert!(journal.get("failed").await.unwrap().is_some());
        assert!(journal.get("open").await.unwrap().is_some());
    }

    #[test]
    fn lease_end_saturates() {
        assert_eq!(lease_until(t(0), TimeDelta::seconds(60)), t(60));
        let latest = lease_until(t(0), TimeDelta::MAX);
        assert_eq!(latest.to_rfc3339(), "9999-12-31T23:59:59.999999+00:00");
        assert_eq!(lease_until(t(0), TimeDelta::days(365 * 9000)), latest);
    }

    #[tokio::test]
    async fn record_step_conflicts_on_duplicate_index() {
        let journal = MemoryJournal::new();
        started(&journal, "wf").await;
        journal.record_step("wf", 0, "a", &json!(1)).await.unwrap();
        let err = journal.record_step("wf", 0, "a", &json!(2)).await.unwrap_err();
        assert!(matches!(err, JournalError::StepConflict { index: 0, .. }));
    }
}
