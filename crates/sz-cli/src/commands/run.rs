//! Run command: the periodic finalization scheduler.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use chrono::{TimeDelta, Utc};
use sz_core::{DeviceId, Finalizer, WorkflowError};
use tokio::time::{Instant, MissedTickBehavior};

/// Cadences of the scheduler loop.
#[derive(Debug, Clone, Copy)]
pub struct Schedule {
    /// Time between ticks.
    pub tick: Duration,
    /// Time between recovery and pruning passes.
    pub housekeeping: Duration,
    /// How long completed workflows stay in the journal.
    pub retention: TimeDelta,
}

/// Recovers pending workflows, then ticks until `shutdown` resolves.
///
/// Ticks run one at a time; a tick that overruns the interval delays the
/// next trigger instead of stacking. Failed ticks are logged and the loop
/// keeps going. Every `schedule.housekeeping` the loop resumes pending
/// workflows and prunes completed ones older than `schedule.retention`.
pub async fn run<F>(finalizer: &Finalizer, schedule: Schedule, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    recover(finalizer).await;

    let mut ticker = tokio::time::interval(schedule.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut housekeeping =
        tokio::time::interval_at(Instant::now() + schedule.housekeeping, schedule.housekeeping);
    housekeeping.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut cursor: Option<DeviceId> = None;
    tokio::pin!(shutdown);

    tracing::info!(
        interval_ms = schedule.tick.as_millis(),
        housekeeping_ms = schedule.housekeeping.as_millis(),
        instance = finalizer.instance(),
        "scheduler started"
    );
    loop {
        tokio::select! {
            biased;
            () = &mut shutdown => break,
            _ = housekeeping.tick() => {
                recover(finalizer).await;
                prune(finalizer, schedule.retention).await;
            }
            _ = ticker.tick() => {
                cursor = tick_once(finalizer, cursor).await;
            }
        }
    }
    tracing::info!("scheduler stopped");
    Ok(())
}

async fn recover(finalizer: &Finalizer) {
    match finalizer.recover().await {
        Ok(results) if !results.is_empty() => {
            let failed = results.iter().filter(|(_, r)| r.is_err()).count();
            tracing::info!(resumed = results.len(), failed, "recovered pending workflows");
        }
        Ok(_) => {}
        Err(err) => tracing::warn!(error = %err, "recovery skipped"),
    }
}

async fn prune(finalizer: &Finalizer, retention: TimeDelta) {
    let Some(before) = Utc::now().checked_sub_signed(retention) else {
        return;
    };
    if let Err(err) = finalizer.prune(before).await {
        tracing::warn!(error = %err, "pruning skipped");
    }
}

/// Runs one tick and returns the cursor for the next.
async fn tick_once(finalizer: &Finalizer, cursor: Option<DeviceId>) -> Option<DeviceId> {
    match finalizer.tick(Utc::now(), cursor.as_ref()).await {
        Ok(report) => {
            tracing::debug!(workflow = %report.workflow_id, outcome = %report.outcome, "tick finished");
            report.outcome.device().cloned()
        }
        Err(WorkflowError::Dropped { snapshot, .. }) => Some(snapshot.device_id),
        Err(err) => {
            tracing::warn!(error = %err, "tick failed");
            cursor
        }
    }
}
