//! Downstream sink contract for finalized sessions.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::evaluate::SessionCandidate;
use crate::log::DeviceLog;
use crate::types::DeviceId;

/// A finalized session, handed to the sink once and not stored here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub device_id: DeviceId,
    pub session_start: DateTime<Utc>,
    pub session_end: DateTime<Utc>,
}

impl SessionSnapshot {
    /// Builds the snapshot for a claimed log.
    ///
    /// The start comes from the candidate. The end is the later of the
    /// candidate's last event and the last event actually removed, so events
    /// appended between evaluation and claim still count toward the session.
    ///
    /// A removed log that starts elsewhere is a different generation than the
    /// one evaluated; its snapshot is built from its own events only.
    pub fn from_claim(candidate: &SessionCandidate, claimed: &DeviceLog) -> Self {
        if let (Some(first), Some(last)) = (claimed.first(), claimed.events.iter().max().copied()) {
            if first != candidate.first_event_at {
                tracing::warn!(
                    device = %candidate.device_id,
                    evaluated_start = %candidate.first_event_at,
                    claimed_start = %first,
                    "claimed log is not the evaluated generation"
                );
                return Self {
                    device_id: candidate.device_id.clone(),
                    session_start: first,
                    session_end: last,
                };
            }
        }
        let removed_end = claimed.events.iter().max().copied();
        let session_end = removed_end.map_or(candidate.last_event_at, |end| {
            end.max(candidate.last_event_at)
        });
        if session_end > candidate.last_event_at {
            tracing::warn!(
                device = %candidate.device_id,
                evaluated_end = %candidate.last_event_at,
                claimed_end = %session_end,
                "events arrived after evaluation and were claimed with the session"
            );
        }
        Self {
            device_id: candidate.device_id.clone(),
            session_start: candidate.first_event_at,
            session_end,
        }
    }
}

/// Acknowledgement returned by a sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub detail: String,
}

impl Ack {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

/// Sink errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// Unreachable, timed out or temporarily refusing; worth retrying.
    #[error("sink unavailable: {0}")]
    Unavailable(String),
    /// The sink will not accept this snapshot.
    #[error("sink rejected snapshot: {0}")]
    Rejected(String),
}

impl SinkError {
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

/// Accepts finalized snapshots.
///
/// Delivery may be repeated after a crash between forwarding and
/// checkpointing; sinks that care should deduplicate on device and end time.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn deliver(&self, snapshot: &SessionSnapshot) -> Result<Ack, SinkError>;
}

/// Writes snapshots to the log instead of an external service.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl Sink for LogSink {
    async fn deliver(&self, snapshot: &SessionSnapshot) -> Result<Ack, SinkError> {
        tracing::info!(
            device = %snapshot.device_id,
            session_start = %snapshot.session_start,
            session_end = %snapshot.session_end,
            "session finalized"
        );
        Ok(Ack::new("logged"))
    }
}

#[derive(Debug, Default)]
struct Recorded {
    delivered: Vec<SessionSnapshot>,
    scripted_failures: VecDeque<SinkError>,
}

/// Records delivered snapshots in memory; failures can be scripted ahead.
#[derive(Debug, Default)]
pub struct MemorySink {
    inner: Mutex<Recorded>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Recorded> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues `error` to be returned by the next delivery attempt.
    pub fn fail_next(&self, error: SinkError) {
        self.inner().scripted_failures.push_back(error);
    }

    /// Snapshots accepted so far, in delivery order.
    pub fn delivered(&self) -> Vec<SessionSnapshot> {
        self.inner().delivered.clone()
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn deliver(&self, snapshot: &SessionSnapshot) -> Result<Ack, SinkError> {
        let mut inner = self.inner();
        if let Some(error) = inner.scripted_failures.pop_front() {
            return Err(error);
        }
        inner.delivered.push(snapshot.clone());
        Ok(Ack::new(format!("recorded #{}", inner.delivered.len())))
    }
}
