//! Session ripeness evaluation.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::log::{DeviceLogs, ReadError, StoreError};
use crate::types::DeviceId;

/// Boundaries of a session that has been idle for at least the session delay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCandidate {
    pub device_id: DeviceId,
    pub first_event_at: DateTime<Utc>,
    pub last_event_at: DateTime<Utc>,
}

/// Why a device's log is not ready for finalization.
#[derive(Debug, Error)]
pub enum EvalError {
    /// The log vanished between scan and read (usually a concurrent claim).
    #[error("log for {device} is empty")]
    EmptyLog { device: DeviceId },
    /// The device has been idle for less than the session delay.
    #[error("session for {device} is not ripe: idle {idle} of {delay}")]
    NotRipe {
        device: DeviceId,
        idle: TimeDelta,
        delay: TimeDelta,
    },
    /// A stored value could not be parsed; the log is left in place.
    #[error("malformed timestamp {value:?} in log for {device}")]
    MalformedTimestamp {
        device: DeviceId,
        value: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EvalError {
    /// True for the outcomes of normal operation that end a tick quietly.
    pub const fn is_benign(&self) -> bool {
        matches!(self, Self::EmptyLog { .. } | Self::NotRipe { .. })
    }
}

/// Decides whether a device's session has gone idle long enough to finalize.
#[derive(Debug, Clone)]
pub struct SessionEvaluator {
    logs: DeviceLogs,
    session_delay: TimeDelta,
}

impl SessionEvaluator {
    pub const fn new(logs: DeviceLogs, session_delay: TimeDelta) -> Self {
        Self {
            logs,
            session_delay,
        }
    }

    pub const fn session_delay(&self) -> TimeDelta {
        self.session_delay
    }

    /// Reads `device`'s log and returns its session if it is ripe at `now`.
    ///
    /// A session is ripe once `now - last_event >= session_delay`. Events are
    /// taken in append order; the log is never re-sorted.
    pub async fn evaluate(
        &self,
        device: &DeviceId,
        now: DateTime<Utc>,
    ) -> Result<SessionCandidate, EvalError> {
        let log = self.logs.read(device).await.map_err(|err| match err {
            ReadError::Store(err) => EvalError::Store(err),
            ReadError::Malformed { value, source } => EvalError::MalformedTimestamp {
                device: device.clone(),
                value,
                source,
            },
        })?;

        let (Some(first_event_at), Some(last_event_at)) = (log.first(), log.last()) else {
            return Err(EvalError::EmptyLog {
                device: device.clone(),
            });
        };

        let idle = now - last_event_at;
        if idle < self.session_delay {
            return Err(EvalError::NotRipe {
                device: device.clone(),
                idle,
                delay: self.session_delay,
            });
        }

        Ok(SessionCandidate {
            device_id: device.clone(),
            first_event_at,
            last_event_at,
        })
    }
}
