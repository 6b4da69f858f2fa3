//! Intake events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::DeviceId;

/// A single timestamped signal from a device.
///
/// Immutable once appended to the device's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// The device that produced the event.
    #[serde(alias = "machine_id")]
    pub device_id: DeviceId,
    /// When the event occurred.
    #[serde(alias = "created_at")]
    pub occurred_at: DateTime<Utc>,
}

impl Event {
    pub const fn new(device_id: DeviceId, occurred_at: DateTime<Utc>) -> Self {
        Self {
            device_id,
            occurred_at,
        }
    }
}

/// A batch of events as delivered by the intake boundary.
///
/// Also accepts the older `{"impressions": [{"machine_id", "created_at"}]}`
/// payload shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBatch {
    #[serde(alias = "impressions")]
    pub events: Vec<Event>,
}
