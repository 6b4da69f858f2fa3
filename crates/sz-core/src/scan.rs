//! Candidate selection.

use crate::log::{DeviceLogs, StoreError};
use crate::types::DeviceId;

/// Picks one device log to examine per finalizer tick.
///
/// Read-only. Callers should not rely on any particular order across devices;
/// the order is whatever the store enumerates.
#[derive(Debug, Clone)]
pub struct CandidateScanner {
    logs: DeviceLogs,
}

impl CandidateScanner {
    pub const fn new(logs: DeviceLogs) -> Self {
        Self { logs }
    }

    /// Returns one device with a live log, or `None` if there are none.
    ///
    /// `cursor` is a hint: the device examined on the previous tick. The scan
    /// resumes after it and wraps around once, so a device that never goes
    /// idle does not hide the others. Keys in the namespace that do not name
    /// a valid device are skipped.
    pub async fn scan_one(&self, cursor: Option<&DeviceId>) -> Result<Option<DeviceId>, StoreError> {
        let start = cursor.map(|device| self.logs.namespace().key_for(device));
        if let Some(device) = self.scan_from(start.as_deref()).await? {
            return Ok(Some(device));
        }
        if start.is_some() {
            return self.scan_from(None).await;
        }
        Ok(None)
    }

    async fn scan_from(&self, start: Option<&str>) -> Result<Option<DeviceId>, StoreError> {
        let mut after = start.map(str::to_string);
        while let Some(key) = self.logs.next_key(after.as_deref()).await? {
            if let Some(device) = self.logs.namespace().device_from_key(&key) {
                return Ok(Some(device));
            }
            tracing::debug!(%key, "skipping key without a device id");
            after = Some(key);
        }
        Ok(None)
    }
}
