//! Event ingestion.
//!
//! Ingestion is a plain append per event. It takes no locks and does not
//! coordinate with finalization: a log claimed mid-batch is simply recreated
//! by the next append, which starts a fresh session for that device.

use thiserror::Error;

use crate::event::Event;
use crate::log::{DeviceLogs, StoreError};
use crate::types::DeviceId;

/// A batch stopped part way through.
///
/// Ingestion is not transactional. The first `applied` events of the batch
/// are already in the store and stay there; nothing is rolled back. Retrying
/// the whole batch appends those events a second time.
#[derive(Debug, Error)]
#[error("ingest aborted at event {applied} of {total} (device {device}): {source}")]
pub struct IngestError {
    /// Events appended before the failure.
    pub applied: usize,
    /// Events in the batch.
    pub total: usize,
    /// Device whose append failed.
    pub device: DeviceId,
    #[source]
    pub source: StoreError,
}

/// Appends intake batches to per-device logs.
#[derive(Debug, Clone)]
pub struct Ingestor {
    logs: DeviceLogs,
}

impl Ingestor {
    pub const fn new(logs: DeviceLogs) -> Self {
        Self { logs }
    }

    /// Appends every event in order and returns how many were appended.
    pub async fn ingest(&self, events: &[Event]) -> Result<usize, IngestError> {
        for (applied, event) in events.iter().enumerate() {
            if let Err(source) = self.logs.append(event).await {
                tracing::warn!(
                    applied,
                    total = events.len(),
                    device = %event.device_id,
                    error = %source,
                    "ingest aborted; earlier appends are kept"
                );
                return Err(IngestError {
                    applied,
                    total: events.len(),
                    device: event.device_id.clone(),
                    source,
                });
            }
        }
        tracing::debug!(count = events.len(), "ingested batch");
        Ok(events.len())
    }
}
