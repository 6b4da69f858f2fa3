//! Exclusive claims on device logs.

use async_trait::async_trait;

use crate::evaluate::SessionCandidate;
use crate::log::{DeviceLog, DeviceLogs, StoreError};

/// Result of a claim attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This caller owns the session; the log it removed is attached.
    Claimed(DeviceLog),
    /// Someone else already claimed it, or there was nothing to claim.
    NotFound,
}

/// Grants the exclusive right to finalize the session a candidate was
/// evaluated from.
///
/// Contract: for each generation of a device's log, exactly one caller
/// observes [`ClaimOutcome::Claimed`]. Repeating a claim after it succeeded
/// yields [`ClaimOutcome::NotFound`], so retries are safe. A candidate whose
/// generation is gone never claims the one that replaced it.
#[async_trait]
pub trait Claim: Send + Sync {
    async fn claim(&self, candidate: &SessionCandidate) -> Result<ClaimOutcome, StoreError>;
}

/// Claims by atomically deleting the log: whoever removes it owns it.
///
/// The delete is conditional on the log still starting with the candidate's
/// first event, which identifies the generation.
///
/// The deletion is irreversible. If forwarding later fails for good there is
/// nothing to put back.
#[derive(Debug, Clone)]
pub struct DeleteClaim {
    logs: DeviceLogs,
}

impl DeleteClaim {
    pub const fn new(logs: DeviceLogs) -> Self {
        Self { logs }
    }
}

#[async_trait]
impl Claim for DeleteClaim {
    async fn claim(&self, candidate: &SessionCandidate) -> Result<ClaimOutcome, StoreError> {
        let device = &candidate.device_id;
        match self.logs.take(device, Some(candidate.first_event_at)).await? {
            Some(log) => {
                tracing::debug!(%device, removed = log.events.len(), "claimed device log");
                Ok(ClaimOutcome::Claimed(log))
            }
            None => {
                tracing::debug!(%device, since = %candidate.first_event_at, "evaluated generation already gone");
                Ok(ClaimOutcome::NotFound)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use chrono::{DateTime, TimeDelta, TimeZone, Utc};

    use crate::log::{EventLog, KeyNamespace};
    use crate::memory::MemoryEventLog;
    use crate::types::DeviceId;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + TimeDelta::seconds(secs)
    }

    fn candidate(first: i64, last: i64) -> SessionCandidate {
        SessionCandidate {
            device_id: DeviceId::new("m1").unwrap(),
            first_event_at: t(first),
            last_event_at: t(last),
        }
    }

    fn fixture() -> (Arc<MemoryEventLog>, DeleteClaim) {
        let store = Arc::new(MemoryEventLog::new());
        let claim = DeleteClaim::new(DeviceLogs::new(store.clone(), KeyNamespace::default()));
        (store, claim)
    }

    #[tokio::test]
    async fn second_claim_finds_nothing() {
        let (store, claim) = fixture();
        store.append("device:m1", "2025-01-01T00:00:00Z").await.unwrap();

        let first = claim.claim(&candidate(0, 0)).await.unwrap();
        let second = claim.claim(&candidate(0, 0)).await.unwrap();

        assert!(matches!(first, ClaimOutcome::Claimed(ref log) if log.events.len() == 1));
        assert_eq!(second, ClaimOutcome::NotFound);
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn new_appends_start_a_new_generation() {
        let (store, claim) = fixture();

        store.append("device:m1", "2025-01-01T00:00:00Z").await.unwrap();
        assert!(matches!(claim.claim(&candidate(0, 0)).await.unwrap(), ClaimOutcome::Claimed(_)));

        store.append("device:m1", "2025-01-01T00:10:00Z").await.unwrap();
        assert!(matches!(
            claim.claim(&candidate(600, 600)).await.unwrap(),
            ClaimOutcome::Claimed(_)
        ));
        assert_eq!(claim.claim(&candidate(600, 600)).await.unwrap(), ClaimOutcome::NotFound);
    }

    #[tokio::test]
    async fn stale_candidate_cannot_claim_the_next_generation() {
        let (store, claim) = fixture();
        store.append("device:m1", "2025-01-01T00:00:00Z").await.unwrap();
        claim.claim(&candidate(0, 0)).await.unwrap();
        store.append("device:m1", "2025-01-01T00:01:40Z").await.unwrap();

        assert_eq!(claim.claim(&candidate(0, 0)).await.unwrap(), ClaimOutcome::NotFound);
        assert_eq!(
            store.read_all("device:m1").await.unwrap(),
            vec!["2025-01-01T00:01:40Z"]
        );
    }
}
