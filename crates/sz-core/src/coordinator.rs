//! Claim-and-finalize coordination.
//!
//! Claiming and forwarding are separate operations so that a durable caller
//! can checkpoint between them. Once a claim has succeeded the log is gone
//! from the store; a retry must forward the snapshot it already holds instead
//! of claiming again, which would only report a lost race.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::claim::{Claim, ClaimOutcome};
use crate::evaluate::SessionCandidate;
use crate::log::StoreError;
use crate::sink::{Ack, SessionSnapshot, Sink, SinkError};

/// Checkpointable result of the claim step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ClaimRecord {
    /// This caller owns the session and must forward `snapshot`.
    Won { snapshot: SessionSnapshot },
    /// Another finalizer got there first.
    LostRace,
}

/// Result of a complete claim-and-forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Finalized(SessionSnapshot),
    LostRace,
}

#[derive(Debug, Error)]
pub enum FinalizeError {
    /// The claim could not be attempted; the log is untouched.
    #[error("claim failed: {0}")]
    Claim(#[source] StoreError),
    /// The log was claimed but the snapshot was not delivered.
    #[error("forwarding snapshot for {} failed: {source}", snapshot.device_id)]
    Forward {
        snapshot: SessionSnapshot,
        #[source]
        source: SinkError,
    },
}

/// Turns a ripe candidate into a delivered snapshot, at most once per session.
#[derive(Clone)]
pub struct Coordinator {
    claim: Arc<dyn Claim>,
    sink: Arc<dyn Sink>,
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator").finish_non_exhaustive()
    }
}

impl Coordinator {
    pub fn new(claim: Arc<dyn Claim>, sink: Arc<dyn Sink>) -> Self {
        Self { claim, sink }
    }

    /// Claims the candidate's log and builds its snapshot.
    pub async fn claim(&self, candidate: &SessionCandidate) -> Result<ClaimRecord, StoreError> {
        match self.claim.claim(candidate).await? {
            ClaimOutcome::Claimed(log) => Ok(ClaimRecord::Won {
                snapshot: SessionSnapshot::from_claim(candidate, &log),
            }),
            ClaimOutcome::NotFound => {
                tracing::info!(device = %candidate.device_id, "lost claim race; another finalizer owns this session");
                Ok(ClaimRecord::LostRace)
            }
        }
    }

    /// Hands an already-claimed snapshot to the sink.
    pub async fn forward(&self, snapshot: &SessionSnapshot) -> Result<Ack, SinkError> {
        let ack = self.sink.deliver(snapshot).await?;
        tracing::debug!(device = %snapshot.device_id, ack = %ack.detail, "snapshot forwarded");
        Ok(ack)
    }

    /// Claims then forwards in one call, without checkpointing in between.
    pub async fn claim_and_finalize(
        &self,
        candidate: &SessionCandidate,
    ) -> Result<FinalizeOutcome, FinalizeError> {
        let snapshot = match self.claim(candidate).await.map_err(FinalizeError::Claim)? {
            ClaimRecord::Won { snapshot } => snapshot,
            ClaimRecord::LostRace => return Ok(FinalizeOutcome::LostRace),
        };
        match self.forward(&snapshot).await {
            Ok(_) => Ok(FinalizeOutcome::Finalized(snapshot)),
            Err(source) => Err(FinalizeError::Forward { snapshot, source }),
        }
    }
}
