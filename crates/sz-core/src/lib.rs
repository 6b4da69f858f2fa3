//! Core domain logic for sessionizer.
//!
//! This crate contains the fundamental types and logic for:
//! - Device logs: the append-only event store contract and its key scheme
//! - Ingestion: appending intake batches to per-device logs
//! - Finalization: scanning, evaluating, claiming and forwarding idle sessions
//! - Durable execution: checkpointed workflow steps backed by a journal
//!
//! Every store, sink and journal is passed in as a capability handle; nothing
//! here reaches for process-wide state.

pub mod claim;
pub mod coordinator;
pub mod durable;
pub mod evaluate;
pub mod event;
pub mod ingest;
pub mod log;
pub mod memory;
pub mod scan;
pub mod sink;
pub mod timestamp;
pub mod types;
pub mod workflow;

pub use claim::{Claim, ClaimOutcome, DeleteClaim};
pub use coordinator::{ClaimRecord, Coordinator, FinalizeError, FinalizeOutcome};
pub use durable::{
    DurableRun, Journal, JournalError, MemoryJournal, RetryPolicy, Retryable, StepRecord,
    WorkflowError, WorkflowRecord, WorkflowStatus, lease_until,
};
pub use evaluate::{EvalError, SessionCandidate, SessionEvaluator};
pub use event::{Event, EventBatch};
pub use ingest::{IngestError, Ingestor};
pub use log::{DeviceLog, DeviceLogs, EventLog, KeyNamespace, KeyPattern, ReadError, StoreError};
pub use memory::MemoryEventLog;
pub use scan::CandidateScanner;
pub use sink::{Ack, LogSink, MemorySink, SessionSnapshot, Sink, SinkError};
pub use types::{DeviceId, ValidationError};
pub use workflow::{Finalizer, FinalizerConfig, Selection, TickInput, TickOutcome, TickReport};
