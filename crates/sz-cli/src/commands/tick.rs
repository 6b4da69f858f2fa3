//! Tick command: run one finalization workflow.

use std::io::Write;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sz_core::{Finalizer, TickReport};

pub async fn run<W: Write>(
    writer: &mut W,
    finalizer: &Finalizer,
    now: DateTime<Utc>,
) -> Result<TickReport> {
    let report = finalizer
        .tick(now, None)
        .await
        .context("finalization tick failed")?;
    writeln!(writer, "{}: {}", report.workflow_id, report.outcome)?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use chrono::{TimeDelta, TimeZone};
    use sz_core::{
        DeviceId, DeviceLogs, Event, FinalizerConfig, Ingestor, KeyNamespace, MemoryEventLog,
        MemoryJournal, MemorySink, SinkError, TickOutcome,
    };

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + TimeDelta::seconds(secs)
    }

    async fn finalizer_with(device: &str, sink: Arc<MemorySink>) -> Finalizer {
        let store = Arc::new(MemoryEventLog::new());
        let logs = DeviceLogs::new(store.clone(), KeyNamespace::default());
        Ingestor::new(logs)
            .ingest(&[Event::new(DeviceId::new(device).unwrap(), t(0))])
            .await
            .unwrap();
        Finalizer::new(
            store,
            sink,
            Arc::new(MemoryJournal::new()),
            FinalizerConfig::default(),
        )
    }

    #[tokio::test]
    async fn prints_workflow_and_outcome() {
        let sink = Arc::new(MemorySink::new());
        let finalizer = finalizer_with("m1", sink.clone()).await;
        let mut output = Vec::new();

        let report = run(&mut output, &finalizer, t(60)).await.unwrap();

        let output = String::from_utf8(output).unwrap();
        assert!(output.starts_with("tick-2025-01-01T00:01:00.000Z-"));
        assert!(output.ends_with(": m1: delivered 2025-01-01T00:00:00Z .. 2025-01-01T00:00:00Z\n"));
        assert!(matches!(report.outcome, TickOutcome::Delivered { .. }));
        assert_eq!(sink.delivered().len(), 1);
    }

    #[tokio::test]
    async fn dropped_snapshot_is_an_error() {
        let sink = Arc::new(MemorySink::new());
        sink.fail_next(SinkError::Rejected("400".into()));
        let finalizer = finalizer_with("m1", sink).await;
        let mut output = Vec::new();

        let err = run(&mut output, &finalizer, t(60)).await.unwrap_err();

        assert!(format!("{err:#}").contains("dropped after claim"));
        assert!(output.is_empty());
    }
}
