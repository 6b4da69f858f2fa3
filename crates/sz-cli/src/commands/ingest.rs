//! Ingest command: append an intake batch to the device logs.

use std::io::{self, Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use sz_core::{DeviceLogs, EventBatch, Ingestor};

/// Reads the raw batch from `file`, or stdin when no file is given.
pub fn read_input(file: Option<&Path>) -> Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display())),
        None => {
            let mut input = String::new();
            io::stdin()
                .read_to_string(&mut input)
                .context("failed to read stdin")?;
            Ok(input)
        }
    }
}

pub fn parse_batch(input: &str) -> Result<EventBatch> {
    serde_json::from_str(input).context("invalid intake batch")
}

/// Ingests `input` and reports the outcome to `writer`.
///
/// On a mid-batch failure the number of events already appended is written
/// before the error is returned; those events stay in the store.
pub async fn run<W: Write>(writer: &mut W, logs: DeviceLogs, input: &str) -> Result<usize> {
    let batch = parse_batch(input)?;
    match Ingestor::new(logs).ingest(&batch.events).await {
        Ok(count) => {
            writeln!(writer, "Ingested {count} events")?;
            Ok(count)
        }
        Err(err) => {
            writeln!(
                writer,
                "Applied {} of {} events before failure",
                err.applied, err.total
            )?;
            Err(err).context("ingest failed")
        }
    }
}
