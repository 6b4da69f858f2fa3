//! Recover command: resume pending workflows once.

use std::io::Write;

use anyhow::{Context, Result};
use sz_core::Finalizer;

/// Resumes pending workflows and returns how many failed again.
pub async fn run<W: Write>(writer: &mut W, finalizer: &Finalizer) -> Result<usize> {
    let results = finalizer
        .recover()
        .await
        .context("failed to list pending workflows")?;

    if results.is_empty() {
        writeln!(writer, "No pending workflows.")?;
        return Ok(0);
    }

    let mut failed = 0;
    for (workflow_id, result) in results {
        match result {
            Ok(outcome) => writeln!(writer, "{workflow_id}: {outcome}")?,
            Err(err) => {
                failed += 1;
                writeln!(writer, "{workflow_id}: failed: {err}")?;
            }
        }
    }
    Ok(failed)
}
