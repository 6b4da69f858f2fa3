//! Status command for showing pending logs and workflows.

use std::io::Write;

use anyhow::{Context, Result};
use sz_core::{SessionSnapshot, WorkflowStatus};
use sz_db::Database;

use crate::Config;

pub fn run<W: Write>(writer: &mut W, db: &Database, config: &Config) -> Result<()> {
    let logs = db.log_summaries().context("failed to summarize device logs")?;
    let pending = db
        .list_workflows(WorkflowStatus::Pending)
        .context("failed to list pending workflows")?;
    let dropped = db
        .list_workflows(WorkflowStatus::Dropped)
        .context("failed to list dropped workflows")?;

    writeln!(writer, "Sessionizer status")?;
    writeln!(writer, "Database: {}", config.database_path.display())?;

    if logs.is_empty() {
        writeln!(writer, "No device logs pending.")?;
    } else {
        writeln!(writer, "Device logs:")?;
        for log in logs {
            writeln!(writer, "- {}: {} events, last {}", log.key, log.values, log.last)?;
        }
    }

    writeln!(writer, "Pending workflows: {}", pending.len())?;
    for workflow in pending {
        match &workflow.owner {
            Some(owner) => writeln!(writer, "- {} (leased by {owner})", workflow.id)?,
            None => writeln!(writer, "- {}", workflow.id)?,
        }
    }

    writeln!(writer, "Dropped workflows: {}", dropped.len())?;
    for workflow in dropped {
        let snapshot = workflow
            .detail
            .and_then(|detail| serde_json::from_value::<SessionSnapshot>(detail).ok());
        match snapshot {
            Some(s) => writeln!(
                writer,
                "- {}: {} {} .. {}",
                workflow.id, s.device_id, s.session_start, s.session_end
            )?,
            None => writeln!(writer, "- {}", workflow.id)?,
        }
    }

    Ok(())
}
