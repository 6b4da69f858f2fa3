//! [`Journal`] on the `workflows` and `workflow_steps` tables.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior, params};
use serde_json::Value;
use sz_core::{Journal, JournalError, StepRecord, WorkflowRecord, WorkflowStatus, lease_until};

use crate::{Database, DbError, format_timestamp, parse_timestamp};

const WORKFLOW_COLUMNS: &str =
    "id, status, input, detail, owner, lease_until, created_at, updated_at";

/// A `workflows` row before its columns are decoded.
struct WorkflowRow {
    id: String,
    status: String,
    input: String,
    detail: Option<String>,
    owner: Option<String>,
    lease_until: Option<String>,
    created_at: String,
    updated_at: String,
}

impl WorkflowRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            status: row.get(1)?,
            input: row.get(2)?,
            detail: row.get(3)?,
            owner: row.get(4)?,
            lease_until: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn decode(self) -> Result<WorkflowRecord, DbError> {
        let status = self
            .status
            .parse::<WorkflowStatus>()
            .map_err(|_| DbError::InvalidStatus {
                workflow_id: self.id.clone(),
                value: self.status.clone(),
            })?;
        let input = parse_json(&self.input, &self.id, "input")?;
        let detail = self
            .detail
            .as_deref()
            .map(|detail| parse_json(detail, &self.id, "detail"))
            .transpose()?;
        let lease_until = self
            .lease_until
            .as_deref()
            .map(|value| parse_timestamp(value, &self.id))
            .transpose()?;
        Ok(WorkflowRecord {
            status,
            input,
            detail,
            owner: self.owner,
            lease_until,
            created_at: parse_timestamp(&self.created_at, &self.id)?,
            updated_at: parse_timestamp(&self.updated_at, &self.id)?,
            id: self.id,
        })
    }
}

fn parse_json(value: &str, workflow_id: &str, column: &'static str) -> Result<Value, DbError> {
    serde_json::from_str(value).map_err(|source| DbError::Json {
        workflow_id: workflow_id.to_string(),
        column,
        source,
    })
}

fn load_workflow(conn: &Connection, workflow_id: &str) -> Result<Option<WorkflowRecord>, DbError> {
    let row = conn
        .query_row(
            &format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = ?"),
            [workflow_id],
            WorkflowRow::from_row,
        )
        .optional()?;
    row.map(WorkflowRow::decode).transpose()
}

impl Database {
    /// Creates or leases a workflow. See [`Journal::acquire`].
    pub fn acquire_workflow(
        &self,
        workflow_id: &str,
        input: &Value,
        owner: &str,
        now: DateTime<Utc>,
        lease: TimeDelta,
    ) -> Result<Option<WorkflowRecord>, DbError> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let lease_end = format_timestamp(lease_until(now, lease));
        let stamp = format_timestamp(now);

        let acquired = match load_workflow(&tx, workflow_id)? {
            None => {
                tx.execute(
                    "
                    INSERT INTO workflows
                    (id, status, input, detail, owner, lease_until, created_at, updated_at)
                    VALUES (?, ?, ?, NULL, ?, ?, ?, ?)
                    ",
                    params![
                        workflow_id,
                        WorkflowStatus::Pending.as_str(),
                        input.to_string(),
                        owner,
                        lease_end,
                        stamp,
                        stamp,
                    ],
                )?;
                true
            }
            Some(record) if record.status != WorkflowStatus::Pending => false,
            Some(record) => {
                let free = match (&record.owner, record.lease_until) {
                    (Some(holder), Some(until)) => holder == owner || until <= now,
                    _ => true,
                };
                if free {
                    tx.execute(
                        "UPDATE workflows SET owner = ?, lease_until = ?, updated_at = ? WHERE id = ?",
                        params![owner, lease_end, stamp, workflow_id],
                    )?;
                }
                free
            }
        };

        let record = if acquired {
            load_workflow(&tx, workflow_id)?
        } else {
            None
        };
        tx.commit()?;
        Ok(record)
    }

    pub fn release_workflow(&self, workflow_id: &str, owner: &str) -> Result<(), DbError> {
        self.conn().execute(
            "UPDATE workflows SET owner = NULL, lease_until = NULL WHERE id = ? AND owner = ?",
            params![workflow_id, owner],
        )?;
        Ok(())
    }

    pub fn workflow_step(
        &self,
        workflow_id: &str,
        index: u32,
    ) -> Result<Option<(String, String)>, DbError> {
        let step = self
            .conn()
            .query_row(
                "SELECT name, output FROM workflow_steps WHERE workflow_id = ? AND step_index = ?",
                params![workflow_id, index],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(step)
    }

    /// Inserts a step row; the primary key rejects a second write to the
    /// same step.
    pub fn insert_workflow_step(
        &self,
        workflow_id: &str,
        index: u32,
        name: &str,
        output: &str,
    ) -> Result<(), DbError> {
        self.conn().execute(
            "
            INSERT INTO workflow_steps (workflow_id, step_index, name, output, recorded_at)
            VALUES (?, ?, ?, ?, ?)
            ",
            params![workflow_id, index, name, output, format_timestamp(Utc::now())],
        )?;
        Ok(())
    }

    /// Sets a terminal status. Returns false if the workflow does not exist.
    pub fn finish_workflow(
        &self,
        workflow_id: &str,
        status: WorkflowStatus,
        detail: Option<&Value>,
    ) -> Result<bool, DbError> {
        let updated = self.conn().execute(
            "
            UPDATE workflows
            SET status = ?, detail = ?, owner = NULL, lease_until = NULL, updated_at = ?
            WHERE id = ?
            ",
            params![
                status.as_str(),
                detail.map(Value::to_string),
                format_timestamp(Utc::now()),
                workflow_id,
            ],
        )?;
        Ok(updated > 0)
    }

    pub fn get_workflow(&self, workflow_id: &str) -> Result<Option<WorkflowRecord>, DbError> {
        load_workflow(&self.conn(), workflow_id)
    }

    /// Lists workflows in `status`, oldest first.
    pub fn list_workflows(&self, status: WorkflowStatus) -> Result<Vec<WorkflowRecord>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE status = ? ORDER BY created_at ASC, id ASC"
        ))?;
        let rows = stmt.query_map([status.as_str()], WorkflowRow::from_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?.decode()?);
        }
        Ok(records)
    }

    /// Deletes completed workflows last updated before `before`, steps
    /// included. Returns how many workflows were removed.
    pub fn prune_workflows(&self, before: DateTime<Utc>) -> Result<usize, DbError> {
        let removed = self.conn().execute(
            "DELETE FROM workflows WHERE status = ? AND updated_at < ?",
            params![WorkflowStatus::Completed.as_str(), format_timestamp(before)],
        )?;
        if removed > 0 {
            tracing::debug!(removed, before = %before, "pruned completed workflows");
        }
        Ok(removed)
    }
}

fn is_constraint_violation(err: &DbError) -> bool {
    matches!(
        err,
        DbError::Sqlite(inner) if inner.sqlite_error_code() == Some(ErrorCode::ConstraintViolation)
    )
}

#[async_trait]
impl Journal for Database {
    async fn acquire(
        &self,
        workflow_id: &str,
        input: &Value,
        owner: &str,
        now: DateTime<Utc>,
        lease: TimeDelta,
    ) -> Result<Option<WorkflowRecord>, JournalError> {
        let (workflow_id, input, owner) = (workflow_id.to_string(), input.clone(), owner.to_string());
        Ok(self
            .blocking(move |db| db.acquire_workflow(&workflow_id, &input, &owner, now, lease))
            .await?)
    }

    async fn release(&self, workflow_id: &str, owner: &str) -> Result<(), JournalError> {
        let (workflow_id, owner) = (workflow_id.to_string(), owner.to_string());
        Ok(self
            .blocking(move |db| db.release_workflow(&workflow_id, &owner))
            .await?)
    }

    async fn step_output(
        &self,
        workflow_id: &str,
        index: u32,
    ) -> Result<Option<StepRecord>, JournalError> {
        let id = workflow_id.to_string();
        let Some((name, output)) = self.blocking(move |db| db.workflow_step(&id, index)).await?
        else {
            return Ok(None);
        };
        let output = parse_json(&output, workflow_id, "step output")?;
        Ok(Some(StepRecord { name, output }))
    }

    async fn record_step(
        &self,
        workflow_id: &str,
        index: u32,
        name: &str,
        output: &Value,
    ) -> Result<(), JournalError> {
        let (id, name, output) = (workflow_id.to_string(), name.to_string(), output.to_string());
        self.blocking(move |db| {
            if db.get_workflow(&id)?.is_none() {
                return Ok(Err(JournalError::UnknownWorkflow(id)));
            }
            match db.insert_workflow_step(&id, index, &name, &output) {
                Ok(()) => Ok(Ok(())),
                Err(err) if is_constraint_violation(&err) => {
                    Ok(Err(JournalError::StepConflict { workflow_id: id, index }))
                }
                Err(err) => Err(err),
            }
        })
        .await?
    }

    async fn finish(
        &self,
        workflow_id: &str,
        status: WorkflowStatus,
        detail: Option<&Value>,
    ) -> Result<(), JournalError> {
        let (id, detail) = (workflow_id.to_string(), detail.cloned());
        let found = self
            .blocking(move |db| db.finish_workflow(&id, status, detail.as_ref()))
            .await?;
        if found {
            Ok(())
        } else {
            Err(JournalError::UnknownWorkflow(workflow_id.to_string()))
        }
    }

    async fn get(&self, workflow_id: &str) -> Result<Option<WorkflowRecord>, JournalError> {
        let id = workflow_id.to_string();
        Ok(self.blocking(move |db| db.get_workflow(&id)).await?)
    }

    async fn list(&self, status: WorkflowStatus) -> Result<Vec<WorkflowRecord>, JournalError> {
        Ok(self.blocking(move |db| db.list_workflows(status)).await?)
    }

    async fn prune(&self, before: DateTime<Utc>) -> Result<usize, JournalError> {
        Ok(self.blocking(move |db| db.prune_workflows(before)).await?)
    }
}
