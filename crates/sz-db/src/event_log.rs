//! [`EventLog`] on the `device_logs` table.

use async_trait::async_trait;
use rusqlite::{OptionalExtension, TransactionBehavior, params};
use sz_core::{EventLog, KeyPattern, StoreError};

use crate::{Database, DbError};

/// Per-key overview of the stored logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSummary {
    pub key: String,
    pub values: usize,
    /// Oldest and newest raw values, in append order.
    pub first: String,
    pub last: String,
}

impl Database {
    /// Appends `value` to the end of `key`'s log.
    pub fn append_value(&self, key: &str, value: &str) -> Result<(), DbError> {
        self.conn().execute(
            "INSERT INTO device_logs (key, value) VALUES (?, ?)",
            params![key, value],
        )?;
        Ok(())
    }

    /// Returns the smallest key matching `pattern` that sorts after `after`.
    pub fn first_key_after(
        &self,
        pattern: &KeyPattern,
        after: Option<&str>,
    ) -> Result<Option<String>, DbError> {
        let key = self
            .conn()
            .query_row(
                "
                SELECT key FROM device_logs
                WHERE key GLOB ?1 AND (?2 IS NULL OR key > ?2)
                ORDER BY key ASC
                LIMIT 1
                ",
                params![pattern.as_str(), after],
                |row| row.get(0),
            )
            .optional()?;
        Ok(key)
    }

    /// Lists `key`'s values in append order.
    pub fn values(&self, key: &str) -> Result<Vec<String>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT value FROM device_logs WHERE key = ? ORDER BY seq ASC")?;
        let rows = stmt.query_map([key], |row| row.get(0))?;
        let mut values = Vec::new();
        for row in rows {
            values.push(row?);
        }
        Ok(values)
    }

    /// Removes `key`'s log and returns what was removed.
    ///
    /// With `head` set, the log is only removed while its first value is
    /// `head`; a log that has since been taken and restarted is left in place
    /// and the result is empty.
    ///
    /// Reading and deleting happen in one `IMMEDIATE` transaction, so of any
    /// number of concurrent callers on any number of handles, one gets the
    /// values and the rest get an empty list.
    pub fn take_values(&self, key: &str, head: Option<&str>) -> Result<Vec<String>, DbError> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut values: Vec<String> = Vec::new();
        {
            let mut stmt =
                tx.prepare("SELECT value FROM device_logs WHERE key = ? ORDER BY seq ASC")?;
            let rows = stmt.query_map([key], |row| row.get(0))?;
            for row in rows {
                values.push(row?);
            }
        }
        let moved_on = match (head, values.first()) {
            (Some(expected), Some(first)) => first != expected,
            _ => false,
        };
        if moved_on {
            tracing::debug!(key, ?head, "log head moved on, not taking");
            tx.rollback()?;
            return Ok(Vec::new());
        }
        let deleted = tx.execute("DELETE FROM device_logs WHERE key = ?", [key])?;
        tx.commit()?;
        debug_assert_eq!(deleted, values.len());
        Ok(values)
    }

    /// Summarizes every stored log, ordered by key.
    pub fn log_summaries(&self) -> Result<Vec<LogSummary>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "
            SELECT
                key,
                COUNT(*),
                (SELECT value FROM device_logs f WHERE f.key = d.key ORDER BY seq ASC LIMIT 1),
                (SELECT value FROM device_logs l WHERE l.key = d.key ORDER BY seq DESC LIMIT 1)
            FROM device_logs d
            GROUP BY key
            ORDER BY key ASC
            ",
        )?;
        let rows = stmt.query_map([], |row| {
            let values: i64 = row.get(1)?;
            Ok(LogSummary {
                key: row.get(0)?,
                values: usize::try_from(values).unwrap_or_default(),
                first: row.get(2)?,
                last: row.get(3)?,
            })
        })?;
        let mut summaries = Vec::new();
        for row in rows {
            summaries.push(row?);
        }
        Ok(summaries)
    }
}

#[async_trait]
impl EventLog for Database {
    async fn append(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let (key, value) = (key.to_string(), value.to_string());
        Ok(self.blocking(move |db| db.append_value(&key, &value)).await?)
    }

    async fn scan_one(
        &self,
        pattern: &KeyPattern,
        after: Option<&str>,
    ) -> Result<Option<String>, StoreError> {
        let (pattern, after) = (pattern.clone(), after.map(str::to_string));
        Ok(self
            .blocking(move |db| db.first_key_after(&pattern, after.as_deref()))
            .await?)
    }

    async fn read_all(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let key = key.to_string();
        Ok(self.blocking(move |db| db.values(&key)).await?)
    }

    async fn delete_if_present(
        &self,
        key: &str,
        head: Option<&str>,
    ) -> Result<Vec<String>, StoreError> {
        let (key, head) = (key.to_string(), head.map(str::to_string));
        Ok(self
            .blocking(move |db| db.take_values(&key, head.as_deref()))
            .await?)
    }
}
