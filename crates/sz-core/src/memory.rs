//! In-memory event store.
//!
//! Suitable for tests and single-process runs. The store can be told to fail,
//! which is how callers exercise their outage handling.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::log::{EventLog, KeyPattern, StoreError};

#[derive(Debug, Default)]
struct State {
    logs: BTreeMap<String, Vec<String>>,
    unavailable: bool,
    append_budget: Option<usize>,
}

impl State {
    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable {
            return Err(StoreError::Unavailable("memory store is offline".into()));
        }
        Ok(())
    }
}

/// An [`EventLog`] held in a `BTreeMap`, enumerated in key order.
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    state: Mutex<State>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every operation fail with [`StoreError::Unavailable`] until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    /// Lets the next `count` appends succeed, then fails appends until reset
    /// with `None`.
    pub fn fail_appends_after(&self, count: Option<usize>) {
        self.state().append_budget = count;
    }

    /// Returns every key currently holding a log.
    pub fn keys(&self) -> Vec<String> {
        self.state().logs.keys().cloned().collect()
    }

    /// Total number of values across all logs.
    pub fn value_count(&self) -> usize {
        self.state().logs.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut state = self.state();
        state.check_available()?;
        if let Some(budget) = state.append_budget.as_mut() {
            if *budget == 0 {
                return Err(StoreError::Unavailable("memory store append budget exhausted".into()));
            }
            *budget -= 1;
        }
        state
            .logs
            .entry(key.to_string())
            .or_default()
            .push(value.to_string());
        Ok(())
    }

    async fn scan_one(
        &self,
        pattern: &KeyPattern,
        after: Option<&str>,
    ) -> Result<Option<String>, StoreError> {
        let state = self.state();
        state.check_available()?;
        let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
        let found = state
            .logs
            .range::<str, _>((lower, Bound::Unbounded))
            .map(|(key, _)| key)
            .find(|key| pattern.matches(key))
            .cloned();
        Ok(found)
    }

    async fn read_all(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state();
        state.check_available()?;
        Ok(state.logs.get(key).cloned().unwrap_or_default())
    }

    async fn delete_if_present(
        &self,
        key: &str,
        head: Option<&str>,
    ) -> Result<Vec<String>, StoreError> {
        let mut state = self.state();
        state.check_available()?;
        let current_head = state.logs.get(key).and_then(|values| values.first());
        if head.is_some_and(|expected| current_head.is_some_and(|first| first != expected)) {
            return Ok(Vec::new());
        }
        Ok(state.logs.remove(key).unwrap_or_default())
    }
}
