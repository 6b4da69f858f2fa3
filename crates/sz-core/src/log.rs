//! The device log store contract.
//!
//! An [`EventLog`] is a keyed, ordered, append-only log of string values with
//! scan and delete primitives. It knows nothing about devices or timestamps.
//! [`DeviceLogs`] layers the key scheme and the timestamp codec on top, and is
//! the only place log values are formatted or parsed.

use std::fmt;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::event::Event;
use crate::timestamp;
use crate::types::{DeviceId, ValidationError};

/// Event store errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached or timed out; the call may succeed later.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store rejected or failed the operation.
    #[error("store error: {0}")]
    Backend(String),
}

impl StoreError {
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// A keyed, ordered, append-only log store.
///
/// Implementations must make [`delete_if_present`](EventLog::delete_if_present)
/// atomic: for a given key generation exactly one caller receives the removed
/// values, every other concurrent or later caller receives an empty vector.
/// A generation starts with the first append to an absent key and ends when
/// the key is deleted.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Appends a value to the end of the log under `key`, creating it if needed.
    async fn append(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Returns the first key matching `pattern` that sorts strictly after
    /// `after` in the store's enumeration order, if any.
    async fn scan_one(
        &self,
        pattern: &KeyPattern,
        after: Option<&str>,
    ) -> Result<Option<String>, StoreError>;

    /// Returns every value under `key` in append order.
    async fn read_all(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Atomically removes the log under `key` and returns the removed values.
    ///
    /// With `head`, the log is removed only if its first value equals `head`;
    /// a log starting with anything else is a later generation and is left
    /// alone. The removed count is the length of the returned vector; an
    /// absent key or a different head yields an empty vector, not an error.
    async fn delete_if_present(
        &self,
        key: &str,
        head: Option<&str>,
    ) -> Result<Vec<String>, StoreError>;
}

/// A key glob with [`glob::Pattern`] syntax (`*`, `?`, `[...]`), parsed once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPattern(glob::Pattern);

impl KeyPattern {
    pub fn new(glob: &str) -> Result<Self, ValidationError> {
        glob::Pattern::new(glob)
            .map(Self)
            .map_err(|err| ValidationError::InvalidPattern {
                value: glob.to_string(),
                reason: err.to_string(),
            })
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Returns true if `key` matches the whole pattern.
    pub fn matches(&self, key: &str) -> bool {
        self.0.matches(key)
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static DEFAULT_NAMESPACE: LazyLock<KeyNamespace> =
    LazyLock::new(|| KeyNamespace::new("device").expect("default namespace is valid"));

/// The namespace token prefixed to every device log key (`<namespace>:<device>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyNamespace {
    token: String,
    pattern: KeyPattern,
}

impl KeyNamespace {
    pub fn new(token: impl Into<String>) -> Result<Self, ValidationError> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(ValidationError::Empty {
                field: "key namespace",
            });
        }
        if token.contains([':', '*', '?', '[', ']']) {
            return Err(ValidationError::InvalidNamespace { value: token });
        }
        let pattern = KeyPattern::new(&format!("{token}:*"))?;
        Ok(Self { token, pattern })
    }

    pub fn as_str(&self) -> &str {
        &self.token
    }

    /// The store key holding `device`'s log.
    pub fn key_for(&self, device: &DeviceId) -> String {
        format!("{}:{}", self.token, device)
    }

    /// Recovers the device from a key in this namespace.
    pub fn device_from_key(&self, key: &str) -> Option<DeviceId> {
        let rest = key.strip_prefix(self.token.as_str())?.strip_prefix(':')?;
        DeviceId::new(rest).ok()
    }

    /// The glob matching every device log key in this namespace.
    pub const fn pattern(&self) -> &KeyPattern {
        &self.pattern
    }
}

impl Default for KeyNamespace {
    fn default() -> Self {
        DEFAULT_NAMESPACE.clone()
    }
}

impl fmt::Display for KeyNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token)
    }
}

/// The decoded contents of one device's log, in append order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLog {
    pub device_id: DeviceId,
    pub events: Vec<DateTime<Utc>>,
}

impl DeviceLog {
    pub fn first(&self) -> Option<DateTime<Utc>> {
        self.events.first().copied()
    }

    pub fn last(&self) -> Option<DateTime<Utc>> {
        self.events.last().copied()
    }
}

/// Failure to read a device log.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A stored value is not a valid timestamp.
    #[error("malformed timestamp {value:?}")]
    Malformed {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
}

/// Typed access to device logs over an [`EventLog`].
#[derive(Clone)]
pub struct DeviceLogs {
    store: Arc<dyn EventLog>,
    namespace: KeyNamespace,
}

impl fmt::Debug for DeviceLogs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceLogs")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl DeviceLogs {
    pub fn new(store: Arc<dyn EventLog>, namespace: KeyNamespace) -> Self {
        Self { store, namespace }
    }

    pub const fn namespace(&self) -> &KeyNamespace {
        &self.namespace
    }

    /// Appends one event to its device's log.
    pub async fn append(&self, event: &Event) -> Result<(), StoreError> {
        let key = self.namespace.key_for(&event.device_id);
        self.store
            .append(&key, &timestamp::format(event.occurred_at))
            .await
    }

    /// Returns the next key in this namespace after `after`, without wrapping.
    pub async fn next_key(&self, after: Option<&str>) -> Result<Option<String>, StoreError> {
        self.store.scan_one(self.namespace.pattern(), after).await
    }

    /// Reads and decodes `device`'s whole log, failing on the first bad value.
    pub async fn read(&self, device: &DeviceId) -> Result<DeviceLog, ReadError> {
        let values = self.store.read_all(&self.namespace.key_for(device)).await?;
        let events = values
            .into_iter()
            .map(|value| {
                timestamp::parse(&value).map_err(|source| ReadError::Malformed { value, source })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(DeviceLog {
            device_id: device.clone(),
            events,
        })
    }

    /// Atomically removes `device`'s log, returning what was removed.
    ///
    /// With `first_event_at`, only the generation whose first event is that
    /// instant is removed. Returns `None` when nothing was removed. The
    /// removal cannot be undone, so values that fail to decode are logged and
    /// skipped rather than failing the call.
    pub async fn take(
        &self,
        device: &DeviceId,
        first_event_at: Option<DateTime<Utc>>,
    ) -> Result<Option<DeviceLog>, StoreError> {
        let key = self.namespace.key_for(device);
        let head = match first_event_at {
            Some(expected) => match self.head_value(&key, expected).await? {
                Some(raw) => Some(raw),
                None => return Ok(None),
            },
            None => None,
        };
        let values = self.store.delete_if_present(&key, head.as_deref()).await?;
        if values.is_empty() {
            return Ok(None);
        }
        let mut events = Vec::with_capacity(values.len());
        for value in values {
            match timestamp::parse(&value) {
                Ok(instant) => events.push(instant),
                Err(err) => {
                    tracing::warn!(device = %device, %value, error = %err, "skipping unparseable value in claimed log");
                }
            }
        }
        Ok(Some(DeviceLog {
            device_id: device.clone(),
            events,
        }))
    }

    /// The stored first value of `key` if it encodes `expected`.
    ///
    /// Values may carry any RFC 3339 offset, so the generation is matched on
    /// the decoded instant and then pinned to the raw text for the delete.
    async fn head_value(
        &self,
        key: &str,
        expected: DateTime<Utc>,
    ) -> Result<Option<String>, StoreError> {
        let values = self.store.read_all(key).await?;
        Ok(values
            .into_iter()
            .next()
            .filter(|raw| timestamp::parse(raw).is_ok_and(|instant| instant == expected)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::memory::MemoryEventLog;

    fn device(id: &str) -> DeviceId {
        DeviceId::new(id).unwrap()
    }

    #[test]
    fn pattern_matches_globs() {
        let pattern = KeyPattern::new("device:*").unwrap();
        assert!(pattern.matches("device:m1"));
        assert!(pattern.matches("device:"));
        assert!(pattern.matches("device:site/m1"));
        assert!(!pattern.matches("devices:m1"));
        assert!(!pattern.matches("other:m1"));

        let pattern = KeyPattern::new("d?v*:m[0-9]1").unwrap();
        assert!(pattern.matches("dev:m01"));
        assert!(pattern.matches("dav-x:m91"));
        assert!(!pattern.matches("dev:mx1"));
        assert_eq!(pattern.as_str(), "d?v*:m[0-9]1");
    }

    #[test]
    fn pattern_rejects_unclosed_class() {
        assert!(matches!(
            KeyPattern::new("device:[m"),
            Err(ValidationError::InvalidPattern { ref value, .. }) if value == "device:[m"
        ));
    }

    #[test]
    fn namespace_rejects_separators_and_globs() {
        assert!(KeyNamespace::new("device").is_ok());
        assert!(matches!(
            KeyNamespace::new(""),
            Err(ValidationError::Empty { .. })
        ));
        for bad in ["a:b", "dev*", "d?", "[x]"] {
            assert!(matches!(
                KeyNamespace::new(bad),
                Err(ValidationError::InvalidNamespace { .. })
            ));
        }
    }

    #[test]
    fn namespace_round_trips_keys() {
        let ns = KeyNamespace::default();
        let key = ns.key_for(&device("m:1"));
        assert_eq!(key, "device:m:1");
        assert_eq!(ns.device_from_key(&key), Some(device("m:1")));
        assert_eq!(ns.device_from_key("device:"), None);
        assert_eq!(ns.device_from_key("other:m1"), None);
        assert!(ns.pattern().matches(&key));
        assert_eq!(ns.pattern().as_str(), "device:*");
        assert_eq!(KeyNamespace::new("machine").unwrap().pattern().as_str(), "machine:*");
    }

    #[tokio::test]
    async fn read_fails_fast_on_malformed_value() {
        let store = Arc::new(MemoryEventLog::new());
        store.append("device:m1", "2025-01-01T00:00:00Z").await.unwrap();
        store.append("device:m1", "not-a-time").await.unwrap();
        let logs = DeviceLogs::new(store, KeyNamespace::default());

        let err = logs.read(&device("m1")).await.unwrap_err();
        assert!(matches!(err, ReadError::Malformed { ref value, .. } if value == "not-a-time"));
    }

    #[tokio::test]
    async fn take_skips_malformed_values_but_still_removes() {
        let store = Arc::new(MemoryEventLog::new());
        store.append("device:m1", "garbage").await.unwrap();
        store.append("device:m1", "2025-01-01T00:00:05Z").await.unwrap();
        let logs = DeviceLogs::new(store.clone(), KeyNamespace::default());

        let taken = logs.take(&device("m1"), None).await.unwrap().unwrap();
        assert_eq!(taken.events.len(), 1);
        assert!(store.read_all("device:m1").await.unwrap().is_empty());
        assert_eq!(logs.take(&device("m1"), None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn take_leaves_a_later_generation_alone() {
        let store = Arc::new(MemoryEventLog::new());
        store.append("device:m1", "2025-01-01T00:01:40Z").await.unwrap();
        let logs = DeviceLogs::new(store.clone(), KeyNamespace::default());
        let stale = timestamp::parse("2025-01-01T00:00:00Z").unwrap();
        let current = timestamp::parse("2025-01-01T00:01:40Z").unwrap();

        assert_eq!(logs.take(&device("m1"), Some(stale)).await.unwrap(), None);
        assert_eq!(store.keys(), vec!["device:m1".to_string()]);

        let taken = logs.take(&device("m1"), Some(current)).await.unwrap().unwrap();
        assert_eq!(taken.events, vec![current]);
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn take_matches_the_head_by_instant() {
        let store = Arc::new(MemoryEventLog::new());
        store.append("device:m1", "2025-01-01T01:00:00+01:00").await.unwrap();
        let logs = DeviceLogs::new(store.clone(), KeyNamespace::default());
        let first = timestamp::parse("2025-01-01T00:00:00Z").unwrap();

        let taken = logs.take(&device("m1"), Some(first)).await.unwrap().unwrap();
        assert_eq!(taken.events, vec![first]);
        assert!(store.keys().is_empty());
    }
}
