//! Core type definitions with validation.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation errors for core types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The provided value was empty.
    #[error("{field} cannot be empty")]
    Empty { field: &'static str },

    /// The namespace token contains a separator or glob metacharacter.
    #[error("invalid key namespace {value:?}: must not contain ':', '*', '?', '[' or ']'")]
    InvalidNamespace { value: String },

    /// A key glob that does not parse.
    #[error("invalid key pattern {value:?}: {reason}")]
    InvalidPattern { value: String, reason: String },
}

/// Generates a validated string ID newtype with common trait implementations.
macro_rules! define_string_id {
    (
        $(#[$meta:meta])*
        $name:ident, $field_name:literal
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Creates a new ID after validation.
            pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
                let id = id.into();
                if id.trim().is_empty() {
                    return Err(ValidationError::Empty { field: $field_name });
                }
                Ok(Self(id))
            }

            /// Returns the ID as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValidationError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_string_id!(
    /// A validated device identifier.
    ///
    /// Device IDs must be non-blank. Each device owns at most one live log in
    /// the event store.
    DeviceId, "device ID"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_rejects_blank() {
        assert_eq!(
            DeviceId::new("  "),
            Err(ValidationError::Empty { field: "device ID" })
        );
    }

    #[test]
    fn device_id_deserialization_validates() {
        let parsed: Result<DeviceId, _> = serde_json::from_str(r#""""#);
        assert!(parsed.is_err());

        let parsed: DeviceId = serde_json::from_str(r#""m1""#).unwrap();
        assert_eq!(parsed.as_str(), "m1");
    }
}
