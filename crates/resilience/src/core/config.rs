//! Configuration errors and the common config contract.

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration and registry errors
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A value failed validation.
    #[error("invalid configuration: {message}")]
    Validation {
        /// What was wrong.
        message: String,
    },

    /// Nothing is defined under the requested key.
    #[error("{kind} '{key}' not found")]
    NotFound {
        /// What was looked up.
        kind: String,
        /// The missing key.
        key: String,
    },

    /// A definition already exists under this name.
    #[error("policy '{name}' is already defined")]
    AlreadyDefined {
        /// The conflicting name.
        name: String,
    },

    /// A resolved policy has a different kind than requested.
    #[error("policy '{name}' is a {actual}, not a {expected}")]
    KindMismatch {
        /// Policy name.
        name: String,
        /// Requested kind.
        expected: String,
        /// Defined kind.
        actual: String,
    },

    /// Serialized configuration could not be decoded.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            key: key.into(),
        }
    }
}

/// Contract shared by every policy configuration.
pub trait ResilienceConfig: Clone + Serialize + DeserializeOwned + Default {
    /// Check invariants.
    fn validate(&self) -> ConfigResult<()>;

    /// Serialize into a JSON value.
    fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Decode from a JSON value and validate.
    fn from_value(value: &serde_json::Value) -> ConfigResult<Self> {
        let config: Self = serde_json::from_value(value.clone())?;
        config.validate()?;
        Ok(config)
    }
}

pub(crate) fn ensure(condition: bool, message: &str) -> ConfigResult<()> {
    if condition {
        Ok(())
    } else {
        Err(ConfigError::validation(message))
    }
}
