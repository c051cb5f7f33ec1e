//! Error types for the aggregation core

use thiserror::Error;

/// Invalid or unparsable aggregation configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A field holds a value outside its accepted range
    #[error("invalid {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },

    /// The JSON document could not be deserialized
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Rejected tag data
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TagError {
    #[error("tag key must not be empty (value {value:?})")]
    EmptyKey { value: String },
}

/// A single sample could not be turned into a wire record
#[derive(Error, Debug)]
pub enum EncodeError {
    /// JSON has no representation for NaN or infinity
    #[error("metric {metric}: non-finite value {value}")]
    NonFinite { metric: String, value: f64 },

    /// The record alone is larger than the batch byte budget
    #[error("record of {size} bytes exceeds batch budget of {budget} bytes")]
    Oversized { size: usize, budget: usize },

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Failure reported by an [`Uploader`](crate::pipeline::Uploader)
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("upload rejected: {0}")]
    Rejected(String),

    #[error("transport error: {0}")]
    Transport(String),
}
