//! Error Taxonomy
//!
//! Every failure the engine surfaces is a [`RecordError`]. Errors fall into
//! four kinds ([`ErrorKind`]) that drive retry decisions:
//!
//! - `NotFound`: a required record is absent. Distinct from an empty result.
//! - `Invalid`: the caller did something wrong (bad query arguments,
//!   validation failure). Never retried.
//! - `Transient`: the backend is momentarily unavailable. Retried with
//!   backoff.
//! - `Unknown`: anything else. Not retried, so bugs are not masked as
//!   flaky infrastructure.
//!
//! Reactive queries never return these errors from their accessors; they
//! are captured into [`ErrorInfo`] and exposed through state. Promise-style
//! calls return them directly.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::backend::BackendError;

/// Result alias used throughout the crate.
pub type Result<T, E = RecordError> = std::result::Result<T, E>;

/// Classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    Invalid,
    Transient,
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Invalid => "Invalid",
            ErrorKind::Transient => "Transient",
            ErrorKind::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// Field-level validation messages, keyed by field name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationErrors {
    fields: BTreeMap<String, Vec<String>>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a message against a field.
    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.fields
            .entry(field.into())
            .or_default()
            .push(message.into());
    }

    /// Builder-style variant of [`add`](Self::add).
    pub fn with(mut self, field: impl Into<String>, message: impl Into<String>) -> Self {
        self.add(field, message);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Messages recorded for `field`.
    pub fn get(&self, field: &str) -> &[String] {
        self.fields.get(field).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// `Ok(())` when no messages were recorded, otherwise `Err(self)`.
    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, messages) in &self.fields {
            for message in messages {
                if !first {
                    f.write_str("; ")?;
                }
                first = false;
                write!(f, "{field} {message}")?;
            }
        }
        Ok(())
    }
}

/// The engine's error type.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RecordError {
    #[error("couldn't find {table} with id={id}")]
    NotFound { table: &'static str, id: String },

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("validation failed: {0}")]
    Invalid(ValidationErrors),

    #[error("backend unavailable: {0}")]
    Transient(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Unknown(String),
}

impl RecordError {
    pub(crate) fn invalid_query(message: impl Into<String>) -> Self {
        RecordError::InvalidQuery(message.into())
    }

    /// The classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RecordError::NotFound { .. } => ErrorKind::NotFound,
            RecordError::InvalidQuery(_) | RecordError::Invalid(_) | RecordError::Config(_) => {
                ErrorKind::Invalid
            }
            RecordError::Transient(_) => ErrorKind::Transient,
            RecordError::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// Whether a retry could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Field messages for validation failures.
    pub fn validation_errors(&self) -> Option<&ValidationErrors> {
        match self {
            RecordError::Invalid(errors) => Some(errors),
            _ => None,
        }
    }
}

impl From<BackendError> for RecordError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Unavailable(message) => RecordError::Transient(message),
            BackendError::Timeout { timeout_ms } => {
                RecordError::Transient(format!("timed out after {timeout_ms}ms"))
            }
            BackendError::NotFound { table, id } => RecordError::NotFound { table, id },
            BackendError::Rejected(errors) => RecordError::Invalid(errors),
            BackendError::Other(message) => RecordError::Unknown(message),
        }
    }
}

impl From<ValidationErrors> for RecordError {
    fn from(errors: ValidationErrors) -> Self {
        RecordError::Invalid(errors)
    }
}

impl From<serde_json::Error> for RecordError {
    fn from(err: serde_json::Error) -> Self {
        RecordError::Unknown(format!("record decoding failed: {err}"))
    }
}

/// An error as surfaced through reactive state.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    /// Number of retries attempted before this error became final.
    pub retry_count: u32,
    pub error: RecordError,
}

impl ErrorInfo {
    pub fn new(error: RecordError, retry_count: u32) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
            retryable: error.is_retryable(),
            retry_count,
            error,
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_errors_map_to_kinds() {
        let transient: RecordError = BackendError::Unavailable("offline".into()).into();
        assert_eq!(transient.kind(), ErrorKind::Transient);
        assert!(transient.is_retryable());

        let timeout: RecordError = BackendError::Timeout { timeout_ms: 50 }.into();
        assert_eq!(timeout.kind(), ErrorKind::Transient);

        let missing: RecordError = BackendError::NotFound {
            table: "tasks",
            id: "X".into(),
        }
        .into();
        assert_eq!(missing.kind(), ErrorKind::NotFound);
        assert!(!missing.is_retryable());

        let other: RecordError = BackendError::Other("boom".into()).into();
        assert_eq!(other.kind(), ErrorKind::Unknown);
    }

    #[test]
    fn validation_errors_collect_messages() {
        let errors = ValidationErrors::new()
            .with("title", "can't be blank")
            .with("title", "is too short")
            .with("status", "is not included in the list");

        assert_eq!(errors.get("title").len(), 2);
        assert_eq!(errors.get("missing"), &[] as &[String]);
        assert_eq!(
            errors.to_string(),
            "status is not included in the list; title can't be blank; title is too short"
        );

        let err = RecordError::from(errors);
        assert_eq!(err.kind(), ErrorKind::Invalid);
        assert!(err.validation_errors().is_some());
    }

    #[test]
    fn error_info_captures_classification() {
        let info = ErrorInfo::new(RecordError::Transient("down".into()), 3);
        assert_eq!(info.kind, ErrorKind::Transient);
        assert!(info.retryable);
        assert_eq!(info.retry_count, 3);
        assert_eq!(info.message, "backend unavailable: down");
    }

    #[test]
    fn not_found_message_names_table_and_id() {
        let err = RecordError::NotFound {
            table: "tasks",
            id: "X".into(),
        };
        assert_eq!(err.to_string(), "couldn't find tasks with id=X");
    }
}
