//! Error types for the core data layer
//!
//! Errors are classified by who can act on them:
//! - Caller mistakes: validation failures, unresolvable live-query sources
//! - Rolled-back writes: transaction failures (state is unchanged)
//! - Destructive recovery: store corruption, which only a reset fixes
//! - Importer outcomes: failures reported by the external importer
//!
//! A cancelled import is not an error and never appears here.

use serde::Serialize;
use thiserror::Error;

use crate::db::DbError;

/// Error type surfaced by every public operation of the core.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("{operation} failed and was rolled back: {source}")]
    Transaction {
        operation: &'static str,
        #[source]
        source: DbError,
    },

    #[error("Database failed its integrity check: {}", errors.join("; "))]
    StoreCorruption { errors: Vec<String> },

    #[error("Cannot observe query: {0}")]
    Subscription(String),

    #[error("Import failed: {0}")]
    ImporterFailure(String),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Preferences error: {0}")]
    Preferences(String),
}

impl CoreError {
    pub fn validation(message: impl Into<String>) -> Self {
        CoreError::Validation(message.into())
    }

    pub fn subscription(message: impl Into<String>) -> Self {
        CoreError::Subscription(message.into())
    }

    /// Re-label a raw database failure as a rolled-back transaction.
    ///
    /// Validation errors raised inside the transaction keep their kind so the
    /// caller can still tell bad input from a failed write.
    pub fn into_transaction(self, operation: &'static str) -> Self {
        match self {
            CoreError::Database(source) => CoreError::Transaction { operation, source },
            other => other,
        }
    }

    /// Returns true if the only way forward is the destructive reset flow.
    pub fn requires_reset(&self) -> bool {
        matches!(self, CoreError::StoreCorruption { .. })
    }

    /// Returns true if the user can fix this by changing what they asked for.
    pub fn is_user_actionable(&self) -> bool {
        matches!(
            self,
            CoreError::Validation(_) | CoreError::Config(_) | CoreError::ImporterFailure(_)
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Validation(_) => ErrorKind::Validation,
            CoreError::Transaction { .. } => ErrorKind::Transaction,
            CoreError::StoreCorruption { .. } => ErrorKind::StoreCorruption,
            CoreError::Subscription(_) => ErrorKind::Subscription,
            CoreError::ImporterFailure(_) => ErrorKind::ImporterFailure,
            CoreError::Database(_) => ErrorKind::Database,
            CoreError::Config(_) | CoreError::Preferences(_) => ErrorKind::Configuration,
        }
    }

    /// Get a user-friendly recovery suggestion
    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "Check the selection and try again.",
            CoreError::Transaction { .. } => "Nothing was changed. Try the operation again.",
            CoreError::StoreCorruption { .. } => {
                "The messages database is corrupted. Reset it and re-import your exports."
            }
            CoreError::Subscription(_) => "This view cannot refresh itself automatically.",
            CoreError::ImporterFailure(_) => "Check that the selected files are complete exports.",
            CoreError::Database(_) => "Restart the application and try again.",
            CoreError::Config(_) => "Check ~/.chatvault/config.json.",
            CoreError::Preferences(_) => "Check file permissions in the data directory.",
        }
    }
}

/// Coarse error category for presentation layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Transaction,
    StoreCorruption,
    Subscription,
    ImporterFailure,
    Database,
    Configuration,
}

/// Serializable error representation for the UI layer
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub message: String,
    pub kind: ErrorKind,
    pub recovery_suggestion: String,
    pub requires_reset: bool,
}

impl From<&CoreError> for ErrorPayload {
    fn from(err: &CoreError) -> Self {
        ErrorPayload {
            message: err.to_string(),
            kind: err.kind(),
            recovery_suggestion: err.recovery_suggestion().to_string(),
            requires_reset: err.requires_reset(),
        }
    }
}
