use std::fmt;

use sled::transaction::{ConflictableTransactionError, TransactionError};

pub type Result<T> = std::result::Result<T, WorkflowError>;

/// One rejected input field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TaxIdError {
    #[error("tax id must have 11 digits, found {0}")]
    WrongLength(usize),
    #[error("tax id cannot repeat a single digit")]
    RepeatedDigits,
    #[error("tax id check digits do not match")]
    ChecksumMismatch,
}

/// Machine readable classification of a [`WorkflowError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Conflict,
    InvalidState,
    Unauthorized,
    Forbidden,
    NotFound,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation_error",
            ErrorKind::Conflict => "conflict",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Internal => "internal",
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("invalid input: {}", join_fields(.0))]
    Validation(Vec<FieldError>),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("operation not allowed in current state: {0}")]
    InvalidState(String),
    #[error("sign in required")]
    Unauthorized,
    #[error("not allowed for this user")]
    Forbidden,
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    // detail is only for logs, never for the caller
    #[error("internal error")]
    Internal(String),
}

fn join_fields(fields: &[FieldError]) -> String {
    fields
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl WorkflowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkflowError::Validation(_) => ErrorKind::Validation,
            WorkflowError::Conflict(_) => ErrorKind::Conflict,
            WorkflowError::InvalidState(_) => ErrorKind::InvalidState,
            WorkflowError::Unauthorized => ErrorKind::Unauthorized,
            WorkflowError::Forbidden => ErrorKind::Forbidden,
            WorkflowError::NotFound { .. } => ErrorKind::NotFound,
            WorkflowError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn field(field: &str, message: impl Into<String>) -> Self {
        WorkflowError::Validation(vec![FieldError::new(field, message)])
    }

    pub fn not_found(entity: &'static str, id: &str) -> Self {
        WorkflowError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn internal(detail: impl fmt::Display) -> Self {
        let detail = detail.to_string();
        tracing::error!(%detail, "internal workflow failure");
        WorkflowError::Internal(detail)
    }
}

impl From<sled::Error> for WorkflowError {
    fn from(value: sled::Error) -> Self {
        WorkflowError::internal(value)
    }
}

impl From<TransactionError<WorkflowError>> for WorkflowError {
    fn from(value: TransactionError<WorkflowError>) -> Self {
        match value {
            TransactionError::Abort(err) => err,
            TransactionError::Storage(err) => err.into(),
        }
    }
}

impl From<WorkflowError> for ConflictableTransactionError<WorkflowError> {
    fn from(value: WorkflowError) -> Self {
        ConflictableTransactionError::Abort(value)
    }
}

impl From<TaxIdError> for WorkflowError {
    fn from(value: TaxIdError) -> Self {
        WorkflowError::field("driver_tax_id", value.to_string())
    }
}
