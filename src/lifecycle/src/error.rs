//! Error types for the lifecycle engine.
//!
//! Validation failures carry a stable [`ValidationErrorKind`] so callers
//! (the CLI in particular) can map them to distinct exit codes. Execution
//! failures are classified as transient or fatal, which decides whether
//! the queue entry is retried.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::policy::{ActionType, PolicyCategory};

pub type Result<T, E = LifecycleError> = std::result::Result<T, E>;

/// Top-level error returned by registry, evaluator, executor and service
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("policy not found: {0}")]
    PolicyNotFound(String),

    #[error("no queue entry for policy {policy} and target {target}")]
    QueueEntryNotFound { policy: String, target: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),
}

/// Stable classification of policy validation failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationErrorKind {
    UnknownTarget,
    MissingParameter,
    CategoryActionMismatch,
    NoCondition,
    PriorityOutOfRange,
    InvalidSelector,
    InvalidPredicate,
    InvalidCondition,
    DuplicateName,
    InvalidName,
}

impl ValidationErrorKind {
    /// Process exit code used by the command line for this failure.
    pub fn exit_code(self) -> u8 {
        match self {
            ValidationErrorKind::UnknownTarget => 10,
            ValidationErrorKind::MissingParameter => 11,
            ValidationErrorKind::CategoryActionMismatch => 12,
            ValidationErrorKind::NoCondition => 13,
            ValidationErrorKind::PriorityOutOfRange => 14,
            ValidationErrorKind::InvalidSelector
            | ValidationErrorKind::InvalidPredicate
            | ValidationErrorKind::InvalidCondition => 15,
            ValidationErrorKind::DuplicateName => 16,
            ValidationErrorKind::InvalidName => 17,
        }
    }
}

/// A policy definition was rejected. Nothing was persisted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("selector namespace '{namespace}' does not resolve to any known namespace")]
    UnknownTarget { namespace: String },

    #[error("action '{action}' requires parameter '{parameter}'")]
    MissingParameter {
        action: ActionType,
        parameter: &'static str,
    },

    #[error("action '{action}' is not permitted for category '{category}'")]
    CategoryActionMismatch {
        category: PolicyCategory,
        action: ActionType,
    },

    #[error("policy must define at least one condition")]
    NoCondition,

    #[error("priority {priority} is outside the allowed range {min}..={max}")]
    PriorityOutOfRange { priority: u32, min: u32, max: u32 },

    #[error("invalid selector pattern '{pattern}': {message}")]
    InvalidSelector { pattern: String, message: String },

    #[error("invalid predicate: {0}")]
    InvalidPredicate(String),

    #[error("invalid condition: {0}")]
    InvalidCondition(String),

    #[error("a policy named '{0}' already exists")]
    DuplicateName(String),

    #[error("invalid policy name: {0}")]
    InvalidName(String),
}

impl ValidationError {
    pub fn kind(&self) -> ValidationErrorKind {
        match self {
            ValidationError::UnknownTarget { .. } => ValidationErrorKind::UnknownTarget,
            ValidationError::MissingParameter { .. } => ValidationErrorKind::MissingParameter,
            ValidationError::CategoryActionMismatch { .. } => {
                ValidationErrorKind::CategoryActionMismatch
            }
            ValidationError::NoCondition => ValidationErrorKind::NoCondition,
            ValidationError::PriorityOutOfRange { .. } => ValidationErrorKind::PriorityOutOfRange,
            ValidationError::InvalidSelector { .. } => ValidationErrorKind::InvalidSelector,
            ValidationError::InvalidPredicate(_) => ValidationErrorKind::InvalidPredicate,
            ValidationError::InvalidCondition(_) => ValidationErrorKind::InvalidCondition,
            ValidationError::DuplicateName(_) => ValidationErrorKind::DuplicateName,
            ValidationError::InvalidName(_) => ValidationErrorKind::InvalidName,
        }
    }
}

/// What went wrong while a storage driver was performing an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    /// The target is locked or otherwise busy
    ResourceBusy,
    /// Lost a race with a concurrent writer
    Contention,
    /// Not enough free space at the destination
    InsufficientSpace,
    /// The target no longer exists
    MissingTarget,
    PermissionDenied,
    /// Parameters the driver cannot act on
    InvalidConfiguration,
    /// Unclassified driver failure
    Other,
}

impl ExecutionErrorKind {
    /// Transient kinds are retried up to the configured attempt limit.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ExecutionErrorKind::ResourceBusy
                | ExecutionErrorKind::Contention
                | ExecutionErrorKind::InsufficientSpace
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionErrorKind::ResourceBusy => "resource_busy",
            ExecutionErrorKind::Contention => "contention",
            ExecutionErrorKind::InsufficientSpace => "insufficient_space",
            ExecutionErrorKind::MissingTarget => "missing_target",
            ExecutionErrorKind::PermissionDenied => "permission_denied",
            ExecutionErrorKind::InvalidConfiguration => "invalid_configuration",
            ExecutionErrorKind::Other => "other",
        }
    }
}

impl fmt::Display for ExecutionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified execution failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("transient failure ({kind}): {message}")]
    Transient {
        kind: ExecutionErrorKind,
        message: String,
    },

    #[error("fatal failure ({kind}): {message}")]
    Fatal {
        kind: ExecutionErrorKind,
        message: String,
    },
}

impl ExecutionError {
    /// Classify a failure by its kind.
    pub fn classify(kind: ExecutionErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        if kind.is_transient() {
            ExecutionError::Transient { kind, message }
        } else {
            ExecutionError::Fatal { kind, message }
        }
    }

    pub fn kind(&self) -> ExecutionErrorKind {
        match self {
            ExecutionError::Transient { kind, .. } | ExecutionError::Fatal { kind, .. } => *kind,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ExecutionError::Transient { message, .. } | ExecutionError::Fatal { message, .. } => {
                message
            }
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ExecutionError::Transient { .. })
    }
}

/// Persistence failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unsupported store DSN '{0}'")]
    UnsupportedDsn(String),

    #[error("failed to prepare store location: {0}")]
    Io(#[from] std::io::Error),
}
