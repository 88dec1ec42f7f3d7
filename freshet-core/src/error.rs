//! Error types for Freshet operations

use crate::{ColumnKey, EntityId};
use thiserror::Error;

/// Row store and record store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Read failed for row {entity_id}: {reason}")]
    ReadFailed { entity_id: EntityId, reason: String },

    #[error("Write failed for row {entity_id} column {column}: {reason}")]
    WriteFailed {
        entity_id: EntityId,
        column: ColumnKey,
        reason: String,
    },

    #[error("Cannot write to family-level column {column}: a qualifier is required")]
    UnqualifiedWrite { column: ColumnKey },

    #[error("Freshener record source failed: {reason}")]
    RecordSourceFailed { reason: String },

    #[error("Store lock poisoned")]
    LockPoisoned,
}

/// Configuration errors.
///
/// Raised per column while instantiating fresheners, and for invalid reader
/// configuration values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Unknown freshness policy '{policy_id}' for column {column}")]
    UnknownPolicy { column: ColumnKey, policy_id: String },

    #[error("Unknown compute function '{compute_id}' for column {column}")]
    UnknownComputeFunction { column: ColumnKey, compute_id: String },

    #[error("Missing required parameter '{parameter}' for {component}")]
    MissingParameter { component: String, parameter: String },

    #[error("Invalid parameter '{parameter}' = '{value}': {reason}")]
    InvalidParameter {
        parameter: String,
        value: String,
        reason: String,
    },

    #[error("Failed to instantiate freshener for column {column}: {reason}")]
    InstantiationFailed { column: ColumnKey, reason: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Per-column freshening faults.
///
/// These never fail a request: the column falls back to its pre-existing
/// value and the fault is recorded.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FreshenError {
    #[error("Freshness policy failed for column {column}: {reason}")]
    PolicyFailed { column: ColumnKey, reason: String },

    #[error("Compute function failed for column {column}: {reason}")]
    ComputeFailed { column: ColumnKey, reason: String },

    #[error("Write-back failed for column {column}: {reason}")]
    WriteBackFailed { column: ColumnKey, reason: String },

    #[error("{stage} panicked for column {column}")]
    Panicked { column: ColumnKey, stage: String },

    #[error("Compute task for column {column} was dropped before reporting")]
    TaskLost { column: ColumnKey },
}

impl FreshenError {
    /// Column the fault belongs to.
    pub fn column(&self) -> &ColumnKey {
        match self {
            Self::PolicyFailed { column, .. }
            | Self::ComputeFailed { column, .. }
            | Self::WriteBackFailed { column, .. }
            | Self::Panicked { column, .. }
            | Self::TaskLost { column } => column,
        }
    }

    /// Build a policy failure from any displayable error.
    pub fn policy(column: &ColumnKey, reason: impl ToString) -> Self {
        Self::PolicyFailed {
            column: column.clone(),
            reason: reason.to_string(),
        }
    }

    /// Build a compute failure from any displayable error.
    pub fn compute(column: &ColumnKey, reason: impl ToString) -> Self {
        Self::ComputeFailed {
            column: column.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Reader lifecycle errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReaderError {
    #[error("Reader is closed")]
    Closed,

    #[error("Reader lock poisoned")]
    LockPoisoned,

    #[error("Reader is missing required component: {component}")]
    MissingComponent { component: String },
}

/// Error when parsing an invalid column name.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Invalid column name '{input}': {reason}")]
pub struct ColumnKeyParseError {
    pub input: String,
    pub reason: String,
}

/// Master error type for all Freshet errors.
#[derive(Debug, Clone, Error)]
pub enum FreshetError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Freshen error: {0}")]
    Freshen(#[from] FreshenError),

    #[error("Reader error: {0}")]
    Reader(#[from] ReaderError),

    #[error("Column parse error: {0}")]
    ColumnKey(#[from] ColumnKeyParseError),
}

impl FreshetError {
    /// Returns true if this error means the reader has been closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Reader(ReaderError::Closed))
    }
}

/// Result type alias for Freshet operations.
pub type FreshetResult<T> = Result<T, FreshetError>;

// =============================================================================
// TESTS
// =============================================================================
