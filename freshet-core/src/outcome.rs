//! Per-column freshening results.

use crate::{Cell, ColumnKey, FreshenError, RowData};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How one freshened column was resolved for one request.
///
/// Decided exactly once per (row, column) per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ColumnOutcome {
    /// The policy accepted the stored value.
    Fresh,
    /// A compute finished in time; `cell` is durable in the store.
    Computed { cell: Cell },
    /// The deadline passed first. The stored value is returned and the
    /// compute keeps running.
    Stale,
    /// The policy, compute or write-back failed. The stored value is returned.
    Failed {
        #[serde(skip)]
        error: Option<FreshenError>,
        reason: String,
    },
}

impl ColumnOutcome {
    pub fn failed(error: FreshenError) -> Self {
        let reason = error.to_string();
        Self::Failed {
            error: Some(error),
            reason,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::Computed { .. } => "computed",
            Self::Stale => "stale",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh)
    }

    pub fn is_computed(&self) -> bool {
        matches!(self, Self::Computed { .. })
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// The underlying fault, for failed outcomes built in this process.
    pub fn error(&self) -> Option<&FreshenError> {
        match self {
            Self::Failed { error, .. } => error.as_ref(),
            _ => None,
        }
    }
}

/// A row view together with the outcome of every column that had an
/// applicable freshener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreshenedRow {
    pub row: RowData,
    pub outcomes: BTreeMap<ColumnKey, ColumnOutcome>,
}

impl FreshenedRow {
    pub fn new(row: RowData) -> Self {
        Self {
            row,
            outcomes: BTreeMap::new(),
        }
    }

    pub fn outcome(&self, column: &ColumnKey) -> Option<&ColumnOutcome> {
        self.outcomes.get(column)
    }

    /// Returns true if no freshened column was left stale or failed.
    pub fn is_fully_fresh(&self) -> bool {
        self.outcomes
            .values()
            .all(|outcome| outcome.is_fresh() || outcome.is_computed())
    }

    pub fn count(&self, predicate: impl Fn(&ColumnOutcome) -> bool) -> usize {
        self.outcomes.values().filter(|outcome| predicate(outcome)).count()
    }

    pub fn into_row(self) -> RowData {
        self.row
    }
}
