//! Row identity and row views.

use crate::{CellValue, ColumnKey, DataRequest, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Opaque row identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// One versioned value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub value: CellValue,
    pub timestamp: Timestamp,
}

impl Cell {
    pub fn new(value: impl Into<CellValue>, timestamp: Timestamp) -> Self {
        Self {
            value: value.into(),
            timestamp,
        }
    }
}

/// Cells read from one row, keyed by fully-qualified column, newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowData {
    entity_id: EntityId,
    cells: BTreeMap<ColumnKey, Vec<Cell>>,
}

impl RowData {
    /// An empty row view.
    pub fn new(entity_id: EntityId) -> Self {
        Self {
            entity_id,
            cells: BTreeMap::new(),
        }
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Columns present in this view.
    pub fn columns(&self) -> impl Iterator<Item = &ColumnKey> {
        self.cells.keys()
    }

    /// Columns of one family present in this view.
    pub fn family_columns<'a>(&'a self, family: &'a str) -> impl Iterator<Item = &'a ColumnKey> {
        self.cells
            .keys()
            .filter(move |column| column.family_name() == family)
    }

    /// All versions of a column, newest first.
    pub fn cells(&self, column: &ColumnKey) -> &[Cell] {
        self.cells.get(column).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn most_recent(&self, column: &ColumnKey) -> Option<&Cell> {
        self.cells(column).first()
    }

    pub fn most_recent_value(&self, column: &ColumnKey) -> Option<&CellValue> {
        self.most_recent(column).map(|cell| &cell.value)
    }

    /// For a qualified key, true if the column has at least one cell; for a
    /// family key, true if any column of the family does.
    pub fn contains(&self, column: &ColumnKey) -> bool {
        if column.is_family() {
            self.family_columns(column.family_name()).next().is_some()
        } else {
            !self.cells(column).is_empty()
        }
    }

    /// Replace all versions of a qualified column. Cells are re-sorted newest
    /// first; an empty list removes the column.
    pub fn set_cells(&mut self, column: ColumnKey, mut cells: Vec<Cell>) {
        if cells.is_empty() {
            self.cells.remove(&column);
            return;
        }
        cells.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        self.cells.insert(column, cells);
    }

    /// Builder-style [`set_cells`](Self::set_cells) for a single value.
    pub fn with_cell(mut self, column: ColumnKey, cell: Cell) -> Self {
        let mut cells = self.cells.remove(&column).unwrap_or_default();
        cells.push(cell);
        self.set_cells(column, cells);
        self
    }

    /// Put `cell` in front of a column's versions, keeping at most
    /// `max_versions` of them.
    pub fn overlay(&mut self, column: &ColumnKey, cell: Cell, max_versions: usize) {
        let cells = self.cells.entry(column.clone()).or_default();
        cells.insert(0, cell);
        cells.truncate(max_versions.max(1));
    }

    /// Keep only what `request` asks for: requested columns, cells within the
    /// time range, at most `max_versions` per column.
    pub fn project(&self, request: &DataRequest) -> RowData {
        let time_range = request.time_range();
        let cells = self
            .cells
            .iter()
            .filter_map(|(column, cells)| {
                let settings = request.settings_for(column)?;
                let kept: Vec<Cell> = cells
                    .iter()
                    .filter(|cell| time_range.contains(cell.timestamp))
                    .take(settings.max_versions)
                    .cloned()
                    .collect();
                (!kept.is_empty()).then(|| (column.clone(), kept))
            })
            .collect();

        RowData {
            entity_id: self.entity_id.clone(),
            cells,
        }
    }
}
