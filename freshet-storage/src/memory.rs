//! In-memory stores for tests and embedders.

use crate::{FreshenerRecordStore, RowStore};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use freshet_core::{
    Cell, CellValue, ColumnKey, ConfigError, DataRequest, EntityId, FreshenerRecord,
    FreshenerRecords, FreshetResult, RowData, StoreError, Timestamp,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// Number of versions kept per column unless configured otherwise.
pub const DEFAULT_RETAINED_VERSIONS: usize = 16;

// ============================================================================
// ROW STORE
// ============================================================================

/// Versioned rows held in a map.
///
/// Every write is stamped strictly newer than the column's current newest
/// cell, so concurrent writers to the same cell resolve last-write-wins.
#[derive(Debug)]
pub struct InMemoryRowStore {
    rows: RwLock<HashMap<EntityId, RowData>>,
    retained_versions: usize,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl Default for InMemoryRowStore {
    fn default() -> Self {
        Self::with_retained_versions(DEFAULT_RETAINED_VERSIONS)
    }
}

impl InMemoryRowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `versions` cells per column (at least 1).
    pub fn with_retained_versions(versions: usize) -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            retained_versions: versions.max(1),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Seed a cell with an explicit timestamp.
    pub fn put(&self, entity_id: impl Into<EntityId>, column: ColumnKey, cell: Cell) -> FreshetResult<()> {
        if column.is_family() {
            return Err(StoreError::UnqualifiedWrite { column }.into());
        }
        let entity_id = entity_id.into();
        let mut rows = self.rows.write().map_err(|_| StoreError::LockPoisoned)?;
        let row = rows
            .entry(entity_id.clone())
            .or_insert_with(|| RowData::new(entity_id));
        let mut cells = row.cells(&column).to_vec();
        cells.push(cell);
        cells.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        cells.truncate(self.retained_versions);
        row.set_cells(column, cells);
        Ok(())
    }

    /// Full copy of a stored row, bypassing request filtering.
    pub fn row(&self, entity_id: &EntityId) -> FreshetResult<Option<RowData>> {
        let rows = self.rows.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(rows.get(entity_id).cloned())
    }

    /// Most recent value of one column, bypassing request filtering.
    pub fn latest_value(&self, entity_id: &EntityId, column: &ColumnKey) -> FreshetResult<Option<CellValue>> {
        Ok(self
            .row(entity_id)?
            .and_then(|row| row.most_recent_value(column).cloned()))
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RowStore for InMemoryRowStore {
    async fn read(&self, entity_id: &EntityId, request: &DataRequest) -> FreshetResult<RowData> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let rows = self.rows.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(rows
            .get(entity_id)
            .map(|row| row.project(request))
            .unwrap_or_else(|| RowData::new(entity_id.clone())))
    }

    async fn write(
        &self,
        entity_id: &EntityId,
        column: &ColumnKey,
        value: CellValue,
    ) -> FreshetResult<Timestamp> {
        if column.is_family() {
            return Err(StoreError::UnqualifiedWrite {
                column: column.clone(),
            }
            .into());
        }

        let mut rows = self.rows.write().map_err(|_| StoreError::LockPoisoned)?;
        let row = rows
            .entry(entity_id.clone())
            .or_insert_with(|| RowData::new(entity_id.clone()));

        let now = Utc::now();
        let timestamp = match row.most_recent(column) {
            Some(newest) if newest.timestamp >= now => newest.timestamp + Duration::microseconds(1),
            _ => now,
        };
        row.overlay(column, Cell::new(value, timestamp), self.retained_versions);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(timestamp)
    }
}

// ============================================================================
// RECORD STORE
// ============================================================================

/// Freshener records held in a map.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: RwLock<FreshenerRecords>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(self, column: ColumnKey, record: FreshenerRecord) -> Self {
        if let Ok(mut records) = self.records.write() {
            records.insert(column, record);
        }
        self
    }

    /// Load records from a JSON object keyed by column name:
    ///
    /// ```json
    /// { "info:email": { "policy_id": "always", "compute_id": "constant",
    ///                   "compute_parameters": { "value": "\"x\"" } } }
    /// ```
    pub fn from_json_str(json: &str) -> FreshetResult<Self> {
        let records: FreshenerRecords =
            serde_json::from_str(json).map_err(|e| ConfigError::InvalidValue {
                field: "freshener_records".to_string(),
                value: json.chars().take(64).collect(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            records: RwLock::new(records),
        })
    }

    /// Attach or replace the record for a column.
    pub fn register(&self, column: ColumnKey, record: FreshenerRecord) -> FreshetResult<Option<FreshenerRecord>> {
        let mut records = self.records.write().map_err(|_| StoreError::LockPoisoned)?;
        Ok(records.insert(column, record))
    }

    pub fn remove(&self, column: &ColumnKey) -> FreshetResult<Option<FreshenerRecord>> {
        let mut records = self.records.write().map_err(|_| StoreError::LockPoisoned)?;
        Ok(records.remove(column))
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl FreshenerRecordStore for InMemoryRecordStore {
    async fn current_records(&self) -> FreshetResult<FreshenerRecords> {
        let records = self.records.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(records.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use freshet_core::{FreshetError, TimeRange};
    use serde_json::json;

    fn email() -> ColumnKey {
        ColumnKey::column("info", "email")
    }

    #[tokio::test]
    async fn test_missing_row_reads_empty() {
        let store = InMemoryRowStore::new();
        let row = store
            .read(&"nobody".into(), &DataRequest::for_columns([email()]))
            .await
            .unwrap();
        assert!(row.is_empty());
        assert_eq!(row.entity_id().as_str(), "nobody");
        assert_eq!(store.read_count(), 1);
    }

    #[tokio::test]
    async fn test_write_is_strictly_newer() {
        let store = InMemoryRowStore::new();
        let future = Utc::now() + Duration::seconds(60);
        store
            .put("row-1", email(), Cell::new("seeded", future))
            .unwrap();

        let ts = store
            .write(&"row-1".into(), &email(), json!("written"))
            .await
            .unwrap();
        assert!(ts > future);

        let row = store
            .read(&"row-1".into(), &DataRequest::for_columns([email()]))
            .await
            .unwrap();
        assert_eq!(row.most_recent_value(&email()), Some(&json!("written")));
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_family_read_and_version_limits() {
        let store = InMemoryRowStore::with_retained_versions(2);
        let now = Utc::now();
        let name = ColumnKey::column("info", "name");
        for i in 0..3 {
            store
                .put("row-1", email(), Cell::new(i, now - Duration::seconds(10 - i)))
                .unwrap();
        }
        store
            .put("row-1", name.clone(), Cell::new("ann", now))
            .unwrap();
        store
            .put("row-1", ColumnKey::column("derived", "score"), Cell::new(1, now))
            .unwrap();

        let request = DataRequest::builder()
            .add_versions(ColumnKey::family("info"), 5)
            .build();
        let row = store.read(&"row-1".into(), &request).await.unwrap();
        assert_eq!(row.cells(&email()).len(), 2);
        assert_eq!(row.most_recent_value(&email()), Some(&json!(2)));
        assert!(row.contains(&name));
        assert!(!row.contains(&ColumnKey::family("derived")));

        let ranged = DataRequest::builder()
            .add_versions(email(), 5)
            .with_time_range(TimeRange::between(now - Duration::seconds(20), now - Duration::seconds(8)))
            .build();
        let row = store.read(&"row-1".into(), &ranged).await.unwrap();
        assert_eq!(row.cells(&email()).len(), 1);
        assert_eq!(row.most_recent_value(&email()), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_family_write_rejected() {
        let store = InMemoryRowStore::new();
        let err = store
            .write(&"row-1".into(), &ColumnKey::family("info"), json!(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FreshetError::Store(StoreError::UnqualifiedWrite { .. })
        ));
    }

    #[tokio::test]
    async fn test_record_store_register_and_remove() {
        let store = InMemoryRecordStore::new()
            .with_record(email(), FreshenerRecord::new("always", "constant"));
        assert_eq!(store.len(), 1);

        let previous = store
            .register(email(), FreshenerRecord::new("never", "constant"))
            .unwrap();
        assert_eq!(previous.map(|r| r.policy_id), Some("always".to_string()));

        let records = store.current_records().await.unwrap();
        assert_eq!(records[&email()].policy_id, "never");

        store.remove(&email()).unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_record_store_from_json() {
        let store = InMemoryRecordStore::from_json_str(
            r#"{
                "info:email": {
                    "policy_id": "shelf_life",
                    "policy_parameters": { "shelf_life_ms": "1000" },
                    "compute_id": "constant",
                    "compute_parameters": { "value": "\"x\"" }
                },
                "derived": { "policy_id": "always", "compute_id": "constant" }
            }"#,
        )
        .unwrap();
        let records = store.current_records().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[&email()].policy_parameters.get("shelf_life_ms"),
            Some(&"1000".to_string())
        );
        assert!(records.contains_key(&ColumnKey::family("derived")));

        assert!(InMemoryRecordStore::from_json_str(r#"{"info:": {}}"#).is_err());
    }
}
