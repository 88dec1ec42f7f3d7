//! Freshet Storage - Store Interfaces and In-Memory Implementations
//!
//! The freshening engine reaches the outside world through two narrow async
//! interfaces: [`RowStore`] for reading rows and writing computed values
//! back, and [`FreshenerRecordStore`] for the durable freshener
//! configuration. Request validation, expression merging and the store's
//! own durability all live behind these traits.

use async_trait::async_trait;
use freshet_core::{
    CellValue, ColumnKey, DataRequest, EntityId, FreshenerRecords, FreshetResult, RowData, Timestamp,
};
use std::sync::Arc;

mod memory;

pub use memory::{InMemoryRecordStore, InMemoryRowStore};

/// Versioned column store holding the rows being freshened.
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Read the cells of one row selected by `request`.
    ///
    /// A missing row is an empty [`RowData`], not an
    /// error.
    async fn read(
        &self,
        entity_id: &EntityId,
        request: &DataRequest,
    ) -> FreshetResult<RowData>;

    /// Append a new version of a fully-qualified column and return the
    /// timestamp it was stored under.
    ///
    /// The value must be durable when this returns. Concurrent writes to the
    /// same cell resolve last-write-wins.
    async fn write(
        &self,
        entity_id: &EntityId,
        column: &ColumnKey,
        value: CellValue,
    ) -> FreshetResult<Timestamp>;
}

/// Durable source of freshener records.
///
/// The engine only takes snapshots; it never watches for changes.
#[async_trait]
pub trait FreshenerRecordStore: Send + Sync {
    /// Every record currently attached to a column of the table.
    async fn current_records(&self) -> FreshetResult<FreshenerRecords>;
}

#[async_trait]
impl<T: RowStore + ?Sized> RowStore for Arc<T> {
    async fn read(
        &self,
        entity_id: &EntityId,
        request: &DataRequest,
    ) -> FreshetResult<RowData> {
        (**self).read(entity_id, request).await
    }

    async fn write(
        &self,
        entity_id: &EntityId,
        column: &ColumnKey,
        value: CellValue,
    ) -> FreshetResult<Timestamp> {
        (**self).write(entity_id, column, value).await
    }
}

#[async_trait]
impl<T: FreshenerRecordStore + ?Sized> FreshenerRecordStore for Arc<T> {
    async fn current_records(&self) -> FreshetResult<FreshenerRecords> {
        (**self).current_records().await
    }
}
