//! Read requests handed to the row store.
//!
//! The engine assumes a [`DataRequest`] is already minimal and valid for the
//! table; merging overlapping expressions and schema validation happen
//! upstream.

use crate::{ColumnKey, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Half-open time range `[min, max)` applied to cell timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TimeRange {
    pub min: Option<Timestamp>,
    pub max: Option<Timestamp>,
}

impl TimeRange {
    /// Unbounded range.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(min: Timestamp, max: Timestamp) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
        }
    }

    /// Returns true if the timestamp falls inside the range.
    pub fn contains(&self, ts: Timestamp) -> bool {
        self.min.map_or(true, |min| ts >= min) && self.max.map_or(true, |max| ts < max)
    }
}

/// Per-column request settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRequest {
    /// Maximum number of versions to return, newest first. Always at least 1.
    pub max_versions: usize,
}

impl Default for ColumnRequest {
    fn default() -> Self {
        Self { max_versions: 1 }
    }
}

/// Which columns (and how many versions of each) to read from one row.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DataRequest {
    columns: BTreeMap<ColumnKey, ColumnRequest>,
    time_range: TimeRange,
}

impl DataRequest {
    pub fn builder() -> DataRequestBuilder {
        DataRequestBuilder::default()
    }

    /// Request the most recent version of each given column.
    pub fn for_columns<I>(columns: I) -> Self
    where
        I: IntoIterator<Item = ColumnKey>,
    {
        let mut builder = Self::builder();
        for column in columns {
            builder = builder.add(column);
        }
        builder.build()
    }

    pub fn columns(&self) -> impl Iterator<Item = (&ColumnKey, &ColumnRequest)> {
        self.columns.iter()
    }

    pub fn column_keys(&self) -> impl Iterator<Item = &ColumnKey> {
        self.columns.keys()
    }

    pub fn get(&self, column: &ColumnKey) -> Option<&ColumnRequest> {
        self.columns.get(column)
    }

    pub fn time_range(&self) -> TimeRange {
        self.time_range
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Settings applying to a fully-qualified column: its own entry if
    /// present, otherwise its family's entry.
    pub fn settings_for(&self, column: &ColumnKey) -> Option<ColumnRequest> {
        self.columns
            .get(column)
            .or_else(|| self.columns.get(&column.family_key()))
            .copied()
    }

    /// Returns true if the request asks for this fully-qualified column,
    /// directly or through its family.
    pub fn includes(&self, column: &ColumnKey) -> bool {
        self.settings_for(column).is_some()
    }

    /// Add the columns of `other` that this request does not already cover.
    ///
    /// Used to widen a client request with columns a freshness policy needs.
    /// Existing entries are left as they are; the time range is not widened.
    pub fn extend_with(&mut self, other: &DataRequest) {
        for (column, settings) in &other.columns {
            let covered = self.columns.contains_key(column)
                || (column.is_qualified() && self.columns.contains_key(&column.family_key()));
            if !covered {
                self.columns.insert(column.clone(), *settings);
            }
        }
    }
}

/// Builder for [`DataRequest`].
#[derive(Debug, Clone, Default)]
pub struct DataRequestBuilder {
    columns: BTreeMap<ColumnKey, ColumnRequest>,
    time_range: TimeRange,
}

impl DataRequestBuilder {
    /// Request the most recent version of a column or family.
    pub fn add(self, column: ColumnKey) -> Self {
        self.add_versions(column, 1)
    }

    /// Request up to `max_versions` versions (clamped to at least 1).
    pub fn add_versions(mut self, column: ColumnKey, max_versions: usize) -> Self {
        let settings = ColumnRequest {
            max_versions: max_versions.max(1),
        };
        self.columns.insert(column, settings);
        self
    }

    pub fn with_time_range(mut self, time_range: TimeRange) -> Self {
        self.time_range = time_range;
        self
    }

    pub fn build(self) -> DataRequest {
        DataRequest {
            columns: self.columns,
            time_range: self.time_range,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn test_builder_clamps_versions() {
        let request = DataRequest::builder()
            .add_versions(ColumnKey::column("info", "email"), 0)
            .build();
        assert_eq!(
            request.get(&ColumnKey::column("info", "email")),
            Some(&ColumnRequest { max_versions: 1 })
        );
    }

    #[test]
    fn test_settings_fall_back_to_family() {
        let request = DataRequest::builder()
            .add_versions(ColumnKey::family("info"), 3)
            .build();
        let email = ColumnKey::column("info", "email");
        assert!(request.includes(&email));
        assert_eq!(request.settings_for(&email).unwrap().max_versions, 3);
        assert!(!request.includes(&ColumnKey::column("derived", "score")));
    }

    #[test]
    fn test_extend_with_skips_covered_columns() {
        let mut request = DataRequest::builder()
            .add_versions(ColumnKey::family("info"), 2)
            .build();
        let extra = DataRequest::builder()
            .add_versions(ColumnKey::column("info", "email"), 5)
            .add(ColumnKey::column("derived", "score"))
            .build();

        request.extend_with(&extra);
        assert_eq!(request.len(), 2);
        assert!(request.get(&ColumnKey::column("info", "email")).is_none());
        assert!(request.get(&ColumnKey::column("derived", "score")).is_some());
    }

    #[test]
    fn test_time_range_is_half_open() {
        let now = Utc::now();
        let range = TimeRange::between(now, now + Duration::seconds(10));
        assert!(range.contains(now));
        assert!(range.contains(now + Duration::seconds(5)));
        assert!(!range.contains(now + Duration::seconds(10)));
        assert!(!range.contains(now - Duration::seconds(1)));
        assert!(TimeRange::all().contains(now));
    }
}
