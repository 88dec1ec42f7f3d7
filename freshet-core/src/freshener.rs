//! Capability traits for pluggable freshening behaviour.
//!
//! A freshener pairs a [`FreshnessPolicy`] (is the stored value good
//! enough?) with a [`ComputeFunction`] (produce a new value). Both are
//! instantiated once per registry build from a
//! [`FreshenerRecord`](crate::FreshenerRecord) and shared read-only by every
//! request bound to that registry snapshot.

use crate::{CellValue, ColumnKey, ConfigError, DataRequest, EntityId, FreshetResult, ParameterMap, RowData};
use async_trait::async_trait;
use std::str::FromStr;

/// Per-invocation view handed to policies and compute functions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreshenerContext {
    entity_id: EntityId,
    column: ColumnKey,
    attached_to: ColumnKey,
    parameters: ParameterMap,
}

impl FreshenerContext {
    /// `column` is the fully-qualified column being freshened; `attached_to`
    /// is the key the freshener record is registered under (the same column,
    /// or its family).
    pub fn new(
        entity_id: EntityId,
        column: ColumnKey,
        attached_to: ColumnKey,
        parameters: ParameterMap,
    ) -> Self {
        Self {
            entity_id,
            column,
            attached_to,
            parameters,
        }
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    pub fn column(&self) -> &ColumnKey {
        &self.column
    }

    pub fn attached_to(&self) -> &ColumnKey {
        &self.attached_to
    }

    pub fn parameters(&self) -> &ParameterMap {
        &self.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// Parse a parameter, returning `Ok(None)` when it is absent.
    pub fn parse_parameter<T>(&self, name: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.parameter(name)
            .map(|raw| {
                raw.parse::<T>().map_err(|e| ConfigError::InvalidParameter {
                    parameter: name.to_string(),
                    value: raw.to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }
}

/// Decides whether the stored data for one column is fresh enough to skip
/// recomputation.
///
/// Implementations run inline on the reading task and must be cheap: no I/O,
/// no blocking.
pub trait FreshnessPolicy: Send + Sync {
    /// Returns `Ok(true)` if the row's current data for `context.column()`
    /// may be served as is.
    fn is_fresh(&self, row: &RowData, context: &FreshenerContext) -> FreshetResult<bool>;

    /// Extra columns this policy needs in the row it inspects, beyond what
    /// the client requested.
    fn data_request(&self) -> Option<DataRequest> {
        None
    }
}

/// Produces a new value for one column; the engine writes it back.
///
/// The same (row, column) may be computed concurrently by two requests, so
/// implementations must tolerate duplicate execution. CPU-heavy work should
/// move to `spawn_blocking` rather than stall the runtime.
#[async_trait]
pub trait ComputeFunction: Send + Sync {
    async fn compute(&self, row: &RowData, context: &FreshenerContext) -> FreshetResult<CellValue>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Cell, FreshetError};
    use chrono::Utc;
    use serde_json::json;

    struct HasValue;

    impl FreshnessPolicy for HasValue {
        fn is_fresh(&self, row: &RowData, context: &FreshenerContext) -> FreshetResult<bool> {
            Ok(row.most_recent(context.column()).is_some())
        }
    }

    struct Echo;

    #[async_trait]
    impl ComputeFunction for Echo {
        async fn compute(
            &self,
            _row: &RowData,
            context: &FreshenerContext,
        ) -> FreshetResult<CellValue> {
            Ok(json!(context.parameter("value").unwrap_or("none")))
        }
    }

    fn context(parameters: ParameterMap) -> FreshenerContext {
        let column = ColumnKey::column("info", "email");
        FreshenerContext::new("row-1".into(), column.clone(), column, parameters)
    }

    #[test]
    fn test_parse_parameter() {
        let mut parameters = ParameterMap::new();
        parameters.insert("limit".to_string(), "42".to_string());
        parameters.insert("bad".to_string(), "x".to_string());
        let ctx = context(parameters);

        assert_eq!(ctx.parse_parameter::<u64>("limit").unwrap(), Some(42));
        assert_eq!(ctx.parse_parameter::<u64>("missing").unwrap(), None);
        assert!(matches!(
            ctx.parse_parameter::<u64>("bad"),
            Err(ConfigError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_policy_object_safety() {
        let policy: Box<dyn FreshnessPolicy> = Box::new(HasValue);
        let ctx = context(ParameterMap::new());
        let empty = RowData::new("row-1".into());
        let full = RowData::new("row-1".into())
            .with_cell(ctx.column().clone(), Cell::new("a@example.com", Utc::now()));

        assert!(!policy.is_fresh(&empty, &ctx).unwrap());
        assert!(policy.is_fresh(&full, &ctx).unwrap());
        assert!(policy.data_request().is_none());
    }

    #[tokio::test]
    async fn test_compute_object_safety() -> Result<(), FreshetError> {
        let compute: Box<dyn ComputeFunction> = Box::new(Echo);
        let mut parameters = ParameterMap::new();
        parameters.insert("value".to_string(), "hi".to_string());
        let value = compute
            .compute(&RowData::new("row-1".into()), &context(parameters))
            .await?;
        assert_eq!(value, json!("hi"));
        Ok(())
    }
}
