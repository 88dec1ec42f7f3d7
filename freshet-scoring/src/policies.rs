//! Built-in freshness policies and compute functions.
//!
//! | id | kind | parameters |
//! |---|---|---|
//! | `always` | policy | none; data is never fresh |
//! | `never` | policy | none; data is always fresh |
//! | `shelf_life` | policy | `shelf_life_ms`: max age of the newest cell |
//! | `newer_than` | policy | `newer_than_ms`: epoch millis the newest cell must exceed |
//! | `constant` | compute | `value`: JSON text of the value to write |

use crate::catalog::FreshenerCatalog;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use freshet_core::{
    CellValue, ComputeFunction, ConfigError, FreshenerContext, FreshetResult, FreshnessPolicy,
    ParameterMap, RowData, Timestamp,
};
use std::sync::Arc;

pub const SHELF_LIFE_PARAM: &str = "shelf_life_ms";
pub const NEWER_THAN_PARAM: &str = "newer_than_ms";
pub const CONSTANT_VALUE_PARAM: &str = "value";

/// Register every built-in under its id.
pub fn register_builtins(catalog: &mut FreshenerCatalog) {
    catalog.register_policy_instance("always", Arc::new(AlwaysFreshen));
    catalog.register_policy_instance("never", Arc::new(NeverFreshen));
    catalog.register_policy("shelf_life", |params| {
        Ok(Arc::new(ShelfLife::from_parameters(params)?) as Arc<dyn FreshnessPolicy>)
    });
    catalog.register_policy("newer_than", |params| {
        Ok(Arc::new(NewerThan::from_parameters(params)?) as Arc<dyn FreshnessPolicy>)
    });
    catalog.register_compute("constant", |params| {
        Ok(Arc::new(ConstantCompute::from_parameters(params)?) as Arc<dyn ComputeFunction>)
    });
}

fn required<'a>(params: &'a ParameterMap, component: &str, name: &str) -> Result<&'a str, ConfigError> {
    params
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| ConfigError::MissingParameter {
            component: component.to_string(),
            parameter: name.to_string(),
        })
}

fn parse_millis(name: &str, raw: &str) -> Result<i64, ConfigError> {
    raw.trim()
        .parse::<i64>()
        .map_err(|e| ConfigError::InvalidParameter {
            parameter: name.to_string(),
            value: raw.to_string(),
            reason: e.to_string(),
        })
}

fn newest_timestamp(row: &RowData, context: &FreshenerContext) -> Option<Timestamp> {
    row.most_recent(context.column()).map(|cell| cell.timestamp)
}

// ============================================================================
// POLICIES
// ============================================================================

/// Stored data is never fresh; every read recomputes.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysFreshen;

impl FreshnessPolicy for AlwaysFreshen {
    fn is_fresh(&self, _row: &RowData, _context: &FreshenerContext) -> FreshetResult<bool> {
        Ok(false)
    }
}

/// Stored data is always fresh; the compute function never runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverFreshen;

impl FreshnessPolicy for NeverFreshen {
    fn is_fresh(&self, _row: &RowData, _context: &FreshenerContext) -> FreshetResult<bool> {
        Ok(true)
    }
}

/// Fresh while the newest cell is younger than the shelf life.
///
/// A missing cell is never fresh.
#[derive(Debug, Clone, Copy)]
pub struct ShelfLife {
    shelf_life: chrono::Duration,
}

impl ShelfLife {
    pub fn new(shelf_life: chrono::Duration) -> Self {
        Self { shelf_life }
    }

    pub fn from_parameters(params: &ParameterMap) -> Result<Self, ConfigError> {
        let raw = required(params, "shelf_life policy", SHELF_LIFE_PARAM)?;
        let millis = parse_millis(SHELF_LIFE_PARAM, raw)?;
        if millis < 0 {
            return Err(ConfigError::InvalidParameter {
                parameter: SHELF_LIFE_PARAM.to_string(),
                value: raw.to_string(),
                reason: "shelf life must not be negative".to_string(),
            });
        }
        Ok(Self::new(chrono::Duration::milliseconds(millis)))
    }
}

impl FreshnessPolicy for ShelfLife {
    fn is_fresh(&self, row: &RowData, context: &FreshenerContext) -> FreshetResult<bool> {
        Ok(newest_timestamp(row, context)
            .map(|written| Utc::now() - written < self.shelf_life)
            .unwrap_or(false))
    }
}

/// Fresh when the newest cell was written after a fixed instant.
#[derive(Debug, Clone, Copy)]
pub struct NewerThan {
    threshold: Timestamp,
}

impl NewerThan {
    pub fn new(threshold: Timestamp) -> Self {
        Self { threshold }
    }

    pub fn from_parameters(params: &ParameterMap) -> Result<Self, ConfigError> {
        let raw = required(params, "newer_than policy", NEWER_THAN_PARAM)?;
        let millis = parse_millis(NEWER_THAN_PARAM, raw)?;
        let threshold =
            DateTime::from_timestamp_millis(millis).ok_or_else(|| ConfigError::InvalidParameter {
                parameter: NEWER_THAN_PARAM.to_string(),
                value: raw.to_string(),
                reason: "timestamp out of range".to_string(),
            })?;
        Ok(Self::new(threshold))
    }
}

impl FreshnessPolicy for NewerThan {
    fn is_fresh(&self, row: &RowData, context: &FreshenerContext) -> FreshetResult<bool> {
        Ok(newest_timestamp(row, context)
            .map(|written| written > self.threshold)
            .unwrap_or(false))
    }
}

// ============================================================================
// COMPUTE FUNCTIONS
// ============================================================================

/// Writes the same configured value every time.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstantCompute {
    value: CellValue,
}

impl ConstantCompute {
    pub fn new(value: impl Into<CellValue>) -> Self {
        Self { value: value.into() }
    }

    pub fn from_parameters(params: &ParameterMap) -> Result<Self, ConfigError> {
        let raw = required(params, "constant compute", CONSTANT_VALUE_PARAM)?;
        let value = serde_json::from_str(raw).map_err(|e| ConfigError::InvalidParameter {
            parameter: CONSTANT_VALUE_PARAM.to_string(),
            value: raw.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { value })
    }
}

#[async_trait]
impl ComputeFunction for ConstantCompute {
    async fn compute(&self, _row: &RowData, _context: &FreshenerContext) -> FreshetResult<CellValue> {
        Ok(self.value.clone())
    }
}
