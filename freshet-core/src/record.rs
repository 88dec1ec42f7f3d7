//! Freshener records as stored by the record source.

use crate::{compute_content_hash, ColumnKey, ConfigError, ContentHash};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// String parameters handed to policies and compute functions.
pub type ParameterMap = BTreeMap<String, String>;

/// Every record known to a record source, keyed by the column it freshens.
pub type FreshenerRecords = BTreeMap<ColumnKey, FreshenerRecord>;

/// Configuration of one freshener: which policy and compute function to
/// instantiate, and with what parameters.
///
/// Two records are equal exactly when a reload may keep the existing
/// instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FreshenerRecord {
    pub policy_id: String,
    #[serde(default)]
    pub policy_parameters: ParameterMap,
    pub compute_id: String,
    #[serde(default)]
    pub compute_parameters: ParameterMap,
}

impl FreshenerRecord {
    pub fn new(policy_id: impl Into<String>, compute_id: impl Into<String>) -> Self {
        Self {
            policy_id: policy_id.into(),
            policy_parameters: ParameterMap::new(),
            compute_id: compute_id.into(),
            compute_parameters: ParameterMap::new(),
        }
    }

    pub fn with_policy_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.policy_parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_compute_parameter(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.compute_parameters.insert(key.into(), value.into());
        self
    }

    /// SHA-256 of the record's canonical JSON form.
    ///
    /// Parameter maps are ordered, so equal records hash equally.
    pub fn fingerprint(&self) -> ContentHash {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        compute_content_hash(&canonical)
    }

    /// Short hex prefix of the fingerprint, for log fields.
    pub fn short_fingerprint(&self) -> String {
        hex::encode(&self.fingerprint()[..6])
    }

    /// Reject records that can never be instantiated.
    pub fn validate(&self, column: &ColumnKey) -> Result<(), ConfigError> {
        if self.policy_id.trim().is_empty() {
            return Err(ConfigError::UnknownPolicy {
                column: column.clone(),
                policy_id: self.policy_id.clone(),
            });
        }
        if self.compute_id.trim().is_empty() {
            return Err(ConfigError::UnknownComputeFunction {
                column: column.clone(),
                compute_id: self.compute_id.clone(),
            });
        }
        Ok(())
    }
}
