//! Factory of freshness policies and compute functions keyed by identifier.
//!
//! A [`FreshenerRecord`] names its policy and compute function by string id.
//! The catalog resolves those ids once, when a registry snapshot is built,
//! never on the request path.

use crate::policies;
use crate::registry::Freshener;
use freshet_core::{
    ColumnKey, ComputeFunction, ConfigError, FreshenerRecord, FreshnessPolicy, ParameterMap,
};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Builds a policy from its record parameters.
pub type PolicyFactory =
    Arc<dyn Fn(&ParameterMap) -> Result<Arc<dyn FreshnessPolicy>, ConfigError> + Send + Sync>;

/// Builds a compute function from its record parameters.
pub type ComputeFactory =
    Arc<dyn Fn(&ParameterMap) -> Result<Arc<dyn ComputeFunction>, ConfigError> + Send + Sync>;

/// Registry of policy and compute-function factories.
/// Factories must be explicitly registered - no auto-discovery.
///
/// # Example
/// ```ignore
/// let mut catalog = FreshenerCatalog::with_builtins();
/// catalog.register_compute("lookup_email", |params| {
///     Ok(Arc::new(EmailLookup::from_params(params)?) as Arc<dyn ComputeFunction>)
/// });
/// ```
#[derive(Clone, Default)]
pub struct FreshenerCatalog {
    policies: HashMap<String, PolicyFactory>,
    computes: HashMap<String, ComputeFactory>,
}

impl FreshenerCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a catalog holding the built-in policies and compute functions.
    pub fn with_builtins() -> Self {
        let mut catalog = Self::new();
        policies::register_builtins(&mut catalog);
        catalog
    }

    /// Register a policy factory. Replaces any factory with the same id.
    pub fn register_policy<F>(&mut self, id: impl Into<String>, factory: F)
    where
        F: Fn(&ParameterMap) -> Result<Arc<dyn FreshnessPolicy>, ConfigError> + Send + Sync + 'static,
    {
        self.policies.insert(id.into(), Arc::new(factory));
    }

    /// Register a compute-function factory. Replaces any factory with the
    /// same id.
    pub fn register_compute<F>(&mut self, id: impl Into<String>, factory: F)
    where
        F: Fn(&ParameterMap) -> Result<Arc<dyn ComputeFunction>, ConfigError> + Send + Sync + 'static,
    {
        self.computes.insert(id.into(), Arc::new(factory));
    }

    /// Register one shared policy instance that ignores record parameters.
    pub fn register_policy_instance(&mut self, id: impl Into<String>, policy: Arc<dyn FreshnessPolicy>) {
        self.register_policy(id, move |_| Ok(Arc::clone(&policy)));
    }

    /// Register one shared compute instance that ignores record parameters.
    pub fn register_compute_instance(
        &mut self,
        id: impl Into<String>,
        compute: Arc<dyn ComputeFunction>,
    ) {
        self.register_compute(id, move |_| Ok(Arc::clone(&compute)));
    }

    pub fn has_policy(&self, id: &str) -> bool {
        self.policies.contains_key(id)
    }

    pub fn has_compute(&self, id: &str) -> bool {
        self.computes.contains_key(id)
    }

    /// Registered policy ids, sorted.
    pub fn policy_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.policies.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Registered compute ids, sorted.
    pub fn compute_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.computes.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Instantiate the freshener described by `record` for `column`.
    ///
    /// A factory that panics is reported as
    /// [`ConfigError::InstantiationFailed`] for this column only.
    pub fn instantiate(&self, column: &ColumnKey, record: &FreshenerRecord) -> Result<Freshener, ConfigError> {
        record.validate(column)?;

        let policy_factory = self
            .policies
            .get(&record.policy_id)
            .ok_or_else(|| ConfigError::UnknownPolicy {
                column: column.clone(),
                policy_id: record.policy_id.clone(),
            })?;
        let compute_factory = self
            .computes
            .get(&record.compute_id)
            .ok_or_else(|| ConfigError::UnknownComputeFunction {
                column: column.clone(),
                compute_id: record.compute_id.clone(),
            })?;

        let policy = guarded(column, "policy factory", || policy_factory(&record.policy_parameters))?;
        let compute = guarded(column, "compute factory", || compute_factory(&record.compute_parameters))?;

        Ok(Freshener::new(column.clone(), record.clone(), policy, compute))
    }
}

fn guarded<T>(
    column: &ColumnKey,
    stage: &str,
    build: impl FnOnce() -> Result<T, ConfigError>,
) -> Result<T, ConfigError> {
    catch_unwind(AssertUnwindSafe(build)).unwrap_or_else(|_| {
        Err(ConfigError::InstantiationFailed {
            column: column.clone(),
            reason: format!("{} panicked", stage),
        })
    })
}

impl std::fmt::Debug for FreshenerCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreshenerCatalog")
            .field("policies", &self.policy_ids())
            .field("computes", &self.compute_ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email() -> ColumnKey {
        ColumnKey::column("info", "email")
    }

    #[test]
    fn test_builtins_registered() {
        let catalog = FreshenerCatalog::with_builtins();
        for id in ["always", "never", "shelf_life", "newer_than"] {
            assert!(catalog.has_policy(id), "missing policy {}", id);
        }
        assert!(catalog.has_compute("constant"));
        assert!(FreshenerCatalog::new().policy_ids().is_empty());
    }

    #[test]
    fn test_instantiate_unknown_ids() {
        let catalog = FreshenerCatalog::with_builtins();
        let err = catalog
            .instantiate(&email(), &FreshenerRecord::new("sometimes", "constant"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownPolicy { .. }));

        let err = catalog
            .instantiate(&email(), &FreshenerRecord::new("always", "oracle"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownComputeFunction { .. }));
    }

    #[test]
    fn test_instantiate_keeps_record() {
        let catalog = FreshenerCatalog::with_builtins();
        let record = FreshenerRecord::new("always", "constant").with_compute_parameter("value", "1");
        let freshener = catalog.instantiate(&email(), &record).unwrap();
        assert_eq!(freshener.column(), &email());
        assert_eq!(freshener.record(), &record);
    }

    #[test]
    fn test_panicking_factory_is_contained() {
        let mut catalog = FreshenerCatalog::with_builtins();
        catalog.register_policy("explodes", |_| panic!("factory blew up"));
        let err = catalog
            .instantiate(&email(), &FreshenerRecord::new("explodes", "constant").with_compute_parameter("value", "1"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InstantiationFailed { .. }));
    }

    #[test]
    fn test_factory_parameter_errors_surface() {
        let catalog = FreshenerCatalog::with_builtins();
        let err = catalog
            .instantiate(&email(), &FreshenerRecord::new("always", "constant"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingParameter { .. }));
    }
}
