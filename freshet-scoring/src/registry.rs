//! Freshener registry: immutable snapshots of instantiated fresheners, swapped
//! atomically on reload.
//!
//! A request binds the current [`RegistrySnapshot`] once, at its start, and
//! resolves every freshener from it. Reloads build a complete new snapshot
//! off to the side and publish it with a single pointer swap, so a request
//! never sees fresheners from two generations.

use crate::catalog::FreshenerCatalog;
use freshet_core::{
    ColumnKey, ComputeFunction, ConfigError, ContentHash, DataRequest, FreshenerRecord, FreshenerRecords,
    FreshetResult, FreshnessPolicy, ReaderError, RowData,
};
use freshet_storage::FreshenerRecordStore;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;

// ============================================================================
// FRESHENER
// ============================================================================

/// A policy and compute function bound to one column key.
///
/// Never mutated after construction. Reloads keep the same `Arc<Freshener>`
/// for every record that did not change.
pub struct Freshener {
    column: ColumnKey,
    record: FreshenerRecord,
    fingerprint: ContentHash,
    policy: Arc<dyn FreshnessPolicy>,
    compute: Arc<dyn ComputeFunction>,
}

impl Freshener {
    pub fn new(
        column: ColumnKey,
        record: FreshenerRecord,
        policy: Arc<dyn FreshnessPolicy>,
        compute: Arc<dyn ComputeFunction>,
    ) -> Self {
        Self {
            column,
            fingerprint: record.fingerprint(),
            record,
            policy,
            compute,
        }
    }

    /// Key the freshener is attached to: a column or a whole family.
    pub fn column(&self) -> &ColumnKey {
        &self.column
    }

    pub fn record(&self) -> &FreshenerRecord {
        &self.record
    }

    /// Fingerprint of the record this freshener was built from.
    pub fn fingerprint(&self) -> &ContentHash {
        &self.fingerprint
    }

    pub fn policy(&self) -> &Arc<dyn FreshnessPolicy> {
        &self.policy
    }

    pub fn compute(&self) -> &Arc<dyn ComputeFunction> {
        &self.compute
    }
}

impl std::fmt::Debug for Freshener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Freshener")
            .field("column", &self.column)
            .field("policy_id", &self.record.policy_id)
            .field("compute_id", &self.record.compute_id)
            .field("fingerprint", &self.record.short_fingerprint())
            .finish()
    }
}

/// A freshener resolved for one fully-qualified column of one request.
#[derive(Debug, Clone)]
pub struct FreshenerBinding {
    pub column: ColumnKey,
    pub freshener: Arc<Freshener>,
}

// ============================================================================
// RELOAD REPORT
// ============================================================================

/// What a snapshot build changed relative to its predecessor.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReloadReport {
    pub generation: u64,
    pub added: Vec<ColumnKey>,
    pub replaced: Vec<ColumnKey>,
    pub retained: Vec<ColumnKey>,
    pub removed: Vec<ColumnKey>,
    #[serde(skip)]
    pub failures: BTreeMap<ColumnKey, ConfigError>,
}

impl ReloadReport {
    /// Returns true if every record instantiated.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Returns true if the published snapshot differs from its predecessor.
    pub fn has_changes(&self) -> bool {
        !(self.added.is_empty() && self.replaced.is_empty() && self.removed.is_empty())
    }
}

// ============================================================================
// SNAPSHOT
// ============================================================================

/// Immutable mapping of column keys to fresheners.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    generation: u64,
    fresheners: BTreeMap<ColumnKey, Arc<Freshener>>,
    failures: BTreeMap<ColumnKey, ConfigError>,
}

impl RegistrySnapshot {
    /// Snapshot with no fresheners, generation 0.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Instantiate every record from scratch.
    ///
    /// A record that fails to instantiate is left out and reported; other
    /// columns are unaffected.
    pub fn build(
        catalog: &FreshenerCatalog,
        records: &FreshenerRecords,
        generation: u64,
    ) -> (Self, ReloadReport) {
        let mut snapshot = Self {
            generation,
            ..Self::default()
        };
        let mut report = ReloadReport {
            generation,
            ..ReloadReport::default()
        };

        for (column, record) in records {
            match catalog.instantiate(column, record) {
                Ok(freshener) => {
                    snapshot.fresheners.insert(column.clone(), Arc::new(freshener));
                    report.added.push(column.clone());
                }
                Err(e) => {
                    snapshot.failures.insert(column.clone(), e.clone());
                    report.failures.insert(column.clone(), e);
                }
            }
        }

        (snapshot, report)
    }

    /// Derive a new snapshot from this one.
    ///
    /// Unchanged records keep their existing `Arc<Freshener>`; new or changed
    /// records are instantiated; records missing from `records` are dropped.
    /// With `restricted`, only those exact keys are reconsidered and every
    /// other column is carried over untouched.
    pub fn rebuild(
        &self,
        catalog: &FreshenerCatalog,
        records: &FreshenerRecords,
        restricted: Option<&BTreeSet<ColumnKey>>,
        generation: u64,
    ) -> (Self, ReloadReport) {
        let in_scope = |column: &ColumnKey| restricted.map_or(true, |keys| keys.contains(column));

        let mut snapshot = Self {
            generation,
            ..Self::default()
        };
        let mut report = ReloadReport {
            generation,
            ..ReloadReport::default()
        };

        // Columns outside the reload scope are carried over as they are.
        for (column, freshener) in &self.fresheners {
            if !in_scope(column) {
                snapshot.fresheners.insert(column.clone(), Arc::clone(freshener));
                report.retained.push(column.clone());
            }
        }
        for (column, error) in &self.failures {
            if !in_scope(column) {
                snapshot.failures.insert(column.clone(), error.clone());
            }
        }

        for (column, record) in records.iter().filter(|(column, _)| in_scope(column)) {
            let existing = self.fresheners.get(column);
            let fingerprint = record.fingerprint();
            if let Some(current) = existing.filter(|current| *current.fingerprint() == fingerprint) {
                snapshot.fresheners.insert(column.clone(), Arc::clone(current));
                report.retained.push(column.clone());
                continue;
            }

            match catalog.instantiate(column, record) {
                Ok(freshener) => {
                    tracing::debug!(
                        column = %column,
                        fingerprint = %record.short_fingerprint(),
                        previous = ?existing.map(|current| current.record().short_fingerprint()),
                        "Freshener instantiated"
                    );
                    snapshot.fresheners.insert(column.clone(), Arc::new(freshener));
                    if existing.is_some() {
                        report.replaced.push(column.clone());
                    } else {
                        report.added.push(column.clone());
                    }
                }
                Err(e) => {
                    snapshot.failures.insert(column.clone(), e.clone());
                    report.failures.insert(column.clone(), e);
                }
            }
        }

        for column in self.fresheners.keys() {
            if in_scope(column) && !records.contains_key(column) {
                report.removed.push(column.clone());
            }
        }

        report.retained.sort();
        (snapshot, report)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.fresheners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fresheners.is_empty()
    }

    /// Freshener attached to exactly this key.
    pub fn get(&self, column: &ColumnKey) -> Option<&Arc<Freshener>> {
        self.fresheners.get(column)
    }

    pub fn fresheners(&self) -> impl Iterator<Item = (&ColumnKey, &Arc<Freshener>)> {
        self.fresheners.iter()
    }

    /// Columns whose records failed to instantiate in the build that
    /// produced this snapshot (or were carried over from an earlier one).
    pub fn failures(&self) -> &BTreeMap<ColumnKey, ConfigError> {
        &self.failures
    }

    /// Freshener for a fully-qualified column: its own, else its family's.
    pub fn resolve(&self, column: &ColumnKey) -> Option<&Arc<Freshener>> {
        self.fresheners
            .get(column)
            .or_else(|| self.fresheners.get(&column.family_key()))
    }

    /// Every freshener that could apply to `request`, before the row is
    /// known. Used to widen the base read with policy data requests.
    pub fn candidates(&self, request: &DataRequest) -> Vec<Arc<Freshener>> {
        let mut seen = BTreeSet::new();
        let mut candidates = Vec::new();
        let mut push = |freshener: &Arc<Freshener>| {
            if seen.insert(freshener.column().clone()) {
                candidates.push(Arc::clone(freshener));
            }
        };

        for requested in request.column_keys() {
            if requested.is_qualified() {
                if let Some(freshener) = self.resolve(requested) {
                    push(freshener);
                }
            } else {
                for (column, freshener) in &self.fresheners {
                    if requested.covers(column) {
                        push(freshener);
                    }
                }
            }
        }
        candidates
    }

    /// Bind fresheners to the fully-qualified columns of one request.
    ///
    /// - A requested column uses its own freshener, else its family's.
    /// - A requested family uses every qualified freshener in that family,
    ///   plus the family freshener for each column of the family present in
    ///   `row` that has no freshener of its own.
    pub fn applicable(&self, request: &DataRequest, row: &RowData) -> Vec<FreshenerBinding> {
        let mut bound: BTreeMap<ColumnKey, Arc<Freshener>> = BTreeMap::new();

        for requested in request.column_keys() {
            if requested.is_qualified() {
                if let Some(freshener) = self.resolve(requested) {
                    bound.insert(requested.clone(), Arc::clone(freshener));
                }
                continue;
            }

            for (column, freshener) in &self.fresheners {
                if column.is_qualified() && requested.covers(column) {
                    bound.insert(column.clone(), Arc::clone(freshener));
                }
            }
            if let Some(family_freshener) = self.fresheners.get(requested) {
                for column in row.family_columns(requested.family_name()) {
                    if !self.fresheners.contains_key(column) {
                        bound
                            .entry(column.clone())
                            .or_insert_with(|| Arc::clone(family_freshener));
                    }
                }
            }
        }

        bound
            .into_iter()
            .map(|(column, freshener)| FreshenerBinding { column, freshener })
            .collect()
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Owner of the current snapshot.
///
/// The pointer lock is held only to clone or replace the `Arc`. Reloads are
/// serialized with each other so two reloads never diff against the same
/// base and lose each other's changes.
pub struct FreshenerRegistry {
    catalog: Arc<FreshenerCatalog>,
    records: Arc<dyn FreshenerRecordStore>,
    columns_to_freshen: Option<BTreeSet<ColumnKey>>,
    current: RwLock<Arc<RegistrySnapshot>>,
    reload_lock: Mutex<()>,
}

impl FreshenerRegistry {
    /// Create a registry holding the empty snapshot. Call
    /// [`load`](Self::load) before serving requests.
    pub fn new(
        catalog: Arc<FreshenerCatalog>,
        records: Arc<dyn FreshenerRecordStore>,
        columns_to_freshen: Option<BTreeSet<ColumnKey>>,
    ) -> Self {
        Self {
            catalog,
            records,
            columns_to_freshen,
            current: RwLock::new(Arc::new(RegistrySnapshot::empty())),
            reload_lock: Mutex::new(()),
        }
    }

    /// The snapshot new requests bind to.
    pub fn snapshot(&self) -> FreshetResult<Arc<RegistrySnapshot>> {
        let current = self.current.read().map_err(|_| ReaderError::LockPoisoned)?;
        Ok(Arc::clone(&current))
    }

    /// Build a snapshot from scratch and publish it. Every freshener is
    /// re-instantiated.
    pub async fn load(&self) -> FreshetResult<ReloadReport> {
        let _reload = self.reload_lock.lock().await;
        let records = self.fetch_records().await?;
        let generation = self.snapshot()?.generation() + 1;
        let (snapshot, mut report) = RegistrySnapshot::build(&self.catalog, &records, generation);
        let previous = self.publish(snapshot)?;
        report.removed = previous
            .fresheners()
            .map(|(column, _)| column)
            .filter(|column| !records.contains_key(*column))
            .cloned()
            .collect();
        log_report(&report);
        Ok(report)
    }

    /// Re-read every record and publish a diffed snapshot.
    pub async fn reload(&self) -> FreshetResult<ReloadReport> {
        self.reload_scoped(None).await
    }

    /// Re-read records and reconsider only `columns`; all other fresheners
    /// stay as they are.
    pub async fn reload_columns(&self, columns: &BTreeSet<ColumnKey>) -> FreshetResult<ReloadReport> {
        self.reload_scoped(Some(columns)).await
    }

    async fn reload_scoped(&self, restricted: Option<&BTreeSet<ColumnKey>>) -> FreshetResult<ReloadReport> {
        let _reload = self.reload_lock.lock().await;
        let records = self.fetch_records().await?;
        let base = self.snapshot()?;
        let (snapshot, report) =
            base.rebuild(&self.catalog, &records, restricted, base.generation() + 1);
        self.publish(snapshot)?;
        log_report(&report);
        Ok(report)
    }

    async fn fetch_records(&self) -> FreshetResult<FreshenerRecords> {
        let mut records = self.records.current_records().await?;
        if let Some(allowed) = &self.columns_to_freshen {
            records.retain(|column, _| allowed.iter().any(|key| key.covers(column)));
        }
        Ok(records)
    }

    fn publish(&self, snapshot: RegistrySnapshot) -> FreshetResult<Arc<RegistrySnapshot>> {
        let mut current = self.current.write().map_err(|_| ReaderError::LockPoisoned)?;
        Ok(std::mem::replace(&mut *current, Arc::new(snapshot)))
    }
}

impl std::fmt::Debug for FreshenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let generation = self.snapshot().map(|s| s.generation()).ok();
        f.debug_struct("FreshenerRegistry")
            .field("catalog", &self.catalog)
            .field("columns_to_freshen", &self.columns_to_freshen)
            .field("generation", &generation)
            .finish()
    }
}

fn log_report(report: &ReloadReport) {
    for (column, error) in &report.failures {
        tracing::warn!(
            column = %column,
            generation = report.generation,
            error = %error,
            "Freshener record failed to instantiate"
        );
    }
    tracing::info!(
        generation = report.generation,
        added = report.added.len(),
        replaced = report.replaced.len(),
        retained = report.retained.len(),
        removed = report.removed.len(),
        failures = report.failures.len(),
        "Freshener registry published"
    );
}
