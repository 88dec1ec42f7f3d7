//! Freshet Test Utilities
//!
//! Centralized test infrastructure for the Freshet workspace:
//! - Scripted policies and compute functions with call accounting
//! - Fault-injecting store wrappers
//! - Proptest generators for core types
//! - Test fixtures for common scenarios
//! - Custom assertions for Freshet-specific validation

// Re-export in-memory stores from their source crate
pub use freshet_storage::{FreshenerRecordStore, InMemoryRecordStore, InMemoryRowStore, RowStore};

// Re-export core types for convenience
pub use freshet_core::{
    Cell, CellValue, ColumnKey, ComputeFunction, ConfigError, DataRequest, EntityId,
    FreshenError, FreshenerContext, FreshenerRecord, FreshenerRecords, FreshetError,
    FreshetResult, FreshnessPolicy, ParameterMap, PolicyFailureMode, ReaderConfig, ReaderError,
    RowData, StatisticsMode, StoreError, Timestamp,
};

use async_trait::async_trait;
use chrono::Utc;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Install a test-friendly tracing subscriber once per process.
///
/// Honors `RUST_LOG`; otherwise shows engine debug events and warnings from
/// everything else.
pub fn init_test_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("freshet_scoring=debug,warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Poll `condition` every few milliseconds until it holds or `timeout`
/// elapses. Returns the final value of the condition.
pub async fn wait_until<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Async variant of [`wait_until`].
pub async fn wait_until_async<F, Fut>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ============================================================================
// MOCK POLICIES
// ============================================================================

/// What a [`MockPolicy`] answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyBehavior {
    Fresh,
    Stale,
    Fail(String),
    Panic,
}

/// Freshness policy with a fixed answer and a check counter.
#[derive(Debug)]
pub struct MockPolicy {
    behavior: PolicyBehavior,
    data_request: Option<DataRequest>,
    checks: AtomicUsize,
}

impl MockPolicy {
    pub fn new(behavior: PolicyBehavior) -> Self {
        Self {
            behavior,
            data_request: None,
            checks: AtomicUsize::new(0),
        }
    }

    pub fn fresh() -> Self {
        Self::new(PolicyBehavior::Fresh)
    }

    pub fn stale() -> Self {
        Self::new(PolicyBehavior::Stale)
    }

    pub fn failing(reason: impl Into<String>) -> Self {
        Self::new(PolicyBehavior::Fail(reason.into()))
    }

    pub fn panicking() -> Self {
        Self::new(PolicyBehavior::Panic)
    }

    /// Ask for extra columns in the base read.
    pub fn with_data_request(mut self, request: DataRequest) -> Self {
        self.data_request = Some(request);
        self
    }

    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

impl FreshnessPolicy for MockPolicy {
    fn is_fresh(&self, _row: &RowData, context: &FreshenerContext) -> FreshetResult<bool> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            PolicyBehavior::Fresh => Ok(true),
            PolicyBehavior::Stale => Ok(false),
            PolicyBehavior::Fail(reason) => Err(FreshenError::policy(context.column(), reason).into()),
            PolicyBehavior::Panic => panic!("mock policy panicked for {}", context.column()),
        }
    }

    fn data_request(&self) -> Option<DataRequest> {
        self.data_request.clone()
    }
}

// ============================================================================
// MOCK COMPUTE FUNCTIONS
// ============================================================================

/// What a [`MockCompute`] produces.
#[derive(Debug, Clone, PartialEq)]
pub enum ComputeBehavior {
    Value(CellValue),
    /// Return the 1-based call number, so every call produces a new value.
    Sequence,
    Fail(String),
    Panic,
}

/// Compute function with a scripted result, an optional delay, and
/// concurrency accounting.
#[derive(Debug)]
pub struct MockCompute {
    behavior: ComputeBehavior,
    delay: Option<Duration>,
    calls: AtomicUsize,
    completed: AtomicUsize,
    running: AtomicUsize,
    peak_running: AtomicUsize,
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockCompute {
    pub fn new(behavior: ComputeBehavior) -> Self {
        Self {
            behavior,
            delay: None,
            calls: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            peak_running: AtomicUsize::new(0),
        }
    }

    pub fn returning(value: impl Into<CellValue>) -> Self {
        Self::new(ComputeBehavior::Value(value.into()))
    }

    pub fn sequence() -> Self {
        Self::new(ComputeBehavior::Sequence)
    }

    pub fn failing(reason: impl Into<String>) -> Self {
        Self::new(ComputeBehavior::Fail(reason.into()))
    }

    pub fn panicking() -> Self {
        Self::new(ComputeBehavior::Panic)
    }

    /// Sleep this long before producing the result.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of times `compute` was entered.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of calls that returned (successfully or not) without panicking.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Highest number of calls observed running at once.
    pub fn peak_running(&self) -> usize {
        self.peak_running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ComputeFunction for MockCompute {
    async fn compute(&self, _row: &RowData, context: &FreshenerContext) -> FreshetResult<CellValue> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_running.fetch_max(now_running, Ordering::SeqCst);
        let _running = RunningGuard(&self.running);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let result = match &self.behavior {
            ComputeBehavior::Value(value) => Ok(value.clone()),
            ComputeBehavior::Sequence => Ok(CellValue::from(call as u64)),
            ComputeBehavior::Fail(reason) => Err(FreshenError::compute(context.column(), reason).into()),
            ComputeBehavior::Panic => panic!("mock compute panicked for {}", context.column()),
        };
        self.completed.fetch_add(1, Ordering::SeqCst);
        result
    }
}

// ============================================================================
// FAULTY STORES
// ============================================================================

/// Row store wrapper that fails or delays on demand.
#[derive(Debug)]
pub struct FaultyRowStore<S> {
    inner: S,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    write_delay: Option<Duration>,
}

impl<S: RowStore> FaultyRowStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            write_delay: None,
        }
    }

    /// Delay every write by `delay` before it reaches the inner store.
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: RowStore> RowStore for FaultyRowStore<S> {
    async fn read(&self, entity_id: &EntityId, request: &DataRequest) -> FreshetResult<RowData> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::ReadFailed {
                entity_id: entity_id.clone(),
                reason: "injected read failure".to_string(),
            }
            .into());
        }
        self.inner.read(entity_id, request).await
    }

    async fn write(
        &self,
        entity_id: &EntityId,
        column: &ColumnKey,
        value: CellValue,
    ) -> FreshetResult<Timestamp> {
        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::WriteFailed {
                entity_id: entity_id.clone(),
                column: column.clone(),
                reason: "injected write failure".to_string(),
            }
            .into());
        }
        self.inner.write(entity_id, column, value).await
    }
}

/// Record store whose every snapshot fails.
#[derive(Debug, Default)]
pub struct FailingRecordStore;

#[async_trait]
impl FreshenerRecordStore for FailingRecordStore {
    async fn current_records(&self) -> FreshetResult<FreshenerRecords> {
        Err(StoreError::RecordSourceFailed {
            reason: "record source unavailable".to_string(),
        }
        .into())
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for generating Freshet core types.

    use super::*;
    use proptest::prelude::*;

    // === Identity Generators ===

    pub fn arb_family() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_]{0,7}"
    }

    pub fn arb_qualifier() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_]{0,11}"
    }

    /// Generate a fully-qualified column.
    pub fn arb_qualified_column() -> impl Strategy<Value = ColumnKey> {
        (arb_family(), arb_qualifier()).prop_map(|(f, q)| ColumnKey::column(f, q))
    }

    /// Generate a qualified or family-level column key.
    pub fn arb_column_key() -> impl Strategy<Value = ColumnKey> {
        prop_oneof![
            3 => arb_qualified_column(),
            1 => arb_family().prop_map(ColumnKey::family),
        ]
    }

    pub fn arb_entity_id() -> impl Strategy<Value = EntityId> {
        "[a-z0-9-]{1,16}".prop_map(EntityId::from)
    }

    /// Generate a Timestamp (DateTime<Utc>).
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        // Generate timestamps within a reasonable range (2020-2030)
        (1577836800i64..1893456000i64).prop_map(|secs| {
            chrono::DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
        })
    }

    // === Data Generators ===

    pub fn arb_cell_value() -> impl Strategy<Value = CellValue> {
        prop_oneof![
            any::<i64>().prop_map(CellValue::from),
            "[a-zA-Z0-9@. ]{0,24}".prop_map(CellValue::from),
            any::<bool>().prop_map(CellValue::from),
            Just(CellValue::Null),
        ]
    }

    pub fn arb_cell() -> impl Strategy<Value = Cell> {
        (arb_cell_value(), arb_timestamp()).prop_map(|(value, ts)| Cell::new(value, ts))
    }

    pub fn arb_parameter_map() -> impl Strategy<Value = ParameterMap> {
        prop::collection::btree_map("[a-z_]{1,8}", "[a-z0-9]{0,8}", 0..4)
    }

    /// Generate a record using the always/never policies and the constant
    /// compute function, so every generated record instantiates.
    pub fn arb_freshener_record() -> impl Strategy<Value = FreshenerRecord> {
        (
            prop_oneof![Just("always"), Just("never")],
            arb_parameter_map(),
            any::<i32>(),
        )
            .prop_map(|(policy, policy_parameters, value)| {
                let mut record = FreshenerRecord::new(policy, "constant")
                    .with_compute_parameter("value", value.to_string());
                record.policy_parameters = policy_parameters;
                record
            })
    }

    pub fn arb_freshener_records() -> impl Strategy<Value = FreshenerRecords> {
        prop::collection::btree_map(arb_column_key(), arb_freshener_record(), 0..8)
    }

    /// Generate a request over 1-5 columns with 1-3 versions each.
    pub fn arb_data_request() -> impl Strategy<Value = DataRequest> {
        prop::collection::vec((arb_column_key(), 1usize..4), 1..6).prop_map(|columns| {
            columns
                .into_iter()
                .fold(DataRequest::builder(), |builder, (column, versions)| {
                    builder.add_versions(column, versions)
                })
                .build()
        })
    }

    // === Config Generators ===

    pub fn arb_policy_failure_mode() -> impl Strategy<Value = PolicyFailureMode> {
        prop_oneof![
            Just(PolicyFailureMode::Recompute),
            Just(PolicyFailureMode::Fallback),
            Just(PolicyFailureMode::AssumeFresh),
        ]
    }

    /// Generate a ReaderConfig that passes `validate()`.
    pub fn arb_valid_config() -> impl Strategy<Value = ReaderConfig> {
        (
            1u64..5_000,
            1usize..64,
            any::<bool>(),
            arb_policy_failure_mode(),
            any::<bool>(),
        )
            .prop_map(|(timeout_ms, pool, allow_partial, mode, stats)| {
                ReaderConfig::new()
                    .with_timeout(Duration::from_millis(timeout_ms))
                    .with_max_concurrent_computes(pool)
                    .with_allow_partial(allow_partial)
                    .with_policy_failure_mode(mode)
                    .with_statistics_mode(if stats {
                        StatisticsMode::All
                    } else {
                        StatisticsMode::None
                    })
            })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built test fixtures for common testing scenarios.

    use super::*;

    pub fn email() -> ColumnKey {
        ColumnKey::column("info", "email")
    }

    pub fn name() -> ColumnKey {
        ColumnKey::column("info", "name")
    }

    pub fn score() -> ColumnKey {
        ColumnKey::column("derived", "score")
    }

    /// Row store holding one cell written a minute ago.
    pub fn seeded_store(entity_id: &str, column: ColumnKey, value: impl Into<CellValue>) -> InMemoryRowStore {
        let store = InMemoryRowStore::new();
        let written = Utc::now() - chrono::Duration::minutes(1);
        // Seeding a qualified column into an empty store cannot fail.
        let _ = store.put(entity_id, column, Cell::new(value, written));
        store
    }

    /// The classic example row: `info:email = "old@example.com"`.
    pub fn email_store() -> InMemoryRowStore {
        seeded_store("row-1", email(), "old@example.com")
    }

    /// Record pairing the always-stale policy with a constant compute.
    pub fn constant_record(value: impl Into<CellValue>) -> FreshenerRecord {
        FreshenerRecord::new("always", "constant")
            .with_compute_parameter("value", value.into().to_string())
    }

    /// Config tuned for tests: short timeout, small pool, quick shutdown.
    pub fn test_config() -> ReaderConfig {
        ReaderConfig::new()
            .with_timeout(Duration::from_millis(500))
            .with_max_concurrent_computes(4)
            .with_shutdown_grace(Duration::from_secs(2))
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Custom assertion functions for Freshet-specific validation.

    use super::*;

    /// Assert that a FreshetResult is Ok.
    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &FreshetResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    /// Assert that a FreshetResult is Err.
    #[track_caller]
    pub fn assert_err<T: std::fmt::Debug>(result: &FreshetResult<T>) {
        assert!(result.is_err(), "Expected Err, got Ok: {:?}", result);
    }

    /// Assert that a FreshetResult is a Store error.
    #[track_caller]
    pub fn assert_store_error<T: std::fmt::Debug>(result: &FreshetResult<T>) {
        match result {
            Err(FreshetError::Store(_)) => {}
            other => panic!("Expected Store error, got: {:?}", other),
        }
    }

    /// Assert that a FreshetResult is a Config error.
    #[track_caller]
    pub fn assert_config_error<T: std::fmt::Debug>(result: &FreshetResult<T>) {
        match result {
            Err(FreshetError::Config(_)) => {}
            other => panic!("Expected Config error, got: {:?}", other),
        }
    }

    /// Assert that a FreshetResult reports a closed reader.
    #[track_caller]
    pub fn assert_closed<T: std::fmt::Debug>(result: &FreshetResult<T>) {
        match result {
            Err(FreshetError::Reader(ReaderError::Closed)) => {}
            other => panic!("Expected Closed reader error, got: {:?}", other),
        }
    }

    /// Assert the most recent value of a column in a row view.
    #[track_caller]
    pub fn assert_value(row: &RowData, column: &ColumnKey, expected: impl Into<CellValue>) {
        let expected = expected.into();
        assert_eq!(
            row.most_recent_value(column),
            Some(&expected),
            "Unexpected value for {} in row {}",
            column,
            row.entity_id()
        );
    }
}
