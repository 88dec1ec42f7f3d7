//! Public reader surface.

use crate::catalog::FreshenerCatalog;
use crate::coordinator::{FreshenRequest, RequestCoordinator};
use crate::executor::FreshenerExecutor;
use crate::registry::{FreshenerRegistry, RegistrySnapshot, ReloadReport};
use crate::statistics::{spawn_statistics_logger, StatisticsCollector, StatisticsSnapshot};
use freshet_core::{
    ColumnKey, DataRequest, EntityId, FreshenedRow, FreshetError, FreshetResult, ParameterMap,
    ReaderConfig, ReaderError, RowData,
};
use freshet_storage::{FreshenerRecordStore, RowStore};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

/// Per-call options for [`FreshTableReader::freshen`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FreshenOptions {
    /// Overrides the reader's default timeout.
    pub timeout: Option<Duration>,
    /// Layered over every record's policy and compute parameters.
    pub parameters: ParameterMap,
}

impl FreshenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

// ============================================================================
// BUILDER
// ============================================================================

/// Builder for [`FreshTableReader`].
///
/// # Example
/// ```ignore
/// let reader = FreshTableReaderBuilder::new()
///     .with_row_store(rows)
///     .with_record_store(records)
///     .with_config(ReaderConfig::from_env()?)
///     .build()
///     .await?;
/// let row = reader.get(&"row-1".into(), &DataRequest::for_columns([email])).await?;
/// ```
#[derive(Default)]
pub struct FreshTableReaderBuilder {
    row_store: Option<Arc<dyn RowStore>>,
    record_store: Option<Arc<dyn FreshenerRecordStore>>,
    catalog: Option<FreshenerCatalog>,
    config: ReaderConfig,
}

impl FreshTableReaderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_row_store(mut self, store: Arc<dyn RowStore>) -> Self {
        self.row_store = Some(store);
        self
    }

    pub fn with_record_store(mut self, store: Arc<dyn FreshenerRecordStore>) -> Self {
        self.record_store = Some(store);
        self
    }

    /// Catalog used to instantiate records. Defaults to
    /// [`FreshenerCatalog::with_builtins`].
    pub fn with_catalog(mut self, catalog: FreshenerCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn with_config(mut self, config: ReaderConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate the configuration, load the initial registry snapshot and
    /// start the statistics logger if one is configured.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn build(self) -> FreshetResult<FreshTableReader> {
        self.config.validate()?;
        let row_store = self.row_store.ok_or_else(|| ReaderError::MissingComponent {
            component: "row store".to_string(),
        })?;
        let record_store = self.record_store.ok_or_else(|| ReaderError::MissingComponent {
            component: "freshener record store".to_string(),
        })?;
        let catalog = Arc::new(self.catalog.unwrap_or_else(FreshenerCatalog::with_builtins));
        let config = self.config;

        let statistics = Arc::new(StatisticsCollector::new(config.statistics_mode));
        let executor = Arc::new(FreshenerExecutor::new(
            Arc::clone(&row_store),
            Arc::clone(&statistics),
            config.max_concurrent_computes,
        ));
        let coordinator = RequestCoordinator::new(
            row_store,
            Arc::clone(&executor),
            Arc::clone(&statistics),
            &config,
        );
        let registry = FreshenerRegistry::new(catalog, record_store, config.columns_to_freshen.clone());
        registry.load().await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let logger = match config.statistics_log_interval {
            Some(every) if statistics.is_enabled() => {
                Some(spawn_statistics_logger(Arc::clone(&statistics), every, shutdown_rx))
            }
            _ => None,
        };

        tracing::info!(
            default_timeout_ms = config.default_timeout.as_millis() as u64,
            max_concurrent_computes = config.max_concurrent_computes,
            allow_partial = config.allow_partial,
            policy_failure_mode = %config.policy_failure_mode,
            statistics = statistics.is_enabled(),
            "Fresh table reader opened"
        );

        Ok(FreshTableReader {
            config,
            registry,
            coordinator,
            executor,
            statistics,
            closed: AtomicBool::new(false),
            shutdown_tx,
            logger: Mutex::new(logger),
        })
    }
}

// ============================================================================
// READER
// ============================================================================

/// Row reader that freshens columns on the way out.
///
/// `Send + Sync`; share one instance via `Arc` across callers.
pub struct FreshTableReader {
    config: ReaderConfig,
    registry: FreshenerRegistry,
    coordinator: RequestCoordinator,
    executor: Arc<FreshenerExecutor>,
    statistics: Arc<StatisticsCollector>,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    logger: Mutex<Option<JoinHandle<()>>>,
}

impl FreshTableReader {
    pub fn builder() -> FreshTableReaderBuilder {
        FreshTableReaderBuilder::new()
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> FreshetResult<()> {
        if self.is_closed() {
            return Err(FreshetError::Reader(ReaderError::Closed));
        }
        Ok(())
    }

    /// Read one row with the default timeout.
    pub async fn get(&self, entity_id: &EntityId, request: &DataRequest) -> FreshetResult<RowData> {
        self.freshen(entity_id, request, FreshenOptions::default())
            .await
            .map(FreshenedRow::into_row)
    }

    /// Read one row, waiting at most `timeout` for computes.
    pub async fn get_with_timeout(
        &self,
        entity_id: &EntityId,
        request: &DataRequest,
        timeout: Duration,
    ) -> FreshetResult<RowData> {
        self.freshen(entity_id, request, FreshenOptions::new().with_timeout(timeout))
            .await
            .map(FreshenedRow::into_row)
    }

    /// Read one row and report how each freshened column was resolved.
    pub async fn freshen(
        &self,
        entity_id: &EntityId,
        request: &DataRequest,
        options: FreshenOptions,
    ) -> FreshetResult<FreshenedRow> {
        let deadline = self.deadline(&options);
        self.ensure_open()?;
        let snapshot = self.registry.snapshot()?;
        let span = tracing::debug_span!(
            "freshen",
            request_id = %Uuid::now_v7(),
            entity_id = %entity_id,
            generation = snapshot.generation(),
        );

        let freshen_request = FreshenRequest::new(entity_id.clone(), request.clone(), deadline)
            .with_parameters(options.parameters);
        self.coordinator
            .process(&snapshot, &freshen_request)
            .instrument(span)
            .await
    }

    /// Read many rows with the default timeout shared by all of them.
    ///
    /// Fails as a whole when any row's base read fails; see
    /// [`freshen_bulk`](Self::freshen_bulk).
    pub async fn bulk_get(&self, entity_ids: &[EntityId], request: &DataRequest) -> FreshetResult<Vec<RowData>> {
        self.freshen_bulk(entity_ids, request, FreshenOptions::default())
            .await
            .map(|rows| rows.into_iter().map(FreshenedRow::into_row).collect())
    }

    pub async fn bulk_get_with_timeout(
        &self,
        entity_ids: &[EntityId],
        request: &DataRequest,
        timeout: Duration,
    ) -> FreshetResult<Vec<RowData>> {
        self.freshen_bulk(entity_ids, request, FreshenOptions::new().with_timeout(timeout))
            .await
            .map(|rows| rows.into_iter().map(FreshenedRow::into_row).collect())
    }

    /// Freshen many rows concurrently under one deadline. Results keep the
    /// order of `entity_ids`; a slow row never holds up the others past the
    /// deadline.
    ///
    /// The call succeeds or fails as a whole: if any row's base read fails,
    /// the error is returned and the other rows' results are discarded.
    /// Computes already written back for those rows stay written.
    pub async fn freshen_bulk(
        &self,
        entity_ids: &[EntityId],
        request: &DataRequest,
        options: FreshenOptions,
    ) -> FreshetResult<Vec<FreshenedRow>> {
        let deadline = self.deadline(&options);
        self.ensure_open()?;
        let snapshot = self.registry.snapshot()?;
        let span = tracing::debug_span!(
            "freshen_bulk",
            request_id = %Uuid::now_v7(),
            rows = entity_ids.len(),
            generation = snapshot.generation(),
        );

        self.coordinator
            .process_bulk(&snapshot, entity_ids, request, &options.parameters, deadline)
            .instrument(span)
            .await
    }

    /// Re-read every freshener record and swap in a new snapshot. Requests
    /// already running finish against the snapshot they started with.
    pub async fn reload(&self) -> FreshetResult<ReloadReport> {
        self.ensure_open()?;
        self.registry.reload().await
    }

    /// Like [`reload`](Self::reload), reconsidering only `columns`.
    pub async fn reload_columns(&self, columns: &BTreeSet<ColumnKey>) -> FreshetResult<ReloadReport> {
        self.ensure_open()?;
        self.registry.reload_columns(columns).await
    }

    /// Current per-freshener statistics.
    pub fn statistics(&self) -> FreshetResult<StatisticsSnapshot> {
        self.ensure_open()?;
        Ok(self.statistics.snapshot())
    }

    /// The registry snapshot new requests bind to.
    pub fn snapshot(&self) -> FreshetResult<Arc<RegistrySnapshot>> {
        self.ensure_open()?;
        self.registry.snapshot()
    }

    /// Stop the statistics logger and wait up to the configured grace for
    /// running computes to finish. Every later call fails with
    /// [`ReaderError::Closed`]; closing again is a no-op.
    pub async fn close(&self) -> FreshetResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let _ = self.shutdown_tx.send(true);
        let logger = self
            .logger
            .lock()
            .map_err(|_| ReaderError::LockPoisoned)?
            .take();
        if let Some(handle) = logger {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Statistics logger ended abnormally");
            }
        }

        let drained = self.executor.shutdown(self.config.shutdown_grace).await;
        tracing::info!(drained, "Fresh table reader closed");
        Ok(())
    }

    fn deadline(&self, options: &FreshenOptions) -> Instant {
        deadline_after(Instant::now(), options.timeout.unwrap_or(self.config.default_timeout))
    }
}

/// Stand-in deadline for timeouts too large to represent, about 30 years.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + timeout`, saturating at [`FAR_FUTURE`] so that
/// `Duration::MAX` means "wait for every compute".
fn deadline_after(now: Instant, timeout: Duration) -> Instant {
    now.checked_add(timeout.min(FAR_FUTURE))
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

impl Drop for FreshTableReader {
    fn drop(&mut self) {
        // Stop the logger even when close() was never called.
        let _ = self.shutdown_tx.send(true);
    }
}

impl std::fmt::Debug for FreshTableReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreshTableReader")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("executor", &self.executor)
            .field("closed", &self.is_closed())
            .finish()
    }
}
