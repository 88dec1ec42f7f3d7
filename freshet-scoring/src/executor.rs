//! Bounded execution of compute functions with write-back.
//!
//! Each stale (row, column) becomes one spawned task. A semaphore sized at
//! construction bounds how many computes run at once; extra tasks wait for a
//! permit. A task writes its value back before it reports, so any value a
//! requester sees as computed is already durable. Deadlines never cancel a
//! task: once submitted it runs to completion even if nobody is waiting.

use crate::registry::Freshener;
use crate::statistics::StatisticsCollector;
use freshet_core::{
    Cell, ColumnKey, EntityId, FreshenError, FreshenerContext, FreshetError, FreshetResult,
    ReaderError, RowData,
};
use freshet_storage::RowStore;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify, Semaphore};

/// Work for one (row, column).
#[derive(Debug, Clone)]
pub struct ComputeTask {
    pub entity_id: EntityId,
    /// Fully-qualified column receiving the value.
    pub column: ColumnKey,
    pub freshener: Arc<Freshener>,
    /// Row as read at the start of the request.
    pub row: Arc<RowData>,
    pub context: FreshenerContext,
}

/// Receiving end of one submitted task.
#[derive(Debug)]
pub struct TaskHandle {
    column: ColumnKey,
    receiver: oneshot::Receiver<Result<Cell, FreshenError>>,
}

impl TaskHandle {
    pub fn column(&self) -> &ColumnKey {
        &self.column
    }

    /// Wait for the task. A task that died without reporting yields
    /// [`FreshenError::TaskLost`].
    pub async fn join(self) -> (ColumnKey, Result<Cell, FreshenError>) {
        let result = match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(FreshenError::TaskLost {
                column: self.column.clone(),
            }),
        };
        (self.column, result)
    }
}

#[derive(Debug, Default)]
struct InFlight {
    count: AtomicUsize,
    drained: Notify,
}

struct InFlightGuard(Arc<InFlight>);

impl InFlightGuard {
    fn enter(in_flight: &Arc<InFlight>) -> Self {
        in_flight.count.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(in_flight))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.drained.notify_waiters();
        }
    }
}

/// Runs compute tasks on the tokio runtime, at most `max_concurrent` at a
/// time.
pub struct FreshenerExecutor {
    store: Arc<dyn RowStore>,
    statistics: Arc<StatisticsCollector>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    accepting: AtomicBool,
    in_flight: Arc<InFlight>,
}

impl FreshenerExecutor {
    pub fn new(store: Arc<dyn RowStore>, statistics: Arc<StatisticsCollector>, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            store,
            statistics,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            accepting: AtomicBool::new(true),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Tasks submitted and not yet finished, queued or running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.count.load(Ordering::SeqCst)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Spawn a task. Must be called from within a tokio runtime.
    ///
    /// Fails with [`ReaderError::Closed`] after [`shutdown`](Self::shutdown).
    pub fn submit(&self, task: ComputeTask) -> FreshetResult<TaskHandle> {
        if !self.is_accepting() {
            return Err(FreshetError::Reader(ReaderError::Closed));
        }

        let guard = InFlightGuard::enter(&self.in_flight);
        let (sender, receiver) = oneshot::channel();
        let column = task.column.clone();
        let store = Arc::clone(&self.store);
        let statistics = Arc::clone(&self.statistics);
        let permits = Arc::clone(&self.permits);

        tokio::spawn(async move {
            let _guard = guard;
            let stats_key = task.freshener.column().clone();
            let entity_id = task.entity_id.clone();
            let column = task.column.clone();
            let result = run_task(task, store.as_ref(), &statistics, permits).await;

            if sender.send(result).is_err() {
                statistics.record_late_completion(&stats_key);
                tracing::debug!(
                    entity_id = %entity_id,
                    column = %column,
                    "Compute finished after its request stopped waiting"
                );
            }
        });

        Ok(TaskHandle { column, receiver })
    }

    /// Stop accepting tasks and wait up to `grace` for queued and running
    /// ones to finish. Returns true if everything drained in time; tasks
    /// still running afterwards continue detached.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.accepting.store(false, Ordering::SeqCst);

        let drained = tokio::time::timeout(grace, async {
            loop {
                let notified = self.in_flight.drained.notified();
                if self.in_flight() == 0 {
                    break;
                }
                notified.await;
            }
        })
        .await
        .is_ok();

        if drained {
            tracing::info!("Freshener executor drained");
        } else {
            tracing::warn!(
                in_flight = self.in_flight(),
                grace_ms = grace.as_millis() as u64,
                "Freshener executor shutdown grace elapsed with tasks still running"
            );
        }
        drained
    }
}

impl std::fmt::Debug for FreshenerExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreshenerExecutor")
            .field("max_concurrent", &self.max_concurrent)
            .field("in_flight", &self.in_flight())
            .field("accepting", &self.is_accepting())
            .finish()
    }
}

async fn run_task(
    task: ComputeTask,
    store: &dyn RowStore,
    statistics: &StatisticsCollector,
    permits: Arc<Semaphore>,
) -> Result<Cell, FreshenError> {
    let stats_key = task.freshener.column().clone();
    let _permit = permits
        .acquire_owned()
        .await
        .map_err(|_| FreshenError::TaskLost {
            column: task.column.clone(),
        })?;

    let started = Instant::now();
    let computed = AssertUnwindSafe(task.freshener.compute().compute(&task.row, &task.context))
        .catch_unwind()
        .await;
    statistics.record_compute(&stats_key, started.elapsed());

    let value = match computed {
        Ok(Ok(value)) => value,
        Ok(Err(e)) => {
            statistics.record_compute_failure(&stats_key);
            let error = match e {
                FreshetError::Freshen(inner) => inner,
                other => FreshenError::compute(&task.column, other),
            };
            tracing::warn!(
                entity_id = %task.entity_id,
                column = %task.column,
                error = %error,
                "Compute function failed"
            );
            return Err(error);
        }
        Err(_) => {
            statistics.record_compute_failure(&stats_key);
            tracing::error!(
                entity_id = %task.entity_id,
                column = %task.column,
                "Compute function panicked"
            );
            return Err(FreshenError::Panicked {
                column: task.column.clone(),
                stage: "compute function".to_string(),
            });
        }
    };

    match store.write(&task.entity_id, &task.column, value.clone()).await {
        Ok(timestamp) => Ok(Cell::new(value, timestamp)),
        Err(e) => {
            statistics.record_compute_failure(&stats_key);
            tracing::warn!(
                entity_id = %task.entity_id,
                column = %task.column,
                error = %e,
                "Write-back failed"
            );
            Err(FreshenError::WriteBackFailed {
                column: task.column.clone(),
                reason: e.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::FreshenerCatalog;
    use freshet_core::{FreshenerRecord, ParameterMap, StatisticsMode};
    use freshet_storage::InMemoryRowStore;
    use serde_json::json;

    fn email() -> ColumnKey {
        ColumnKey::column("info", "email")
    }

    fn task(record: FreshenerRecord) -> ComputeTask {
        let freshener = FreshenerCatalog::with_builtins()
            .instantiate(&email(), &record)
            .unwrap();
        ComputeTask {
            entity_id: "row-1".into(),
            column: email(),
            freshener: Arc::new(freshener),
            row: Arc::new(RowData::new("row-1".into())),
            context: FreshenerContext::new("row-1".into(), email(), email(), ParameterMap::new()),
        }
    }

    #[tokio::test]
    async fn test_submit_writes_back_before_reporting() {
        let store = Arc::new(InMemoryRowStore::new());
        let stats = Arc::new(StatisticsCollector::new(StatisticsMode::All));
        let executor = FreshenerExecutor::new(store.clone(), stats.clone(), 2);

        let record = FreshenerRecord::new("always", "constant").with_compute_parameter("value", "\"new\"");
        let (column, result) = executor.submit(task(record)).unwrap().join().await;
        let cell = result.unwrap();

        assert_eq!(column, email());
        assert_eq!(cell.value, json!("new"));
        assert_eq!(
            store.latest_value(&"row-1".into(), &email()).unwrap(),
            Some(json!("new"))
        );
        assert_eq!(stats.snapshot().get(&email()).unwrap().compute_latency.count, 1);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_tasks() {
        let executor = FreshenerExecutor::new(
            Arc::new(InMemoryRowStore::new()),
            Arc::new(StatisticsCollector::disabled()),
            1,
        );
        assert!(executor.shutdown(Duration::from_millis(50)).await);
        let record = FreshenerRecord::new("always", "constant").with_compute_parameter("value", "1");
        let err = executor.submit(task(record)).unwrap_err();
        assert!(err.is_closed());
    }

    #[tokio::test]
    async fn test_dropped_handle_counts_late_completion() {
        let store = Arc::new(InMemoryRowStore::new());
        let stats = Arc::new(StatisticsCollector::new(StatisticsMode::All));
        let executor = FreshenerExecutor::new(store.clone(), stats.clone(), 1);

        let record = FreshenerRecord::new("always", "constant").with_compute_parameter("value", "7");
        drop(executor.submit(task(record)).unwrap());

        assert!(executor.shutdown(Duration::from_secs(1)).await);
        assert_eq!(store.latest_value(&"row-1".into(), &email()).unwrap(), Some(json!(7)));
        assert_eq!(stats.snapshot().get(&email()).unwrap().late_completions, 1);
    }
}
