//! Orchestration of one freshening read.
//!
//! Per row: resolve fresheners from the bound snapshot, read the base row,
//! run every policy inline, dispatch computes for stale columns, wait for
//! them until the deadline, then assemble the view the caller asked for.

use crate::executor::{ComputeTask, FreshenerExecutor};
use crate::registry::{FreshenerBinding, RegistrySnapshot};
use crate::statistics::StatisticsCollector;
use freshet_core::{
    Cell, ColumnKey, ColumnOutcome, DataRequest, EntityId, FreshenError, FreshenedRow,
    FreshenerContext, FreshetResult, ParameterMap, PolicyFailureMode, ReaderConfig, RowData,
};
use freshet_storage::RowStore;
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant as StdInstant;
use tokio::time::{timeout_at, Instant};

/// One logical read of one row.
#[derive(Debug, Clone)]
pub struct FreshenRequest {
    pub entity_id: EntityId,
    pub request: DataRequest,
    /// Absolute time after which stale values are returned instead of
    /// waiting further.
    pub deadline: Instant,
    /// Overrides applied on top of the record's policy and compute
    /// parameters.
    pub parameters: ParameterMap,
}

impl FreshenRequest {
    pub fn new(entity_id: EntityId, request: DataRequest, deadline: Instant) -> Self {
        Self {
            entity_id,
            request,
            deadline,
            parameters: ParameterMap::new(),
        }
    }

    pub fn with_parameters(mut self, parameters: ParameterMap) -> Self {
        self.parameters = parameters;
        self
    }
}

/// Policy verdict for one bound column.
enum Decision {
    Decided(ColumnOutcome),
    Compute,
}

/// Drives policy checks, compute dispatch, the deadline wait and assembly.
pub struct RequestCoordinator {
    store: Arc<dyn RowStore>,
    executor: Arc<FreshenerExecutor>,
    statistics: Arc<StatisticsCollector>,
    allow_partial: bool,
    policy_failure_mode: PolicyFailureMode,
}

impl RequestCoordinator {
    pub fn new(
        store: Arc<dyn RowStore>,
        executor: Arc<FreshenerExecutor>,
        statistics: Arc<StatisticsCollector>,
        config: &ReaderConfig,
    ) -> Self {
        Self {
            store,
            executor,
            statistics,
            allow_partial: config.allow_partial,
            policy_failure_mode: config.policy_failure_mode,
        }
    }

    /// Freshen one row against `snapshot`.
    ///
    /// Only a failed base read is an error; every per-column fault degrades
    /// to the stored value.
    pub async fn process(&self, snapshot: &RegistrySnapshot, request: &FreshenRequest) -> FreshetResult<FreshenedRow> {
        let mut base_request = request.request.clone();
        for candidate in snapshot.candidates(&request.request) {
            if let Some(extra) = candidate.policy().data_request() {
                base_request.extend_with(&extra);
            }
        }

        let row = self.store.read(&request.entity_id, &base_request).await?;
        let bindings = snapshot.applicable(&request.request, &row);
        if bindings.is_empty() {
            return Ok(FreshenedRow::new(row.project(&request.request)));
        }

        let shared_row = Arc::new(row);
        let mut decided: BTreeMap<ColumnKey, ColumnOutcome> = BTreeMap::new();
        let mut handles = Vec::new();

        for binding in &bindings {
            match self.check_policy(binding, &shared_row, request) {
                Decision::Decided(outcome) => {
                    decided.insert(binding.column.clone(), outcome);
                }
                Decision::Compute => {
                    let task = ComputeTask {
                        entity_id: request.entity_id.clone(),
                        column: binding.column.clone(),
                        freshener: Arc::clone(&binding.freshener),
                        row: Arc::clone(&shared_row),
                        context: context_for(
                            binding,
                            request,
                            &binding.freshener.record().compute_parameters,
                        ),
                    };
                    handles.push(self.executor.submit(task)?);
                }
            }
        }

        let dispatched = handles.len();
        let mut completed: BTreeMap<ColumnKey, Result<Cell, FreshenError>> = BTreeMap::new();
        let mut pending: FuturesUnordered<_> = handles.into_iter().map(|handle| handle.join()).collect();
        if !pending.is_empty() && Instant::now() < request.deadline {
            let _ = timeout_at(request.deadline, async {
                while let Some((column, result)) = pending.next().await {
                    completed.insert(column, result);
                }
            })
            .await;
        }
        // Whatever is still pending keeps running and is counted as late.
        drop(pending);

        let mut outcomes = BTreeMap::new();
        for binding in &bindings {
            let outcome = match decided.remove(&binding.column) {
                Some(outcome) => outcome,
                None => match completed.remove(&binding.column) {
                    Some(Ok(cell)) => ColumnOutcome::Computed { cell },
                    Some(Err(error)) => ColumnOutcome::failed(error),
                    None => ColumnOutcome::Stale,
                },
            };
            outcomes.insert(binding.column.clone(), outcome);
        }

        let any_stale = outcomes.values().any(ColumnOutcome::is_stale);
        if any_stale && !self.allow_partial {
            for outcome in outcomes.values_mut() {
                if outcome.is_computed() {
                    *outcome = ColumnOutcome::Stale;
                }
            }
        }

        let mut view = Arc::try_unwrap(shared_row).unwrap_or_else(|shared| (*shared).clone());
        for binding in &bindings {
            let outcome = &outcomes[&binding.column];
            self.statistics.record_outcome(binding.freshener.column(), outcome);
            if let ColumnOutcome::Computed { cell } = outcome {
                let max_versions = request
                    .request
                    .settings_for(&binding.column)
                    .map(|settings| settings.max_versions)
                    .unwrap_or(1);
                view.overlay(&binding.column, cell.clone(), max_versions);
            }
        }

        let result = FreshenedRow {
            row: view.project(&request.request),
            outcomes,
        };
        tracing::debug!(
            entity_id = %request.entity_id,
            bound = bindings.len(),
            dispatched,
            fresh = result.count(ColumnOutcome::is_fresh),
            computed = result.count(ColumnOutcome::is_computed),
            stale = result.count(ColumnOutcome::is_stale),
            failed = result.count(ColumnOutcome::is_failed),
            "Row freshened"
        );
        Ok(result)
    }

    /// Freshen many rows concurrently under one shared deadline.
    ///
    /// Every row runs to completion; the first base read error, in row
    /// order, is then returned in place of all results.
    pub async fn process_bulk(
        &self,
        snapshot: &RegistrySnapshot,
        entity_ids: &[EntityId],
        request: &DataRequest,
        parameters: &ParameterMap,
        deadline: Instant,
    ) -> FreshetResult<Vec<FreshenedRow>> {
        let requests: Vec<FreshenRequest> = entity_ids
            .iter()
            .map(|entity_id| {
                FreshenRequest::new(entity_id.clone(), request.clone(), deadline)
                    .with_parameters(parameters.clone())
            })
            .collect();

        futures_util::future::join_all(requests.iter().map(|request| self.process(snapshot, request)))
            .await
            .into_iter()
            .collect()
    }

    fn check_policy(&self, binding: &FreshenerBinding, row: &RowData, request: &FreshenRequest) -> Decision {
        let stats_key = binding.freshener.column();
        let context = context_for(binding, request, &binding.freshener.record().policy_parameters);
        let policy = binding.freshener.policy();

        let started = StdInstant::now();
        let verdict = catch_unwind(AssertUnwindSafe(|| policy.is_fresh(row, &context)));
        self.statistics.record_policy_check(stats_key, started.elapsed());

        let error = match verdict {
            Ok(Ok(true)) => return Decision::Decided(ColumnOutcome::Fresh),
            Ok(Ok(false)) => return Decision::Compute,
            Ok(Err(e)) => match e {
                freshet_core::FreshetError::Freshen(inner) => inner,
                other => FreshenError::policy(&binding.column, other),
            },
            Err(_) => FreshenError::Panicked {
                column: binding.column.clone(),
                stage: "freshness policy".to_string(),
            },
        };

        self.statistics.record_policy_failure(stats_key);
        tracing::warn!(
            entity_id = %request.entity_id,
            column = %binding.column,
            mode = %self.policy_failure_mode,
            error = %error,
            "Freshness policy failed"
        );

        match self.policy_failure_mode {
            PolicyFailureMode::Recompute => Decision::Compute,
            PolicyFailureMode::Fallback => Decision::Decided(ColumnOutcome::failed(error)),
            PolicyFailureMode::AssumeFresh => Decision::Decided(ColumnOutcome::Fresh),
        }
    }
}

impl std::fmt::Debug for RequestCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCoordinator")
            .field("executor", &self.executor)
            .field("allow_partial", &self.allow_partial)
            .field("policy_failure_mode", &self.policy_failure_mode)
            .finish()
    }
}

fn context_for(binding: &FreshenerBinding, request: &FreshenRequest, record_parameters: &ParameterMap) -> FreshenerContext {
    let mut parameters = record_parameters.clone();
    parameters.extend(request.parameters.iter().map(|(k, v)| (k.clone(), v.clone())));
    FreshenerContext::new(
        request.entity_id.clone(),
        binding.column.clone(),
        binding.freshener.column().clone(),
        parameters,
    )
}
