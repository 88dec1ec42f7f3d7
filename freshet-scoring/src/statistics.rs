//! Per-freshener statistics.
//!
//! Writers touch only atomics inside a sharded map entry, so recording never
//! blocks a request and a snapshot never pauses writers. Every recording
//! operation is infallible.

use dashmap::DashMap;
use freshet_core::{ColumnKey, ColumnOutcome, StatisticsMode};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

// ============================================================================
// LATENCY
// ============================================================================

#[derive(Debug)]
struct LatencyAccumulator {
    count: AtomicU64,
    total_micros: AtomicU64,
    min_micros: AtomicU64,
    max_micros: AtomicU64,
}

impl Default for LatencyAccumulator {
    fn default() -> Self {
        Self {
            count: AtomicU64::new(0),
            total_micros: AtomicU64::new(0),
            min_micros: AtomicU64::new(u64::MAX),
            max_micros: AtomicU64::new(0),
        }
    }
}

impl LatencyAccumulator {
    fn observe(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_micros.fetch_add(micros, Ordering::Relaxed);
        self.min_micros.fetch_min(micros, Ordering::Relaxed);
        self.max_micros.fetch_max(micros, Ordering::Relaxed);
    }

    fn summary(&self) -> LatencySummary {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return LatencySummary::default();
        }
        LatencySummary {
            count,
            total: Duration::from_micros(self.total_micros.load(Ordering::Relaxed)),
            min: Some(Duration::from_micros(self.min_micros.load(Ordering::Relaxed))),
            max: Some(Duration::from_micros(self.max_micros.load(Ordering::Relaxed))),
        }
    }
}

/// Count, total, min and max of observed durations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LatencySummary {
    pub count: u64,
    pub total: Duration,
    pub min: Option<Duration>,
    pub max: Option<Duration>,
}

impl LatencySummary {
    pub fn mean(&self) -> Option<Duration> {
        (self.count > 0).then(|| self.total / self.count.min(u32::MAX as u64) as u32)
    }
}

// ============================================================================
// PER-COLUMN ACCUMULATOR
// ============================================================================

#[derive(Debug, Default)]
struct ColumnStatistics {
    invocations: AtomicU64,
    fresh: AtomicU64,
    computed: AtomicU64,
    stale: AtomicU64,
    failed: AtomicU64,
    policy_failures: AtomicU64,
    compute_failures: AtomicU64,
    late_completions: AtomicU64,
    policy_latency: LatencyAccumulator,
    compute_latency: LatencyAccumulator,
}

impl ColumnStatistics {
    fn record(&self) -> StatisticsRecord {
        StatisticsRecord {
            invocations: self.invocations.load(Ordering::Relaxed),
            fresh: self.fresh.load(Ordering::Relaxed),
            computed: self.computed.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            policy_failures: self.policy_failures.load(Ordering::Relaxed),
            compute_failures: self.compute_failures.load(Ordering::Relaxed),
            late_completions: self.late_completions.load(Ordering::Relaxed),
            policy_latency: self.policy_latency.summary(),
            compute_latency: self.compute_latency.summary(),
        }
    }
}

/// Statistics of one freshener at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatisticsRecord {
    /// Outcomes decided for columns bound to this freshener.
    pub invocations: u64,
    pub fresh: u64,
    pub computed: u64,
    pub stale: u64,
    pub failed: u64,
    pub policy_failures: u64,
    /// Compute errors, panics and failed write-backs.
    pub compute_failures: u64,
    /// Computes that finished after their request stopped waiting.
    pub late_completions: u64,
    pub policy_latency: LatencySummary,
    pub compute_latency: LatencySummary,
}

/// Copy of every freshener's statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatisticsSnapshot {
    pub columns: BTreeMap<ColumnKey, StatisticsRecord>,
}

impl StatisticsSnapshot {
    pub fn get(&self, column: &ColumnKey) -> Option<&StatisticsRecord> {
        self.columns.get(column)
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Sum of every column's record. Latency summaries are merged.
    pub fn totals(&self) -> StatisticsRecord {
        self.columns
            .values()
            .fold(StatisticsRecord::default(), |mut acc, record| {
                acc.invocations += record.invocations;
                acc.fresh += record.fresh;
                acc.computed += record.computed;
                acc.stale += record.stale;
                acc.failed += record.failed;
                acc.policy_failures += record.policy_failures;
                acc.compute_failures += record.compute_failures;
                acc.late_completions += record.late_completions;
                acc.policy_latency = merge(acc.policy_latency, record.policy_latency);
                acc.compute_latency = merge(acc.compute_latency, record.compute_latency);
                acc
            })
    }
}

fn merge(a: LatencySummary, b: LatencySummary) -> LatencySummary {
    let pick = |x: Option<Duration>, y: Option<Duration>, f: fn(Duration, Duration) -> Duration| match (x, y) {
        (Some(x), Some(y)) => Some(f(x, y)),
        (x, y) => x.or(y),
    };
    LatencySummary {
        count: a.count + b.count,
        total: a.total + b.total,
        min: pick(a.min, b.min, std::cmp::min),
        max: pick(a.max, b.max, std::cmp::max),
    }
}

// ============================================================================
// COLLECTOR
// ============================================================================

/// Thread-safe statistics for every freshener of one reader.
#[derive(Debug)]
pub struct StatisticsCollector {
    mode: StatisticsMode,
    columns: DashMap<ColumnKey, Arc<ColumnStatistics>>,
}

impl StatisticsCollector {
    pub fn new(mode: StatisticsMode) -> Self {
        Self {
            mode,
            columns: DashMap::new(),
        }
    }

    /// A collector that records nothing.
    pub fn disabled() -> Self {
        Self::new(StatisticsMode::None)
    }

    pub fn mode(&self) -> StatisticsMode {
        self.mode
    }

    pub fn is_enabled(&self) -> bool {
        self.mode.is_enabled()
    }

    fn column(&self, column: &ColumnKey) -> Option<Arc<ColumnStatistics>> {
        if !self.is_enabled() {
            return None;
        }
        if let Some(existing) = self.columns.get(column) {
            return Some(Arc::clone(existing.value()));
        }
        let entry = self.columns.entry(column.clone()).or_default();
        Some(Arc::clone(entry.value()))
    }

    /// Count one decided outcome for the freshener attached to `column`.
    pub fn record_outcome(&self, column: &ColumnKey, outcome: &ColumnOutcome) {
        if let Some(stats) = self.column(column) {
            stats.invocations.fetch_add(1, Ordering::Relaxed);
            let counter = match outcome {
                ColumnOutcome::Fresh => &stats.fresh,
                ColumnOutcome::Computed { .. } => &stats.computed,
                ColumnOutcome::Stale => &stats.stale,
                ColumnOutcome::Failed { .. } => &stats.failed,
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_policy_check(&self, column: &ColumnKey, elapsed: Duration) {
        if let Some(stats) = self.column(column) {
            stats.policy_latency.observe(elapsed);
        }
    }

    pub fn record_policy_failure(&self, column: &ColumnKey) {
        if let Some(stats) = self.column(column) {
            stats.policy_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_compute(&self, column: &ColumnKey, elapsed: Duration) {
        if let Some(stats) = self.column(column) {
            stats.compute_latency.observe(elapsed);
        }
    }

    pub fn record_compute_failure(&self, column: &ColumnKey) {
        if let Some(stats) = self.column(column) {
            stats.compute_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_late_completion(&self, column: &ColumnKey) {
        if let Some(stats) = self.column(column) {
            stats.late_completions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Copy current values. Concurrent writers are not paused, so counters
    /// of different columns may be from slightly different instants.
    pub fn snapshot(&self) -> StatisticsSnapshot {
        let columns = self
            .columns
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().record()))
            .collect();
        StatisticsSnapshot { columns }
    }
}

impl Default for StatisticsCollector {
    fn default() -> Self {
        Self::new(StatisticsMode::default())
    }
}

// ============================================================================
// BACKGROUND LOGGER
// ============================================================================

/// Spawn a task that logs a statistics summary every `every` until
/// `shutdown_rx` turns true.
pub fn spawn_statistics_logger(
    statistics: Arc<StatisticsCollector>,
    every: Duration,
    shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(statistics_log_task(statistics, every, shutdown_rx))
}

/// Body of [`spawn_statistics_logger`].
pub async fn statistics_log_task(
    statistics: Arc<StatisticsCollector>,
    every: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;

    tracing::info!(interval_secs = every.as_secs_f64(), "Statistics logger started");

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                log_statistics(&statistics.snapshot());
            }
        }
    }

    log_statistics(&statistics.snapshot());
    tracing::info!("Statistics logger stopped");
}

/// Emit one event per freshener.
pub fn log_statistics(snapshot: &StatisticsSnapshot) {
    if snapshot.is_empty() {
        tracing::trace!("No freshener statistics gathered yet");
        return;
    }
    for (column, record) in &snapshot.columns {
        tracing::info!(
            column = %column,
            invocations = record.invocations,
            fresh = record.fresh,
            computed = record.computed,
            stale = record.stale,
            failed = record.failed,
            policy_failures = record.policy_failures,
            compute_failures = record.compute_failures,
            late_completions = record.late_completions,
            mean_policy_us = record.policy_latency.mean().map(|d| d.as_micros() as u64),
            mean_compute_us = record.compute_latency.mean().map(|d| d.as_micros() as u64),
            "Freshener statistics"
        );
    }
}
