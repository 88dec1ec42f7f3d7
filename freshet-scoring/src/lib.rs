//! Freshet Scoring - Read-Path Freshening Engine
//!
//! Serves row reads within a deadline while keeping derived columns fresh.
//! For each requested column that has a freshener attached, a policy decides
//! whether the stored value is good enough; if not, a compute function
//! produces a new value on a bounded worker pool and writes it back. The
//! caller gets the computed value if it lands before the deadline, otherwise
//! the stored one, and the computation keeps going in the background.
//!
//! The pieces:
//! - [`FreshenerCatalog`]: policy and compute factories keyed by id.
//! - [`FreshenerRegistry`]: immutable snapshots of instantiated fresheners,
//!   swapped atomically on reload.
//! - [`RequestCoordinator`]: per-request flow from read to overlay.
//! - [`FreshenerExecutor`]: bounded compute pool with write-back.
//! - [`StatisticsCollector`]: per-freshener counters and latencies.
//! - [`FreshTableReader`]: the public surface tying them together.

mod catalog;
mod coordinator;
mod executor;
mod policies;
mod reader;
mod registry;
mod statistics;

pub use catalog::{ComputeFactory, FreshenerCatalog, PolicyFactory};
pub use coordinator::{FreshenRequest, RequestCoordinator};
pub use executor::{ComputeTask, FreshenerExecutor, TaskHandle};
pub use policies::{
    register_builtins, AlwaysFreshen, ConstantCompute, NeverFreshen, NewerThan, ShelfLife,
    CONSTANT_VALUE_PARAM, NEWER_THAN_PARAM, SHELF_LIFE_PARAM,
};
pub use reader::{FreshTableReader, FreshTableReaderBuilder, FreshenOptions};
pub use registry::{Freshener, FreshenerBinding, FreshenerRegistry, RegistrySnapshot, ReloadReport};
pub use statistics::{
    log_statistics, spawn_statistics_logger, statistics_log_task, LatencySummary,
    StatisticsCollector, StatisticsRecord, StatisticsSnapshot,
};

pub use freshet_core::*;
pub use freshet_storage::{FreshenerRecordStore, InMemoryRecordStore, InMemoryRowStore, RowStore};
