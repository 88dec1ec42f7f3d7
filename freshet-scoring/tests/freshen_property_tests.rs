//! Property-based tests for freshening reads over generated records and
//! requests.

use freshet_scoring::{
    ColumnOutcome, FreshTableReader, FreshenOptions, FreshenerRecords, FreshetError,
    InMemoryRecordStore, InMemoryRowStore,
};
use freshet_test_utils::fixtures::test_config;
use freshet_test_utils::generators::*;
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

fn test_runtime() -> Result<Runtime, TestCaseError> {
    Runtime::new().map_err(|e| TestCaseError::fail(format!("Failed to create runtime: {}", e)))
}

fn fail(e: FreshetError) -> TestCaseError {
    TestCaseError::fail(e.to_string())
}

async fn reader_for(records: &FreshenerRecords) -> Result<FreshTableReader, TestCaseError> {
    let mut store = InMemoryRecordStore::new();
    for (column, record) in records {
        store = store.with_record(column.clone(), record.clone());
    }
    FreshTableReader::builder()
        .with_row_store(Arc::new(InMemoryRowStore::new()))
        .with_record_store(Arc::new(store))
        .with_config(test_config().with_timeout(Duration::from_secs(5)))
        .build()
        .await
        .map_err(fail)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Every outcome belongs to a requested, fully-qualified column, and
    /// carries the verdict of the freshener that column resolves to.
    #[test]
    fn prop_outcomes_follow_resolved_freshener(
        records in arb_freshener_records(),
        request in arb_data_request(),
        entity_id in arb_entity_id(),
    ) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let reader = reader_for(&records).await?;
            let snapshot = reader.snapshot().map_err(fail)?;
            let freshened = reader
                .freshen(&entity_id, &request, FreshenOptions::new())
                .await
                .map_err(fail)?;

            for (column, outcome) in &freshened.outcomes {
                prop_assert!(column.is_qualified());
                prop_assert!(request.includes(column));

                let Some(freshener) = snapshot.resolve(column) else {
                    return Err(TestCaseError::fail(format!("no freshener for {}", column)));
                };
                let record = freshener.record();

                match record.policy_id.as_str() {
                    "never" => prop_assert!(outcome.is_fresh()),
                    _ => {
                        let expected: i32 = record.compute_parameters["value"]
                            .parse()
                            .map_err(|e| TestCaseError::fail(format!("{}", e)))?;
                        match outcome {
                            ColumnOutcome::Computed { cell } => {
                                prop_assert_eq!(&cell.value, &json!(expected));
                                prop_assert_eq!(freshened.row.most_recent_value(column), Some(&json!(expected)));
                            }
                            other => prop_assert!(false, "expected computed, got {:?}", other),
                        }
                    }
                }
            }

            reader.close().await.map_err(fail)?;
            Ok(())
        })?;
    }

    /// Reloading an unchanged record set keeps every freshener instance.
    #[test]
    fn prop_reload_without_changes_retains_everything(records in arb_freshener_records()) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let reader = reader_for(&records).await?;
            let before = reader.snapshot().map_err(fail)?;
            let report = reader.reload().await.map_err(fail)?;
            let after = reader.snapshot().map_err(fail)?;

            prop_assert!(!report.has_changes());
            prop_assert_eq!(report.retained.len(), before.len());
            prop_assert_eq!(after.len(), before.len());
            for (column, freshener) in before.fresheners() {
                let kept = after.get(column);
                prop_assert!(kept.is_some_and(|kept| Arc::ptr_eq(kept, freshener)));
            }
            Ok(())
        })?;
    }

    /// Any valid configuration builds a working reader.
    #[test]
    fn prop_valid_config_builds(config in arb_valid_config()) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let reader = FreshTableReader::builder()
                .with_row_store(Arc::new(InMemoryRowStore::new()))
                .with_record_store(Arc::new(InMemoryRecordStore::new()))
                .with_config(config.clone())
                .build()
                .await
                .map_err(fail)?;
            prop_assert_eq!(reader.config(), &config);
            prop_assert!(reader.statistics().map_err(fail)?.is_empty());
            Ok(())
        })?;
    }
}
