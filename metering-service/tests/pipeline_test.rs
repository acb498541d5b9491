//! Export pipeline integration tests.
//!
//! Runs whole cycles over in-memory storage with a scripted billing API.

mod common;

use common::{
    error_response, seed_export_marker, seed_usage, spawn_app, spawn_app_with, stored_state,
    test_config, usage_record, ym, ScriptedBilling, UnlistableStorage,
};
use metering_service::error::MeteringError;
use metering_service::models::MeteringRecord;
use metering_service::services::{MemoryStorage, Storage};
use metering_service::startup::Application;
use metering_service::workers::CycleOutcome;
use serde_json::json;
use std::sync::Arc;

fn network_error() -> MeteringError {
    MeteringError::Network("HTTP 503: upstream unavailable".to_string())
}

#[tokio::test]
async fn single_contract_month_is_submitted_and_recorded() {
    let t = spawn_app(test_config(&[]));
    seed_export_marker(&t.storage, "2025-01").await;
    seed_usage(
        &t.storage,
        "2025-01",
        "batch-1.json",
        vec![usage_record("C1", "cpu_core_hours", 100.0, 0.05)],
    )
    .await;

    let outcome = t.app.run_cycle().await.unwrap();
    assert_eq!(outcome, CycleOutcome::Processed(ym("2025-01")));

    let submissions = t.billing.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(
        submissions[0],
        vec![MeteringRecord {
            cloud: "aws".to_string(),
            contract_id: "C1".to_string(),
            dimension: "cpu_core_hours".to_string(),
            start_time: "2025-01-01T00:00:00Z".to_string(),
            end_time: "2025-01-31T23:59:59Z".to_string(),
            quantity: "100".to_string(),
        }]
    );

    let state = stored_state(&t.storage).await;
    assert!(state.success_contracts[&ym("2025-01")].contains("C1"));
    assert_eq!(state.last_processed_month, Some(ym("2025-01")));
    assert!(state.error_contracts.is_empty());
    assert!(state.last_updated.is_some());
}

#[tokio::test]
async fn reprocessing_a_month_submits_nothing() {
    let t = spawn_app(test_config(&[]));
    seed_export_marker(&t.storage, "2025-01").await;
    seed_usage(
        &t.storage,
        "2025-01",
        "batch-1.json",
        vec![
            usage_record("C1", "cpu_core_hours", 100.0, 0.05),
            usage_record("C2", "cpu_core_hours", 40.0, 0.05),
        ],
    )
    .await;

    let month = ym("2025-01");
    assert!(t.app.processor().process_month(month).await.unwrap());
    assert_eq!(t.billing.submission_count(), 2);

    assert!(t.app.processor().process_month(month).await.unwrap());
    assert_eq!(t.billing.submission_count(), 2);
}

#[tokio::test]
async fn records_for_one_contract_go_in_one_submission() {
    let t = spawn_app(test_config(&[
        ("DIMENSION2_NAME", "memory_gib_hours"),
        ("DIMENSION2_FORMULA", "memory_byte_hours / 1073741824"),
    ]));
    seed_export_marker(&t.storage, "2025-01").await;
    seed_usage(
        &t.storage,
        "2025-01",
        "a.json",
        vec![
            usage_record("C1", "cpu_core_hours", 100.0, 0.05),
            usage_record("C1", "cpu_core_hours", 50.0, 0.07),
        ],
    )
    .await;
    seed_usage(
        &t.storage,
        "2025-01",
        "b.json",
        vec![usage_record("C1", "memory_byte_hours", 3221225472.0, 0.01)],
    )
    .await;

    t.app.run_cycle().await.unwrap();

    let submissions = t.billing.submissions();
    assert_eq!(submissions.len(), 1);
    let quantities: Vec<(&str, &str)> = submissions[0]
        .iter()
        .map(|r| (r.dimension.as_str(), r.quantity.as_str()))
        .collect();
    assert_eq!(
        quantities,
        vec![("cpu_core_hours", "150"), ("memory_gib_hours", "3")]
    );
    assert_eq!(t.billing.auth_calls(), 1);
}

#[tokio::test]
async fn months_advance_one_per_cycle_until_caught_up() {
    let t = spawn_app(test_config(&[("START_MONTH", "2024-12")]));
    seed_export_marker(&t.storage, "2025-01").await;
    seed_usage(
        &t.storage,
        "2024-12",
        "batch.json",
        vec![usage_record("C1", "cpu_core_hours", 10.0, 0.05)],
    )
    .await;
    seed_usage(
        &t.storage,
        "2025-01",
        "batch.json",
        vec![usage_record("C1", "cpu_core_hours", 20.0, 0.05)],
    )
    .await;

    assert_eq!(
        t.app.run_cycle().await.unwrap(),
        CycleOutcome::Processed(ym("2024-12"))
    );
    assert_eq!(
        t.app.run_cycle().await.unwrap(),
        CycleOutcome::Processed(ym("2025-01"))
    );
    assert_eq!(t.app.run_cycle().await.unwrap(), CycleOutcome::CaughtUp);

    let quantities: Vec<String> = t
        .billing
        .submissions()
        .iter()
        .map(|s| s[0].quantity.clone())
        .collect();
    assert_eq!(quantities, vec!["10", "20"]);
    assert_eq!(
        stored_state(&t.storage).await.last_processed_month,
        Some(ym("2025-01"))
    );
}

#[tokio::test]
async fn incomplete_export_holds_back_the_month() {
    let t = spawn_app(test_config(&[]));
    // Export ran only part way through January.
    t.storage
        .upload(
            "omnistrate-metering/last_success_export.json",
            serde_json::to_vec(&json!({
                "svc:PROD:plan-1": { "lastSuccessfulExport": "2025-01-20T08:00:00Z" }
            }))
            .unwrap(),
        )
        .await
        .unwrap();
    seed_usage(
        &t.storage,
        "2025-01",
        "batch.json",
        vec![usage_record("C1", "cpu_core_hours", 10.0, 0.05)],
    )
    .await;

    assert_eq!(t.app.run_cycle().await.unwrap(), CycleOutcome::CaughtUp);
    assert_eq!(t.billing.submission_count(), 0);
}

#[tokio::test]
async fn month_without_usage_files_still_advances() {
    let t = spawn_app(test_config(&[]));
    seed_export_marker(&t.storage, "2025-01").await;

    assert_eq!(
        t.app.run_cycle().await.unwrap(),
        CycleOutcome::Processed(ym("2025-01"))
    );
    assert_eq!(t.billing.submission_count(), 0);
    assert_eq!(t.billing.auth_calls(), 0);
}

#[tokio::test]
async fn month_with_only_unpriced_records_still_advances() {
    let t = spawn_app(test_config(&[]));
    seed_export_marker(&t.storage, "2025-01").await;
    seed_usage(
        &t.storage,
        "2025-01",
        "batch.json",
        vec![
            json!({ "externalPayerId": "C1", "dimension": "cpu_core_hours", "value": 10 }),
            usage_record("C2", "cpu_core_hours", 5.0, 0.0),
        ],
    )
    .await;

    assert_eq!(
        t.app.run_cycle().await.unwrap(),
        CycleOutcome::Processed(ym("2025-01"))
    );
    assert_eq!(t.billing.submission_count(), 0);

    let state = stored_state(&t.storage).await;
    assert_eq!(state.last_processed_month, Some(ym("2025-01")));
    assert!(state.error_contracts.is_empty());
    assert_eq!(t.app.run_cycle().await.unwrap(), CycleOutcome::CaughtUp);
}

#[tokio::test]
async fn quantities_beyond_i64_range_are_sent_in_full() {
    let t = spawn_app(test_config(&[("DIMENSION1_FORMULA", "cpu_core_hours * 1e18")]));
    seed_export_marker(&t.storage, "2025-01").await;
    seed_usage(
        &t.storage,
        "2025-01",
        "batch.json",
        vec![usage_record("C1", "cpu_core_hours", 100.0, 0.05)],
    )
    .await;

    assert_eq!(
        t.app.run_cycle().await.unwrap(),
        CycleOutcome::Processed(ym("2025-01"))
    );
    let submissions = t.billing.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0][0].quantity, "100000000000000000000");
}

#[tokio::test]
async fn failed_submission_is_stored_and_retried_with_the_same_payload() {
    let t = spawn_app(test_config(&[]));
    seed_export_marker(&t.storage, "2025-01").await;
    seed_usage(
        &t.storage,
        "2025-01",
        "batch.json",
        vec![usage_record("C1", "cpu_core_hours", 100.0, 0.05)],
    )
    .await;
    t.billing.push(Err(network_error()));

    assert_eq!(
        t.app.run_cycle().await.unwrap(),
        CycleOutcome::Failed(ym("2025-01"))
    );

    let state = stored_state(&t.storage).await;
    assert_eq!(state.last_processed_month, None);
    let entry = state.error_entry("C1", &ym("2025-01")).unwrap();
    assert_eq!(entry.retry_count, 0);
    assert_eq!(entry.code.as_deref(), Some("API_ERROR"));
    assert_eq!(entry.errors.len(), 1);
    assert_eq!(
        entry.payload.as_ref().unwrap().request,
        t.billing.submissions()[0]
    );

    assert_eq!(
        t.app.run_cycle().await.unwrap(),
        CycleOutcome::Processed(ym("2025-01"))
    );

    let submissions = t.billing.submissions();
    assert_eq!(submissions.len(), 2);
    assert_eq!(submissions[0], submissions[1]);

    let state = stored_state(&t.storage).await;
    assert!(state.error_contracts.is_empty());
    assert!(state.success_contracts[&ym("2025-01")].contains("C1"));
    assert_eq!(state.last_processed_month, Some(ym("2025-01")));
}

#[tokio::test]
async fn failed_retry_uses_retry_error_code() {
    let t = spawn_app(test_config(&[]));
    seed_export_marker(&t.storage, "2025-01").await;
    seed_usage(
        &t.storage,
        "2025-01",
        "batch.json",
        vec![usage_record("C1", "cpu_core_hours", 1.0, 0.05)],
    )
    .await;
    t.billing.push(Err(network_error()));
    t.billing.push(Err(network_error()));

    t.app.run_cycle().await.unwrap();
    t.app.run_cycle().await.unwrap();

    let state = stored_state(&t.storage).await;
    let entry = state.error_entry("C1", &ym("2025-01")).unwrap();
    assert_eq!(entry.retry_count, 1);
    assert_eq!(entry.code.as_deref(), Some("RETRY_ERROR"));
}

#[tokio::test]
async fn application_errors_accumulate_across_attempts() {
    let t = spawn_app(test_config(&[]));
    seed_export_marker(&t.storage, "2025-01").await;
    seed_usage(
        &t.storage,
        "2025-01",
        "batch.json",
        vec![usage_record("C1", "cpu_core_hours", 100.0, 0.05)],
    )
    .await;
    t.billing.push(Ok(error_response(
        json!(["Dimension not registered"]),
        "INVALID_DIMENSION",
        "Rejected",
    )));
    t.billing.push(Ok(error_response(
        json!("Contract suspended"),
        "CONTRACT_INACTIVE",
        "Suspended",
    )));

    t.app.run_cycle().await.unwrap();
    assert_eq!(
        t.app.run_cycle().await.unwrap(),
        CycleOutcome::Failed(ym("2025-01"))
    );

    let state = stored_state(&t.storage).await;
    let entry = state.error_entry("C1", &ym("2025-01")).unwrap();
    assert_eq!(
        entry.errors,
        vec!["Dimension not registered", "Contract suspended"]
    );
    assert_eq!(entry.code.as_deref(), Some("CONTRACT_INACTIVE"));
    assert_eq!(entry.message.as_deref(), Some("Suspended"));
    assert_eq!(entry.retry_count, 1);
}

#[tokio::test]
async fn exhausted_contracts_stay_stored_and_are_not_resubmitted() {
    let t = spawn_app(test_config(&[("MAX_RETRIES", "2")]));
    seed_export_marker(&t.storage, "2025-01").await;
    seed_usage(
        &t.storage,
        "2025-01",
        "batch.json",
        vec![usage_record("C1", "cpu_core_hours", 100.0, 0.05)],
    )
    .await;
    for _ in 0..3 {
        t.billing.push(Err(network_error()));
    }

    for _ in 0..3 {
        assert_eq!(
            t.app.run_cycle().await.unwrap(),
            CycleOutcome::Failed(ym("2025-01"))
        );
    }
    assert_eq!(t.billing.submission_count(), 3);

    // retry_count is now 2, which is no longer below MAX_RETRIES.
    t.app.run_cycle().await.unwrap();
    assert_eq!(t.billing.submission_count(), 3);

    let state = stored_state(&t.storage).await;
    let entry = state.error_entry("C1", &ym("2025-01")).unwrap();
    assert_eq!(entry.retry_count, 2);
    assert_eq!(entry.errors.len(), 3);
    assert!(!state
        .success_contracts
        .get(&ym("2025-01"))
        .is_some_and(|contracts| contracts.contains("C1")));
}

#[tokio::test]
async fn one_failing_contract_does_not_block_the_others() {
    let t = spawn_app(test_config(&[]));
    seed_export_marker(&t.storage, "2025-01").await;
    seed_usage(
        &t.storage,
        "2025-01",
        "batch.json",
        vec![
            usage_record("C1", "cpu_core_hours", 10.0, 0.05),
            usage_record("C2", "cpu_core_hours", 20.0, 0.05),
        ],
    )
    .await;
    t.billing.push(Err(network_error()));

    assert_eq!(
        t.app.run_cycle().await.unwrap(),
        CycleOutcome::Failed(ym("2025-01"))
    );
    assert_eq!(t.billing.submission_count(), 2);

    let state = stored_state(&t.storage).await;
    assert!(state.error_entry("C1", &ym("2025-01")).is_some());
    assert!(state.success_contracts[&ym("2025-01")].contains("C2"));
}

#[tokio::test]
async fn warning_results_count_as_success() {
    let t = spawn_app(test_config(&[]));
    seed_export_marker(&t.storage, "2025-01").await;
    seed_usage(
        &t.storage,
        "2025-01",
        "batch.json",
        vec![usage_record("C1", "cpu_core_hours", 10.0, 0.05)],
    )
    .await;
    t.billing.push(Ok(serde_json::from_value(json!({
        "results": [{ "status": "pending", "message": "Dimension not yet registered" }]
    }))
    .unwrap()));

    assert_eq!(
        t.app.run_cycle().await.unwrap(),
        CycleOutcome::Processed(ym("2025-01"))
    );
    let state = stored_state(&t.storage).await;
    assert!(state.success_contracts[&ym("2025-01")].contains("C1"));
}

#[tokio::test]
async fn failing_formula_drops_only_that_contract() {
    let t = spawn_app(test_config(&[
        ("DIMENSION2_NAME", "replicas_per_core"),
        ("DIMENSION2_FORMULA", "replica_hours / cpu_core_hours"),
    ]));
    seed_export_marker(&t.storage, "2025-01").await;
    seed_usage(
        &t.storage,
        "2025-01",
        "batch.json",
        vec![
            usage_record("A", "replica_hours", 5.0, 0.01),
            usage_record("B", "cpu_core_hours", 10.0, 0.05),
            usage_record("B", "replica_hours", 20.0, 0.01),
        ],
    )
    .await;

    assert_eq!(
        t.app.run_cycle().await.unwrap(),
        CycleOutcome::Processed(ym("2025-01"))
    );

    let submissions = t.billing.submissions();
    assert_eq!(submissions.len(), 1);
    let records: Vec<(&str, &str, &str)> = submissions[0]
        .iter()
        .map(|r| (r.contract_id.as_str(), r.dimension.as_str(), r.quantity.as_str()))
        .collect();
    assert_eq!(
        records,
        vec![
            ("B", "cpu_core_hours", "10"),
            ("B", "replicas_per_core", "2")
        ]
    );

    let state = stored_state(&t.storage).await;
    assert!(!state.is_processed("A", &ym("2025-01")));
}

#[tokio::test]
async fn month_fails_when_no_contract_has_valid_dimensions() {
    let t = spawn_app(test_config(&[
        ("DIMENSION1_NAME", "net_hours"),
        ("DIMENSION1_FORMULA", "replica_hours - cpu_core_hours"),
    ]));
    seed_export_marker(&t.storage, "2025-01").await;
    seed_usage(
        &t.storage,
        "2025-01",
        "batch.json",
        vec![usage_record("C1", "cpu_core_hours", 10.0, 0.05)],
    )
    .await;

    assert_eq!(
        t.app.run_cycle().await.unwrap(),
        CycleOutcome::Failed(ym("2025-01"))
    );
    assert_eq!(t.billing.submission_count(), 0);
}

#[tokio::test]
async fn missing_export_marker_aborts_the_cycle() {
    let t = spawn_app(test_config(&[]));
    seed_usage(
        &t.storage,
        "2025-01",
        "batch.json",
        vec![usage_record("C1", "cpu_core_hours", 10.0, 0.05)],
    )
    .await;

    assert!(matches!(
        t.app.run_cycle().await,
        Err(MeteringError::UsageSourceUnavailable)
    ));
    assert_eq!(t.billing.submission_count(), 0);
}

#[tokio::test]
async fn listing_failure_is_fatal_and_does_not_advance() {
    let storage = Arc::new(UnlistableStorage {
        inner: MemoryStorage::new(),
    });
    seed_export_marker(&storage.inner, "2025-01").await;
    let billing = Arc::new(ScriptedBilling::new());
    let app = Application::with_components(test_config(&[]), storage.clone(), billing.clone());

    assert!(matches!(
        app.run_cycle().await,
        Err(MeteringError::UsageSource(_))
    ));
    assert_eq!(app.state().last_processed_month().await.unwrap(), None);
}

#[tokio::test]
async fn authentication_failure_is_fatal() {
    let t = spawn_app_with(
        test_config(&[]),
        Arc::new(MemoryStorage::new()),
        Arc::new(ScriptedBilling::rejecting_auth()),
    );
    seed_export_marker(&t.storage, "2025-01").await;
    seed_usage(
        &t.storage,
        "2025-01",
        "batch.json",
        vec![usage_record("C1", "cpu_core_hours", 10.0, 0.05)],
    )
    .await;

    assert!(matches!(
        t.app.run_cycle().await,
        Err(MeteringError::Authentication(_))
    ));
    assert_eq!(t.billing.submission_count(), 0);
    assert_eq!(
        t.app.state().last_processed_month().await.unwrap(),
        None
    );
}

#[tokio::test]
async fn corrupt_state_is_never_reset() {
    let t = spawn_app(test_config(&[]));
    seed_export_marker(&t.storage, "2025-01").await;
    t.storage
        .upload(&common::identity().state_file(), b"{not json".to_vec())
        .await
        .unwrap();

    assert!(matches!(
        t.app.run_cycle().await,
        Err(MeteringError::Persistence(_))
    ));
    assert_eq!(
        t.storage
            .download(&common::identity().state_file())
            .await
            .unwrap(),
        b"{not json".to_vec()
    );
}

#[tokio::test]
async fn preflight_in_dry_run_skips_authentication() {
    let t = spawn_app(test_config(&[]));

    t.app.preflight().await.unwrap();

    assert_eq!(t.billing.auth_calls(), 0);
    assert!(t
        .storage
        .download(&common::identity().state_file())
        .await
        .is_ok());
}

#[tokio::test]
async fn preflight_rejects_bad_credentials() {
    let config = test_config(&[
        ("DRY_RUN", "false"),
        ("CLAZAR_CLIENT_ID", "client"),
        ("CLAZAR_CLIENT_SECRET", "secret"),
    ]);
    let t = spawn_app_with(
        config,
        Arc::new(MemoryStorage::new()),
        Arc::new(ScriptedBilling::rejecting_auth()),
    );

    assert!(matches!(
        t.app.preflight().await,
        Err(MeteringError::Authentication(_))
    ));
    assert_eq!(t.billing.auth_calls(), 1);
}
