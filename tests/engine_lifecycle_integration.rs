//! Integration tests for the engine lifecycle
//!
//! These tests drive whole engines through initialize/finalize with real
//! sub-engines and in-memory collaborators.

mod common;

use common::builders::{explorer_config, metric_grid, static_source, InstructionBuilder};
use common::mock_helpers::{
    CountingBlobBackend, DelayedProcessor, FailingSource, FailingStorage, SlowSource,
};
use common::wait_for;
use explorer_engine::config::{CustomStateConfig, VisualizationConfig};
use explorer_engine::engine::{
    EngineEvent, EventKind, InstructionsStatus, NotificationKind, PipelinePhase, PipelineStatus,
    QueryForm, QuerySpec, QUERY_PARAM,
};
use explorer_engine::engine::explorer::encode_query_spec;
use explorer_engine::persistence::{KeyValueStorage, MemoryStorage};
use explorer_engine::pipeline::QueryParams;
use explorer_engine::{
    devtools, EngineError, ExplorerConfig, ExplorerEngine, History, Location, SearchOutcome,
    SequenceType,
};
use serde_json::json;
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;

fn image_config() -> ExplorerConfig {
    ExplorerConfig {
        sequence_type: SequenceType::Images,
        ..explorer_config("images")
    }
}

fn image_items(runs: usize) -> Vec<explorer_engine::Instruction> {
    (0..runs)
        .map(|run| {
            InstructionBuilder::new(&format!("run-{}", run), "samples")
                .blob(&format!("run-{}/samples", run))
                .build()
        })
        .collect()
}

fn image_engine(backend: Arc<CountingBlobBackend>, runs: usize) -> ExplorerEngine {
    ExplorerEngine::builder(image_config())
        .source(static_source(image_items(runs)))
        .blob_backend(backend)
        .build()
}

// ============================================================================
// Bootstrap scenarios
// ============================================================================

#[tokio::test]
async fn test_single_instruction_succeeds() {
    let engine = ExplorerEngine::new(
        ExplorerConfig::default(),
        static_source(vec![InstructionBuilder::new("run-1", "loss").build()]),
    );
    let teardown = engine.initialize().await.unwrap();

    assert_eq!(engine.pipeline().status(), PipelineStatus::Succeeded);
    assert_eq!(engine.pipeline().output().len(), 1);
    assert!(engine.notifications().is_empty());
    assert_eq!(engine.query().spec(), QuerySpec::default());

    teardown.run();
}

#[tokio::test]
async fn test_empty_instructions_report_insufficient_resources() {
    let engine = ExplorerEngine::new(explorer_config("empty"), static_source(Vec::new()));
    let _teardown = engine.initialize().await.unwrap();

    assert_eq!(
        engine.pipeline().status(),
        PipelineStatus::InsufficientResources
    );
    assert!(engine.notifications().is_empty());
    assert!(engine.pipeline().output().is_empty());
    assert_eq!(engine.pipeline().stats().total_runs(), 0);
}

#[tokio::test]
async fn test_failing_source_becomes_error_notification() {
    let engine = ExplorerEngine::new(
        explorer_config("failing"),
        Arc::new(FailingSource::new("backend unavailable")),
    );
    let _teardown = engine.initialize().await.unwrap();

    assert_eq!(engine.pipeline().status(), PipelineStatus::Error);
    let notifications = engine.notifications().list();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].kind, NotificationKind::Error);
    assert!(notifications[0].message.contains("backend unavailable"));
}

#[tokio::test]
async fn test_malformed_persisted_query_falls_back_to_default() {
    let history = History::new(Location::parse("/metrics").with_search_param(QUERY_PARAM, "{"));
    let engine = ExplorerEngine::builder(explorer_config("metrics").with_persistence("/metrics"))
        .source(static_source(metric_grid(1)))
        .history(history)
        .build();

    let _teardown = engine.initialize().await.unwrap();

    assert_eq!(engine.query().spec(), QuerySpec::default());
    assert!(engine.notifications().is_empty());
    assert_eq!(engine.pipeline().status(), PipelineStatus::Succeeded);
    assert_eq!(engine.pipeline().output().len(), 4);
}

#[tokio::test]
async fn test_persisted_query_is_replayed() {
    let spec = QuerySpec {
        form: QueryForm {
            selections: vec!["loss".to_string()],
            simple_input: "metric.context.subset == \"val\"".to_string(),
            ..QueryForm::default()
        },
        ..QuerySpec::default()
    };
    let history = History::new(
        Location::parse("/metrics").with_search_param(QUERY_PARAM, &encode_query_spec(&spec).unwrap()),
    );
    let engine = ExplorerEngine::builder(explorer_config("metrics").with_persistence("/metrics"))
        .source(static_source(metric_grid(3)))
        .history(history)
        .build();

    let _teardown = engine.initialize().await.unwrap();

    assert_eq!(engine.query().spec(), spec);
    assert_eq!(engine.pipeline().output().len(), 3);
    assert_eq!(
        engine.query().applied().map(|p| p.predicate),
        Some(spec.to_params(SequenceType::Metric).predicate)
    );
}

// ============================================================================
// Configuration and lifecycle errors
// ============================================================================

#[tokio::test]
async fn test_persistence_without_base_path_is_a_configuration_error() {
    let config = ExplorerConfig {
        persist: true,
        base_path: None,
        ..explorer_config("broken")
    };
    let engine = ExplorerEngine::new(config, static_source(metric_grid(1)));
    let version = engine.store().version();

    let err = engine.initialize().await.unwrap_err();
    assert!(err.is_configuration());
    assert_eq!(engine.store().version(), version);
    assert!(engine.notifications().is_empty());
}

#[tokio::test]
async fn test_finalize_then_initialize_again() {
    let engine = ExplorerEngine::new(explorer_config("again"), static_source(metric_grid(1)));

    engine.initialize().await.unwrap().run();
    assert_eq!(engine.pipeline().status(), PipelineStatus::Idle);

    let _teardown = engine.initialize().await.unwrap();
    assert_eq!(engine.pipeline().status(), PipelineStatus::Succeeded);
    assert_eq!(engine.pipeline().output().len(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_finalize_during_instructions_load_wins() {
    let engine = ExplorerEngine::new(
        explorer_config("slow-load"),
        Arc::new(SlowSource::new(Duration::from_millis(100), metric_grid(1))),
    );
    let initial = engine.store().get_state();

    let pending = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.initialize().await.map(|_| ()) })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    engine.finalize();

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(EngineError::Lifecycle(_))));
    assert!(!engine.is_initialized());
    assert_eq!(engine.pipeline().status(), PipelineStatus::Idle);
    assert_eq!(engine.instructions().status(), InstructionsStatus::Idle);
    assert!(engine.instructions().items().is_empty());
    assert_eq!(*engine.store().get_state(), *initial);
    assert_eq!(engine.blob_uri().outstanding(), 0);

    // The engine can still be brought up normally afterwards
    let _teardown = engine.initialize().await.unwrap();
    assert_eq!(engine.pipeline().status(), PipelineStatus::Succeeded);
    assert_eq!(engine.pipeline().output().len(), 4);
}

// ============================================================================
// Resource release
// ============================================================================

#[tokio::test]
async fn test_finalize_releases_every_handle_once() {
    let backend = Arc::new(CountingBlobBackend::default());
    let engine = image_engine(backend.clone(), 3);

    let teardown = engine.initialize().await.unwrap();
    assert_eq!(backend.live(), 3);
    assert_eq!(engine.blob_uri().outstanding(), 3);

    teardown.run();
    assert_eq!(backend.live(), 0);
    assert_eq!(backend.revoked(), backend.created());

    engine.finalize();
    assert_eq!(backend.revoked(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_finalize_during_search_leaves_initial_state() {
    let backend = Arc::new(CountingBlobBackend::default());
    let engine = ExplorerEngine::builder(image_config())
        .source(static_source(image_items(2)))
        .blob_backend(backend.clone())
        .processor(Arc::new(DelayedProcessor::new([
            Duration::ZERO,
            Duration::from_millis(200),
        ])))
        .build();
    let initial = engine.store().get_state();
    let _teardown = engine.initialize().await.unwrap();
    assert_eq!(engine.blob_uri().outstanding(), 2);

    let search = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .pipeline()
                .search(QueryParams::new("run.hash != \"none\""), false)
                .await
        })
    };
    assert!(wait_for(|| engine.pipeline().phase() == PipelinePhase::CustomProcessing).await);
    engine.finalize();

    assert!(matches!(search.await.unwrap(), SearchOutcome::Superseded));
    assert_eq!(*engine.store().get_state(), *initial);
    assert_eq!(engine.pipeline().status(), PipelineStatus::Idle);
    assert!(engine.pipeline().output().is_empty());
    assert_eq!(engine.blob_uri().outstanding(), 0);
    assert_eq!(backend.live(), 0);
    assert_eq!(engine.events().fired(EventKind::PipelineFinished), 0);
}

#[tokio::test]
async fn test_superseded_handles_are_released_after_search() {
    let backend = Arc::new(CountingBlobBackend::default());
    let engine = image_engine(backend.clone(), 3);
    let _teardown = engine.initialize().await.unwrap();

    engine.query().change_form(QueryForm {
        simple_input: "run.hash == \"run-1\"".to_string(),
        ..QueryForm::default()
    });

    assert!(wait_for(|| engine.pipeline().output().len() == 1).await);
    assert!(wait_for(|| backend.live() == 1).await);
    assert_eq!(backend.revoked(), 2);
}

// ============================================================================
// Independence and persistence
// ============================================================================

#[tokio::test]
async fn test_instances_are_independent() {
    let first = ExplorerEngine::new(explorer_config("first"), static_source(metric_grid(1)));
    let second = ExplorerEngine::new(explorer_config("second"), static_source(Vec::new()));

    let _a = first.initialize().await.unwrap();
    let _b = second.initialize().await.unwrap();
    first.notifications().warning("only in first");

    assert_eq!(first.notifications().len(), 1);
    assert!(second.notifications().is_empty());
    assert_eq!(first.pipeline().status(), PipelineStatus::Succeeded);
    assert_eq!(
        second.pipeline().status(),
        PipelineStatus::InsufficientResources
    );
}

#[tokio::test]
async fn test_navigation_persisted_to_storage() {
    let storage = Arc::new(MemoryStorage::new());
    let history = History::at("/metrics");
    let engine = ExplorerEngine::builder(explorer_config("metrics").with_persistence("/metrics"))
        .source(static_source(metric_grid(1)))
        .history(history.clone())
        .storage(storage.clone())
        .build();
    let teardown = engine.initialize().await.unwrap();

    // The initial search wrote the query into the URL
    let stored = storage.get("/metricsUrl").unwrap().unwrap();
    assert_eq!(stored, history.location().href());
    assert!(Location::parse(&stored).search_param(QUERY_PARAM).is_some());

    teardown.run();
    history.push(Location::parse("/elsewhere"));
    assert_eq!(storage.get("/metricsUrl").unwrap(), Some(stored));
}

#[tokio::test]
async fn test_storage_failures_are_not_fatal() {
    let engine = ExplorerEngine::builder(explorer_config("metrics").with_persistence("/metrics"))
        .source(static_source(metric_grid(1)))
        .storage(Arc::new(FailingStorage))
        .build();

    let teardown = engine.initialize().await.unwrap();
    assert_eq!(engine.pipeline().status(), PipelineStatus::Succeeded);
    teardown.run();
}

#[tokio::test]
async fn test_visualization_controls_survive_engines() {
    let storage = Arc::new(MemoryStorage::new());
    let mut config = explorer_config("metrics").with_persistence("/metrics");
    let mut controls = serde_json::Map::new();
    controls.insert("smoothing".to_string(), json!(0.0));
    config
        .visualizations
        .insert("chart".to_string(), VisualizationConfig { controls });

    let first = ExplorerEngine::builder(config.clone())
        .source(static_source(metric_grid(2)))
        .storage(storage.clone())
        .build();
    let teardown = first.initialize().await.unwrap();
    let chart = first.visualizations().get("chart").unwrap();
    assert_eq!(chart.summary.record_count, 8);

    first
        .visualizations()
        .update_control("chart", "smoothing", json!(0.6))
        .unwrap();
    teardown.run();

    let second = ExplorerEngine::builder(config)
        .source(static_source(metric_grid(2)))
        .storage(storage)
        .build();
    let _teardown = second.initialize().await.unwrap();
    assert_eq!(
        second.visualizations().get("chart").unwrap().controls["smoothing"],
        json!(0.6)
    );
}

#[tokio::test]
async fn test_custom_state_restored_from_url() {
    let mut config = explorer_config("metrics").with_persistence("/metrics");
    config.states.insert(
        "panel".to_string(),
        CustomStateConfig {
            initial_state: json!({ "open": false }),
            persist: true,
        },
    );
    let history = History::at("/metrics");

    let first = ExplorerEngine::builder(config.clone())
        .source(static_source(metric_grid(1)))
        .history(history.clone())
        .build();
    let teardown = first.initialize().await.unwrap();
    first
        .custom_states()
        .merge("panel", json!({ "open": true }))
        .unwrap();
    teardown.run();

    let second = ExplorerEngine::builder(config)
        .source(static_source(metric_grid(1)))
        .history(history)
        .build();
    let _teardown = second.initialize().await.unwrap();
    assert_eq!(
        second.custom_states().get("panel").unwrap(),
        json!({ "open": true })
    );
}

// ============================================================================
// Events and tooling
// ============================================================================

#[tokio::test]
async fn test_pipeline_finished_reaches_channel_subscribers() {
    let engine = ExplorerEngine::new(explorer_config("events"), static_source(metric_grid(1)));
    let (_, rx) = engine
        .events()
        .subscribe_channel(Some(EventKind::PipelineFinished));

    let _teardown = engine.initialize().await.unwrap();

    match rx.try_recv().unwrap() {
        EngineEvent::PipelineFinished { record_count, .. } => assert_eq!(record_count, 4),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(engine.events().fired(EventKind::PipelineFinished), 1);
}

#[tokio::test]
#[serial]
async fn test_devtools_registration_follows_lifecycle() {
    let config = ExplorerConfig {
        devtool: true,
        ..explorer_config("devtools-lifecycle")
    };
    let engine = ExplorerEngine::new(config, static_source(metric_grid(1)));

    let teardown = engine.initialize().await.unwrap();
    if devtools::enabled() {
        let store = devtools::inspect("devtools-lifecycle").unwrap();
        assert_eq!(store.version(), engine.store().version());
    }

    teardown.run();
    assert!(devtools::inspect("devtools-lifecycle").is_none());
}

#[tokio::test]
#[serial]
async fn test_finalizing_old_engine_keeps_newer_devtools_entry() {
    let config = ExplorerConfig {
        devtool: true,
        ..explorer_config("devtools-shared")
    };
    let old = ExplorerEngine::new(config.clone(), static_source(metric_grid(1)));
    let new = ExplorerEngine::new(config, static_source(metric_grid(1)));

    let old_teardown = old.initialize().await.unwrap();
    let new_teardown = new.initialize().await.unwrap();
    old_teardown.run();

    if devtools::enabled() {
        let store = devtools::inspect("devtools-shared").unwrap();
        assert!(store.downgrade().is(new.store()));
    }

    new_teardown.run();
    assert!(devtools::inspect("devtools-shared").is_none());
}
