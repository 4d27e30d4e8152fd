//! Integration tests for PipelineCoordinator and BatchCoordinator
//!
//! These tests drive complete pipelines through mock collaborators and check
//! the externally visible behaviour: stage order, progress, retries, rollback,
//! admission control, batching and shutdown.

mod common;

use anyhow::Result;
use common::{fast_config, init_test_logging, item, record_events, Fixture};
use futures::future::join_all;
use parking_lot::Mutex;
use shelf_config::{RetryPolicyConfig, StageTimeouts};
use shelf_core::test_support::mocks::{
    MockAiAnnotator, MockContentFinalizer, MockContentStore, MockSearchIndexer,
};
use shelf_core::{CollaboratorError, ContentItem};
use shelf_pipeline::retry::is_transient;
use shelf_pipeline::{
    BatchCoordinator, BatchStatus, HealthState, PipelineConfig, PipelineError, PipelineState,
    Stage,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn history(state: &PipelineState) -> Vec<Stage> {
    state.stage_history.iter().map(|r| r.stage).collect()
}

fn assert_well_formed(state: &PipelineState) {
    assert!(
        state
            .stage_history
            .windows(2)
            .all(|w| w[0].timestamp < w[1].timestamp),
        "history timestamps must strictly increase"
    );
    assert!(
        state
            .stage_history
            .windows(2)
            .all(|w| w[0].stage.can_transition_to(w[1].stage)),
        "history must follow stage order: {:?}",
        history(state)
    );
    assert_eq!(state.progress == 100, state.is_complete());
}

// ============================================================================
// Single pipelines
// ============================================================================

#[tokio::test]
async fn test_happy_path_runs_every_stage() -> Result<()> {
    init_test_logging();
    let fixture = Fixture::new();
    let events = record_events(&fixture.coordinator.events());

    let state = fixture.coordinator.process_single(item("a1")).await?;

    assert_eq!(state.stage, Stage::Complete);
    assert_eq!(state.progress, 100);
    assert_eq!(
        history(&state),
        vec![
            Stage::Pending,
            Stage::Validation,
            Stage::AiProcessing,
            Stage::Storage,
            Stage::Indexing,
            Stage::PostProcessing,
            Stage::Complete,
        ]
    );
    assert_eq!(state.completed_stages, Stage::ACTIVE.to_vec());
    assert_eq!(state.retry_attempts, 0);
    assert!(state.error.is_none());
    assert!(state.end_time.is_some());
    assert_well_formed(&state);

    let progress: Vec<u8> = events.lock().iter().map(|e| e.progress).collect();
    assert_eq!(progress, vec![0, 10, 50, 70, 90, 100]);

    assert!(fixture.store.get("a1").unwrap().is_annotated());
    assert_eq!(fixture.indexer.indexed(), vec!["a1".to_string()]);

    let metrics = fixture.coordinator.get_metrics();
    assert_eq!(metrics.total_pipelines_started, 1);
    assert_eq!(metrics.total_pipelines_completed, 1);
    assert_eq!(metrics.total_pipelines_failed, 0);
    for stage in Stage::ACTIVE {
        let stage_metrics = metrics.stage_metrics[&stage];
        assert_eq!(stage_metrics.invocation_count, 1, "{stage}");
        assert_eq!(stage_metrics.success_rate, 1.0, "{stage}");
    }
    assert_eq!(fixture.coordinator.get_active_pipeline_count(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_transient_annotation_failures_are_retried_with_backoff() -> Result<()> {
    let fixture = Fixture::builder()
        .annotator(MockAiAnnotator::new().failing_times(2))
        .config(PipelineConfig::default())
        .build();
    let started = tokio::time::Instant::now();

    let state = fixture.coordinator.process_single(item("a1")).await?;

    assert!(state.is_complete());
    assert_eq!(state.retry_attempts, 2);
    assert_eq!(fixture.annotator.call_count(), 3);
    // Default policy: 1000ms then 2000ms
    assert!(started.elapsed() >= Duration::from_millis(3000));

    let metrics = fixture.coordinator.get_metrics();
    assert_eq!(metrics.total_retries, 2);
    let ai = metrics.stage_metrics[&Stage::AiProcessing];
    assert_eq!(ai.invocation_count, 3);
    assert_eq!(ai.success_count, 1);
    Ok(())
}

#[tokio::test]
async fn test_indexing_failure_rolls_back_stored_content() -> Result<()> {
    let fixture = Fixture::builder()
        .indexer(MockSearchIndexer::new().always_failing())
        .build();

    let state = fixture.coordinator.process_single(item("a1")).await?;

    assert!(state.is_failed());
    assert_eq!(state.progress, 70);
    assert!(state.rolled_back);
    assert!(state.rollback_error.is_none());
    let error = state.error.as_ref().unwrap();
    assert_eq!(error.stage, Stage::Indexing);
    assert_eq!(error.attempts, 4);
    assert_eq!(state.retry_attempts, 3);
    assert_eq!(fixture.indexer.call_count(), 4);
    assert_eq!(fixture.store.delete_calls(), vec!["a1".to_string()]);
    assert!(!fixture.store.contains("a1"));
    assert_well_formed(&state);

    let metrics = fixture.coordinator.get_metrics();
    assert_eq!(metrics.total_pipelines_failed, 1);
    assert_eq!(metrics.total_rollbacks, 1);
    Ok(())
}

#[tokio::test]
async fn test_failed_rollback_is_recorded_on_the_pipeline() -> Result<()> {
    let fixture = Fixture::builder()
        .indexer(MockSearchIndexer::new().rejecting())
        .store(MockContentStore::new().failing_deletes())
        .build();

    let state = fixture.coordinator.process_single(item("a1")).await?;

    assert!(state.is_failed());
    assert!(state.rolled_back);
    assert!(state.rollback_error.is_some());
    assert_eq!(state.error.unwrap().stage, Stage::Indexing);
    assert_eq!(fixture.store.delete_calls().len(), 1);
    assert!(fixture.store.contains("a1"));
    Ok(())
}

#[tokio::test]
async fn test_post_processing_failure_rolls_back_stored_content() -> Result<()> {
    let fixture = Fixture::builder()
        .finalizer(MockContentFinalizer::new().always_failing())
        .build();

    let state = fixture.coordinator.process_single(item("a1")).await?;

    assert!(state.is_failed());
    assert_eq!(state.progress, 90);
    assert!(state.rolled_back);
    let error = state.error.as_ref().unwrap();
    assert_eq!(error.stage, Stage::PostProcessing);
    assert_eq!(error.attempts, 4);
    assert_eq!(fixture.finalizer.call_count(), 4);
    assert_eq!(fixture.indexer.indexed(), vec!["a1".to_string()]);
    assert_eq!(fixture.store.delete_calls(), vec!["a1".to_string()]);
    assert!(!fixture.store.contains("a1"));
    assert!(fixture.discovery.triggered().is_empty());
    assert_well_formed(&state);
    Ok(())
}

#[tokio::test]
async fn test_permanent_errors_fail_fast_with_transient_predicate() -> Result<()> {
    let fixture = Fixture::builder()
        .annotator(
            MockAiAnnotator::new()
                .always_failing()
                .with_error(CollaboratorError::permanent("unsupported content")),
        )
        .retry_predicate(is_transient)
        .build();

    let state = fixture.coordinator.process_single(item("a1")).await?;

    assert!(state.is_failed());
    assert_eq!(state.error.unwrap().attempts, 1);
    assert_eq!(state.retry_attempts, 0);
    assert_eq!(fixture.annotator.call_count(), 1);
    assert_eq!(fixture.coordinator.get_metrics().total_retries, 0);
    Ok(())
}

#[tokio::test]
async fn test_validation_failure_never_reaches_collaborators() -> Result<()> {
    let fixture = Fixture::new();

    let state = fixture
        .coordinator
        .process_single(ContentItem::new("a1").with_url("javascript:alert(1)"))
        .await?;

    assert!(state.is_failed());
    assert_eq!(state.progress, 0);
    assert_eq!(state.retry_attempts, 0);
    assert_eq!(state.error.unwrap().stage, Stage::Validation);
    assert_eq!(fixture.annotator.call_count(), 0);
    assert_eq!(fixture.store.save_count(), 0);
    assert!(!state.rolled_back);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_configured_timeout_fails_slow_annotation() -> Result<()> {
    let config = PipelineConfig::default()
        .with_stage_timeouts(StageTimeouts {
            ai_processing_ms: Some(50),
            ..StageTimeouts::default()
        })
        .with_retry_policy(RetryPolicyConfig {
            max_retries: 1,
            initial_delay_ms: 10,
            max_delay_ms: 10,
            backoff_multiplier: 1.0,
        });
    let fixture = Fixture::builder()
        .annotator(MockAiAnnotator::new().with_delay(Duration::from_secs(5)))
        .config(config)
        .build();

    let state = fixture.coordinator.process_single(item("a1")).await?;

    assert!(state.is_failed());
    let error = state.error.unwrap();
    assert_eq!(error.stage, Stage::AiProcessing);
    assert_eq!(error.attempts, 2);
    assert!(error.message.contains("timed out"));
    assert_eq!(fixture.store.save_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_terminal_status_is_stable() -> Result<()> {
    let fixture = Fixture::new();
    let id = fixture.coordinator.start_pipeline(item("a1"))?;

    let first = fixture.coordinator.wait_for_completion(id).await?;
    let second = fixture.coordinator.wait_for_completion(id).await?;

    assert_eq!(first, second);
    assert_eq!(fixture.coordinator.get_pipeline_status(id)?, first);
    assert_eq!(
        fixture.coordinator.advance_to_stage(id, Stage::Failed),
        Err(PipelineError::ManagedPipeline(id))
    );
    Ok(())
}

#[tokio::test]
async fn test_missing_collaborators_rejected_up_front() {
    let coordinator = shelf_pipeline::PipelineCoordinator::builder()
        .content_store(Arc::new(MockContentStore::new()))
        .search_indexer(Arc::new(MockSearchIndexer::new()))
        .build();

    assert_eq!(
        coordinator.process_single(item("a1")).await,
        Err(PipelineError::MissingCollaborator("annotator"))
    );
    assert_eq!(
        coordinator.create_pipeline(item("a1")),
        Err(PipelineError::MissingCollaborator("annotator"))
    );
}

// ============================================================================
// Admission control
// ============================================================================

#[tokio::test]
async fn test_fourth_pipeline_waits_for_a_slot() -> Result<()> {
    let fixture = Fixture::builder()
        .annotator(MockAiAnnotator::new().gated())
        .build();
    let coordinator = &fixture.coordinator;

    let ids = (0..4)
        .map(|i| coordinator.start_pipeline(item(&format!("a{i}"))))
        .collect::<Result<Vec<_>, _>>()?;

    assert_eq!(coordinator.get_active_pipeline_count(), 3);
    assert_eq!(coordinator.get_queued_pipeline_count(), 1);
    assert_eq!(coordinator.get_pipeline_status(ids[3])?.stage, Stage::Queued);

    // Let the admitted pipelines reach the annotator gate
    while fixture.annotator.call_count() < 3 {
        tokio::task::yield_now().await;
    }
    assert_eq!(coordinator.get_pipeline_status(ids[3])?.stage, Stage::Queued);
    assert_eq!(fixture.annotator.calls_for("a3"), 0);

    fixture.annotator.release(4);
    let states = join_all(ids.iter().map(|id| coordinator.wait_for_completion(*id))).await;

    for state in states {
        let state = state?;
        assert!(state.is_complete());
        assert_well_formed(&state);
    }
    let queued = coordinator.get_pipeline_status(ids[3])?;
    assert_eq!(&history(&queued)[..3], &[Stage::Pending, Stage::Queued, Stage::Validation]);
    assert_eq!(coordinator.get_active_pipeline_count(), 0);
    assert_eq!(coordinator.get_queued_pipeline_count(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_active_pipelines_never_exceed_limit() -> Result<()> {
    let fixture = Fixture::builder()
        .annotator(MockAiAnnotator::new().with_delay(Duration::from_millis(5)))
        .config(fast_config().with_max_concurrent(2))
        .build();

    let running = Arc::new(Mutex::new((HashSet::new(), 0usize)));
    let tracker = Arc::clone(&running);
    fixture.coordinator.events().on_progress(move |event| {
        let mut guard = tracker.lock();
        let (active, peak) = &mut *guard;
        match event.stage {
            Stage::Validation => {
                active.insert(event.pipeline_id);
            }
            Stage::Complete | Stage::Failed => {
                active.remove(&event.pipeline_id);
            }
            _ => {}
        }
        *peak = (*peak).max(active.len());
    });

    let ids = (0..10)
        .map(|i| fixture.coordinator.start_pipeline(item(&format!("a{i}"))))
        .collect::<Result<Vec<_>, _>>()?;
    for id in ids {
        assert!(fixture.coordinator.wait_for_completion(id).await?.is_complete());
    }

    let peak = running.lock().1;
    assert!(peak <= 2, "peak concurrency was {peak}");
    assert_eq!(fixture.coordinator.get_metrics().total_pipelines_completed, 10);
    Ok(())
}

#[tokio::test]
async fn test_shutdown_fails_running_and_queued_pipelines() -> Result<()> {
    let fixture = Fixture::builder()
        .annotator(MockAiAnnotator::new().gated())
        .build();
    let coordinator = &fixture.coordinator;
    let ids = (0..4)
        .map(|i| coordinator.start_pipeline(item(&format!("a{i}"))))
        .collect::<Result<Vec<_>, _>>()?;
    while fixture.annotator.call_count() < 3 {
        tokio::task::yield_now().await;
    }

    coordinator.shutdown();

    for id in &ids {
        let state = coordinator.wait_for_completion(*id).await?;
        assert!(state.is_failed());
        assert!(state.error.unwrap().message.contains("cancelled"));
    }
    let queued = coordinator.get_pipeline_status(ids[3])?;
    assert_eq!(queued.error.unwrap().stage, Stage::Queued);
    assert_eq!(fixture.store.save_count(), 0);
    assert_eq!(coordinator.get_active_pipeline_count(), 0);
    assert_eq!(coordinator.get_metrics().total_pipelines_failed, 4);
    assert!(coordinator.is_shut_down());
    Ok(())
}

#[tokio::test]
async fn test_panicking_annotator_releases_its_slot() -> Result<()> {
    let fixture = Fixture::builder()
        .annotator(MockAiAnnotator::new().panicking())
        .config(fast_config().with_max_concurrent(1))
        .build();

    let first = fixture.coordinator.start_pipeline(item("a1"))?;
    let second = fixture.coordinator.start_pipeline(item("a2"))?;
    for id in [first, second] {
        let state =
            tokio::time::timeout(Duration::from_secs(5), fixture.coordinator.wait_for_completion(id))
                .await??;
        assert!(state.is_failed());
        let error = state.error.unwrap();
        assert_eq!(error.stage, Stage::AiProcessing);
        assert!(error.message.contains("panicked"), "{}", error.message);
    }

    assert_eq!(fixture.coordinator.get_active_pipeline_count(), 0);
    assert_eq!(fixture.coordinator.get_metrics().total_pipelines_failed, 2);
    Ok(())
}

#[tokio::test]
async fn test_manual_pipelines_count_against_the_limit() -> Result<()> {
    let fixture = Fixture::new();
    let ids = (0..4)
        .map(|i| fixture.coordinator.create_pipeline(item(&format!("m{i}"))))
        .collect::<Result<Vec<_>, _>>()?;

    for id in &ids[..3] {
        fixture.coordinator.advance_to_stage(*id, Stage::Validation)?;
    }
    let err = fixture
        .coordinator
        .advance_to_stage(ids[3], Stage::Validation)
        .unwrap_err();
    assert!(matches!(err, PipelineError::NoCapacity { limit: 3, .. }));

    let in_active_stages = fixture
        .coordinator
        .list_pipelines()
        .iter()
        .filter(|p| p.stage.is_active())
        .count();
    assert_eq!(in_active_stages, 3);
    assert_eq!(fixture.coordinator.get_active_pipeline_count(), 3);

    // A driven pipeline has to wait behind them
    let driven = fixture.coordinator.start_pipeline(item("d1"))?;
    assert_eq!(fixture.coordinator.get_queued_pipeline_count(), 1);
    fixture.coordinator.advance_to_stage(ids[0], Stage::Failed)?;
    let state = fixture.coordinator.wait_for_completion(driven).await?;
    assert!(state.is_complete());
    Ok(())
}

#[tokio::test]
async fn test_invalid_config_fails_instead_of_hanging() {
    let fixture = Fixture::builder()
        .config(fast_config().with_max_concurrent(0))
        .build();

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        fixture.coordinator.process_single(item("a1")),
    )
    .await
    .expect("process_single must not wait for a slot that never frees");
    assert!(matches!(result, Err(PipelineError::InvalidConfig(_))));
    assert_eq!(fixture.coordinator.get_queued_pipeline_count(), 0);
}

// ============================================================================
// Batches
// ============================================================================

#[tokio::test]
async fn test_batch_with_one_failing_item_is_partial() -> Result<()> {
    let fixture = Fixture::builder()
        .annotator(MockAiAnnotator::new().failing_for("b2"))
        .build();
    let batches = BatchCoordinator::new(fixture.coordinator.clone());

    let batch_id = batches.process_batch(vec![item("b1"), item("b2"), item("b3")])?;
    let batch = batches.wait_for_batch_completion(batch_id).await?;

    assert_eq!(batch.status, BatchStatus::Partial);
    assert_eq!(batch.total_items, 3);
    assert_eq!(batch.completed_items, 2);
    assert_eq!(batch.failed_items, 1);
    assert_eq!(batch.completed_items + batch.failed_items, batch.total_items);
    assert!(batch.finished_at.is_some());

    let members = batches.get_batch_pipelines(batch_id)?;
    assert!(members[0].is_complete());
    assert!(members[1].is_failed());
    assert!(members[2].is_complete());
    assert_eq!(members[1].error.as_ref().unwrap().stage, Stage::AiProcessing);
    assert_eq!(fixture.annotator.calls_for("b2"), 4);
    assert!(!fixture.store.contains("b2"));
    assert_eq!(batches.list_batches(), vec![batch]);
    Ok(())
}

#[tokio::test]
async fn test_batch_where_every_item_fails() -> Result<()> {
    let fixture = Fixture::builder()
        .store(MockContentStore::new().always_failing_saves())
        .build();
    let batches = BatchCoordinator::new(fixture.coordinator.clone());

    let batch_id = batches.process_batch(vec![item("b1"), item("b2")])?;
    let batch = batches.wait_for_batch_completion(batch_id).await?;

    assert_eq!(batch.status, BatchStatus::Failed);
    assert_eq!(batch.failed_items, 2);
    assert_eq!(
        fixture.coordinator.get_health_status().status,
        HealthState::Unhealthy
    );
    Ok(())
}

#[tokio::test]
async fn test_batch_counters_only_move_on_terminal_members() -> Result<()> {
    let fixture = Fixture::builder()
        .annotator(MockAiAnnotator::new().gated())
        .build();
    let batches = BatchCoordinator::new(fixture.coordinator.clone());

    let batch_id = batches.process_batch((0..5).map(|i| item(&format!("b{i}"))).collect())?;
    while fixture.annotator.call_count() < 3 {
        tokio::task::yield_now().await;
    }

    let running = batches.get_batch_status(batch_id)?;
    assert_eq!(running.status, BatchStatus::Running);
    assert_eq!(running.completed_items + running.failed_items, 0);
    assert_eq!(fixture.coordinator.get_queued_pipeline_count(), 2);

    fixture.annotator.release(5);
    let batch = batches.wait_for_batch_completion(batch_id).await?;
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(batch.completed_items, 5);
    Ok(())
}

// ============================================================================
// Observers
// ============================================================================

#[tokio::test]
async fn test_broadcast_subscribers_see_every_transition() -> Result<()> {
    let fixture = Fixture::new();
    let mut rx = fixture.coordinator.events().subscribe();

    let state = fixture.coordinator.process_single(item("a1")).await?;

    let mut stages = Vec::new();
    while let Ok(event) = rx.try_recv() {
        assert_eq!(event.pipeline_id, state.pipeline_id);
        stages.push(event.stage);
    }
    assert_eq!(stages, history(&state)[1..].to_vec());
    Ok(())
}

#[tokio::test]
async fn test_progress_never_decreases_across_mixed_outcomes() -> Result<()> {
    let fixture = Fixture::builder()
        .annotator(MockAiAnnotator::new().failing_for("bad"))
        .indexer(MockSearchIndexer::new().failing_times(1))
        .build();
    let events = record_events(&fixture.coordinator.events());

    let ids = ["a1", "bad", "a2", "a3"]
        .iter()
        .map(|id| fixture.coordinator.start_pipeline(item(id)))
        .collect::<Result<Vec<_>, _>>()?;
    for id in &ids {
        let state = fixture.coordinator.wait_for_completion(*id).await?;
        assert_well_formed(&state);
    }

    let events = events.lock();
    for id in &ids {
        let progress: Vec<u8> = events
            .iter()
            .filter(|e| e.pipeline_id == *id)
            .map(|e| e.progress)
            .collect();
        assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_slow_annotator_is_the_only_bottleneck() -> Result<()> {
    let fixture = Fixture::builder()
        .annotator(MockAiAnnotator::new().with_delay(Duration::from_millis(200)))
        .build();

    fixture.coordinator.process_single(item("a1")).await?;

    let bottlenecks = fixture.coordinator.get_bottlenecks();
    let stages: Vec<Stage> = bottlenecks.iter().map(|b| b.stage).collect();
    assert_eq!(stages, vec![Stage::AiProcessing]);
    assert!(bottlenecks[0].average_time_ms >= 200.0);

    let health = fixture.coordinator.get_health_status();
    assert_eq!(health.status, HealthState::Degraded);
    assert_eq!(health.bottlenecks, bottlenecks);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_clean_runs_report_healthy() -> Result<()> {
    let fixture = Fixture::new();

    for id in ["a1", "a2", "a3"] {
        fixture.coordinator.process_single(item(id)).await?;
    }

    assert!(fixture.coordinator.get_bottlenecks().is_empty());
    assert_eq!(
        fixture.coordinator.get_health_status().status,
        HealthState::Healthy
    );
    Ok(())
}

#[tokio::test]
async fn test_reset_drops_finished_pipelines_and_metrics() -> Result<()> {
    let fixture = Fixture::new();
    fixture.coordinator.process_single(item("a1")).await?;
    assert_eq!(fixture.coordinator.list_pipelines().len(), 1);

    fixture.coordinator.reset();

    assert!(fixture.coordinator.list_pipelines().is_empty());
    assert_eq!(fixture.coordinator.get_metrics().total_pipelines_started, 0);
    assert_eq!(
        fixture.coordinator.get_health_status().status,
        HealthState::Healthy
    );
    Ok(())
}
