//! Pipeline Coordinator
//!
//! The single entry point for processing content items. The coordinator owns
//! the pipeline registry and admission control, and exposes status, metrics
//! and health queries.
//!
//! ## Admission
//!
//! At most `max_concurrent_pipelines` pipelines occupy active stages. Further
//! pipelines enter `queued` and wait in FIFO order. When an active pipeline
//! reaches a terminal stage, its slot passes directly to the head of the
//! queue, so the active count never drops and rises again in between.
//!
//! Manually driven pipelines share the same slots: entering `validation`
//! takes one, or fails with [`PipelineError::NoCapacity`] when none is free,
//! and a terminal transition gives it back.
//!
//! ## Architecture
//!
//! ```text
//! PipelineCoordinator
//!   ├─> registry (DashMap<PipelineId, PipelineInstance>)
//!   ├─> admission (active count + FIFO queue)
//!   ├─> PipelineInstance task per admitted pipeline
//!   │     └─> StageExecutor ──> AiAnnotator / ContentStore / SearchIndexer
//!   ├─> ProgressEventBus
//!   └─> MetricsCollector
//! ```

use crate::error::{PipelineError, PipelineResult, StageError, StageFailure};
use crate::events::ProgressEventBus;
use crate::executor::StageExecutor;
use crate::health::{HealthState, HealthStatus};
use crate::instance::{PipelineContext, PipelineInstance};
use crate::metrics::{Bottleneck, MetricsCollector, PipelineMetrics};
use crate::retry::RetryPredicate;
use crate::stage::Stage;
use crate::state::{PipelineId, PipelineState};
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use shelf_config::PipelineConfig;
use shelf_core::{
    AiAnnotator, ConnectionDiscovery, ContentFinalizer, ContentItem, ContentStore, SearchIndexer,
};
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Builder for [`PipelineCoordinator`]
///
/// Collaborators are optional here; a coordinator missing a required one,
/// or built from a config that fails validation, is still built but refuses
/// to start pipelines.
#[derive(Default)]
pub struct PipelineCoordinatorBuilder {
    annotator: Option<Arc<dyn AiAnnotator>>,
    content_store: Option<Arc<dyn ContentStore>>,
    search_indexer: Option<Arc<dyn SearchIndexer>>,
    connection_discovery: Option<Arc<dyn ConnectionDiscovery>>,
    content_finalizer: Option<Arc<dyn ContentFinalizer>>,
    retry_predicate: Option<RetryPredicate>,
    config: PipelineConfig,
}

impl PipelineCoordinatorBuilder {
    pub fn annotator(mut self, annotator: Arc<dyn AiAnnotator>) -> Self {
        self.annotator = Some(annotator);
        self
    }

    pub fn content_store(mut self, store: Arc<dyn ContentStore>) -> Self {
        self.content_store = Some(store);
        self
    }

    pub fn search_indexer(mut self, indexer: Arc<dyn SearchIndexer>) -> Self {
        self.search_indexer = Some(indexer);
        self
    }

    /// Optional; post-processing skips discovery without it
    pub fn connection_discovery(mut self, discovery: Arc<dyn ConnectionDiscovery>) -> Self {
        self.connection_discovery = Some(discovery);
        self
    }

    /// Optional; post-processing only checks the annotation without it
    pub fn content_finalizer(mut self, finalizer: Arc<dyn ContentFinalizer>) -> Self {
        self.content_finalizer = Some(finalizer);
        self
    }

    /// Decide which stage errors are retried, for every stage.
    ///
    /// Without one every error is retried; [`crate::retry::is_transient`] is
    /// the usual alternative. Validation failures, cancellation and panics
    /// are never retried either way.
    pub fn retry_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&StageError) -> bool + Send + Sync + 'static,
    {
        self.retry_predicate = Some(Arc::new(predicate));
        self
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> PipelineCoordinator {
        let metrics = Arc::new(MetricsCollector::new());
        let events = Arc::new(ProgressEventBus::new(self.config.event_buffer_size));

        let context = match self.config.validate() {
            Err(e) => Err(PipelineError::InvalidConfig(e.to_string())),
            Ok(()) => match (self.annotator, self.content_store, self.search_indexer) {
                (None, _, _) => Err(PipelineError::MissingCollaborator("annotator")),
                (_, None, _) => Err(PipelineError::MissingCollaborator("content store")),
                (_, _, None) => Err(PipelineError::MissingCollaborator("search indexer")),
                (Some(annotator), Some(store), Some(indexer)) => Ok(Arc::new(PipelineContext {
                    annotator,
                    store,
                    indexer,
                    discovery: self.connection_discovery,
                    finalizer: self.content_finalizer,
                    config: self.config.clone(),
                    retry_predicate: self.retry_predicate,
                    executor: StageExecutor::new(Arc::clone(&metrics)),
                    metrics: Arc::clone(&metrics),
                })),
            },
        };
        if let Err(e) = &context {
            warn!(error = %e, "Pipeline coordinator built but not ready");
        }

        PipelineCoordinator {
            inner: Arc::new(Inner {
                context,
                config: self.config,
                registry: DashMap::new(),
                admission: Mutex::new(Admission::default()),
                events,
                metrics,
                shutdown: CancellationToken::new(),
            }),
        }
    }
}

#[derive(Default)]
struct Admission {
    active: usize,
    queue: VecDeque<Arc<PipelineInstance>>,
}

struct Inner {
    context: Result<Arc<PipelineContext>, PipelineError>,
    config: PipelineConfig,
    registry: DashMap<PipelineId, Arc<PipelineInstance>>,
    admission: Mutex<Admission>,
    events: Arc<ProgressEventBus>,
    metrics: Arc<MetricsCollector>,
    shutdown: CancellationToken,
}

/// Orchestrates content pipelines under a global concurrency limit
///
/// Cheap to clone; clones share the same registry and admission state.
#[derive(Clone)]
pub struct PipelineCoordinator {
    inner: Arc<Inner>,
}

impl PipelineCoordinator {
    pub fn builder() -> PipelineCoordinatorBuilder {
        PipelineCoordinatorBuilder::default()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// Fail fast when a required collaborator is missing
    pub fn ensure_ready(&self) -> PipelineResult<()> {
        self.context().map(|_| ())
    }

    fn context(&self) -> PipelineResult<Arc<PipelineContext>> {
        self.inner.context.clone()
    }

    fn instance(&self, id: PipelineId) -> PipelineResult<Arc<PipelineInstance>> {
        self.inner
            .registry
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(PipelineError::PipelineNotFound(id))
    }

    /// Register a pipeline for `item` and schedule it.
    ///
    /// Runs immediately when a slot is free, otherwise enters `queued`.
    /// Must be called from within a Tokio runtime.
    pub fn start_pipeline(&self, item: ContentItem) -> PipelineResult<PipelineId> {
        let context = self.context()?;
        let instance = Arc::new(PipelineInstance::new(
            item,
            true,
            Arc::clone(&self.inner.events),
            self.inner.shutdown.child_token(),
        ));
        let id = instance.id();
        self.inner.registry.insert(id, Arc::clone(&instance));
        self.inner.metrics.record_started();

        // Queued must be applied under the admission lock so a released slot
        // cannot pick the instance up first, but published outside it.
        let sequence = instance.sequence();
        let queued = {
            let mut admission = self.inner.admission.lock();
            if admission.active < self.inner.config.max_concurrent_pipelines {
                admission.active += 1;
                None
            } else {
                let event = instance.apply_transition(&sequence, Stage::Queued, None)?;
                admission.queue.push_back(Arc::clone(&instance));
                Some((event, admission.queue.len()))
            }
        };

        match queued {
            Some((event, position)) => {
                instance.publish(&sequence, event);
                drop(sequence);
                debug!(pipeline_id = %id, position, "Pipeline queued");
            }
            None => {
                drop(sequence);
                self.spawn(instance, context);
            }
        }
        Ok(id)
    }

    /// Register a pipeline in `pending` without scheduling it
    ///
    /// The pipeline only moves through [`PipelineCoordinator::advance_to_stage`].
    pub fn create_pipeline(&self, item: ContentItem) -> PipelineResult<PipelineId> {
        self.ensure_ready()?;
        let instance = Arc::new(PipelineInstance::new(
            item,
            false,
            Arc::clone(&self.inner.events),
            self.inner.shutdown.child_token(),
        ));
        let id = instance.id();
        self.inner.registry.insert(id, instance);
        self.inner.metrics.record_started();
        debug!(pipeline_id = %id, "Pipeline created for manual driving");
        Ok(id)
    }

    fn spawn(&self, instance: Arc<PipelineInstance>, context: Arc<PipelineContext>) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            // Stage panics are handled in `run`; this covers progress callbacks
            if let Err(payload) = AssertUnwindSafe(instance.run(&context)).catch_unwind().await {
                let failure = instance.panic_failure(&*payload);
                if instance.fail(failure).is_ok() {
                    context.metrics.record_finished(false, instance.elapsed());
                }
            }
            coordinator.release_slot(&context);
            instance.settle();
        });
    }

    /// Hand the finished pipeline's slot to the queue head, or free it
    fn release_slot(&self, context: &Arc<PipelineContext>) {
        let next = {
            let mut admission = self.inner.admission.lock();
            let next = admission.queue.pop_front();
            if next.is_none() {
                admission.active = admission.active.saturating_sub(1);
            }
            next
        };

        if let Some(next) = next {
            debug!(pipeline_id = %next.id(), "Admitting queued pipeline");
            self.spawn(next, Arc::clone(context));
        }
    }

    pub fn get_pipeline_status(&self, id: PipelineId) -> PipelineResult<PipelineState> {
        Ok(self.instance(id)?.snapshot())
    }

    /// Explicit transition of a manually driven pipeline.
    ///
    /// Entering `validation` takes a concurrency slot and fails with
    /// [`PipelineError::NoCapacity`] when none is free; the pipeline stays
    /// where it was and may try again later. A terminal transition from an
    /// active stage releases the slot.
    pub fn advance_to_stage(&self, id: PipelineId, stage: Stage) -> PipelineResult<PipelineState> {
        let instance = self.instance(id)?;
        if instance.is_driven() {
            return Err(PipelineError::ManagedPipeline(id));
        }
        let context = self.context()?;

        let sequence = instance.sequence();
        let from = instance.stage();
        let event = if !from.is_active() && stage.is_active() {
            let mut admission = self.inner.admission.lock();
            let limit = self.inner.config.max_concurrent_pipelines;
            if admission.active >= limit {
                return Err(PipelineError::NoCapacity {
                    pipeline_id: id,
                    limit,
                });
            }
            let event = instance.apply_transition(&sequence, stage, None)?;
            admission.active += 1;
            event
        } else {
            instance.apply_transition(&sequence, stage, None)?
        };
        instance.publish(&sequence, event);
        drop(sequence);

        let state = instance.snapshot();
        if state.is_terminal() {
            self.inner
                .metrics
                .record_finished(state.is_complete(), instance.elapsed());
            if from.is_active() {
                self.release_slot(&context);
            }
            instance.settle();
        }
        Ok(state)
    }

    /// Suspend until the pipeline is `complete` or `failed`.
    ///
    /// Stage failures are reported in the returned state, never as `Err`.
    pub async fn wait_for_completion(&self, id: PipelineId) -> PipelineResult<PipelineState> {
        let instance = self.instance(id)?;
        Ok(instance.wait().await)
    }

    /// Start a pipeline and wait for its terminal state
    pub async fn process_single(&self, item: ContentItem) -> PipelineResult<PipelineState> {
        let id = self.start_pipeline(item)?;
        self.wait_for_completion(id).await
    }

    pub fn get_active_pipeline_count(&self) -> usize {
        self.inner.admission.lock().active
    }

    pub fn get_queued_pipeline_count(&self) -> usize {
        self.inner.admission.lock().queue.len()
    }

    /// Snapshots of every registered pipeline, oldest first
    pub fn list_pipelines(&self) -> Vec<PipelineState> {
        let mut pipelines: Vec<PipelineState> = self
            .inner
            .registry
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        pipelines.sort_by_key(|state| state.start_time);
        pipelines
    }

    pub fn get_metrics(&self) -> PipelineMetrics {
        self.inner.metrics.snapshot()
    }

    pub fn get_bottlenecks(&self) -> Vec<Bottleneck> {
        self.inner.metrics.bottlenecks(&self.inner.config.bottleneck)
    }

    pub fn get_health_status(&self) -> HealthStatus {
        let failure_rate = self.get_metrics().failure_rate();
        let bottlenecks = self.get_bottlenecks();
        let (active_pipelines, queued_pipelines) = {
            let admission = self.inner.admission.lock();
            (admission.active, admission.queue.len())
        };

        HealthStatus {
            status: HealthState::evaluate(
                failure_rate,
                !bottlenecks.is_empty(),
                &self.inner.config.health,
            ),
            active_pipelines,
            queued_pipelines,
            max_concurrent_pipelines: self.inner.config.max_concurrent_pipelines,
            failure_rate,
            bottlenecks,
        }
    }

    /// Shared event bus for progress subscriptions
    pub fn events(&self) -> Arc<ProgressEventBus> {
        Arc::clone(&self.inner.events)
    }

    /// Drop settled pipelines and zero the metrics; live pipelines are kept
    pub fn reset(&self) {
        let before = self.inner.registry.len();
        self.inner.registry.retain(|_, instance| !instance.is_settled());
        self.inner.metrics.reset();
        info!(
            removed = before - self.inner.registry.len(),
            remaining = self.inner.registry.len(),
            "Pipeline coordinator reset"
        );
    }

    /// Cancel every running pipeline and fail every queued one
    pub fn shutdown(&self) {
        info!("Shutting down pipeline coordinator");
        self.inner.shutdown.cancel();

        let drained: Vec<Arc<PipelineInstance>> =
            self.inner.admission.lock().queue.drain(..).collect();
        for instance in drained {
            let cancelled = StageError::Cancelled {
                stage: Stage::Queued,
            };
            if instance
                .fail(StageFailure::new(Stage::Queued, &cancelled, 0))
                .is_ok()
            {
                self.inner.metrics.record_finished(false, instance.elapsed());
            }
            instance.settle();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}
