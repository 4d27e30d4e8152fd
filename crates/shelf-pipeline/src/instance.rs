//! Single-pipeline state machine.
//!
//! A [`PipelineInstance`] owns the state of one content item's trip through
//! the stages. Coordinator-driven instances run [`PipelineInstance::run`] in
//! their own task; instances registered with `create_pipeline` are moved only
//! through explicit transitions.
//!
//! ## Locking
//!
//! Three `parking_lot` mutexes, none held across an await:
//!
//! - `state`: the [`PipelineState`] itself
//! - `item`: the content item, updated once with the annotation
//! - `sequence`: held from applying a transition until its event has been
//!   published, so events of one pipeline are delivered in transition order
//!
//! Lock order is `sequence` before `state`.

use crate::error::{PipelineError, PipelineResult, StageError, StageFailure};
use crate::events::{ProgressEvent, ProgressEventBus};
use crate::executor::{StageExecutor, StageOptions};
use crate::metrics::MetricsCollector;
use crate::retry::RetryPredicate;
use crate::stage::Stage;
use crate::state::{PipelineId, PipelineState};
use futures::FutureExt;
use parking_lot::{Mutex, MutexGuard};
use shelf_config::PipelineConfig;
use shelf_core::{
    AiAnnotator, CollaboratorError, ConnectionDiscovery, ContentFinalizer, ContentItem,
    ContentStore, SearchIndexer,
};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Collaborators and shared services every pipeline task needs
pub(crate) struct PipelineContext {
    pub annotator: Arc<dyn AiAnnotator>,
    pub store: Arc<dyn ContentStore>,
    pub indexer: Arc<dyn SearchIndexer>,
    pub discovery: Option<Arc<dyn ConnectionDiscovery>>,
    pub finalizer: Option<Arc<dyn ContentFinalizer>>,
    pub config: PipelineConfig,
    /// Replaces the retry-everything default of every stage policy
    pub retry_predicate: Option<RetryPredicate>,
    pub executor: StageExecutor,
    pub metrics: Arc<MetricsCollector>,
}

impl PipelineContext {
    fn stage_options(&self, stage: Stage) -> StageOptions {
        let options = StageOptions::for_stage(&self.config, stage);
        match &self.retry_predicate {
            Some(predicate) => {
                let retry = options.retry.clone().with_shared_predicate(Arc::clone(predicate));
                options.with_retry(retry)
            }
            None => options,
        }
    }
}

/// One pipeline and its state machine
pub struct PipelineInstance {
    id: PipelineId,
    driven: bool,
    item: Mutex<ContentItem>,
    state: Mutex<PipelineState>,
    sequence: Mutex<()>,
    settled: watch::Sender<bool>,
    events: Arc<ProgressEventBus>,
    cancel: CancellationToken,
    started: Instant,
}

impl PipelineInstance {
    pub(crate) fn new(
        item: ContentItem,
        driven: bool,
        events: Arc<ProgressEventBus>,
        cancel: CancellationToken,
    ) -> Self {
        let id = PipelineId::new_v4();
        let state = PipelineState::new(id, item.id.clone());
        let (settled, _) = watch::channel(false);
        Self {
            id,
            driven,
            item: Mutex::new(item),
            state: Mutex::new(state),
            sequence: Mutex::new(()),
            settled,
            events,
            cancel,
            started: Instant::now(),
        }
    }

    pub fn id(&self) -> PipelineId {
        self.id
    }

    /// Whether the coordinator runs this pipeline's stages
    pub fn is_driven(&self) -> bool {
        self.driven
    }

    pub fn stage(&self) -> Stage {
        self.state.lock().stage
    }

    /// Read-only copy of the current state
    pub fn snapshot(&self) -> PipelineState {
        self.state.lock().clone()
    }

    /// The content item, including its annotation once attached
    pub fn item(&self) -> ContentItem {
        self.item.lock().clone()
    }

    /// Whether all terminal bookkeeping is done and waiters were released
    pub fn is_settled(&self) -> bool {
        *self.settled.borrow()
    }

    /// Time since the pipeline was registered
    pub(crate) fn elapsed(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    /// Take the sequencing lock; see the module docs
    pub(crate) fn sequence(&self) -> MutexGuard<'_, ()> {
        self.sequence.lock()
    }

    /// Validate and apply a transition, returning the event to publish.
    ///
    /// The caller must publish the event before releasing `_sequence`.
    pub(crate) fn apply_transition(
        &self,
        _sequence: &MutexGuard<'_, ()>,
        to: Stage,
        error: Option<StageFailure>,
    ) -> PipelineResult<ProgressEvent> {
        let mut state = self.state.lock();
        if !state.stage.can_transition_to(to) {
            return Err(PipelineError::InvalidTransition {
                pipeline_id: self.id,
                from: state.stage,
                to,
            });
        }

        if error.is_some() {
            state.error = error;
        }
        let timestamp = state.record_transition(to);
        Ok(ProgressEvent {
            pipeline_id: self.id,
            content_id: state.content_id.clone(),
            stage: to,
            progress: state.progress,
            timestamp,
        })
    }

    pub(crate) fn publish(&self, _sequence: &MutexGuard<'_, ()>, event: ProgressEvent) {
        self.events.publish(event);
    }

    /// Apply and publish a transition
    pub(crate) fn advance_to(&self, to: Stage) -> PipelineResult<PipelineState> {
        let sequence = self.sequence();
        let event = self.apply_transition(&sequence, to, None)?;
        self.publish(&sequence, event);
        drop(sequence);
        Ok(self.snapshot())
    }

    /// Move to `Failed`, recording `failure` as the cause
    pub(crate) fn fail(&self, failure: StageFailure) -> PipelineResult<PipelineState> {
        warn!(
            pipeline_id = %self.id,
            stage = %failure.stage,
            attempts = failure.attempts,
            error = %failure.message,
            "Pipeline failed"
        );
        let sequence = self.sequence();
        let event = self.apply_transition(&sequence, Stage::Failed, Some(failure))?;
        self.publish(&sequence, event);
        drop(sequence);
        Ok(self.snapshot())
    }

    /// Turn a caught panic into the failure of the current stage
    pub(crate) fn panic_failure(&self, payload: &(dyn Any + Send)) -> StageFailure {
        let stage = self.stage();
        let error = StageError::Panicked {
            stage,
            message: panic_message(payload),
        };
        error!(pipeline_id = %self.id, %stage, error = %error, "Stage panicked");
        StageFailure::new(stage, &error, 1)
    }

    /// Release every `wait` caller; called once terminal bookkeeping is done
    pub(crate) fn settle(&self) {
        self.settled.send_replace(true);
    }

    /// Wait until the pipeline has settled in a terminal stage
    pub(crate) async fn wait(&self) -> PipelineState {
        let mut settled = self.settled.subscribe();
        // The sender lives in `self`, so the channel cannot close here
        let _ = settled.wait_for(|done| *done).await;
        self.snapshot()
    }

    /// Drive every active stage, then record the outcome.
    ///
    /// Stage failures end the pipeline in `Failed`; they are never returned.
    pub(crate) async fn run(&self, ctx: &PipelineContext) -> PipelineState {
        let content_id = self.state.lock().content_id.clone();
        info!(pipeline_id = %self.id, %content_id, "Pipeline started");

        let outcome = AssertUnwindSafe(self.run_stages(ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(self.panic_failure(&*payload)));

        let success = match outcome {
            Ok(()) => match self.advance_to(Stage::Complete) {
                Ok(state) => {
                    info!(
                        pipeline_id = %self.id,
                        elapsed_ms = self.started.elapsed().as_millis() as u64,
                        retries = state.retry_attempts,
                        "Pipeline complete"
                    );
                    true
                }
                Err(e) => {
                    warn!(pipeline_id = %self.id, error = %e, "Could not complete pipeline");
                    false
                }
            },
            Err(failure) => {
                if self.needs_rollback(&failure) {
                    self.rollback(ctx).await;
                }
                if let Err(e) = self.fail(failure) {
                    warn!(pipeline_id = %self.id, error = %e, "Could not mark pipeline failed");
                }
                false
            }
        };

        ctx.metrics.record_finished(success, self.started.elapsed());
        self.snapshot()
    }

    async fn run_stages(&self, ctx: &PipelineContext) -> Result<(), StageFailure> {
        for stage in Stage::ACTIVE {
            self.enter(stage)?;
            self.run_stage(ctx, stage).await?;
        }
        Ok(())
    }

    fn enter(&self, stage: Stage) -> Result<(), StageFailure> {
        self.advance_to(stage).map(|_| ()).map_err(|e| {
            let error = StageError::Rejected {
                stage,
                reason: e.to_string(),
            };
            StageFailure::new(stage, &error, 0)
        })
    }

    async fn run_stage(&self, ctx: &PipelineContext, stage: Stage) -> Result<(), StageFailure> {
        let options = ctx.stage_options(stage);
        let on_retry = |_: u32, _: &StageError| {
            self.state.lock().retry_attempts += 1;
            ctx.metrics.record_retry();
        };
        let executor = &ctx.executor;

        match stage {
            Stage::Validation => {
                executor
                    .execute_stage(stage, &options, &self.cancel, on_retry, |_| {
                        let outcome = validate(&self.item());
                        async move { outcome }
                    })
                    .await
            }
            Stage::AiProcessing => {
                let annotation = executor
                    .execute_stage(stage, &options, &self.cancel, on_retry, |_| {
                        let item = self.item();
                        async move {
                            ctx.annotator
                                .process(&item)
                                .await
                                .map_err(|e| StageError::collaborator(stage, e))
                        }
                    })
                    .await?;
                debug!(pipeline_id = %self.id, tags = annotation.tags.len(), "Annotation attached");
                self.item.lock().annotation = Some(annotation);
                Ok(())
            }
            Stage::Storage => {
                let record = executor
                    .execute_stage(stage, &options, &self.cancel, on_retry, |_| {
                        let item = self.item();
                        async move {
                            ctx.store
                                .save(&item)
                                .await
                                .map_err(|e| StageError::collaborator(stage, e))
                        }
                    })
                    .await?;
                debug!(pipeline_id = %self.id, content_id = %record.content_id, "Content stored");
                Ok(())
            }
            Stage::Indexing => {
                executor
                    .execute_stage(stage, &options, &self.cancel, on_retry, |_| {
                        let item = self.item();
                        async move {
                            match ctx.indexer.update_index(&item).await {
                                Ok(true) => Ok(()),
                                Ok(false) => Err(StageError::Rejected {
                                    stage,
                                    reason: "search index declined the update".to_string(),
                                }),
                                Err(e) => Err(StageError::collaborator(stage, e)),
                            }
                        }
                    })
                    .await
            }
            Stage::PostProcessing => {
                executor
                    .execute_stage(stage, &options, &self.cancel, on_retry, |_| {
                        let item = self.item();
                        async move {
                            ensure_annotated(&item)?;
                            match &ctx.finalizer {
                                Some(finalizer) => finalizer
                                    .finalize(&item)
                                    .await
                                    .map_err(|e| StageError::collaborator(stage, e)),
                                None => Ok(()),
                            }
                        }
                    })
                    .await?;
                self.trigger_discovery(ctx);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn trigger_discovery(&self, ctx: &PipelineContext) {
        let Some(discovery) = ctx.discovery.as_ref().map(Arc::clone) else {
            return;
        };
        let item = self.item();
        let pipeline_id = self.id;
        tokio::spawn(async move {
            match discovery.discover(&item).await {
                Ok(found) => debug!(%pipeline_id, found, "Connection discovery finished"),
                Err(e) => warn!(%pipeline_id, error = %e, "Connection discovery failed"),
            }
        });
    }

    /// Storage succeeded and a later stage gave up
    fn needs_rollback(&self, failure: &StageFailure) -> bool {
        let state = self.state.lock();
        matches!(failure.stage, Stage::Indexing | Stage::PostProcessing)
            && state.has_completed(Stage::Storage)
            && !state.rolled_back
    }

    /// One best-effort delete of the stored item, bounded by the storage timeout.
    ///
    /// `rolled_back` marks that the delete was attempted; a failed delete is
    /// additionally kept in `rollback_error`.
    async fn rollback(&self, ctx: &PipelineContext) {
        let content_id = self.state.lock().content_id.clone();
        info!(pipeline_id = %self.id, %content_id, "Rolling back stored content");

        let delete = ctx.store.delete(&content_id);
        let outcome = match ctx.config.stage_timeouts.storage() {
            Some(after) => tokio::time::timeout(after, delete)
                .await
                .unwrap_or_else(|_| {
                    Err(CollaboratorError::unavailable(format!(
                        "delete timed out after {after:?}"
                    )))
                }),
            None => delete.await,
        };
        ctx.metrics.record_rollback();

        let mut state = self.state.lock();
        state.rolled_back = true;
        match outcome {
            Ok(()) => {
                debug!(pipeline_id = %self.id, %content_id, "Rollback complete");
            }
            Err(e) => {
                warn!(
                    pipeline_id = %self.id,
                    %content_id,
                    error = %e,
                    "Rollback failed, stored content left in place"
                );
                state.rollback_error = Some(e.to_string());
            }
        }
    }
}

fn validate(item: &ContentItem) -> Result<(), StageError> {
    if item.id.trim().is_empty() {
        return Err(StageError::Validation("content id is empty".to_string()));
    }
    if !item.url.is_empty()
        && !(item.url.starts_with("http://") || item.url.starts_with("https://"))
    {
        return Err(StageError::Validation(format!(
            "unsupported url scheme: {}",
            item.url
        )));
    }
    Ok(())
}

fn ensure_annotated(item: &ContentItem) -> Result<(), StageError> {
    if item.is_annotated() {
        Ok(())
    } else {
        Err(StageError::Rejected {
            stage: Stage::PostProcessing,
            reason: "item reached post-processing without an annotation".to_string(),
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}
