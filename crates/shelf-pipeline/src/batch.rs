//! Batch processing.
//!
//! A batch is a group of pipelines started together and observed as a unit.
//! Every member is an ordinary pipeline, subject to the coordinator's global
//! concurrency limit. A watcher task per member waits for its terminal state
//! and folds the outcome into the batch counters, so counters only ever move
//! when a member finishes.

use crate::coordinator::PipelineCoordinator;
use crate::error::{PipelineError, PipelineResult};
use crate::state::{PipelineId, PipelineState};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shelf_core::ContentItem;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Unique batch identifier
pub type BatchId = Uuid;

/// Aggregate outcome of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    /// At least one member has not finished
    Running,
    /// Every member completed
    Completed,
    /// Some members completed and some failed
    Partial,
    /// Every member failed
    Failed,
}

impl BatchStatus {
    /// Status of a batch whose members have all finished
    fn settled(completed: usize, failed: usize) -> Self {
        match (completed, failed) {
            (_, 0) => BatchStatus::Completed,
            (0, _) => BatchStatus::Failed,
            _ => BatchStatus::Partial,
        }
    }
}

/// Snapshot of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchState {
    pub batch_id: BatchId,
    /// Member pipelines, in item order
    pub pipeline_ids: Vec<PipelineId>,
    pub total_items: usize,
    pub completed_items: usize,
    pub failed_items: usize,
    pub status: BatchStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BatchState {
    pub fn is_finished(&self) -> bool {
        self.status != BatchStatus::Running
    }
}

struct BatchEntry {
    state: Mutex<BatchState>,
    finished: watch::Sender<bool>,
}

impl BatchEntry {
    fn snapshot(&self) -> BatchState {
        self.state.lock().clone()
    }

    /// Fold one member outcome into the counters
    fn record(&self, succeeded: bool) {
        let finished = {
            let mut state = self.state.lock();
            if succeeded {
                state.completed_items += 1;
            } else {
                state.failed_items += 1;
            }

            if state.completed_items + state.failed_items < state.total_items {
                return;
            }
            state.status = BatchStatus::settled(state.completed_items, state.failed_items);
            state.finished_at = Some(Utc::now());
            state.clone()
        };

        info!(
            batch_id = %finished.batch_id,
            status = ?finished.status,
            completed = finished.completed_items,
            failed = finished.failed_items,
            "Batch finished"
        );
        self.finished.send_replace(true);
    }
}

/// Runs groups of items through a shared [`PipelineCoordinator`]
#[derive(Clone)]
pub struct BatchCoordinator {
    coordinator: PipelineCoordinator,
    batches: Arc<DashMap<BatchId, Arc<BatchEntry>>>,
}

impl BatchCoordinator {
    pub fn new(coordinator: PipelineCoordinator) -> Self {
        Self {
            coordinator,
            batches: Arc::new(DashMap::new()),
        }
    }

    pub fn coordinator(&self) -> &PipelineCoordinator {
        &self.coordinator
    }

    fn entry(&self, batch_id: BatchId) -> PipelineResult<Arc<BatchEntry>> {
        self.batches
            .get(&batch_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(PipelineError::BatchNotFound(batch_id))
    }

    /// Start one pipeline per item and track them as a batch.
    ///
    /// An empty batch is `completed` immediately.
    pub fn process_batch(&self, items: Vec<ContentItem>) -> PipelineResult<BatchId> {
        self.coordinator.ensure_ready()?;

        let pipeline_ids = items
            .into_iter()
            .map(|item| self.coordinator.start_pipeline(item))
            .collect::<PipelineResult<Vec<_>>>()?;

        let batch_id = BatchId::new_v4();
        let total_items = pipeline_ids.len();
        let empty = total_items == 0;
        let state = BatchState {
            batch_id,
            pipeline_ids: pipeline_ids.clone(),
            total_items,
            completed_items: 0,
            failed_items: 0,
            status: if empty {
                BatchStatus::Completed
            } else {
                BatchStatus::Running
            },
            started_at: Utc::now(),
            finished_at: empty.then(Utc::now),
        };
        let (finished, _) = watch::channel(empty);
        let entry = Arc::new(BatchEntry {
            state: Mutex::new(state),
            finished,
        });
        self.batches.insert(batch_id, Arc::clone(&entry));
        info!(%batch_id, total_items, "Batch started");

        for pipeline_id in pipeline_ids {
            self.watch_member(batch_id, pipeline_id, Arc::clone(&entry));
        }
        Ok(batch_id)
    }

    fn watch_member(&self, batch_id: BatchId, pipeline_id: PipelineId, entry: Arc<BatchEntry>) {
        let coordinator = self.coordinator.clone();
        tokio::spawn(async move {
            let succeeded = match coordinator.wait_for_completion(pipeline_id).await {
                Ok(state) => {
                    debug!(%batch_id, %pipeline_id, stage = %state.stage, "Batch member finished");
                    state.is_complete()
                }
                Err(e) => {
                    warn!(%batch_id, %pipeline_id, error = %e, "Lost track of batch member");
                    false
                }
            };
            entry.record(succeeded);
        });
    }

    /// Suspend until every member of the batch is terminal
    pub async fn wait_for_batch_completion(&self, batch_id: BatchId) -> PipelineResult<BatchState> {
        let entry = self.entry(batch_id)?;
        let mut finished = entry.finished.subscribe();
        // `entry` keeps the sender alive for the duration of the wait
        let _ = finished.wait_for(|done| *done).await;
        Ok(entry.snapshot())
    }

    pub fn get_batch_status(&self, batch_id: BatchId) -> PipelineResult<BatchState> {
        Ok(self.entry(batch_id)?.snapshot())
    }

    /// Snapshots of every batch, oldest first
    pub fn list_batches(&self) -> Vec<BatchState> {
        let mut batches: Vec<BatchState> = self
            .batches
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        batches.sort_by_key(|batch| batch.started_at);
        batches
    }

    /// Member snapshots of a batch, in item order.
    ///
    /// Members dropped by [`PipelineCoordinator::reset`] are skipped.
    pub fn get_batch_pipelines(&self, batch_id: BatchId) -> PipelineResult<Vec<PipelineState>> {
        Ok(self
            .get_batch_status(batch_id)?
            .pipeline_ids
            .into_iter()
            .filter_map(|id| self.coordinator.get_pipeline_status(id).ok())
            .collect())
    }

    /// Forget finished batches, then reset the coordinator.
    ///
    /// Running batches and their members are kept.
    pub fn reset(&self) {
        let before = self.batches.len();
        self.batches.retain(|_, entry| !entry.snapshot().is_finished());
        info!(
            removed = before - self.batches.len(),
            remaining = self.batches.len(),
            "Batch coordinator reset"
        );
        self.coordinator.reset();
    }
}
