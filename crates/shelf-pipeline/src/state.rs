//! Pipeline state snapshots.

use crate::error::StageFailure;
use crate::stage::Stage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique pipeline identifier
pub type PipelineId = Uuid;

/// One entry of a pipeline's stage history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub timestamp: DateTime<Utc>,
}

/// State of a single pipeline.
///
/// Owned and mutated by its `PipelineInstance`; everything handed out by
/// the coordinator is a clone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineState {
    pub pipeline_id: PipelineId,
    pub content_id: String,
    pub stage: Stage,
    /// 0-100, non-decreasing; 100 only once `Complete`
    pub progress: u8,
    pub start_time: DateTime<Utc>,
    /// Set when the pipeline reaches a terminal stage
    pub end_time: Option<DateTime<Utc>>,
    /// Append-only, strictly time-ordered
    pub stage_history: Vec<StageRecord>,
    /// Active stages that finished successfully, in order
    pub completed_stages: Vec<Stage>,
    pub error: Option<StageFailure>,
    /// Retries performed across all stages
    pub retry_attempts: u32,
    /// True once a compensating delete removed the stored content
    pub rolled_back: bool,
    /// Message of a compensating delete that failed
    pub rollback_error: Option<String>,
}

impl PipelineState {
    pub(crate) fn new(pipeline_id: PipelineId, content_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            pipeline_id,
            content_id: content_id.into(),
            stage: Stage::Pending,
            progress: 0,
            start_time: now,
            end_time: None,
            stage_history: vec![StageRecord {
                stage: Stage::Pending,
                timestamp: now,
            }],
            completed_stages: Vec::new(),
            error: None,
            retry_attempts: 0,
            rolled_back: false,
            rollback_error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    pub fn is_complete(&self) -> bool {
        self.stage == Stage::Complete
    }

    pub fn is_failed(&self) -> bool {
        self.stage == Stage::Failed
    }

    /// Whether `stage` finished successfully in this pipeline
    pub fn has_completed(&self, stage: Stage) -> bool {
        self.completed_stages.contains(&stage)
    }

    /// Apply a transition that has already been checked against the stage order.
    ///
    /// History timestamps are kept strictly increasing even when the clock
    /// reports the same instant twice.
    pub(crate) fn record_transition(&mut self, to: Stage) -> DateTime<Utc> {
        let mut timestamp = Utc::now();
        if let Some(last) = self.stage_history.last() {
            if timestamp <= last.timestamp {
                timestamp = last.timestamp + chrono::Duration::microseconds(1);
            }
        }

        if self.stage.is_active() && to != Stage::Failed {
            self.completed_stages.push(self.stage);
        }
        if let Some(progress) = to.entry_progress() {
            self.progress = self.progress.max(progress);
        }
        if to.is_terminal() {
            self.end_time = Some(timestamp);
        }

        self.stage = to;
        self.stage_history.push(StageRecord {
            stage: to,
            timestamp,
        });
        timestamp
    }
}
