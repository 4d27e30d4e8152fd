//! Pipeline error types
//!
//! Two families live here. [`StageError`] and [`StageFailure`] describe what
//! went wrong inside a stage; they are caught at the pipeline boundary and
//! recorded in the pipeline state rather than returned to callers.
//! [`PipelineError`] covers misuse of the coordinator API itself (unknown
//! ids, missing collaborators, illegal manual transitions).

use crate::batch::BatchId;
use crate::stage::Stage;
use crate::state::PipelineId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shelf_core::CollaboratorError;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single stage attempt
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StageError {
    /// Input rejected before annotation; never retried
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The attempt exceeded its stage timeout
    #[error("{stage} timed out after {after:?}")]
    Timeout {
        /// Stage that timed out
        stage: Stage,
        /// Configured budget that was exceeded
        after: Duration,
    },

    /// The collaborator returned an error
    #[error("{stage} failed: {source}")]
    Collaborator {
        /// Stage whose collaborator failed
        stage: Stage,
        /// Error reported by the collaborator
        #[source]
        source: CollaboratorError,
    },

    /// The collaborator answered but declined the operation
    #[error("{stage} rejected: {reason}")]
    Rejected {
        /// Stage whose operation was declined
        stage: Stage,
        /// Why it was declined
        reason: String,
    },

    /// The pipeline was cancelled while the stage was running
    #[error("{stage} cancelled")]
    Cancelled {
        /// Stage that observed the cancellation
        stage: Stage,
    },

    /// A collaborator panicked while the stage was running
    #[error("{stage} panicked: {message}")]
    Panicked {
        /// Stage whose operation panicked
        stage: Stage,
        /// Panic payload, when it was a string
        message: String,
    },
}

impl StageError {
    /// Wrap a collaborator error for the given stage
    pub fn collaborator(stage: Stage, source: CollaboratorError) -> Self {
        Self::Collaborator { stage, source }
    }

    /// Whether this error can never succeed on retry, whatever the policy says
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::Cancelled { .. } | Self::Panicked { .. }
        )
    }
}

/// Raised once a stage has exhausted its retry budget
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[error("{stage} failed after {attempts} attempt(s): {message}")]
pub struct StageFailure {
    /// Stage that failed
    pub stage: Stage,
    /// Message of the last error
    pub message: String,
    /// When the failure was recorded
    pub timestamp: DateTime<Utc>,
    /// Attempts made, including the first
    pub attempts: u32,
}

impl StageFailure {
    /// Build a failure from the final error of a stage
    pub fn new(stage: Stage, error: &StageError, attempts: u32) -> Self {
        Self {
            stage,
            message: error.to_string(),
            timestamp: Utc::now(),
            attempts,
        }
    }
}

/// Errors returned by the coordinator API
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// A required collaborator was not configured
    #[error("Required collaborator not configured: {0}")]
    MissingCollaborator(&'static str),

    /// The pipeline configuration failed validation
    #[error("Invalid pipeline configuration: {0}")]
    InvalidConfig(String),

    /// Every concurrency slot is taken
    #[error("No free slot for pipeline {pipeline_id}: {limit} pipelines already active")]
    NoCapacity {
        /// Pipeline that asked for a slot
        pipeline_id: PipelineId,
        /// Configured concurrency limit
        limit: usize,
    },

    /// No pipeline with this id is registered
    #[error("Pipeline not found: {0}")]
    PipelineNotFound(PipelineId),

    /// No batch with this id is registered
    #[error("Batch not found: {0}")]
    BatchNotFound(BatchId),

    /// The pipeline is driven by its own task and cannot be advanced by hand
    #[error("Pipeline {0} is driven by the coordinator")]
    ManagedPipeline(PipelineId),

    /// The requested transition breaks the stage order
    #[error("Invalid transition for pipeline {pipeline_id}: {from} -> {to}")]
    InvalidTransition {
        /// Pipeline the transition was attempted on
        pipeline_id: PipelineId,
        /// Current stage
        from: Stage,
        /// Requested stage
        to: Stage,
    },
}

/// Specialized Result type for coordinator operations
pub type PipelineResult<T> = Result<T, PipelineError>;
