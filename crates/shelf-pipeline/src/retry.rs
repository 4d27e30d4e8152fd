//! Retry policy with exponential backoff.
//!
//! A single policy object consumed by the stage executor. Policies are
//! resolved per stage from [`PipelineConfig`]: the global `retry_policy`,
//! replaced by a stage-specific override when one is configured.

use crate::error::StageError;
use crate::stage::Stage;
use shelf_config::{PipelineConfig, RetryPolicyConfig};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Predicate deciding whether an error is worth another attempt
pub type RetryPredicate = Arc<dyn Fn(&StageError) -> bool + Send + Sync>;

/// Retry timeouts, rejections and transient collaborator errors only
pub fn is_transient(error: &StageError) -> bool {
    match error {
        StageError::Collaborator { source, .. } => source.is_transient(),
        StageError::Timeout { .. } | StageError::Rejected { .. } => true,
        StageError::Validation(_) | StageError::Cancelled { .. } | StageError::Panicked { .. } => {
            false
        }
    }
}

/// Exponential backoff retry policy
#[derive(Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Growth factor per retry
    pub backoff_multiplier: f64,
    should_retry: RetryPredicate,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryPolicyConfig::default())
    }
}

impl RetryPolicy {
    /// Build a policy from its config section; retries every error
    pub fn from_config(config: &RetryPolicyConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: config.initial_delay(),
            max_delay: config.max_delay(),
            backoff_multiplier: config.backoff_multiplier,
            should_retry: Arc::new(|_| true),
        }
    }

    /// Resolve the policy for a stage from the pipeline config
    ///
    /// Validation never retries: its failures are deterministic.
    pub fn for_stage(config: &PipelineConfig, stage: Stage) -> Self {
        let overrides = &config.stage_retry;
        let stage_config = match stage {
            Stage::Validation => return Self::none(),
            Stage::AiProcessing => overrides.ai_processing.as_ref(),
            Stage::Storage => overrides.storage.as_ref(),
            Stage::Indexing => overrides.indexing.as_ref(),
            Stage::PostProcessing => overrides.post_processing.as_ref(),
            _ => None,
        };
        Self::from_config(stage_config.unwrap_or(&config.retry_policy))
    }

    /// A policy that makes exactly one attempt
    pub fn none() -> Self {
        Self::from_config(&RetryPolicyConfig::no_retries())
    }

    /// Replace the retry predicate
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&StageError) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    /// Replace the retry predicate with one shared across policies
    pub fn with_shared_predicate(mut self, predicate: RetryPredicate) -> Self {
        self.should_retry = predicate;
        self
    }

    /// Only retry what [`is_transient`] accepts
    pub fn transient_only(self) -> Self {
        self.with_predicate(is_transient)
    }

    /// Delay before retry number `attempt` (1-based)
    ///
    /// `min(initial_delay * backoff_multiplier^(attempt-1), max_delay)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_ms =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// Whether a failed attempt should be followed by retry number `attempt`
    pub fn should_retry(&self, error: &StageError, attempt: u32) -> bool {
        attempt <= self.max_retries && !error.is_fatal() && (self.should_retry)(error)
    }

    /// Sum of every delay this policy can incur when all retries are used
    pub fn total_backoff(&self) -> Duration {
        (1..=self.max_retries).map(|attempt| self.delay_for(attempt)).sum()
    }
}
