//! Stage execution with timeout, retry and cancellation.
//!
//! The executor knows nothing about what a stage does. It receives an
//! operation closure and runs it under the stage's [`StageOptions`]:
//!
//! 1. Each attempt is bounded by the stage timeout, when one is configured
//! 2. Each attempt races the pipeline's cancellation token
//! 3. Failed attempts are retried per the [`RetryPolicy`], sleeping
//!    `tokio::time::sleep` between them
//! 4. Every attempt is recorded in the [`MetricsCollector`]
//!
//! Once the retry budget is spent the last error is wrapped in a
//! [`StageFailure`].

use crate::error::{StageError, StageFailure};
use crate::metrics::MetricsCollector;
use crate::retry::RetryPolicy;
use crate::stage::Stage;
use shelf_config::PipelineConfig;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How a single stage is run
#[derive(Debug, Clone, Default)]
pub struct StageOptions {
    /// Per-attempt budget; `None` means unbounded
    pub timeout: Option<Duration>,
    pub retry: RetryPolicy,
}

impl StageOptions {
    /// Timeout and retry policy configured for `stage`
    pub fn for_stage(config: &PipelineConfig, stage: Stage) -> Self {
        let timeouts = &config.stage_timeouts;
        let timeout = match stage {
            Stage::Validation => timeouts.validation(),
            Stage::AiProcessing => timeouts.ai_processing(),
            Stage::Storage => timeouts.storage(),
            Stage::Indexing => timeouts.indexing(),
            Stage::PostProcessing => timeouts.post_processing(),
            _ => None,
        };
        Self {
            timeout,
            retry: RetryPolicy::for_stage(config, stage),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Runs stage operations under timeout and retry policy
#[derive(Debug, Clone)]
pub struct StageExecutor {
    metrics: Arc<MetricsCollector>,
}

impl StageExecutor {
    pub fn new(metrics: Arc<MetricsCollector>) -> Self {
        Self { metrics }
    }

    /// Run `operation` until it succeeds or the retry budget is spent.
    ///
    /// `operation` is called once per attempt with a child of `cancel`.
    /// `on_retry` is called with the retry number and the error that caused
    /// it, before the backoff sleep.
    pub async fn execute_stage<T, F, Fut, R>(
        &self,
        stage: Stage,
        options: &StageOptions,
        cancel: &CancellationToken,
        mut on_retry: R,
        mut operation: F,
    ) -> Result<T, StageFailure>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
        R: FnMut(u32, &StageError),
    {
        let mut attempt: u32 = 1;
        loop {
            if cancel.is_cancelled() {
                let error = StageError::Cancelled { stage };
                return Err(StageFailure::new(stage, &error, attempt - 1));
            }

            debug!(stage = %stage, attempt, "Executing stage attempt");
            let started = Instant::now();
            let outcome = self.attempt(stage, options.timeout, cancel, &mut operation).await;
            self.metrics
                .record_stage(stage, started.elapsed(), outcome.is_ok());

            let error = match outcome {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !options.retry.should_retry(&error, attempt) {
                debug!(stage = %stage, attempts = attempt, error = %error, "Stage failed");
                return Err(StageFailure::new(stage, &error, attempt));
            }

            let delay = options.retry.delay_for(attempt);
            warn!(
                stage = %stage,
                retry = attempt,
                max_retries = options.retry.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Stage attempt failed, retrying"
            );
            on_retry(attempt, &error);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let cancelled = StageError::Cancelled { stage };
                    return Err(StageFailure::new(stage, &cancelled, attempt));
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    async fn attempt<T, F, Fut>(
        &self,
        stage: Stage,
        budget: Option<Duration>,
        cancel: &CancellationToken,
        operation: &mut F,
    ) -> Result<T, StageError>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
    {
        let child = cancel.child_token();
        let call = operation(child.clone());
        let bounded = async move {
            match budget {
                Some(after) => match timeout(after, call).await {
                    Ok(result) => result,
                    Err(_) => Err(StageError::Timeout { stage, after }),
                },
                None => call.await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                child.cancel();
                Err(StageError::Cancelled { stage })
            }
            result = bounded => result,
        }
    }
}
