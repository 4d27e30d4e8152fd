//! Pipeline configuration with sensible defaults
//!
//! Every section can be omitted from a config file; missing fields fall back
//! to the defaults below. Option names written in camelCase (as the browser
//! extension emits them) are accepted alongside the snake_case names.

use crate::error::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration for the content pipeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Maximum number of pipelines allowed in active stages at once
    #[serde(alias = "maxConcurrentPipelines")]
    pub max_concurrent_pipelines: usize,
    /// Per-stage timeouts
    #[serde(alias = "stageTimeouts")]
    pub stage_timeouts: StageTimeouts,
    /// Retry policy applied to every stage unless overridden
    #[serde(alias = "retryPolicy")]
    pub retry_policy: RetryPolicyConfig,
    /// Per-stage retry policy overrides
    #[serde(alias = "stageRetry")]
    pub stage_retry: StageRetryOverrides,
    /// Bottleneck detection thresholds
    pub bottleneck: BottleneckConfig,
    /// Health classification thresholds
    pub health: HealthConfig,
    /// Capacity of the broadcast channel backing progress streams
    #[serde(alias = "eventBufferSize")]
    pub event_buffer_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_pipelines: default_max_concurrent(),
            stage_timeouts: StageTimeouts::default(),
            retry_policy: RetryPolicyConfig::default(),
            stage_retry: StageRetryOverrides::default(),
            bottleneck: BottleneckConfig::default(),
            health: HealthConfig::default(),
            event_buffer_size: 256,
        }
    }
}

fn default_max_concurrent() -> usize {
    3
}

impl PipelineConfig {
    /// Builder-style override of the concurrency limit
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_pipelines = max;
        self
    }

    /// Builder-style override of the global retry policy
    pub fn with_retry_policy(mut self, policy: RetryPolicyConfig) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Builder-style override of the stage timeouts
    pub fn with_stage_timeouts(mut self, timeouts: StageTimeouts) -> Self {
        self.stage_timeouts = timeouts;
        self
    }

    /// Check the configuration for values the pipeline cannot run with
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_concurrent_pipelines == 0 {
            return Err(ConfigError::invalid(
                "max_concurrent_pipelines",
                "must be at least 1",
            ));
        }
        if self.event_buffer_size == 0 {
            return Err(ConfigError::invalid(
                "event_buffer_size",
                "must be at least 1",
            ));
        }

        self.retry_policy.validate("retry_policy")?;
        for (name, policy) in self.stage_retry.entries() {
            if let Some(policy) = policy {
                policy.validate(&format!("stage_retry.{name}"))?;
            }
        }

        self.stage_timeouts.validate()?;
        self.bottleneck.validate()?;
        self.health.validate()?;
        Ok(())
    }
}

/// Timeouts for each stage, in milliseconds
///
/// Validation and post-processing are local work and carry no timeout
/// unless one is set explicitly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StageTimeouts {
    /// Validation timeout (none by default)
    pub validation_ms: Option<u64>,
    /// AI annotation timeout
    #[serde(alias = "aiProcessing")]
    pub ai_processing_ms: Option<u64>,
    /// Content store write timeout
    #[serde(alias = "storage")]
    pub storage_ms: Option<u64>,
    /// Search index update timeout
    #[serde(alias = "indexing")]
    pub indexing_ms: Option<u64>,
    /// Post-processing timeout (none by default)
    #[serde(alias = "postProcessing")]
    pub post_processing_ms: Option<u64>,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            validation_ms: None,
            ai_processing_ms: Some(30_000),
            storage_ms: Some(10_000),
            indexing_ms: Some(5_000),
            post_processing_ms: None,
        }
    }
}

impl StageTimeouts {
    /// Validation timeout as a [`Duration`]
    pub fn validation(&self) -> Option<Duration> {
        self.validation_ms.map(Duration::from_millis)
    }

    /// AI annotation timeout as a [`Duration`]
    pub fn ai_processing(&self) -> Option<Duration> {
        self.ai_processing_ms.map(Duration::from_millis)
    }

    /// Storage timeout as a [`Duration`]
    pub fn storage(&self) -> Option<Duration> {
        self.storage_ms.map(Duration::from_millis)
    }

    /// Indexing timeout as a [`Duration`]
    pub fn indexing(&self) -> Option<Duration> {
        self.indexing_ms.map(Duration::from_millis)
    }

    /// Post-processing timeout as a [`Duration`]
    pub fn post_processing(&self) -> Option<Duration> {
        self.post_processing_ms.map(Duration::from_millis)
    }

    fn validate(&self) -> ConfigResult<()> {
        let entries = [
            ("validation_ms", self.validation_ms),
            ("ai_processing_ms", self.ai_processing_ms),
            ("storage_ms", self.storage_ms),
            ("indexing_ms", self.indexing_ms),
            ("post_processing_ms", self.post_processing_ms),
        ];
        for (name, value) in entries {
            if value == Some(0) {
                return Err(ConfigError::invalid(
                    format!("stage_timeouts.{name}"),
                    "timeout must be greater than zero (omit it to disable)",
                ));
            }
        }
        Ok(())
    }
}

/// Exponential backoff retry settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicyConfig {
    /// Retries after the first attempt (0 disables retrying)
    #[serde(alias = "maxRetries")]
    pub max_retries: u32,
    /// Delay before the first retry
    #[serde(alias = "initialDelay")]
    pub initial_delay_ms: u64,
    /// Upper bound on any single delay
    #[serde(alias = "maxDelay")]
    pub max_delay_ms: u64,
    /// Growth factor applied per retry
    #[serde(alias = "backoffMultiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicyConfig {
    /// A policy that never retries
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Initial delay as a [`Duration`]
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Maximum delay as a [`Duration`]
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    fn validate(&self, field: &str) -> ConfigResult<()> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid(
                format!("{field}.backoff_multiplier"),
                "must be a finite number >= 1.0",
            ));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(ConfigError::invalid(
                format!("{field}.initial_delay_ms"),
                format!(
                    "initial delay {}ms exceeds max delay {}ms",
                    self.initial_delay_ms, self.max_delay_ms
                ),
            ));
        }
        Ok(())
    }
}

/// Optional per-stage retry policies; `None` means "use the global policy"
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StageRetryOverrides {
    /// Override for AI annotation
    #[serde(alias = "aiProcessing")]
    pub ai_processing: Option<RetryPolicyConfig>,
    /// Override for content storage
    pub storage: Option<RetryPolicyConfig>,
    /// Override for search indexing
    pub indexing: Option<RetryPolicyConfig>,
    /// Override for post-processing
    #[serde(alias = "postProcessing")]
    pub post_processing: Option<RetryPolicyConfig>,
}

impl StageRetryOverrides {
    fn entries(&self) -> [(&'static str, Option<&RetryPolicyConfig>); 4] {
        [
            ("ai_processing", self.ai_processing.as_ref()),
            ("storage", self.storage.as_ref()),
            ("indexing", self.indexing.as_ref()),
            ("post_processing", self.post_processing.as_ref()),
        ]
    }
}

/// Thresholds for flagging slow stages
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BottleneckConfig {
    /// Flag stages slower than this multiple of the fastest stage's average
    #[serde(alias = "relativeFactor")]
    pub relative_factor: f64,
    /// Flag stages whose average exceeds this many milliseconds
    #[serde(alias = "absoluteThresholdMs")]
    pub absolute_threshold_ms: Option<u64>,
    /// Averages below this many milliseconds are noise for the relative
    /// rule: such stages are never flagged by it, and the fastest-stage
    /// baseline is raised to at least this value
    #[serde(alias = "minAverageMs")]
    pub min_average_ms: f64,
}

impl Default for BottleneckConfig {
    fn default() -> Self {
        Self {
            relative_factor: 3.0,
            absolute_threshold_ms: None,
            min_average_ms: 1.0,
        }
    }
}

impl BottleneckConfig {
    fn validate(&self) -> ConfigResult<()> {
        if !self.relative_factor.is_finite() || self.relative_factor <= 1.0 {
            return Err(ConfigError::invalid(
                "bottleneck.relative_factor",
                "must be a finite number > 1.0",
            ));
        }
        if !self.min_average_ms.is_finite() || self.min_average_ms < 0.0 {
            return Err(ConfigError::invalid(
                "bottleneck.min_average_ms",
                "must be a finite, non-negative number",
            ));
        }
        Ok(())
    }
}

/// Failure-rate thresholds for the health report
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    /// Failure rate at or above which the pipeline reports `degraded`
    #[serde(alias = "degradedFailureRate")]
    pub degraded_failure_rate: f64,
    /// Failure rate at or above which the pipeline reports `unhealthy`
    #[serde(alias = "unhealthyFailureRate")]
    pub unhealthy_failure_rate: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            degraded_failure_rate: 0.1,
            unhealthy_failure_rate: 0.5,
        }
    }
}

impl HealthConfig {
    fn validate(&self) -> ConfigResult<()> {
        let in_range = |rate: f64| (0.0..=1.0).contains(&rate);
        if !in_range(self.degraded_failure_rate) || !in_range(self.unhealthy_failure_rate) {
            return Err(ConfigError::invalid(
                "health",
                "failure rates must lie between 0.0 and 1.0",
            ));
        }
        if self.degraded_failure_rate > self.unhealthy_failure_rate {
            return Err(ConfigError::invalid(
                "health.degraded_failure_rate",
                "must not exceed unhealthy_failure_rate",
            ));
        }
        Ok(())
    }
}
