//! Pipeline and per-stage metrics.
//!
//! Counters are lock-free `AtomicU64`s updated from pipeline tasks;
//! [`MetricsCollector::snapshot`] turns them into a serializable
//! [`PipelineMetrics`] value.

use crate::stage::Stage;
use serde::{Deserialize, Serialize};
use shelf_config::BottleneckConfig;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
struct StageCounters {
    total_micros: AtomicU64,
    invocations: AtomicU64,
    successes: AtomicU64,
}

impl StageCounters {
    fn reset(&self) {
        self.total_micros.store(0, Ordering::Relaxed);
        self.invocations.store(0, Ordering::Relaxed);
        self.successes.store(0, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StageMetrics {
        let total_micros = self.total_micros.load(Ordering::Relaxed);
        let invocation_count = self.invocations.load(Ordering::Relaxed);
        let success_count = self.successes.load(Ordering::Relaxed);
        let total_time_ms = total_micros as f64 / 1000.0;

        let (success_rate, average_time_ms) = if invocation_count == 0 {
            (0.0, 0.0)
        } else {
            (
                success_count as f64 / invocation_count as f64,
                total_time_ms / invocation_count as f64,
            )
        };

        StageMetrics {
            total_time_ms,
            invocation_count,
            success_count,
            success_rate,
            average_time_ms,
        }
    }
}

/// Aggregated timing for one stage
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageMetrics {
    pub total_time_ms: f64,
    /// Attempts, including retries
    pub invocation_count: u64,
    pub success_count: u64,
    pub success_rate: f64,
    pub average_time_ms: f64,
}

/// Point-in-time copy of every counter
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineMetrics {
    pub total_pipelines_started: u64,
    pub total_pipelines_completed: u64,
    pub total_pipelines_failed: u64,
    pub total_retries: u64,
    pub total_rollbacks: u64,
    /// Mean wall time of terminal pipelines
    pub average_processing_time_ms: f64,
    pub stage_metrics: BTreeMap<Stage, StageMetrics>,
}

impl PipelineMetrics {
    /// `failed / (completed + failed)`, or 0 before any pipeline finished
    pub fn failure_rate(&self) -> f64 {
        let finished = self.total_pipelines_completed + self.total_pipelines_failed;
        if finished == 0 {
            0.0
        } else {
            self.total_pipelines_failed as f64 / finished as f64
        }
    }
}

/// A stage flagged as slow relative to the others
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bottleneck {
    pub stage: Stage,
    pub average_time_ms: f64,
    pub is_bottleneck: bool,
}

/// Lock-free metrics sink shared by every pipeline
#[derive(Debug, Default)]
pub struct MetricsCollector {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    rollbacks: AtomicU64,
    processing_micros: AtomicU64,
    stages: [StageCounters; 5],
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self, stage: Stage) -> Option<&StageCounters> {
        Stage::ACTIVE
            .iter()
            .position(|s| *s == stage)
            .map(|index| &self.stages[index])
    }

    /// Record one stage attempt; non-active stages are ignored
    pub fn record_stage(&self, stage: Stage, duration: Duration, success: bool) {
        let Some(counters) = self.counters(stage) else {
            return;
        };
        counters
            .total_micros
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        counters.invocations.fetch_add(1, Ordering::Relaxed);
        if success {
            counters.successes.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a terminal pipeline and its wall time
    pub fn record_finished(&self, success: bool, elapsed: Duration) {
        if success {
            self.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.processing_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineMetrics {
        let completed = self.completed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let finished = completed + failed;
        let average_processing_time_ms = if finished == 0 {
            0.0
        } else {
            self.processing_micros.load(Ordering::Relaxed) as f64 / 1000.0 / finished as f64
        };

        PipelineMetrics {
            total_pipelines_started: self.started.load(Ordering::Relaxed),
            total_pipelines_completed: completed,
            total_pipelines_failed: failed,
            total_retries: self.retries.load(Ordering::Relaxed),
            total_rollbacks: self.rollbacks.load(Ordering::Relaxed),
            average_processing_time_ms,
            stage_metrics: Stage::ACTIVE
                .iter()
                .zip(self.stages.iter())
                .map(|(stage, counters)| (*stage, counters.snapshot()))
                .collect(),
        }
    }

    /// Stages whose average attempt time stands out, slowest first.
    ///
    /// A stage is flagged when its average exceeds `relative_factor` times
    /// the baseline, or exceeds `absolute_threshold_ms` when one is
    /// configured. The baseline is the fastest measured average, raised to
    /// `min_average_ms`; stages averaging less than `min_average_ms` are
    /// never flagged relatively. Stages never invoked are not considered.
    pub fn bottlenecks(&self, config: &BottleneckConfig) -> Vec<Bottleneck> {
        let measured: Vec<(Stage, f64)> = Stage::ACTIVE
            .iter()
            .zip(self.stages.iter())
            .map(|(stage, counters)| (*stage, counters.snapshot()))
            .filter(|(_, metrics)| metrics.invocation_count > 0)
            .map(|(stage, metrics)| (stage, metrics.average_time_ms))
            .collect();

        let baseline = measured
            .iter()
            .map(|(_, avg)| *avg)
            .fold(f64::INFINITY, f64::min)
            .max(config.min_average_ms);

        let mut flagged: Vec<Bottleneck> = measured
            .iter()
            .filter(|(_, avg)| {
                let relative = measured.len() > 1
                    && baseline > 0.0
                    && *avg >= config.min_average_ms
                    && *avg > baseline * config.relative_factor;
                let absolute = config
                    .absolute_threshold_ms
                    .is_some_and(|threshold| *avg > threshold as f64);
                relative || absolute
            })
            .map(|(stage, avg)| Bottleneck {
                stage: *stage,
                average_time_ms: *avg,
                is_bottleneck: true,
            })
            .collect();

        flagged.sort_by(|a, b| b.average_time_ms.total_cmp(&a.average_time_ms));
        flagged
    }

    /// Zero every counter
    pub fn reset(&self) {
        for counter in [
            &self.started,
            &self.completed,
            &self.failed,
            &self.retries,
            &self.rollbacks,
            &self.processing_micros,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        for stage in &self.stages {
            stage.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_stage_metrics_derive_rates() {
        let metrics = MetricsCollector::new();
        metrics.record_stage(Stage::Storage, ms(10), false);
        metrics.record_stage(Stage::Storage, ms(30), true);

        let snapshot = metrics.snapshot();
        let storage = snapshot.stage_metrics[&Stage::Storage];
        assert_eq!(storage.invocation_count, 2);
        assert_eq!(storage.success_count, 1);
        assert_eq!(storage.success_rate, 0.5);
        assert_eq!(storage.total_time_ms, 40.0);
        assert_eq!(storage.average_time_ms, 20.0);
        assert_eq!(snapshot.stage_metrics[&Stage::Indexing].invocation_count, 0);
    }

    #[test]
    fn test_non_active_stages_ignored() {
        let metrics = MetricsCollector::new();
        metrics.record_stage(Stage::Queued, ms(5), true);
        assert_eq!(metrics.snapshot().stage_metrics.len(), 5);
        assert!(metrics
            .snapshot()
            .stage_metrics
            .values()
            .all(|m| m.invocation_count == 0));
    }

    #[test]
    fn test_average_processing_time_covers_failures() {
        let metrics = MetricsCollector::new();
        metrics.record_finished(true, ms(100));
        metrics.record_finished(false, ms(300));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.average_processing_time_ms, 200.0);
        assert_eq!(snapshot.failure_rate(), 0.5);
    }

    #[test]
    fn test_relative_bottleneck_detection() {
        let metrics = MetricsCollector::new();
        metrics.record_stage(Stage::Validation, ms(1), true);
        metrics.record_stage(Stage::Storage, ms(2), true);
        metrics.record_stage(Stage::AiProcessing, ms(50), true);
        metrics.record_stage(Stage::Indexing, ms(10), true);

        let bottlenecks = metrics.bottlenecks(&BottleneckConfig::default());
        let stages: Vec<Stage> = bottlenecks.iter().map(|b| b.stage).collect();
        assert_eq!(stages, vec![Stage::AiProcessing, Stage::Indexing]);
        assert!(bottlenecks.iter().all(|b| b.is_bottleneck));
    }

    #[test]
    fn test_sub_millisecond_stages_never_flagged() {
        let metrics = MetricsCollector::new();
        metrics.record_stage(Stage::Validation, Duration::from_micros(60), true);
        metrics.record_stage(Stage::Storage, Duration::from_micros(42), true);
        metrics.record_stage(Stage::Indexing, Duration::from_micros(900), true);
        metrics.record_stage(Stage::AiProcessing, ms(200), true);

        let stages: Vec<Stage> = metrics
            .bottlenecks(&BottleneckConfig::default())
            .iter()
            .map(|b| b.stage)
            .collect();
        assert_eq!(stages, vec![Stage::AiProcessing]);
    }

    #[test]
    fn test_zero_floor_uses_raw_fastest_stage() {
        let metrics = MetricsCollector::new();
        metrics.record_stage(Stage::Validation, Duration::from_micros(10), true);
        metrics.record_stage(Stage::Storage, Duration::from_micros(50), true);

        let config = BottleneckConfig {
            min_average_ms: 0.0,
            ..BottleneckConfig::default()
        };
        assert_eq!(metrics.bottlenecks(&config)[0].stage, Stage::Storage);
    }

    #[test]
    fn test_absolute_threshold_flags_single_stage() {
        let metrics = MetricsCollector::new();
        metrics.record_stage(Stage::AiProcessing, ms(500), true);

        assert!(metrics.bottlenecks(&BottleneckConfig::default()).is_empty());

        let config = BottleneckConfig {
            absolute_threshold_ms: Some(200),
            ..BottleneckConfig::default()
        };
        assert_eq!(metrics.bottlenecks(&config)[0].stage, Stage::AiProcessing);
    }

    #[test]
    fn test_reset_zeroes_everything() {
        let metrics = MetricsCollector::new();
        metrics.record_started();
        metrics.record_retry();
        metrics.record_rollback();
        metrics.record_stage(Stage::Indexing, ms(4), true);
        metrics.reset();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot, MetricsCollector::new().snapshot());
    }

    #[test]
    fn test_snapshot_serializes_stage_keys() {
        let metrics = MetricsCollector::new();
        metrics.record_stage(Stage::AiProcessing, ms(3), true);
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["stageMetrics"]["aiProcessing"]["invocationCount"], 1);
    }
}
