//! Content Processing Pipeline Orchestration
//!
//! This crate drives captured content items through SmartShelf's processing
//! stages and keeps observers informed of their progress.
//!
//! ## Architecture
//!
//! Each item runs through five stages, strictly in order:
//! 1. **Validation**: Local checks on the item (id, URL scheme)
//! 2. **AI Processing**: Annotation through the `AiAnnotator`
//! 3. **Storage**: Persistence through the `ContentStore`
//! 4. **Indexing**: Search index update through the `SearchIndexer`
//! 5. **Post-processing**: Finalization and a fire-and-forget `ConnectionDiscovery`
//!
//! ## Clear Separation of Concerns
//!
//! Infrastructure (DOES NOT orchestrate):
//! - `shelf-core`: Just declares content types and collaborator traits
//! - `shelf-config`: Just loads and validates configuration
//!
//! This crate (shelf-pipeline):
//! - Runs stages in order with per-stage timeouts and retry with backoff
//! - Bounds how many pipelines run at once, queueing the rest in FIFO order
//! - Rolls back stored content when indexing or post-processing fails
//! - Publishes progress events and aggregates metrics and health
//! - Groups pipelines into batches
//!
//! ## Usage
//!
//! ```rust,ignore
//! use shelf_pipeline::{BatchCoordinator, PipelineCoordinator};
//!
//! let coordinator = PipelineCoordinator::builder()
//!     .annotator(annotator)
//!     .content_store(store)
//!     .search_indexer(indexer)
//!     .config(config)
//!     .build();
//!
//! // Observe progress
//! coordinator.events().on_progress(|event| println!("{} {}%", event.stage, event.progress));
//!
//! // Process one item
//! let state = coordinator.process_single(item).await?;
//!
//! // Or a batch
//! let batches = BatchCoordinator::new(coordinator.clone());
//! let batch_id = batches.process_batch(items)?;
//! let batch = batches.wait_for_batch_completion(batch_id).await?;
//! ```

pub mod batch;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod executor;
pub mod health;
pub mod instance;
pub mod metrics;
pub mod retry;
pub mod stage;
pub mod state;

pub use batch::{BatchCoordinator, BatchId, BatchState, BatchStatus};
pub use coordinator::{PipelineCoordinator, PipelineCoordinatorBuilder};
pub use error::{PipelineError, PipelineResult, StageError, StageFailure};
pub use events::{ProgressEvent, ProgressEventBus, SubscriptionId};
pub use executor::{StageExecutor, StageOptions};
pub use health::{HealthState, HealthStatus};
pub use instance::PipelineInstance;
pub use metrics::{Bottleneck, MetricsCollector, PipelineMetrics, StageMetrics};
pub use retry::{RetryPolicy, RetryPredicate};
pub use stage::Stage;
pub use state::{PipelineId, PipelineState, StageRecord};

pub use shelf_config::PipelineConfig;
