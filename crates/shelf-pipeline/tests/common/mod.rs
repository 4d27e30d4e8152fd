//! Common test utilities for pipeline tests.

#![allow(dead_code)]

use parking_lot::Mutex;
use shelf_config::{PipelineConfig, RetryPolicyConfig};
use shelf_core::test_support::mocks::{
    MockAiAnnotator, MockConnectionDiscovery, MockContentFinalizer, MockContentStore,
    MockSearchIndexer,
};
use shelf_core::ContentItem;
use shelf_pipeline::{
    PipelineCoordinator, PipelineCoordinatorBuilder, ProgressEvent, ProgressEventBus, StageError,
};
use std::sync::Arc;

pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// A coordinator wired to observable mock collaborators
pub struct Fixture {
    pub annotator: MockAiAnnotator,
    pub store: MockContentStore,
    pub indexer: MockSearchIndexer,
    pub discovery: MockConnectionDiscovery,
    pub finalizer: MockContentFinalizer,
    pub coordinator: PipelineCoordinator,
}

impl Fixture {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> FixtureBuilder {
        FixtureBuilder::default()
    }
}

#[derive(Default)]
pub struct FixtureBuilder {
    annotator: Option<MockAiAnnotator>,
    store: Option<MockContentStore>,
    indexer: Option<MockSearchIndexer>,
    finalizer: Option<MockContentFinalizer>,
    retry_predicate: Option<fn(&StageError) -> bool>,
    config: Option<PipelineConfig>,
}

impl FixtureBuilder {
    pub fn annotator(mut self, annotator: MockAiAnnotator) -> Self {
        self.annotator = Some(annotator);
        self
    }

    pub fn store(mut self, store: MockContentStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn indexer(mut self, indexer: MockSearchIndexer) -> Self {
        self.indexer = Some(indexer);
        self
    }

    pub fn finalizer(mut self, finalizer: MockContentFinalizer) -> Self {
        self.finalizer = Some(finalizer);
        self
    }

    pub fn retry_predicate(mut self, predicate: fn(&StageError) -> bool) -> Self {
        self.retry_predicate = Some(predicate);
        self
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(self) -> Fixture {
        let annotator = self.annotator.unwrap_or_default();
        let store = self.store.unwrap_or_default();
        let indexer = self.indexer.unwrap_or_default();
        let finalizer = self.finalizer.unwrap_or_default();
        let discovery = MockConnectionDiscovery::new();

        let mut builder: PipelineCoordinatorBuilder = PipelineCoordinator::builder()
            .annotator(Arc::new(annotator.clone()))
            .content_store(Arc::new(store.clone()))
            .search_indexer(Arc::new(indexer.clone()))
            .connection_discovery(Arc::new(discovery.clone()))
            .content_finalizer(Arc::new(finalizer.clone()))
            .config(self.config.unwrap_or_else(fast_config));
        if let Some(predicate) = self.retry_predicate {
            builder = builder.retry_predicate(predicate);
        }

        Fixture {
            annotator,
            store,
            indexer,
            discovery,
            finalizer,
            coordinator: builder.build(),
        }
    }
}

/// Default config with millisecond backoff so real-time tests stay quick
pub fn fast_config() -> PipelineConfig {
    PipelineConfig::default().with_retry_policy(RetryPolicyConfig {
        max_retries: 3,
        initial_delay_ms: 5,
        max_delay_ms: 20,
        backoff_multiplier: 2.0,
    })
}

pub fn item(id: &str) -> ContentItem {
    ContentItem::new(id)
        .with_title(format!("Article {id}"))
        .with_content("Some captured text")
        .with_url(format!("https://example.com/{id}"))
}

/// Collect every event published on the bus
pub fn record_events(bus: &ProgressEventBus) -> Arc<Mutex<Vec<ProgressEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    bus.on_progress(move |event| sink.lock().push(event.clone()));
    events
}
