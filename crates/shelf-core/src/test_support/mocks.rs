//! Mock Collaborators for Testing
//!
//! In-memory implementations of the collaborator traits. They are:
//!
//! - **Deterministic**: failures are scripted, never random
//! - **Observable**: every call is recorded for assertions
//! - **Configurable**: failures can be injected per call count or per item id
//! - **Controllable**: the annotator can be gated so tests decide when calls finish
//!
//! # Example
//!
//! ```rust,ignore
//! use shelf_core::test_support::mocks::MockAiAnnotator;
//! use shelf_core::{AiAnnotator, ContentItem};
//!
//! # async fn example() {
//! let annotator = MockAiAnnotator::new().failing_times(2);
//! let item = ContentItem::new("x1");
//!
//! assert!(annotator.process(&item).await.is_err());
//! assert!(annotator.process(&item).await.is_err());
//! assert!(annotator.process(&item).await.is_ok());
//! assert_eq!(annotator.call_count(), 3);
//! # }
//! ```

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::content::{Annotation, ContentItem, StoredRecord};
use crate::error::{CollaboratorError, CollaboratorResult};
use crate::traits::{
    AiAnnotator, ConnectionDiscovery, ContentFinalizer, ContentStore, SearchIndexer,
};

// ============================================================================
// Failure scripting
// ============================================================================

/// Scripted failure behaviour shared by the mocks
#[derive(Debug, Clone)]
struct FailurePlan {
    /// Fail this many more calls, then succeed
    remaining_failures: u32,
    /// Fail every call
    always: bool,
    /// Fail every call for these item ids
    ids: HashSet<String>,
    /// Error returned when a call fails
    error: CollaboratorError,
}

impl Default for FailurePlan {
    fn default() -> Self {
        Self {
            remaining_failures: 0,
            always: false,
            ids: HashSet::new(),
            error: CollaboratorError::transient("simulated failure"),
        }
    }
}

impl FailurePlan {
    fn check(&mut self, id: &str) -> CollaboratorResult<()> {
        if self.always || self.ids.contains(id) {
            return Err(self.error.clone());
        }
        if self.remaining_failures > 0 {
            self.remaining_failures -= 1;
            return Err(self.error.clone());
        }
        Ok(())
    }
}

// ============================================================================
// Mock AI Annotator
// ============================================================================

/// Mock annotator producing a summary derived from the item title
#[derive(Clone, Default)]
pub struct MockAiAnnotator {
    state: Arc<Mutex<AnnotatorState>>,
    gate: Option<Arc<Semaphore>>,
}

#[derive(Default)]
struct AnnotatorState {
    calls: Vec<String>,
    failures: FailurePlan,
    delay: Option<Duration>,
    panics: bool,
}

impl MockAiAnnotator {
    /// Create an annotator that always succeeds
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` calls, then succeed
    pub fn failing_times(self, n: u32) -> Self {
        self.state.lock().unwrap().failures.remaining_failures = n;
        self
    }

    /// Fail every call
    pub fn always_failing(self) -> Self {
        self.state.lock().unwrap().failures.always = true;
        self
    }

    /// Fail every call for the given item id
    pub fn failing_for(self, id: impl Into<String>) -> Self {
        self.state.lock().unwrap().failures.ids.insert(id.into());
        self
    }

    /// Use a specific error for injected failures
    pub fn with_error(self, error: CollaboratorError) -> Self {
        self.state.lock().unwrap().failures.error = error;
        self
    }

    /// Sleep for `delay` inside every call
    pub fn with_delay(self, delay: Duration) -> Self {
        self.state.lock().unwrap().delay = Some(delay);
        self
    }

    /// Panic inside every call, after recording it
    pub fn panicking(self) -> Self {
        self.state.lock().unwrap().panics = true;
        self
    }

    /// Block every call until [`MockAiAnnotator::release`] lets it through
    pub fn gated(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    /// Let `n` gated calls proceed
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    /// Total number of calls made
    pub fn call_count(&self) -> usize {
        self.state.lock().unwrap().calls.len()
    }

    /// Number of calls made for a given item id
    pub fn calls_for(&self, id: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.as_str() == id)
            .count()
    }
}

#[async_trait]
impl AiAnnotator for MockAiAnnotator {
    async fn process(&self, item: &ContentItem) -> CollaboratorResult<Annotation> {
        let (outcome, delay, panics) = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(item.id.clone());
            (state.failures.check(&item.id), state.delay, state.panics)
        };
        if panics {
            panic!("annotator crashed on {}", item.id);
        }

        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        outcome?;
        Ok(Annotation {
            summary: format!("Summary of {}", item.title),
            categories: vec!["reference".to_string()],
            tags: vec![format!("item:{}", item.id)],
        })
    }
}

// ============================================================================
// Mock Content Store
// ============================================================================

/// In-memory content store recording saves and deletes
#[derive(Clone, Default)]
pub struct MockContentStore {
    state: Arc<Mutex<StoreState>>,
}

#[derive(Default)]
struct StoreState {
    records: HashMap<String, ContentItem>,
    save_calls: Vec<String>,
    delete_calls: Vec<String>,
    save_failures: FailurePlan,
    fail_deletes: bool,
}

impl MockContentStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` saves
    pub fn failing_saves(self, n: u32) -> Self {
        self.state.lock().unwrap().save_failures.remaining_failures = n;
        self
    }

    /// Fail every save
    pub fn always_failing_saves(self) -> Self {
        self.state.lock().unwrap().save_failures.always = true;
        self
    }

    /// Fail every delete
    pub fn failing_deletes(self) -> Self {
        self.state.lock().unwrap().fail_deletes = true;
        self
    }

    /// Whether an item with this id is currently stored
    pub fn contains(&self, id: &str) -> bool {
        self.state.lock().unwrap().records.contains_key(id)
    }

    /// The stored copy of an item
    pub fn get(&self, id: &str) -> Option<ContentItem> {
        self.state.lock().unwrap().records.get(id).cloned()
    }

    /// Number of save calls made
    pub fn save_count(&self) -> usize {
        self.state.lock().unwrap().save_calls.len()
    }

    /// Ids passed to `delete`, in call order
    pub fn delete_calls(&self) -> Vec<String> {
        self.state.lock().unwrap().delete_calls.clone()
    }
}

#[async_trait]
impl ContentStore for MockContentStore {
    async fn save(&self, item: &ContentItem) -> CollaboratorResult<StoredRecord> {
        let mut state = self.state.lock().unwrap();
        state.save_calls.push(item.id.clone());
        state.save_failures.check(&item.id)?;
        state.records.insert(item.id.clone(), item.clone());
        Ok(StoredRecord::now(&item.id))
    }

    async fn delete(&self, content_id: &str) -> CollaboratorResult<()> {
        let mut state = self.state.lock().unwrap();
        state.delete_calls.push(content_id.to_string());
        if state.fail_deletes {
            return Err(CollaboratorError::unavailable("store offline"));
        }
        state.records.remove(content_id);
        Ok(())
    }
}

// ============================================================================
// Mock Search Indexer
// ============================================================================

/// Search indexer recording which items were indexed
#[derive(Clone, Default)]
pub struct MockSearchIndexer {
    state: Arc<Mutex<IndexerState>>,
}

#[derive(Default)]
struct IndexerState {
    indexed: Vec<String>,
    calls: usize,
    failures: FailurePlan,
    reject: bool,
}

impl MockSearchIndexer {
    /// Create an indexer that accepts every update
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` updates
    pub fn failing_times(self, n: u32) -> Self {
        self.state.lock().unwrap().failures.remaining_failures = n;
        self
    }

    /// Fail every update
    pub fn always_failing(self) -> Self {
        self.state.lock().unwrap().failures.always = true;
        self
    }

    /// Answer every update with `Ok(false)`
    pub fn rejecting(self) -> Self {
        self.state.lock().unwrap().reject = true;
        self
    }

    /// Number of update calls made
    pub fn call_count(&self) -> usize {
        self.state.lock().unwrap().calls
    }

    /// Ids successfully indexed, in order
    pub fn indexed(&self) -> Vec<String> {
        self.state.lock().unwrap().indexed.clone()
    }
}

#[async_trait]
impl SearchIndexer for MockSearchIndexer {
    async fn update_index(&self, item: &ContentItem) -> CollaboratorResult<bool> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        state.failures.check(&item.id)?;
        if state.reject {
            return Ok(false);
        }
        state.indexed.push(item.id.clone());
        Ok(true)
    }
}

// ============================================================================
// Mock Content Finalizer
// ============================================================================

/// Finalizer recording the ids it was asked to finalize
#[derive(Clone, Default)]
pub struct MockContentFinalizer {
    state: Arc<Mutex<FinalizerState>>,
}

#[derive(Default)]
struct FinalizerState {
    calls: Vec<String>,
    failures: FailurePlan,
}

impl MockContentFinalizer {
    /// Create a finalizer that always succeeds
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` calls
    pub fn failing_times(self, n: u32) -> Self {
        self.state.lock().unwrap().failures.remaining_failures = n;
        self
    }

    /// Fail every call
    pub fn always_failing(self) -> Self {
        self.state.lock().unwrap().failures.always = true;
        self
    }

    /// Number of calls made
    pub fn call_count(&self) -> usize {
        self.state.lock().unwrap().calls.len()
    }
}

#[async_trait]
impl ContentFinalizer for MockContentFinalizer {
    async fn finalize(&self, item: &ContentItem) -> CollaboratorResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(item.id.clone());
        state.failures.check(&item.id)
    }
}

// ============================================================================
// Mock Connection Discovery
// ============================================================================

/// Connection discovery that counts invocations
#[derive(Clone, Default)]
pub struct MockConnectionDiscovery {
    state: Arc<Mutex<Vec<String>>>,
}

impl MockConnectionDiscovery {
    /// Create a discovery mock
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids discovery was triggered for
    pub fn triggered(&self) -> Vec<String> {
        self.state.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConnectionDiscovery for MockConnectionDiscovery {
    async fn discover(&self, item: &ContentItem) -> CollaboratorResult<usize> {
        self.state.lock().unwrap().push(item.id.clone());
        Ok(0)
    }
}
