//! Collaborator Traits
//!
//! The pipeline orchestrates but does not implement annotation, storage or
//! search. Those capabilities are provided by infrastructure crates behind
//! the traits below and injected into the coordinator at construction time.
//!
//! All collaborators must be `Send + Sync`: a single instance is shared by
//! every concurrently running pipeline. Serialising conflicting writes to the
//! same content id is the collaborator's responsibility.

use crate::content::{Annotation, ContentItem, StoredRecord};
use crate::error::CollaboratorResult;
use async_trait::async_trait;

/// AI annotation engine
///
/// Produces a summary, categories and tags for a content item. Calls may fail
/// transiently (rate limits, model warm-up) or permanently (unsupported
/// content); the pipeline decides whether to retry.
#[async_trait]
pub trait AiAnnotator: Send + Sync {
    /// Annotate a single content item
    async fn process(&self, item: &ContentItem) -> CollaboratorResult<Annotation>;
}

/// Persistent content store
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Persist an item (including its annotation, if present)
    async fn save(&self, item: &ContentItem) -> CollaboratorResult<StoredRecord>;

    /// Remove a previously saved item
    ///
    /// The pipeline only calls this to compensate for a save whose later
    /// stages failed.
    async fn delete(&self, content_id: &str) -> CollaboratorResult<()>;
}

/// Search index maintenance
#[async_trait]
pub trait SearchIndexer: Send + Sync {
    /// Add or refresh a single item in the index
    ///
    /// Returns `Ok(false)` when the index declined the update.
    async fn update_index(&self, item: &ContentItem) -> CollaboratorResult<bool>;

    /// Add or refresh many items
    ///
    /// The default implementation updates items one at a time and reports
    /// `false` if any update was declined. Indexers with a native bulk API
    /// should override it.
    async fn batch_update_index(&self, items: &[ContentItem]) -> CollaboratorResult<bool> {
        let mut all_accepted = true;
        for item in items {
            all_accepted &= self.update_index(item).await?;
        }
        Ok(all_accepted)
    }
}

/// Local finalization run in post-processing
///
/// Called once the item is stored and indexed, for work such as deriving
/// read-time metadata or marking the item ready in the host application. An
/// error here fails the pipeline and rolls back the stored content.
#[async_trait]
pub trait ContentFinalizer: Send + Sync {
    /// Finalize a stored, indexed item
    async fn finalize(&self, item: &ContentItem) -> CollaboratorResult<()>;
}

/// Related-content discovery triggered after an item is fully processed
///
/// Invoked fire-and-forget from post-processing; its outcome never affects
/// the pipeline result.
#[async_trait]
pub trait ConnectionDiscovery: Send + Sync {
    /// Find connections for the item, returning how many were found
    async fn discover(&self, item: &ContentItem) -> CollaboratorResult<usize>;
}
