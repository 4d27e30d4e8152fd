//! SmartShelf core domain
//!
//! Defines the content types flowing through the processing pipeline and the
//! collaborator traits the pipeline depends on. Following dependency
//! inversion, this crate only declares the abstractions; concrete annotators,
//! stores and indexers live in infrastructure crates and are injected by the
//! application.

pub mod content;
pub mod error;
pub mod traits;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;

pub use content::{Annotation, ContentItem, StoredRecord};
pub use error::{CollaboratorError, CollaboratorResult};
pub use traits::{
    AiAnnotator, ConnectionDiscovery, ContentFinalizer, ContentStore, SearchIndexer,
};
