//! Captured content and the records derived from it

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A content item captured from the browser
///
/// The pipeline treats the item as opaque input: it is passed through to each
/// collaborator unchanged, except for the [`Annotation`] attached after the
/// AI stage succeeds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    /// Stable identifier assigned at capture time
    pub id: String,
    /// Page or document title
    #[serde(default)]
    pub title: String,
    /// Extracted text content
    #[serde(default)]
    pub content: String,
    /// Source URL (empty for content without an origin page)
    #[serde(default)]
    pub url: String,
    /// AI-generated annotation, present once annotation has run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<Annotation>,
    /// Free-form capture metadata carried through untouched
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ContentItem {
    /// Create an item with only an id
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Set the title
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Set the text content
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    /// Set the source URL
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Check whether the AI stage has attached an annotation
    pub fn is_annotated(&self) -> bool {
        self.annotation.is_some()
    }
}

/// Output of the AI annotator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    /// Short summary of the content
    pub summary: String,
    /// Broad categories the content belongs to
    #[serde(default)]
    pub categories: Vec<String>,
    /// Fine-grained tags
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Acknowledgement returned by the content store after a save
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    /// Id of the stored content
    pub content_id: String,
    /// Store-specific revision marker, if the store versions records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    /// When the store accepted the write
    pub stored_at: DateTime<Utc>,
}

impl StoredRecord {
    /// Create a record stamped with the current time
    pub fn now(content_id: impl Into<String>) -> Self {
        Self {
            content_id: content_id.into(),
            revision: None,
            stored_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_sets_fields() {
        let item = ContentItem::new("x1")
            .with_title("Rust ownership")
            .with_url("https://doc.rust-lang.org/book/")
            .with_content("Each value has an owner.");

        assert_eq!(item.id, "x1");
        assert_eq!(item.title, "Rust ownership");
        assert!(!item.is_annotated());
    }

    #[test]
    fn test_deserialize_minimal_item() {
        let item: ContentItem = serde_json::from_str(r#"{"id":"x1"}"#).unwrap();
        assert_eq!(item, ContentItem::new("x1"));
    }

    #[test]
    fn test_annotation_omitted_when_absent() {
        let json = serde_json::to_value(ContentItem::new("x1")).unwrap();
        assert!(json.get("annotation").is_none());
        assert!(json.get("metadata").is_none());
    }
}
