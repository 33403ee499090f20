//! Content store seam feeding the sync pipeline

use crate::search::document::IndexedDocument;
use crate::search::error::{SearchError, SearchResult};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Which documents a sync run reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentSelector {
    All,
    ById(String),
    /// The document at `path` and every document below `path/`
    Descendants(String),
}

impl DocumentSelector {
    pub fn matches(&self, document: &IndexedDocument) -> bool {
        match self {
            DocumentSelector::All => true,
            DocumentSelector::ById(id) => &document.id == id,
            DocumentSelector::Descendants(root) => {
                let root = root.trim_end_matches('/');
                document.path == root || document.path.starts_with(&format!("{}/", root))
            }
        }
    }
}

/// Source of documents to index.
///
/// `stream` returns a fresh cursor on every call, so a rebuild can read the
/// store again from the start.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Number of documents the selector would yield
    async fn count(&self, selector: &DocumentSelector) -> SearchResult<u64>;

    fn stream(&self, selector: &DocumentSelector) -> BoxStream<'static, SearchResult<IndexedDocument>>;

    /// Tag names per document id; ids without tags are absent
    async fn tag_names(&self, ids: &[String]) -> SearchResult<HashMap<String, Vec<String>>>;

    /// Active user count, used to normalize the popularity boost
    async fn user_count(&self) -> SearchResult<u64>;
}

/// In-process [`ContentStore`] backed by maps
#[derive(Clone, Default)]
pub struct MemoryContentStore {
    documents: Arc<RwLock<BTreeMap<String, IndexedDocument>>>,
    tags: Arc<RwLock<HashMap<String, Vec<String>>>>,
    user_count: Arc<AtomicU64>,
    fail_tag_lookup: Arc<AtomicBool>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store; tag names carried on the documents move into the tag table
    pub fn with_documents(documents: impl IntoIterator<Item = IndexedDocument>) -> Self {
        let store = Self::new();
        for document in documents {
            store.upsert(document);
        }
        store
    }

    /// Load a JSON array of documents
    pub fn from_json_file(path: impl AsRef<Path>) -> SearchResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SearchError::ContentStore(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let documents: Vec<IndexedDocument> = serde_json::from_str(&raw)?;
        Ok(Self::with_documents(documents))
    }

    pub fn upsert(&self, mut document: IndexedDocument) {
        let tags = std::mem::take(&mut document.tag_names);
        if tags.is_empty() {
            self.tags.write().remove(&document.id);
        } else {
            self.tags
                .write()
                .insert(document.id.clone(), tags.into_iter().collect());
        }
        self.documents.write().insert(document.id.clone(), document);
    }

    pub fn remove(&self, id: &str) -> Option<IndexedDocument> {
        self.tags.write().remove(id);
        self.documents.write().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<IndexedDocument> {
        self.documents.read().get(id).cloned()
    }

    pub fn set_tags(&self, id: &str, tags: Vec<impl Into<String>>) {
        let tags: Vec<String> = tags.into_iter().map(Into::into).collect();
        if tags.is_empty() {
            self.tags.write().remove(id);
        } else {
            self.tags.write().insert(id.to_string(), tags);
        }
    }

    pub fn set_bookmark_count(&self, id: &str, count: u64) {
        if let Some(document) = self.documents.write().get_mut(id) {
            document.bookmark_count = count;
        }
    }

    pub fn set_user_count(&self, count: u64) {
        self.user_count.store(count, Ordering::Relaxed);
    }

    /// Make every tag lookup fail, for exercising error escalation
    pub fn set_fail_tag_lookup(&self, fail: bool) {
        self.fail_tag_lookup.store(fail, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn count(&self, selector: &DocumentSelector) -> SearchResult<u64> {
        Ok(self
            .documents
            .read()
            .values()
            .filter(|document| selector.matches(document))
            .count() as u64)
    }

    fn stream(&self, selector: &DocumentSelector) -> BoxStream<'static, SearchResult<IndexedDocument>> {
        let snapshot: Vec<IndexedDocument> = self
            .documents
            .read()
            .values()
            .filter(|document| selector.matches(document))
            .cloned()
            .collect();

        stream::iter(snapshot.into_iter().map(Ok)).boxed()
    }

    async fn tag_names(&self, ids: &[String]) -> SearchResult<HashMap<String, Vec<String>>> {
        if self.fail_tag_lookup.load(Ordering::Relaxed) {
            return Err(SearchError::ContentStore("tag lookup unavailable".to_string()));
        }

        let tags = self.tags.read();
        Ok(ids
            .iter()
            .filter_map(|id| tags.get(id).map(|names| (id.clone(), names.clone())))
            .collect())
    }

    async fn user_count(&self) -> SearchResult<u64> {
        Ok(self.user_count.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use std::io::Write;

    fn store() -> MemoryContentStore {
        MemoryContentStore::with_documents(vec![
            IndexedDocument::new("1", "/team", "root"),
            IndexedDocument::new("2", "/team/infra", "child"),
            IndexedDocument::new("3", "/team/infra/runbook", "grandchild"),
            IndexedDocument::new("4", "/teammates", "sibling"),
        ])
    }

    #[tokio::test]
    async fn test_descendants_selector() {
        let store = store();
        let selector = DocumentSelector::Descendants("/team".to_string());
        assert_eq!(store.count(&selector).await.unwrap(), 3);

        let ids: Vec<String> = store
            .stream(&selector)
            .map_ok(|doc| doc.id)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(ids, vec!["1", "2", "3"]);

        let root = DocumentSelector::Descendants("/".to_string());
        assert_eq!(store.count(&root).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_stream_is_restartable() {
        let store = store();
        let first: Vec<IndexedDocument> = store.stream(&DocumentSelector::All).try_collect().await.unwrap();
        let second: Vec<IndexedDocument> = store.stream(&DocumentSelector::All).try_collect().await.unwrap();
        assert_eq!(first.len(), 4);
        assert_eq!(second.len(), 4);
    }

    #[tokio::test]
    async fn test_tag_lookup_only_returns_tagged_ids() {
        let store = store();
        store.set_tags("2", vec!["infra"]);

        let tags = store
            .tag_names(&["1".to_string(), "2".to_string()])
            .await
            .unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags["2"], vec!["infra".to_string()]);

        store.set_fail_tag_lookup(true);
        assert!(store.tag_names(&["2".to_string()]).await.is_err());
    }

    #[tokio::test]
    async fn test_load_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"id": "p1", "path": "/a", "body": "hello",
                 "createdAt": "2024-01-01T00:00:00Z", "updatedAt": "2024-01-02T00:00:00Z",
                 "grant": 1, "tagNames": ["x"]}}]"#
        )
        .unwrap();

        let store = MemoryContentStore::from_json_file(file.path()).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.get("p1").unwrap().tag_names.is_empty());
        let tags = store.tag_names(&["p1".to_string()]).await.unwrap();
        assert_eq!(tags["p1"], vec!["x".to_string()]);
    }
}
