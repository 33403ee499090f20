//! Main search service implementation

use crate::search::client::{ClusterClient, ClusterHealth, HttpClusterClient, NodeInfo, ProtocolVersion};
use crate::search::config::SearchConfig;
use crate::search::error::{SearchError, SearchResult};
use crate::search::index::{IndexAdminStatus, IndexManager, IndexSet};
use crate::search::observer::SyncObserver;
use crate::search::pipeline::{BulkSyncPipeline, SyncOptions, SyncReport};
use crate::search::query::{map_response, AccessPolicy, QueryCompiler, SearchOptions, SearchResults, Viewer};
use crate::search::source::{ContentStore, DocumentSelector};
use crate::search::terms::SearchTerms;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

/// Cluster version and node inventory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub protocol: ProtocolVersion,
    /// Version reported by the first node
    pub version: Option<String>,
    pub nodes: BTreeMap<String, NodeInfo>,
}

/// Removes the single-flight entry when the rebuild ends, however it ends
struct RebuildGuard<'a> {
    running: &'a DashMap<String, Instant>,
    key: String,
}

impl Drop for RebuildGuard<'_> {
    fn drop(&mut self) {
        self.running.remove(&self.key);
    }
}

/// Search, sync hooks and index administration over one index set
pub struct SearchService {
    config: SearchConfig,
    client: Arc<dyn ClusterClient>,
    store: Arc<dyn ContentStore>,
    manager: IndexManager,
    pipeline: BulkSyncPipeline,
    compiler: QueryCompiler,
    observer: Arc<dyn SyncObserver>,
    rebuilds: DashMap<String, Instant>,
}

impl SearchService {
    /// Create a service over an existing client
    pub fn new(
        config: SearchConfig,
        client: Arc<dyn ClusterClient>,
        store: Arc<dyn ContentStore>,
        observer: Arc<dyn SyncObserver>,
    ) -> SearchResult<Self> {
        config.check()?;
        if config.protocol()? != client.protocol() {
            return Err(SearchError::InvalidConfiguration(format!(
                "Configured protocol version {} does not match the cluster client ({})",
                config.protocol_version,
                client.protocol()
            )));
        }
        let connection = config.connection_info()?;
        let indices = IndexSet::new(connection.index_name);

        let compiler = QueryCompiler::new(indices.alias.clone(), AccessPolicy::from(&config));
        let pipeline = BulkSyncPipeline::new(client.clone(), store.clone(), &config);
        let manager = IndexManager::new(client.clone(), indices);

        Ok(Self {
            config,
            client,
            store,
            manager,
            pipeline,
            compiler,
            observer,
            rebuilds: DashMap::new(),
        })
    }

    /// Create a service talking HTTP to the configured cluster
    pub fn connect(
        config: SearchConfig,
        store: Arc<dyn ContentStore>,
        observer: Arc<dyn SyncObserver>,
    ) -> SearchResult<Self> {
        let client = Arc::new(HttpClusterClient::new(&config)?);
        Self::new(config, client, store, observer)
    }

    pub fn indices(&self) -> &IndexSet {
        self.manager.indices()
    }

    /// Normalize the index set, then rebuild if configured to.
    ///
    /// A boot-time rebuild failure is logged, not returned.
    pub async fn init(&self) -> SearchResult<()> {
        self.manager.normalize_indices().await?;

        if self.config.rebuild_on_boot {
            info!(index = %self.indices().main, "Rebuilding index on boot");
            if let Err(e) = self.rebuild_index().await {
                error!(index = %self.indices().main, error = %e, "Boot-time rebuild failed");
            }
        }

        info!(
            index = %self.indices().main,
            alias = %self.indices().alias,
            protocol = %self.client.protocol(),
            "Search service initialized"
        );
        Ok(())
    }

    /// Run a search for already-validated terms
    pub async fn search(
        &self,
        terms: &SearchTerms,
        viewer: Option<&Viewer>,
        options: &SearchOptions,
    ) -> SearchResult<SearchResults> {
        let start = Instant::now();
        let user_count = self.store.user_count().await?;
        let request = self.compiler.compile(terms, viewer, options, user_count);

        let response = self.client.search(&request).await?;
        let results = map_response(response);

        debug!(
            query = %terms.query_string(),
            total = results.meta.total,
            hits = results.meta.hits_count,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Search executed"
        );
        Ok(results)
    }

    /// Validate a raw terms payload, then search; invalid payloads never reach the cluster
    pub async fn search_json(
        &self,
        payload: &Value,
        viewer: Option<&Viewer>,
        options: &SearchOptions,
    ) -> SearchResult<SearchResults> {
        let terms = SearchTerms::from_json(payload)?;
        self.search(&terms, viewer, options).await
    }

    async fn sync(&self, selector: DocumentSelector) -> SearchResult<SyncReport> {
        self.pipeline
            .sync(
                &self.indices().main,
                &selector,
                self.observer.as_ref(),
                SyncOptions::default(),
            )
            .await
    }

    pub async fn on_document_created_or_updated(&self, id: &str) -> SearchResult<SyncReport> {
        self.sync(DocumentSelector::ById(id.to_string())).await
    }

    pub async fn on_documents_deleted(&self, ids: &[String]) -> SearchResult<SyncReport> {
        self.pipeline.delete(&self.indices().main, ids).await
    }

    /// Re-index a subtree, e.g. after a rename or a grant change
    pub async fn on_descendants_updated(&self, root_path: &str) -> SearchResult<SyncReport> {
        self.sync(DocumentSelector::Descendants(root_path.to_string()))
            .await
    }

    pub async fn on_descendants_deleted(&self, ids: &[String]) -> SearchResult<SyncReport> {
        self.pipeline.delete(&self.indices().main, ids).await
    }

    pub async fn on_bookmark_changed(&self, id: &str) -> SearchResult<SyncReport> {
        self.sync(DocumentSelector::ById(id.to_string())).await
    }

    pub async fn on_comment_changed(&self, page_id: &str) -> SearchResult<SyncReport> {
        self.sync(DocumentSelector::ById(page_id.to_string())).await
    }

    pub async fn on_tag_changed(&self, id: &str) -> SearchResult<SyncReport> {
        self.sync(DocumentSelector::ById(id.to_string())).await
    }

    pub async fn cluster_info(&self) -> SearchResult<ClusterInfo> {
        let nodes = self.client.nodes_info().await?;
        Ok(ClusterInfo {
            protocol: self.client.protocol(),
            version: nodes.values().next().map(|node| node.version.clone()),
            nodes,
        })
    }

    pub async fn cluster_health(&self) -> SearchResult<ClusterHealth> {
        self.client.cluster_health().await
    }

    pub async fn index_admin_status(&self) -> SearchResult<IndexAdminStatus> {
        self.manager.admin_status().await
    }

    pub async fn normalize_indices(&self) -> SearchResult<()> {
        self.manager.normalize_indices().await
    }

    /// Rebuild the index set; only one rebuild per main index runs at a time
    pub async fn rebuild_index(&self) -> SearchResult<SyncReport> {
        let key = self.indices().main.clone();
        match self.rebuilds.entry(key.clone()) {
            Entry::Occupied(_) => return Err(SearchError::RebuildInProgress(key)),
            Entry::Vacant(entry) => {
                entry.insert(Instant::now());
            }
        }
        let _guard = RebuildGuard {
            running: &self.rebuilds,
            key,
        };

        self.manager
            .rebuild_index(&self.pipeline, self.observer.as_ref())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::config::SearchConfigBuilder;
    use crate::search::document::IndexedDocument;
    use crate::search::memory::InMemoryCluster;
    use crate::search::observer::NoopObserver;
    use crate::search::source::MemoryContentStore;
    use crate::search::terms::TermKey;
    use serde_json::json;

    async fn service(documents: Vec<IndexedDocument>) -> (Arc<InMemoryCluster>, MemoryContentStore, SearchService) {
        let cluster = Arc::new(InMemoryCluster::v8());
        let store = MemoryContentStore::with_documents(documents);
        let config = SearchConfigBuilder::new().uri("http://localhost:9200/wiki").build();
        let service = SearchService::new(
            config,
            cluster.clone(),
            Arc::new(store.clone()),
            Arc::new(NoopObserver),
        )
        .unwrap();
        service.init().await.unwrap();
        (cluster, store, service)
    }

    #[tokio::test]
    async fn test_index_names_follow_uri() {
        let (cluster, _store, service) = service(vec![]).await;
        assert_eq!(service.indices().alias, "wiki-alias");
        assert_eq!(cluster.alias_targets("wiki-alias"), vec!["wiki"]);
    }

    #[tokio::test]
    async fn test_unsupported_terms_never_reach_cluster() {
        let (cluster, _store, service) = service(vec![]).await;
        let err = service
            .search_json(&json!({ "fuzzy": ["x"] }), None, &SearchOptions::new())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("fuzzy"));
        assert_eq!(cluster.search_call_count(), 0);
    }

    #[tokio::test]
    async fn test_sync_hooks() {
        let (cluster, store, service) = service(vec![
            IndexedDocument::new("1", "/team", "root"),
            IndexedDocument::new("2", "/team/a", "child"),
        ])
        .await;

        service.on_descendants_updated("/team").await.unwrap();
        assert_eq!(cluster.document_count("wiki-alias"), 2);

        store.set_bookmark_count("2", 7);
        service.on_bookmark_changed("2").await.unwrap();
        assert_eq!(cluster.get_document("wiki", "2").unwrap()["bookmark_count"], 7);

        store.set_tags("1", vec!["infra"]);
        service.on_tag_changed("1").await.unwrap();
        let results = service
            .search(
                &SearchTerms::new().with(TermKey::Tag, vec!["infra"]),
                None,
                &SearchOptions::new(),
            )
            .await
            .unwrap();
        assert_eq!(results.ids(), vec!["1"]);

        service.on_documents_deleted(&["1".to_string()]).await.unwrap();
        assert_eq!(cluster.document_count("wiki-alias"), 1);
    }

    #[test]
    fn test_protocol_version_checked_at_construction() {
        let build = |version: u8, cluster: InMemoryCluster| {
            SearchService::new(
                SearchConfigBuilder::new().protocol_version(version).build(),
                Arc::new(cluster),
                Arc::new(MemoryContentStore::new()),
                Arc::new(NoopObserver),
            )
        };

        assert!(matches!(
            build(9, InMemoryCluster::v8()),
            Err(SearchError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            build(7, InMemoryCluster::v8()),
            Err(SearchError::InvalidConfiguration(_))
        ));
        assert!(build(7, InMemoryCluster::v7()).is_ok());
        assert!(build(8, InMemoryCluster::v8()).is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_rebuild_is_rejected() {
        let documents = (0..4).map(|i| IndexedDocument::new(format!("p{}", i), format!("/p/{}", i), "body"));
        let (_cluster, _store, service) = service(documents.collect()).await;

        let (first, second) = tokio::join!(service.rebuild_index(), service.rebuild_index());
        assert_eq!(first.unwrap().processed_count, 4);
        assert!(matches!(second, Err(SearchError::RebuildInProgress(_))));

        // guard released
        assert!(service.rebuild_index().await.is_ok());
    }

    #[tokio::test]
    async fn test_cluster_info_and_health() {
        let (_cluster, _store, service) = service(vec![]).await;
        let info = service.cluster_info().await.unwrap();
        assert_eq!(info.protocol, ProtocolVersion::V8);
        assert_eq!(info.version.as_deref(), Some("8.11.0"));
        assert_eq!(service.cluster_health().await.unwrap().status, "green");
    }
}
