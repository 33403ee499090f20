//! Index lifecycle management
//!
//! A deployment owns three names derived from the main index: the main
//! index itself, a read alias and a temporary index used only while
//! rebuilding. Readers always go through the alias.

use crate::search::client::{AliasAction, AliasMap, ClusterClient, IndexStats};
use crate::search::error::SearchResult;
use crate::search::observer::{SyncEvent, SyncObserver};
use crate::search::pipeline::{BulkSyncPipeline, SyncOptions, SyncReport};
use crate::search::source::DocumentSelector;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Names of the main index, its alias and the rebuild index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSet {
    pub main: String,
    pub alias: String,
    pub tmp: String,
}

impl IndexSet {
    pub fn new(main: impl Into<String>) -> Self {
        let main = main.into();
        Self {
            alias: format!("{}-alias", main),
            tmp: format!("{}-tmp", main),
            main,
        }
    }
}

/// Operator view of the index set
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexAdminStatus {
    pub main_exists: bool,
    pub tmp_exists: bool,
    /// Stats of the existing indices among main and tmp
    pub indices: BTreeMap<String, IndexStats>,
    /// Aliases bound to each existing index
    pub aliases: AliasMap,
    pub is_normalized: bool,
}

/// Creates, heals and rebuilds the index set
pub struct IndexManager {
    client: Arc<dyn ClusterClient>,
    indices: IndexSet,
}

impl IndexManager {
    pub fn new(client: Arc<dyn ClusterClient>, indices: IndexSet) -> Self {
        Self { client, indices }
    }

    pub fn indices(&self) -> &IndexSet {
        &self.indices
    }

    /// Bring the index set to its normal shape: no tmp index, main present,
    /// alias bound to main. Safe to call repeatedly.
    pub async fn normalize_indices(&self) -> SearchResult<()> {
        let IndexSet { main, alias, tmp } = &self.indices;

        let main_exists = self.client.index_exists(main).await?;

        if self.client.index_exists(tmp).await? {
            if main_exists && self.client.alias_exists(alias, tmp).await? {
                // move the alias back in one step so it never dangles
                self.client
                    .update_aliases(&[
                        AliasAction::Remove {
                            alias: alias.clone(),
                            index: tmp.clone(),
                        },
                        AliasAction::Add {
                            alias: alias.clone(),
                            index: main.clone(),
                        },
                    ])
                    .await?;
                info!(alias = %alias, index = %main, "Alias moved back to main index");
            }
            self.client.delete_index(tmp).await?;
            info!(index = %tmp, "Temporary index deleted");
        }

        if !main_exists {
            let mapping = self.client.protocol().mapping();
            self.client.create_index(main, &mapping).await?;
            info!(index = %main, protocol = %self.client.protocol(), "Main index created");
        }

        if !self.client.alias_exists(alias, main).await? {
            self.client.put_alias(alias, main).await?;
            info!(alias = %alias, index = %main, "Alias bound");
        }

        debug!(index = %main, "Index set normalized");
        Ok(())
    }

    /// Rebuild the main index from the content store.
    ///
    /// Readers are served from a copy in the tmp index while main is
    /// recreated and repopulated. Whatever happens, the set is normalized
    /// afterwards; a failure is reported to the observer and then returned.
    pub async fn rebuild_index(
        &self,
        pipeline: &BulkSyncPipeline,
        observer: &dyn SyncObserver,
    ) -> SearchResult<SyncReport> {
        let start = Instant::now();
        let result = self.run_rebuild(pipeline, observer).await;

        if let Err(e) = &result {
            error!(index = %self.indices.main, error = %e, "Rebuild failed");
            observer.notify(SyncEvent::RebuildFailed {
                error: e.to_string(),
            });
        }

        let normalized = self.normalize_indices().await;
        if let Err(e) = &normalized {
            warn!(index = %self.indices.main, error = %e, "Normalization after rebuild failed");
        }

        let report = result?;
        normalized?;

        info!(
            index = %self.indices.main,
            documents = report.processed_count,
            errors = report.error_count,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Rebuild completed"
        );
        Ok(report)
    }

    async fn run_rebuild(
        &self,
        pipeline: &BulkSyncPipeline,
        observer: &dyn SyncObserver,
    ) -> SearchResult<SyncReport> {
        let IndexSet { main, alias, tmp } = &self.indices;
        let mapping = self.client.protocol().mapping();

        self.client.create_index(tmp, &mapping).await?;
        self.client.reindex(main, tmp).await?;
        debug!(source = %main, dest = %tmp, "Copied main index");

        self.client
            .update_aliases(&[
                AliasAction::Add {
                    alias: alias.clone(),
                    index: tmp.clone(),
                },
                AliasAction::Remove {
                    alias: alias.clone(),
                    index: main.clone(),
                },
            ])
            .await?;
        info!(alias = %alias, index = %tmp, "Readers switched to temporary index");

        self.client.delete_index(main).await?;
        self.client.create_index(main, &mapping).await?;

        pipeline
            .sync(main, &DocumentSelector::All, observer, SyncOptions::with_progress())
            .await
    }

    /// Existence, stats and alias bindings of main and tmp
    pub async fn admin_status(&self) -> SearchResult<IndexAdminStatus> {
        let IndexSet { main, alias, tmp } = &self.indices;

        let main_exists = self.client.index_exists(main).await?;
        let tmp_exists = self.client.index_exists(tmp).await?;

        let existing: Vec<String> = [(main, main_exists), (tmp, tmp_exists)]
            .into_iter()
            .filter(|(_, exists)| *exists)
            .map(|(name, _)| name.clone())
            .collect();

        let indices = self.client.index_stats(&existing).await?;
        let aliases = self.client.get_alias(&existing).await?;

        let alias_on_main = aliases
            .get(main)
            .map_or(false, |bound| bound.contains(alias));
        let tmp_aliased = aliases.get(tmp).map_or(false, |bound| !bound.is_empty());

        Ok(IndexAdminStatus {
            main_exists,
            tmp_exists,
            indices,
            aliases,
            is_normalized: main_exists && alias_on_main && !tmp_exists && !tmp_aliased,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::config::SearchConfigBuilder;
    use crate::search::document::IndexedDocument;
    use crate::search::memory::InMemoryCluster;
    use crate::search::observer::{ChannelObserver, NoopObserver};
    use crate::search::source::MemoryContentStore;

    fn setup(documents: usize) -> (Arc<InMemoryCluster>, IndexManager, BulkSyncPipeline) {
        let cluster = Arc::new(InMemoryCluster::v8());
        let manager = IndexManager::new(cluster.clone(), IndexSet::new("pages"));
        let store = MemoryContentStore::with_documents(
            (0..documents).map(|i| IndexedDocument::new(format!("p{}", i), format!("/p/{}", i), "body")),
        );
        let pipeline = BulkSyncPipeline::new(
            cluster.clone(),
            Arc::new(store),
            &SearchConfigBuilder::new().bulk_size(2).build(),
        );
        (cluster, manager, pipeline)
    }

    #[test]
    fn test_index_set_names() {
        let set = IndexSet::new("wiki");
        assert_eq!(set.alias, "wiki-alias");
        assert_eq!(set.tmp, "wiki-tmp");
    }

    #[tokio::test]
    async fn test_normalize_is_idempotent() {
        let (cluster, manager, _pipeline) = setup(0);

        manager.normalize_indices().await.unwrap();
        let first = manager.admin_status().await.unwrap();
        manager.normalize_indices().await.unwrap();
        let second = manager.admin_status().await.unwrap();

        assert!(first.is_normalized);
        assert!(second.is_normalized);
        assert_eq!(cluster.index_names(), vec!["pages"]);
        assert_eq!(cluster.alias_targets("pages-alias"), vec!["pages"]);
    }

    #[tokio::test]
    async fn test_normalize_heals_interrupted_rebuild() {
        let (cluster, manager, _pipeline) = setup(0);
        cluster.create_index("pages", &serde_json::json!({})).await.unwrap();
        cluster.create_index("pages-tmp", &serde_json::json!({})).await.unwrap();
        cluster.put_alias("pages-alias", "pages-tmp").await.unwrap();

        assert!(!manager.admin_status().await.unwrap().is_normalized);

        manager.normalize_indices().await.unwrap();
        let status = manager.admin_status().await.unwrap();
        assert!(status.is_normalized);
        assert!(!status.tmp_exists);
        assert_eq!(cluster.alias_targets("pages-alias"), vec!["pages"]);
    }

    #[tokio::test]
    async fn test_rebuild_leaves_normalized_set() {
        let (cluster, manager, pipeline) = setup(5);
        manager.normalize_indices().await.unwrap();

        let report = manager.rebuild_index(&pipeline, &NoopObserver).await.unwrap();

        assert_eq!(report.processed_count, 5);
        assert_eq!(cluster.index_names(), vec!["pages"]);
        assert_eq!(cluster.alias_targets("pages-alias"), vec!["pages"]);
        assert_eq!(cluster.document_count("pages-alias"), 5);

        let status = manager.admin_status().await.unwrap();
        assert!(status.is_normalized);
        assert_eq!(status.indices["pages"].document_count, 5);
    }

    #[tokio::test]
    async fn test_rebuild_failure_is_reported_then_normalized() {
        let (cluster, manager, pipeline) = setup(3);
        manager.normalize_indices().await.unwrap();
        cluster.set_fail_reindex(true);

        let (observer, mut rx) = ChannelObserver::channel();
        let result = manager.rebuild_index(&pipeline, &observer).await;

        assert!(result.is_err());
        assert!(matches!(rx.try_recv(), Ok(SyncEvent::RebuildFailed { .. })));
        assert!(manager.admin_status().await.unwrap().is_normalized);
        assert_eq!(cluster.index_names(), vec!["pages"]);
    }
}
