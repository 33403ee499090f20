//! Full-text search indexing and querying against an external search cluster
//!
//! This module keeps a cluster index in step with the content store and
//! answers keyword searches with access control applied:
//!
//! - **Cluster Client**: protocol 7 / 8 adapter behind the [`ClusterClient`] trait
//! - **Query Compiler**: structured terms to one cluster query with access filter and popularity boost
//! - **Index Lifecycle**: normalization, zero-downtime rebuild through an alias swap, admin status
//! - **Bulk Sync**: batched, back-pressured streaming from the content store into the index
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │           Search Service                         │
//! ├─────────────────────────────────────────────────┤
//! │  - search()          - sync hooks (on_*)        │
//! │  - rebuild_index()   - index_admin_status()     │
//! └─────────────────────────────────────────────────┘
//!          │                 │                │
//!          ▼                 ▼                ▼
//! ┌────────────────┐ ┌───────────────┐ ┌──────────────────┐
//! │ Query Compiler │ │ Index Manager │ │ Bulk Sync        │
//! │                │ │ main/alias/tmp│ │ source→batch→    │
//! │                │ │               │ │ enrich→bulk      │
//! └────────────────┘ └───────────────┘ └──────────────────┘
//!                      │
//!                      ▼
//! ┌─────────────────────────────────────────────────┐
//! │      ClusterClient (HTTP or in-memory)           │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use wiki_search_indexer::search::{
//!     MemoryContentStore, NoopObserver, SearchConfig, SearchOptions, SearchService, SearchTerms,
//!     TermKey,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(MemoryContentStore::new());
//!     let service = SearchService::connect(SearchConfig::default(), store, Arc::new(NoopObserver))?;
//!     service.init().await?;
//!
//!     let terms = SearchTerms::new().with(TermKey::Match, vec!["deploy"]);
//!     let results = service.search(&terms, None, &SearchOptions::new()).await?;
//!     println!("Found {} pages", results.meta.total);
//!
//!     Ok(())
//! }
//! ```

mod client;
mod config;
mod document;
mod error;
mod index;
mod mappings;
mod memory;
mod observer;
mod pipeline;
mod query;
mod service;
mod source;
mod terms;

pub use client::{
    to_ndjson, AliasAction, AliasMap, BulkItem, BulkItemResult, BulkOperation, BulkResponse,
    ClusterClient, ClusterHealth, HttpClusterClient, IndexStats, NodeInfo, PluginInfo,
    ProtocolVersion, SearchRequest, SearchResponseBody, TotalHits, TotalRelation,
};
pub use config::{ConnectionInfo, SearchConfig, SearchConfigBuilder, DEFAULT_INDEX_NAME};
pub use document::{ClusterDocument, Grant, IndexedDocument};
pub use error::{SearchError, SearchResult};
pub use index::{IndexAdminStatus, IndexManager, IndexSet};
pub use mappings::{mapping_v7, mapping_v8};
pub use memory::InMemoryCluster;
pub use observer::{ChannelObserver, NoopObserver, SyncEvent, SyncObserver};
pub use pipeline::{BulkSyncPipeline, SyncOptions, SyncReport};
pub use query::{
    map_response, AccessPolicy, QueryCompiler, SearchHit, SearchMeta, SearchOptions,
    SearchResults, SortAxis, SortOrder, Viewer, DEFAULT_LIMIT, DEFAULT_SOURCE_FIELDS,
};
pub use service::{ClusterInfo, SearchService};
pub use source::{ContentStore, DocumentSelector, MemoryContentStore};
pub use terms::{SearchTerms, TermKey};
