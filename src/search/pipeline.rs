//! Bulk sync pipeline
//!
//! A spawned producer reads the content store, cuts the stream into batches
//! and attaches tag names; the sink writes each batch with one bulk call. The
//! two halves are joined by a channel holding a single batch, so the cursor
//! never runs more than one batch ahead of the cluster.

use crate::search::client::{BulkOperation, BulkResponse, ClusterClient};
use crate::search::config::SearchConfig;
use crate::search::document::IndexedDocument;
use crate::search::error::{SearchError, SearchResult};
use crate::search::observer::{SyncEvent, SyncObserver};
use crate::search::source::{ContentStore, DocumentSelector};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Per-run switches
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Notify the observer after every batch and at the end
    pub emit_progress: bool,
}

impl SyncOptions {
    pub fn with_progress() -> Self {
        Self {
            emit_progress: true,
        }
    }
}

/// Outcome of one pipeline run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// Documents the selector matched when the run started
    pub total_count: u64,
    /// Documents the cluster accepted
    pub processed_count: u64,
    /// Documents rejected per item or lost to a failed bulk call
    pub error_count: u64,
    /// Bulk calls issued
    pub batch_count: u64,
}

impl SyncReport {
    fn record(&mut self, response: &BulkResponse) {
        self.processed_count += response.success_count() as u64;
        self.error_count += response.error_count() as u64;
    }
}

type SyncBatch = SearchResult<Vec<IndexedDocument>>;

/// Streams documents from a [`ContentStore`] into a cluster index
#[derive(Clone)]
pub struct BulkSyncPipeline {
    client: Arc<dyn ClusterClient>,
    store: Arc<dyn ContentStore>,
    bulk_size: usize,
    max_body_length: usize,
}

impl BulkSyncPipeline {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        store: Arc<dyn ContentStore>,
        config: &SearchConfig,
    ) -> Self {
        Self {
            client,
            store,
            bulk_size: config.bulk_size.max(1),
            max_body_length: config.max_body_length,
        }
    }

    /// Index every document the selector yields into `index`.
    ///
    /// Per-item rejections and failed bulk calls are logged and counted.
    /// Content-store failures stop the run and are returned.
    pub async fn sync(
        &self,
        index: &str,
        selector: &DocumentSelector,
        observer: &dyn SyncObserver,
        options: SyncOptions,
    ) -> SearchResult<SyncReport> {
        let start = Instant::now();
        let mut report = SyncReport {
            total_count: self.store.count(selector).await?,
            ..SyncReport::default()
        };

        let (tx, mut rx) = mpsc::channel::<SyncBatch>(1);
        let producer = self.spawn_producer(selector, tx);
        let doc_type = self.client.protocol().doc_type();

        while let Some(batch) = rx.recv().await {
            let batch = batch?;
            let operations = batch
                .iter()
                .map(|document| document.to_bulk_index(index, doc_type))
                .collect::<SearchResult<Vec<_>>>()?;

            self.write_batch(&operations, &mut report).await;

            if options.emit_progress {
                observer.notify(SyncEvent::AddProgress {
                    total_count: report.total_count,
                    processed_count: report.processed_count,
                });
            }
        }

        producer
            .await
            .map_err(|e| SearchError::Pipeline(format!("producer task failed: {}", e)))?;

        if options.emit_progress {
            observer.notify(SyncEvent::AddFinished {
                total_count: report.total_count,
                processed_count: report.processed_count,
            });
        }

        info!(
            index = %index,
            total = report.total_count,
            processed = report.processed_count,
            errors = report.error_count,
            batches = report.batch_count,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Sync completed"
        );

        Ok(report)
    }

    /// Remove documents by id with one bulk call
    pub async fn delete(&self, index: &str, ids: &[String]) -> SearchResult<SyncReport> {
        let mut report = SyncReport {
            total_count: ids.len() as u64,
            ..SyncReport::default()
        };
        if ids.is_empty() {
            return Ok(report);
        }

        let doc_type = self.client.protocol().doc_type();
        let operations: Vec<BulkOperation> = ids
            .iter()
            .map(|id| BulkOperation::Delete {
                index: index.to_string(),
                doc_type,
                id: id.clone(),
            })
            .collect();

        self.write_batch(&operations, &mut report).await;
        debug!(index = %index, deleted = report.processed_count, "Documents removed");
        Ok(report)
    }

    async fn write_batch(&self, operations: &[BulkOperation], report: &mut SyncReport) {
        report.batch_count += 1;

        match self.client.bulk(operations).await {
            Ok(response) => {
                for item in response.items.iter().filter(|item| item.is_error()) {
                    let result = item.result();
                    warn!(
                        index = %result.index,
                        id = %result.id,
                        status = result.status,
                        error = ?result.error,
                        "Bulk item rejected"
                    );
                }
                report.record(&response);
            }
            Err(e) => {
                error!(
                    error = %e,
                    documents = operations.len(),
                    "Bulk call failed"
                );
                report.error_count += operations.len() as u64;
            }
        }
    }

    /// Source, batcher and enricher, running ahead of the sink by at most one batch
    fn spawn_producer(
        &self,
        selector: &DocumentSelector,
        tx: mpsc::Sender<SyncBatch>,
    ) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let max_body_length = self.max_body_length;
        let mut batches = self.store.stream(selector).chunks(self.bulk_size);

        tokio::spawn(async move {
            while let Some(chunk) = batches.next().await {
                let batch = match chunk
                    .into_iter()
                    .map(|document| {
                        document.map(|mut document| {
                            document.truncate_body(max_body_length);
                            document
                        })
                    })
                    .collect::<SearchResult<Vec<_>>>()
                {
                    Ok(batch) => attach_tags(store.as_ref(), batch).await,
                    Err(e) => Err(e),
                };

                let failed = batch.is_err();
                if tx.send(batch).await.is_err() {
                    debug!("Sync sink closed; producer stopping");
                    return;
                }
                if failed {
                    return;
                }
            }
        })
    }
}

/// One tag lookup for the whole batch
async fn attach_tags(store: &dyn ContentStore, mut batch: Vec<IndexedDocument>) -> SyncBatch {
    let ids: Vec<String> = batch.iter().map(|document| document.id.clone()).collect();
    let mut tags = store.tag_names(&ids).await?;

    for document in batch.iter_mut() {
        if let Some(names) = tags.remove(&document.id) {
            document.tag_names = names.into_iter().collect();
        }
    }
    Ok(batch)
}
