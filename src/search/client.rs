//! Cluster client adapter
//!
//! [`ClusterClient`] is the only seam through which the rest of the search
//! subsystem talks to the cluster. The protocol generation is fixed when a
//! client is constructed; callers never branch on it.

use crate::search::config::SearchConfig;
use crate::search::error::{SearchError, SearchResult};
use crate::search::mappings;
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Supported cluster protocol generations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum ProtocolVersion {
    #[strum(serialize = "7")]
    V7,
    #[strum(serialize = "8")]
    V8,
}

impl ProtocolVersion {
    /// Document-type marker carried in bulk commands (version 7 only)
    pub fn doc_type(self) -> Option<&'static str> {
        match self {
            ProtocolVersion::V7 => Some("_doc"),
            ProtocolVersion::V8 => None,
        }
    }

    /// Index mapping document for this generation
    pub fn mapping(self) -> Value {
        match self {
            ProtocolVersion::V7 => mappings::mapping_v7(),
            ProtocolVersion::V8 => mappings::mapping_v8(),
        }
    }
}

impl TryFrom<u8> for ProtocolVersion {
    type Error = SearchError;

    fn try_from(version: u8) -> Result<Self, Self::Error> {
        match version {
            7 => Ok(ProtocolVersion::V7),
            8 => Ok(ProtocolVersion::V8),
            other => Err(SearchError::InvalidConfiguration(format!(
                "Unsupported cluster protocol version {}; expected 7 or 8",
                other
            ))),
        }
    }
}

/// One action of an atomic alias update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AliasAction {
    Add { alias: String, index: String },
    Remove { alias: String, index: String },
}

/// Index name -> aliases bound to it
pub type AliasMap = BTreeMap<String, BTreeSet<String>>;

/// A single bulk command
#[derive(Debug, Clone, PartialEq)]
pub enum BulkOperation {
    Index {
        index: String,
        doc_type: Option<&'static str>,
        id: String,
        document: Value,
    },
    Delete {
        index: String,
        doc_type: Option<&'static str>,
        id: String,
    },
}

impl BulkOperation {
    /// Document id targeted by the command
    pub fn id(&self) -> &str {
        match self {
            BulkOperation::Index { id, .. } | BulkOperation::Delete { id, .. } => id,
        }
    }

    /// The action line, e.g. `{"index": {"_index": "pages", "_id": "1"}}`
    pub fn command_line(&self) -> Value {
        let (action, index, doc_type, id) = match self {
            BulkOperation::Index {
                index, doc_type, id, ..
            } => ("index", index, doc_type, id),
            BulkOperation::Delete {
                index, doc_type, id,
            } => ("delete", index, doc_type, id),
        };

        let mut meta = json!({ "_index": index, "_id": id });
        if let Some(doc_type) = doc_type {
            meta["_type"] = json!(doc_type);
        }
        json!({ action: meta })
    }

    /// The source line following an `index` action
    pub fn source(&self) -> Option<&Value> {
        match self {
            BulkOperation::Index { document, .. } => Some(document),
            BulkOperation::Delete { .. } => None,
        }
    }
}

/// Serialize bulk commands as newline-delimited JSON
pub fn to_ndjson(operations: &[BulkOperation]) -> SearchResult<String> {
    let mut body = String::new();
    for operation in operations {
        body.push_str(&serde_json::to_string(&operation.command_line())?);
        body.push('\n');
        if let Some(source) = operation.source() {
            body.push_str(&serde_json::to_string(source)?);
            body.push('\n');
        }
    }
    Ok(body)
}

/// Per-item outcome inside a bulk response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkItemResult {
    #[serde(rename = "_index", default)]
    pub index: String,

    #[serde(rename = "_id", default)]
    pub id: String,

    #[serde(default)]
    pub status: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

/// One entry of a bulk response's `items`, keyed by action
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkItem {
    Index(BulkItemResult),
    Create(BulkItemResult),
    Update(BulkItemResult),
    Delete(BulkItemResult),
}

impl BulkItem {
    pub fn result(&self) -> &BulkItemResult {
        match self {
            BulkItem::Index(r) | BulkItem::Create(r) | BulkItem::Update(r) | BulkItem::Delete(r) => r,
        }
    }

    pub fn is_error(&self) -> bool {
        self.result().error.is_some()
    }
}

/// `{items, errors, took}` returned by a bulk call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkResponse {
    #[serde(default)]
    pub took: u64,

    #[serde(default)]
    pub errors: bool,

    #[serde(default)]
    pub items: Vec<BulkItem>,
}

impl BulkResponse {
    pub fn error_count(&self) -> usize {
        self.items.iter().filter(|item| item.is_error()).count()
    }

    pub fn success_count(&self) -> usize {
        self.items.len() - self.error_count()
    }
}

/// A search call against one index or alias
#[derive(Debug, Clone, Serialize)]
pub struct SearchRequest {
    pub index: String,
    pub body: Value,
}

/// How precise a reported hit total is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TotalRelation {
    #[serde(rename = "eq")]
    Exact,
    #[serde(rename = "gte")]
    LowerBound,
}

/// Hit total, either the tracked object form or a bare legacy number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TotalHits {
    Tracked { value: u64, relation: TotalRelation },
    Legacy(u64),
}

impl TotalHits {
    pub fn value(&self) -> u64 {
        match self {
            TotalHits::Tracked { value, .. } | TotalHits::Legacy(value) => *value,
        }
    }

    pub fn relation(&self) -> TotalRelation {
        match self {
            TotalHits::Tracked { relation, .. } => *relation,
            TotalHits::Legacy(_) => TotalRelation::Exact,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawHit {
    #[serde(rename = "_id")]
    pub id: String,

    #[serde(rename = "_score", default)]
    pub score: Option<f64>,

    #[serde(rename = "_source", default)]
    pub source: Value,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub highlight: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HitsEnvelope {
    #[serde(default)]
    pub total: Option<TotalHits>,

    #[serde(default)]
    pub hits: Vec<RawHit>,
}

/// `{took, hits: {total, hits}}` returned by a search call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponseBody {
    #[serde(default)]
    pub took: u64,

    pub hits: HitsEnvelope,
}

/// Document and storage statistics for one physical index
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    /// Documents in primary shards
    pub document_count: u64,

    /// Primary store size in bytes
    pub store_size_bytes: u64,

    /// Index operations performed on primary shards
    pub indexing_total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub plugins: Vec<PluginInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterHealth {
    pub cluster_name: String,
    pub status: String,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub number_of_nodes: u64,
    #[serde(default)]
    pub number_of_data_nodes: u64,
    #[serde(default)]
    pub active_shards: u64,
    #[serde(default)]
    pub unassigned_shards: u64,
}

/// Index, alias, bulk and search operations against a search cluster.
///
/// Every call is a single request bounded by the configured timeout; retry
/// policy belongs to the caller.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Protocol generation selected at construction
    fn protocol(&self) -> ProtocolVersion;

    async fn create_index(&self, name: &str, mapping: &Value) -> SearchResult<()>;

    async fn index_exists(&self, name: &str) -> SearchResult<bool>;

    async fn delete_index(&self, name: &str) -> SearchResult<()>;

    /// Aliases bound to each of the given (existing) indices
    async fn get_alias(&self, indices: &[String]) -> SearchResult<AliasMap>;

    async fn alias_exists(&self, alias: &str, index: &str) -> SearchResult<bool>;

    async fn put_alias(&self, alias: &str, index: &str) -> SearchResult<()>;

    /// Apply all actions in one atomic call
    async fn update_aliases(&self, actions: &[AliasAction]) -> SearchResult<()>;

    /// Server-side copy of every document from `source` into `dest`
    async fn reindex(&self, source: &str, dest: &str) -> SearchResult<()>;

    async fn bulk(&self, operations: &[BulkOperation]) -> SearchResult<BulkResponse>;

    async fn search(&self, request: &SearchRequest) -> SearchResult<SearchResponseBody>;

    async fn index_stats(&self, indices: &[String]) -> SearchResult<BTreeMap<String, IndexStats>>;

    /// Node id -> node description
    async fn nodes_info(&self) -> SearchResult<BTreeMap<String, NodeInfo>>;

    async fn cluster_health(&self) -> SearchResult<ClusterHealth>;
}

/// [`ClusterClient`] speaking the cluster's REST API over HTTP
#[derive(Clone)]
pub struct HttpClusterClient {
    client: Client,
    host: String,
    auth: Option<(String, String)>,
    protocol: ProtocolVersion,
}

impl HttpClusterClient {
    /// Create a client; fails on an unsupported protocol version or bad URI
    pub fn new(config: &SearchConfig) -> SearchResult<Self> {
        let protocol = ProtocolVersion::try_from(config.protocol_version)?;
        let connection = config.connection_info()?;

        let client = Client::builder()
            .timeout(config.request_timeout())
            .danger_accept_invalid_certs(!config.reject_unauthorized)
            .build()
            .map_err(|e| {
                SearchError::InvalidConfiguration(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            host: connection.host,
            auth: connection.auth,
            protocol,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}/{}", self.host, path.trim_start_matches('/')))
            .header("User-Agent", "wiki-search-indexer/1.0");

        match &self.auth {
            Some((username, password)) => builder.basic_auth(username, Some(password)),
            None => builder,
        }
    }

    /// Send and turn non-2xx responses into `SearchError::Cluster`
    async fn send(&self, builder: RequestBuilder) -> SearchResult<Response> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let reason = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v["error"]["reason"].as_str().map(str::to_string))
            .unwrap_or(body);

        Err(SearchError::Cluster {
            status: status.as_u16(),
            reason,
        })
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> SearchResult<T> {
        let response = self.send(builder).await?;
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// HEAD request answering 200 / 404
    async fn exists(&self, path: &str) -> SearchResult<bool> {
        let response = self.request(Method::HEAD, path).send().await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(SearchError::Cluster {
                status: status.as_u16(),
                reason: format!("unexpected status for HEAD /{}", path),
            }),
        }
    }
}

#[derive(Deserialize)]
struct AliasEntry {
    #[serde(default)]
    aliases: BTreeMap<String, Value>,
}

#[derive(Deserialize)]
struct NodesEnvelope {
    #[serde(default)]
    nodes: BTreeMap<String, NodeInfo>,
}

#[async_trait]
impl ClusterClient for HttpClusterClient {
    fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    async fn create_index(&self, name: &str, mapping: &Value) -> SearchResult<()> {
        debug!(index = %name, "Creating index");
        self.send(self.request(Method::PUT, name).json(mapping)).await?;
        Ok(())
    }

    async fn index_exists(&self, name: &str) -> SearchResult<bool> {
        self.exists(name).await
    }

    async fn delete_index(&self, name: &str) -> SearchResult<()> {
        debug!(index = %name, "Deleting index");
        self.send(self.request(Method::DELETE, name)).await?;
        Ok(())
    }

    async fn get_alias(&self, indices: &[String]) -> SearchResult<AliasMap> {
        if indices.is_empty() {
            return Ok(AliasMap::new());
        }
        let path = format!("{}/_alias", indices.join(","));
        let entries: BTreeMap<String, AliasEntry> =
            self.send_json(self.request(Method::GET, &path)).await?;

        Ok(entries
            .into_iter()
            .map(|(index, entry)| (index, entry.aliases.into_keys().collect()))
            .collect())
    }

    async fn alias_exists(&self, alias: &str, index: &str) -> SearchResult<bool> {
        self.exists(&format!("{}/_alias/{}", index, alias)).await
    }

    async fn put_alias(&self, alias: &str, index: &str) -> SearchResult<()> {
        debug!(alias = %alias, index = %index, "Binding alias");
        self.send(self.request(Method::PUT, &format!("{}/_alias/{}", index, alias)))
            .await?;
        Ok(())
    }

    async fn update_aliases(&self, actions: &[AliasAction]) -> SearchResult<()> {
        debug!(actions = actions.len(), "Updating aliases");
        self.send(
            self.request(Method::POST, "_aliases")
                .json(&json!({ "actions": actions })),
        )
        .await?;
        Ok(())
    }

    async fn reindex(&self, source: &str, dest: &str) -> SearchResult<()> {
        let body = json!({
            "source": { "index": source },
            "dest": { "index": dest },
        });
        let response: Value = self
            .send_json(
                self.request(Method::POST, "_reindex?wait_for_completion=true")
                    .json(&body),
            )
            .await?;

        match response["failures"].as_array() {
            Some(failures) if !failures.is_empty() => Err(SearchError::Cluster {
                status: 500,
                reason: format!("reindex {} -> {} reported {} failures", source, dest, failures.len()),
            }),
            _ => Ok(()),
        }
    }

    async fn bulk(&self, operations: &[BulkOperation]) -> SearchResult<BulkResponse> {
        if operations.is_empty() {
            return Ok(BulkResponse::default());
        }
        let body = to_ndjson(operations)?;
        self.send_json(
            self.request(Method::POST, "_bulk")
                .header("Content-Type", "application/x-ndjson")
                .body(body),
        )
        .await
    }

    async fn search(&self, request: &SearchRequest) -> SearchResult<SearchResponseBody> {
        self.send_json(
            self.request(Method::POST, &format!("{}/_search", request.index))
                .json(&request.body),
        )
        .await
    }

    async fn index_stats(&self, indices: &[String]) -> SearchResult<BTreeMap<String, IndexStats>> {
        if indices.is_empty() {
            return Ok(BTreeMap::new());
        }
        let path = format!("{}/_stats/docs,store,indexing", indices.join(","));
        let response: Value = self.send_json(self.request(Method::GET, &path)).await?;

        let mut stats = BTreeMap::new();
        if let Some(entries) = response["indices"].as_object() {
            for (name, entry) in entries {
                let primaries = &entry["primaries"];
                stats.insert(
                    name.clone(),
                    IndexStats {
                        document_count: primaries["docs"]["count"].as_u64().unwrap_or(0),
                        store_size_bytes: primaries["store"]["size_in_bytes"].as_u64().unwrap_or(0),
                        indexing_total: primaries["indexing"]["index_total"].as_u64().unwrap_or(0),
                    },
                );
            }
        } else {
            warn!(path = %path, "Stats response carried no indices");
        }
        Ok(stats)
    }

    async fn nodes_info(&self) -> SearchResult<BTreeMap<String, NodeInfo>> {
        let envelope: NodesEnvelope = self.send_json(self.request(Method::GET, "_nodes")).await?;
        Ok(envelope.nodes)
    }

    async fn cluster_health(&self) -> SearchResult<ClusterHealth> {
        self.send_json(self.request(Method::GET, "_cluster/health"))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::config::SearchConfigBuilder;

    #[test]
    fn test_protocol_version_selection() {
        assert_eq!(ProtocolVersion::try_from(7).unwrap(), ProtocolVersion::V7);
        assert_eq!(ProtocolVersion::try_from(8).unwrap(), ProtocolVersion::V8);
        assert!(matches!(
            ProtocolVersion::try_from(6),
            Err(SearchError::InvalidConfiguration(_))
        ));

        assert_eq!(ProtocolVersion::V7.doc_type(), Some("_doc"));
        assert_eq!(ProtocolVersion::V8.doc_type(), None);
    }

    #[test]
    fn test_client_construction_fails_fast() {
        let config = SearchConfigBuilder::new().protocol_version(9).build();
        assert!(HttpClusterClient::new(&config).is_err());

        let config = SearchConfigBuilder::new().uri("::::").build();
        assert!(HttpClusterClient::new(&config).is_err());

        let config = SearchConfigBuilder::new().protocol_version(7).build();
        let client = HttpClusterClient::new(&config).unwrap();
        assert_eq!(client.protocol(), ProtocolVersion::V7);
    }

    #[test]
    fn test_bulk_ndjson_layout() {
        let operations = vec![
            BulkOperation::Index {
                index: "pages".to_string(),
                doc_type: Some("_doc"),
                id: "1".to_string(),
                document: json!({ "path": "/a" }),
            },
            BulkOperation::Delete {
                index: "pages".to_string(),
                doc_type: None,
                id: "2".to_string(),
            },
        ];

        let body = to_ndjson(&operations).unwrap();
        let lines: Vec<Value> = body
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["index"]["_type"], "_doc");
        assert_eq!(lines[0]["index"]["_id"], "1");
        assert_eq!(lines[1]["path"], "/a");
        assert_eq!(lines[2]["delete"]["_id"], "2");
        assert!(lines[2]["delete"].get("_type").is_none());
        assert!(body.ends_with('\n'));
    }

    #[test]
    fn test_alias_actions_wire_shape() {
        let actions = vec![
            AliasAction::Add {
                alias: "pages-alias".to_string(),
                index: "pages-tmp".to_string(),
            },
            AliasAction::Remove {
                alias: "pages-alias".to_string(),
                index: "pages".to_string(),
            },
        ];
        let value = json!({ "actions": actions });
        assert_eq!(value["actions"][0]["add"]["index"], "pages-tmp");
        assert_eq!(value["actions"][1]["remove"]["index"], "pages");
    }

    #[test]
    fn test_total_hits_forms() {
        let tracked: TotalHits = serde_json::from_value(json!({ "value": 10000, "relation": "gte" })).unwrap();
        assert_eq!(tracked.value(), 10000);
        assert_eq!(tracked.relation(), TotalRelation::LowerBound);

        let legacy: TotalHits = serde_json::from_value(json!(42)).unwrap();
        assert_eq!(legacy.value(), 42);
        assert_eq!(legacy.relation(), TotalRelation::Exact);
    }

    #[test]
    fn test_bulk_response_counts() {
        let response: BulkResponse = serde_json::from_value(json!({
            "took": 3,
            "errors": true,
            "items": [
                { "index": { "_index": "pages", "_id": "1", "status": 201 } },
                { "index": { "_index": "pages", "_id": "2", "status": 400,
                    "error": { "type": "mapper_parsing_exception" } } },
                { "delete": { "_index": "pages", "_id": "3", "status": 404 } }
            ]
        }))
        .unwrap();

        assert_eq!(response.error_count(), 1);
        assert_eq!(response.success_count(), 2);
    }
}
