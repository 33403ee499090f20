//! In-process cluster
//!
//! [`InMemoryCluster`] implements [`ClusterClient`] over plain maps and
//! evaluates the subset of the query DSL the compiler emits: `bool`, `term`,
//! `terms`, `prefix`, `multi_match` and `function_score`. Text matching is a
//! case-insensitive substring test; language sub-fields resolve to their base
//! field.

use crate::search::client::{
    AliasAction, AliasMap, BulkItem, BulkItemResult, BulkOperation, BulkResponse, ClusterClient,
    ClusterHealth, HitsEnvelope, IndexStats, NodeInfo, PluginInfo, ProtocolVersion, RawHit,
    SearchRequest, SearchResponseBody, TotalHits, TotalRelation,
};
use crate::search::error::{SearchError, SearchResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Default)]
struct MemoryIndex {
    documents: BTreeMap<String, Value>,
    indexing_total: u64,
}

#[derive(Default)]
struct ClusterState {
    indices: BTreeMap<String, MemoryIndex>,
    /// alias -> bound indices
    aliases: BTreeMap<String, BTreeSet<String>>,
}

impl ClusterState {
    /// Concrete indices behind a name, which may be an alias
    fn resolve(&self, name: &str) -> Vec<String> {
        if self.indices.contains_key(name) {
            vec![name.to_string()]
        } else {
            self.aliases
                .get(name)
                .map(|bound| bound.iter().cloned().collect())
                .unwrap_or_default()
        }
    }

    /// Single write target behind a name
    fn write_target(&self, name: &str) -> Option<String> {
        let resolved = self.resolve(name);
        (resolved.len() == 1).then(|| resolved[0].clone())
    }
}

fn not_found(name: &str) -> SearchError {
    SearchError::Cluster {
        status: 404,
        reason: format!("no such index [{}]", name),
    }
}

/// [`ClusterClient`] keeping every index in memory
pub struct InMemoryCluster {
    protocol: ProtocolVersion,
    state: Mutex<ClusterState>,
    failing_ids: Mutex<HashSet<String>>,
    fail_reindex: AtomicBool,
    bulk_calls: AtomicUsize,
    search_calls: AtomicUsize,
}

impl InMemoryCluster {
    pub fn new(protocol: ProtocolVersion) -> Self {
        Self {
            protocol,
            state: Mutex::new(ClusterState::default()),
            failing_ids: Mutex::new(HashSet::new()),
            fail_reindex: AtomicBool::new(false),
            bulk_calls: AtomicUsize::new(0),
            search_calls: AtomicUsize::new(0),
        }
    }

    pub fn v7() -> Self {
        Self::new(ProtocolVersion::V7)
    }

    pub fn v8() -> Self {
        Self::new(ProtocolVersion::V8)
    }

    /// Reject every later bulk item targeting `id`
    pub fn fail_bulk_item(&self, id: impl Into<String>) {
        self.failing_ids.lock().insert(id.into());
    }

    /// Make reindex calls fail
    pub fn set_fail_reindex(&self, fail: bool) {
        self.fail_reindex.store(fail, Ordering::SeqCst);
    }

    pub fn bulk_call_count(&self) -> usize {
        self.bulk_calls.load(Ordering::SeqCst)
    }

    pub fn search_call_count(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }

    pub fn index_names(&self) -> Vec<String> {
        self.state.lock().indices.keys().cloned().collect()
    }

    /// Indices bound to `alias`
    pub fn alias_targets(&self, alias: &str) -> Vec<String> {
        self.state
            .lock()
            .aliases
            .get(alias)
            .map(|bound| bound.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Documents visible through an index or alias
    pub fn document_count(&self, name: &str) -> usize {
        let state = self.state.lock();
        state
            .resolve(name)
            .iter()
            .filter_map(|index| state.indices.get(index))
            .map(|index| index.documents.len())
            .sum()
    }

    pub fn get_document(&self, name: &str, id: &str) -> Option<Value> {
        let state = self.state.lock();
        state
            .resolve(name)
            .iter()
            .filter_map(|index| state.indices.get(index))
            .find_map(|index| index.documents.get(id).cloned())
    }

    fn apply_operation(&self, state: &mut ClusterState, operation: &BulkOperation) -> BulkItem {
        let (name, id) = match operation {
            BulkOperation::Index { index, id, .. } | BulkOperation::Delete { index, id, .. } => {
                (index.as_str(), id.as_str())
            }
        };
        let mut result = BulkItemResult {
            index: name.to_string(),
            id: id.to_string(),
            status: 200,
            error: None,
        };

        let target = state.write_target(name);
        let failing = self.failing_ids.lock().contains(id);

        match (operation, target) {
            (_, None) => {
                result.status = 404;
                result.error = Some(json!({ "type": "index_not_found_exception", "index": name }));
            }
            (BulkOperation::Index { document, .. }, Some(target)) => {
                if failing {
                    result.status = 400;
                    result.error = Some(json!({ "type": "mapper_parsing_exception" }));
                } else if let Some(index) = state.indices.get_mut(&target) {
                    let created = index.documents.insert(id.to_string(), document.clone()).is_none();
                    index.indexing_total += 1;
                    result.index = target;
                    result.status = if created { 201 } else { 200 };
                }
                return BulkItem::Index(result);
            }
            (BulkOperation::Delete { .. }, Some(target)) => {
                if let Some(index) = state.indices.get_mut(&target) {
                    result.status = if index.documents.remove(id).is_some() { 200 } else { 404 };
                    result.index = target;
                }
            }
        }

        match operation {
            BulkOperation::Index { .. } => BulkItem::Index(result),
            BulkOperation::Delete { .. } => BulkItem::Delete(result),
        }
    }
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    async fn create_index(&self, name: &str, _mapping: &Value) -> SearchResult<()> {
        let mut state = self.state.lock();
        if state.indices.contains_key(name) || state.aliases.contains_key(name) {
            return Err(SearchError::Cluster {
                status: 400,
                reason: format!("index [{}] already exists", name),
            });
        }
        state.indices.insert(name.to_string(), MemoryIndex::default());
        Ok(())
    }

    async fn index_exists(&self, name: &str) -> SearchResult<bool> {
        Ok(self.state.lock().indices.contains_key(name))
    }

    async fn delete_index(&self, name: &str) -> SearchResult<()> {
        let mut state = self.state.lock();
        if state.indices.remove(name).is_none() {
            return Err(not_found(name));
        }
        for bound in state.aliases.values_mut() {
            bound.remove(name);
        }
        state.aliases.retain(|_, bound| !bound.is_empty());
        Ok(())
    }

    async fn get_alias(&self, indices: &[String]) -> SearchResult<AliasMap> {
        let state = self.state.lock();
        let mut map = AliasMap::new();
        for index in indices {
            if !state.indices.contains_key(index) {
                return Err(not_found(index));
            }
            let aliases = state
                .aliases
                .iter()
                .filter(|(_, bound)| bound.contains(index))
                .map(|(alias, _)| alias.clone())
                .collect();
            map.insert(index.clone(), aliases);
        }
        Ok(map)
    }

    async fn alias_exists(&self, alias: &str, index: &str) -> SearchResult<bool> {
        Ok(self
            .state
            .lock()
            .aliases
            .get(alias)
            .map_or(false, |bound| bound.contains(index)))
    }

    async fn put_alias(&self, alias: &str, index: &str) -> SearchResult<()> {
        self.update_aliases(&[AliasAction::Add {
            alias: alias.to_string(),
            index: index.to_string(),
        }])
        .await
    }

    async fn update_aliases(&self, actions: &[AliasAction]) -> SearchResult<()> {
        let mut state = self.state.lock();

        // validate everything first; the update is all-or-nothing
        for action in actions {
            match action {
                AliasAction::Add { alias, index } => {
                    if !state.indices.contains_key(index) {
                        return Err(not_found(index));
                    }
                    if state.indices.contains_key(alias) {
                        return Err(SearchError::Cluster {
                            status: 400,
                            reason: format!("an index exists with the same name as the alias [{}]", alias),
                        });
                    }
                }
                AliasAction::Remove { alias, index } => {
                    let bound = state
                        .aliases
                        .get(alias)
                        .map_or(false, |bound| bound.contains(index));
                    if !bound {
                        return Err(SearchError::Cluster {
                            status: 404,
                            reason: format!("aliases [{}] missing on [{}]", alias, index),
                        });
                    }
                }
            }
        }

        for action in actions {
            match action {
                AliasAction::Add { alias, index } => {
                    state
                        .aliases
                        .entry(alias.clone())
                        .or_default()
                        .insert(index.clone());
                }
                AliasAction::Remove { alias, index } => {
                    if let Some(bound) = state.aliases.get_mut(alias) {
                        bound.remove(index);
                    }
                }
            }
        }
        state.aliases.retain(|_, bound| !bound.is_empty());
        Ok(())
    }

    async fn reindex(&self, source: &str, dest: &str) -> SearchResult<()> {
        if self.fail_reindex.load(Ordering::SeqCst) {
            return Err(SearchError::Cluster {
                status: 500,
                reason: format!("reindex {} -> {} failed", source, dest),
            });
        }

        let mut state = self.state.lock();
        let sources = state.resolve(source);
        if sources.is_empty() {
            return Err(not_found(source));
        }
        let documents: Vec<(String, Value)> = sources
            .iter()
            .filter_map(|name| state.indices.get(name))
            .flat_map(|index| index.documents.iter().map(|(id, doc)| (id.clone(), doc.clone())))
            .collect();

        let target = state.write_target(dest).ok_or_else(|| not_found(dest))?;
        if let Some(index) = state.indices.get_mut(&target) {
            index.indexing_total += documents.len() as u64;
            index.documents.extend(documents);
        }
        Ok(())
    }

    async fn bulk(&self, operations: &[BulkOperation]) -> SearchResult<BulkResponse> {
        if operations.is_empty() {
            return Ok(BulkResponse::default());
        }
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock();
        let items: Vec<BulkItem> = operations
            .iter()
            .map(|operation| self.apply_operation(&mut state, operation))
            .collect();

        Ok(BulkResponse {
            took: 1,
            errors: items.iter().any(BulkItem::is_error),
            items,
        })
    }

    async fn search(&self, request: &SearchRequest) -> SearchResult<SearchResponseBody> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);

        let state = self.state.lock();
        let indices = state.resolve(&request.index);
        if indices.is_empty() {
            return Err(not_found(&request.index));
        }

        let body = &request.body;
        let query = body.get("query").cloned().unwrap_or_else(|| json!({ "match_all": {} }));

        let mut scored: Vec<(String, f64, &Value)> = indices
            .iter()
            .filter_map(|name| state.indices.get(name))
            .flat_map(|index| index.documents.iter())
            .filter_map(|(id, doc)| evaluate(&query, doc).map(|score| (id.clone(), score, doc)))
            .collect();

        sort_hits(&mut scored, body.get("sort"));

        let total = scored.len() as u64;
        let from = body["from"].as_u64().unwrap_or(0) as usize;
        let size = body["size"].as_u64().unwrap_or(10) as usize;
        let fields: Option<Vec<&str>> = body["_source"]
            .as_array()
            .map(|fields| fields.iter().filter_map(Value::as_str).collect());

        let hits = scored
            .into_iter()
            .skip(from)
            .take(size)
            .map(|(id, score, doc)| RawHit {
                id,
                score: Some(score),
                source: project(doc, fields.as_deref()),
                highlight: BTreeMap::new(),
            })
            .collect();

        Ok(SearchResponseBody {
            took: 1,
            hits: HitsEnvelope {
                total: Some(TotalHits::Tracked {
                    value: total,
                    relation: TotalRelation::Exact,
                }),
                hits,
            },
        })
    }

    async fn index_stats(&self, indices: &[String]) -> SearchResult<BTreeMap<String, IndexStats>> {
        let state = self.state.lock();
        let mut stats = BTreeMap::new();
        for name in indices {
            let index = state.indices.get(name).ok_or_else(|| not_found(name))?;
            let store_size_bytes = index
                .documents
                .values()
                .map(|doc| doc.to_string().len() as u64)
                .sum();
            stats.insert(
                name.clone(),
                IndexStats {
                    document_count: index.documents.len() as u64,
                    store_size_bytes,
                    indexing_total: index.indexing_total,
                },
            );
        }
        Ok(stats)
    }

    async fn nodes_info(&self) -> SearchResult<BTreeMap<String, NodeInfo>> {
        let version = match self.protocol {
            ProtocolVersion::V7 => "7.17.0",
            ProtocolVersion::V8 => "8.11.0",
        };
        let plugins = ["analysis-icu", "analysis-kuromoji"]
            .iter()
            .map(|name| PluginInfo {
                name: name.to_string(),
                version: version.to_string(),
            })
            .collect();

        let mut nodes = BTreeMap::new();
        nodes.insert(
            "memory-0".to_string(),
            NodeInfo {
                name: "memory-node".to_string(),
                version: version.to_string(),
                plugins,
            },
        );
        Ok(nodes)
    }

    async fn cluster_health(&self) -> SearchResult<ClusterHealth> {
        Ok(ClusterHealth {
            cluster_name: "in-memory".to_string(),
            status: "green".to_string(),
            timed_out: false,
            number_of_nodes: 1,
            number_of_data_nodes: 1,
            active_shards: self.state.lock().indices.len() as u64,
            unassigned_shards: 0,
        })
    }
}

/// Score of `doc` under `query`, or `None` when it does not match
fn evaluate(query: &Value, doc: &Value) -> Option<f64> {
    let (kind, clause) = query.as_object()?.iter().next()?;

    match kind.as_str() {
        "match_all" => Some(1.0),
        "bool" => evaluate_bool(clause, doc),
        "function_score" => {
            let score = evaluate(&clause["query"], doc)?;
            let factor = &clause["field_value_factor"];
            let boost = match factor["field"].as_str() {
                Some(field) => {
                    let value = doc[field].as_f64().or_else(|| factor["missing"].as_f64()).unwrap_or(0.0);
                    let scaled = value * factor["factor"].as_f64().unwrap_or(1.0);
                    match factor["modifier"].as_str() {
                        Some("log1p") => (1.0 + scaled).log10(),
                        _ => scaled,
                    }
                }
                None => 0.0,
            };
            Some(score + boost)
        }
        "term" => {
            let (field, expected) = clause.as_object()?.iter().next()?;
            field_values(doc, field)
                .iter()
                .any(|value| value == expected)
                .then_some(1.0)
        }
        "terms" => {
            let (field, expected) = clause.as_object()?.iter().next()?;
            let expected = expected.as_array()?;
            field_values(doc, field)
                .iter()
                .any(|value| expected.contains(value))
                .then_some(1.0)
        }
        "prefix" => {
            let (field, prefix) = clause.as_object()?.iter().next()?;
            let prefix = prefix.as_str()?;
            field_values(doc, base_field(field))
                .iter()
                .filter_map(Value::as_str)
                .any(|value| value.starts_with(prefix))
                .then_some(1.0)
        }
        "multi_match" => evaluate_multi_match(clause, doc),
        _ => None,
    }
}

fn evaluate_bool(clause: &Value, doc: &Value) -> Option<f64> {
    let list = |key: &str| clause[key].as_array().cloned().unwrap_or_default();
    let (must, filter, should, must_not) = (list("must"), list("filter"), list("should"), list("must_not"));

    let mut score = 0.0;
    for query in &must {
        score += evaluate(query, doc)?;
    }
    for query in &filter {
        evaluate(query, doc)?;
    }
    if must_not.iter().any(|query| evaluate(query, doc).is_some()) {
        return None;
    }

    let should_scores: Vec<f64> = should.iter().filter_map(|query| evaluate(query, doc)).collect();
    if must.is_empty() && filter.is_empty() && !should.is_empty() && should_scores.is_empty() {
        return None;
    }
    Some(score + should_scores.iter().sum::<f64>())
}

fn evaluate_multi_match(clause: &Value, doc: &Value) -> Option<f64> {
    let query = clause["query"].as_str()?.to_lowercase();
    let phrase = clause["type"].as_str() == Some("phrase");
    let tokens: Vec<&str> = query.split_whitespace().collect();

    let mut score = 0.0;
    for field in clause["fields"].as_array()?.iter().filter_map(Value::as_str) {
        let (name, boost) = match field.split_once('^') {
            Some((name, boost)) => (name, boost.parse::<f64>().unwrap_or(1.0)),
            None => (field, 1.0),
        };
        let text = field_values(doc, base_field(name))
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join("\n");

        let hits = if phrase {
            usize::from(!query.is_empty() && text.contains(query.as_str()))
        } else {
            tokens.iter().filter(|token| text.contains(**token)).count()
        };
        score += hits as f64 * boost;
    }

    (score > 0.0).then_some(score)
}

/// `path.ja` -> `path`
fn base_field(field: &str) -> &str {
    field.split('.').next().unwrap_or(field)
}

/// A field's values, flattening arrays
fn field_values(doc: &Value, field: &str) -> Vec<Value> {
    match doc.get(field) {
        Some(Value::Array(values)) => values.clone(),
        Some(Value::Null) | None => Vec::new(),
        Some(value) => vec![value.clone()],
    }
}

fn sort_hits(hits: &mut [(String, f64, &Value)], sort: Option<&Value>) {
    let (field, descending) = sort
        .and_then(Value::as_object)
        .and_then(|sort| sort.iter().next())
        .map(|(field, spec)| (field.clone(), spec["order"].as_str() != Some("asc")))
        .unwrap_or_else(|| ("_score".to_string(), true));

    hits.sort_by(|a, b| {
        let ordering = if field == "_score" {
            a.1.partial_cmp(&b.1).unwrap_or(CmpOrdering::Equal)
        } else {
            compare_values(&a.2[field.as_str()], &b.2[field.as_str()])
        };
        let ordering = if descending { ordering.reverse() } else { ordering };
        ordering.then_with(|| a.0.cmp(&b.0))
    });
}

fn compare_values(a: &Value, b: &Value) -> CmpOrdering {
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(CmpOrdering::Equal),
        _ => a.as_str().unwrap_or_default().cmp(b.as_str().unwrap_or_default()),
    }
}

fn project(doc: &Value, fields: Option<&[&str]>) -> Value {
    match (fields, doc.as_object()) {
        (Some(fields), Some(object)) => Value::Object(
            object
                .iter()
                .filter(|(key, _)| fields.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        ),
        _ => doc.clone(),
    }
}
