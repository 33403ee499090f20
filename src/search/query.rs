//! Search query compilation and result mapping

use crate::search::client::{SearchRequest, SearchResponseBody, TotalRelation};
use crate::search::config::SearchConfig;
use crate::search::document::Grant;
use crate::search::terms::SearchTerms;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

pub const DEFAULT_OFFSET: usize = 0;
pub const DEFAULT_LIMIT: usize = 50;

/// Fields returned in `_source` unless the caller overrides them
pub const DEFAULT_SOURCE_FIELDS: [&str; 7] = [
    "path",
    "bookmark_count",
    "comment_count",
    "seenUsers_count",
    "updated_at",
    "tag_names",
    "comments",
];

const MATCH_FIELDS: [&str; 6] = [
    "path.ja^2",
    "path.en^2",
    "body.ja",
    "body.en",
    "comments.ja",
    "comments.en",
];

const NOT_MATCH_FIELDS: [&str; 6] = [
    "path.ja",
    "path.en",
    "body.ja",
    "body.en",
    "comments.ja",
    "comments.en",
];

// Analyzed base fields, so quoted words are matched as written
const PHRASE_FIELDS: [&str; 3] = ["path.raw^2", "body", "comments"];

/// Sort order for search results
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Ascending,
    #[default]
    Descending,
}

impl SortOrder {
    fn as_str(self) -> &'static str {
        match self {
            SortOrder::Ascending => "asc",
            SortOrder::Descending => "desc",
        }
    }
}

/// Axis to sort by
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, strum::EnumString)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum SortAxis {
    #[default]
    RelationScore,
    CreatedAt,
    UpdatedAt,
}

impl SortAxis {
    fn field(self) -> &'static str {
        match self {
            SortAxis::RelationScore => "_score",
            SortAxis::CreatedAt => "created_at",
            SortAxis::UpdatedAt => "updated_at",
        }
    }
}

/// Pagination, sorting and projection of a search
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchOptions {
    pub offset: Option<usize>,
    pub limit: Option<usize>,
    pub sort: SortAxis,
    pub order: SortOrder,
    /// Overrides [`DEFAULT_SOURCE_FIELDS`]
    pub fields: Option<Vec<String>>,
}

impl SearchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_sort(mut self, sort: SortAxis, order: SortOrder) -> Self {
        self.sort = sort;
        self.order = order;
        self
    }

    pub fn with_fields(mut self, fields: Vec<impl Into<String>>) -> Self {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }
}

/// Identity of the caller for access filtering; anonymous callers pass `None`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewer {
    pub user_id: String,
    /// Resolved memberships, externally sourced groups included
    pub group_ids: Vec<String>,
}

impl Viewer {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            group_ids: Vec::new(),
        }
    }

    pub fn with_groups(mut self, groups: Vec<impl Into<String>>) -> Self {
        self.group_ids = groups.into_iter().map(Into::into).collect();
        self
    }
}

/// List policy for restricted documents
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPolicy {
    pub hide_restricted_by_owner: bool,
    pub hide_restricted_by_group: bool,
}

impl From<&SearchConfig> for AccessPolicy {
    fn from(config: &SearchConfig) -> Self {
        Self {
            hide_restricted_by_owner: config.hide_restricted_by_owner,
            hide_restricted_by_group: config.hide_restricted_by_group,
        }
    }
}

/// One result hit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub score: Option<f64>,
    pub source: Value,
    pub highlight: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchMeta {
    /// Total matching documents (before pagination)
    pub total: u64,
    /// Whether `total` is exact or a lower bound
    pub total_relation: TotalRelation,
    /// Cluster-side execution time in milliseconds
    pub took: u64,
    /// Hits in this page
    pub hits_count: usize,
}

/// Ranked hit list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResults {
    pub meta: SearchMeta,
    pub data: Vec<SearchHit>,
}

impl SearchResults {
    pub fn ids(&self) -> Vec<&str> {
        self.data.iter().map(|hit| hit.id.as_str()).collect()
    }
}

/// Compiles terms, viewer and options into one cluster search request
#[derive(Debug, Clone)]
pub struct QueryCompiler {
    alias: String,
    policy: AccessPolicy,
}

#[derive(Default)]
struct BoolQuery {
    must: Vec<Value>,
    must_not: Vec<Value>,
    filter: Vec<Value>,
}

impl BoolQuery {
    fn into_value(self) -> Value {
        json!({
            "bool": {
                "must": self.must,
                "must_not": self.must_not,
                "filter": self.filter,
            }
        })
    }
}

impl QueryCompiler {
    pub fn new(alias: impl Into<String>, policy: AccessPolicy) -> Self {
        Self {
            alias: alias.into(),
            policy,
        }
    }

    /// Build the request.
    ///
    /// `user_count` normalizes the bookmark popularity boost.
    pub fn compile(
        &self,
        terms: &SearchTerms,
        viewer: Option<&Viewer>,
        options: &SearchOptions,
        user_count: u64,
    ) -> SearchRequest {
        let mut query = BoolQuery::default();
        Self::append_criteria(&mut query, terms);
        query.filter.push(self.access_filter(viewer));

        let fields: Vec<String> = options.fields.clone().unwrap_or_else(|| {
            DEFAULT_SOURCE_FIELDS.iter().map(|f| f.to_string()).collect()
        });

        let body = json!({
            "query": Self::function_score(query.into_value(), user_count),
            "sort": { options.sort.field(): { "order": options.order.as_str() } },
            "from": options.offset.unwrap_or(DEFAULT_OFFSET),
            "size": options.limit.unwrap_or(DEFAULT_LIMIT),
            "_source": fields,
            "highlight": Self::highlight(),
        });

        SearchRequest {
            index: self.alias.clone(),
            body,
        }
    }

    fn append_criteria(query: &mut BoolQuery, terms: &SearchTerms) {
        if !terms.match_.is_empty() {
            query.must.push(json!({
                "multi_match": {
                    "query": terms.match_.join(" "),
                    "type": "most_fields",
                    "fields": MATCH_FIELDS,
                }
            }));
        }

        if !terms.not_match.is_empty() {
            query.must_not.push(json!({
                "multi_match": {
                    "query": terms.not_match.join(" "),
                    "fields": NOT_MATCH_FIELDS,
                    "operator": "or",
                }
            }));
        }

        for phrase in &terms.phrase {
            query.must.push(Self::phrase_query(phrase));
        }

        for phrase in &terms.not_phrase {
            query.must_not.push(Self::phrase_query(phrase));
        }

        if !terms.prefix.is_empty() {
            query.filter.push(json!({
                "bool": { "should": Self::prefix_queries(&terms.prefix) }
            }));
        }

        if !terms.not_prefix.is_empty() {
            query.filter.push(json!({
                "bool": { "must_not": Self::prefix_queries(&terms.not_prefix) }
            }));
        }

        if !terms.tag.is_empty() {
            query.filter.push(json!({
                "bool": { "should": Self::tag_queries(&terms.tag) }
            }));
        }

        if !terms.not_tag.is_empty() {
            query.filter.push(json!({
                "bool": { "must_not": Self::tag_queries(&terms.not_tag) }
            }));
        }
    }

    fn phrase_query(phrase: &str) -> Value {
        json!({
            "multi_match": {
                "query": phrase,
                "type": "phrase",
                "fields": PHRASE_FIELDS,
            }
        })
    }

    fn prefix_queries(paths: &[String]) -> Vec<Value> {
        paths
            .iter()
            .map(|path| json!({ "prefix": { "path.raw": path } }))
            .collect()
    }

    fn tag_queries(tags: &[String]) -> Vec<Value> {
        tags.iter()
            .map(|tag| json!({ "term": { "tag_names": tag } }))
            .collect()
    }

    /// Visibility filter: public, owner-restricted or group-restricted
    pub fn access_filter(&self, viewer: Option<&Viewer>) -> Value {
        let grant_term = |grant: Grant| json!({ "term": { "grant": grant.code() } });

        let mut conditions = vec![grant_term(Grant::Public)];

        if !self.policy.hide_restricted_by_owner {
            conditions.push(grant_term(Grant::SpecifiedUsers));
            conditions.push(grant_term(Grant::OwnerOnly));
        } else if let Some(viewer) = viewer {
            for grant in [Grant::SpecifiedUsers, Grant::OwnerOnly] {
                conditions.push(json!({
                    "bool": {
                        "must": [
                            grant_term(grant),
                            { "term": { "granted_users": viewer.user_id } },
                        ]
                    }
                }));
            }
        }

        if !self.policy.hide_restricted_by_group {
            conditions.push(grant_term(Grant::UserGroup));
        } else if let Some(viewer) = viewer.filter(|v| !v.group_ids.is_empty()) {
            conditions.push(json!({
                "bool": {
                    "must": [
                        grant_term(Grant::UserGroup),
                        { "terms": { "granted_groups": viewer.group_ids } },
                    ]
                }
            }));
        }

        json!({ "bool": { "should": conditions } })
    }

    /// Text relevance plus a log-scaled bookmark popularity term
    fn function_score(query: Value, user_count: u64) -> Value {
        let factor = 10_000.0 / user_count.max(1) as f64;
        json!({
            "function_score": {
                "query": query,
                "field_value_factor": {
                    "field": "bookmark_count",
                    "modifier": "log1p",
                    "factor": factor,
                    "missing": 0,
                },
                "boost_mode": "sum",
            }
        })
    }

    fn highlight() -> Value {
        json!({
            "fragmenter": "simple",
            "pre_tags": ["<em class='highlighted-keyword'>"],
            "post_tags": ["</em>"],
            "fields": {
                "*": { "fragment_size": 40 },
                // path fields are highlighted whole
                "path.*": { "number_of_fragments": 0 },
            },
            // below the index default of 1,000,000 so long bodies are truncated, not rejected
            "max_analyzed_offset": 999_999,
        })
    }
}

/// Map a cluster response onto [`SearchResults`]
pub fn map_response(response: SearchResponseBody) -> SearchResults {
    let (total, total_relation) = match response.hits.total {
        Some(total) => (total.value(), total.relation()),
        None => (response.hits.hits.len() as u64, TotalRelation::Exact),
    };

    let data: Vec<SearchHit> = response
        .hits
        .hits
        .into_iter()
        .map(|hit| SearchHit {
            id: hit.id,
            score: hit.score,
            source: hit.source,
            highlight: hit.highlight,
        })
        .collect();

    SearchResults {
        meta: SearchMeta {
            total,
            total_relation,
            took: response.took,
            hits_count: data.len(),
        },
        data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::terms::TermKey;

    fn compiler(policy: AccessPolicy) -> QueryCompiler {
        QueryCompiler::new("pages-alias", policy)
    }

    fn bool_part(request: &SearchRequest) -> &Value {
        &request.body["query"]["function_score"]["query"]["bool"]
    }

    #[test]
    fn test_envelope_defaults() {
        let request = compiler(AccessPolicy::default()).compile(
            &SearchTerms::new(),
            None,
            &SearchOptions::new(),
            10,
        );

        assert_eq!(request.index, "pages-alias");
        assert_eq!(request.body["from"], 0);
        assert_eq!(request.body["size"], 50);
        assert_eq!(request.body["sort"]["_score"]["order"], "desc");
        assert_eq!(request.body["_source"].as_array().unwrap().len(), 7);
        assert_eq!(request.body["highlight"]["fields"]["path.*"]["number_of_fragments"], 0);
    }

    #[test]
    fn test_options_applied() {
        let options = SearchOptions::new()
            .with_offset(20)
            .with_limit(10)
            .with_sort(SortAxis::UpdatedAt, SortOrder::Ascending)
            .with_fields(vec!["path"]);
        let request = compiler(AccessPolicy::default()).compile(&SearchTerms::new(), None, &options, 1);

        assert_eq!(request.body["from"], 20);
        assert_eq!(request.body["size"], 10);
        assert_eq!(request.body["sort"]["updated_at"]["order"], "asc");
        assert_eq!(request.body["_source"], json!(["path"]));
    }

    #[test]
    fn test_match_terms_joined_and_phrases_separate() {
        let terms = SearchTerms::new()
            .with(TermKey::Match, vec!["alpha", "beta"])
            .with(TermKey::NotMatch, vec!["gamma", "delta"])
            .with(TermKey::Phrase, vec!["one two", "three four"])
            .with(TermKey::NotPhrase, vec!["five six"]);
        let request = compiler(AccessPolicy::default()).compile(&terms, None, &SearchOptions::new(), 1);
        let bool_query = bool_part(&request);

        let must = bool_query["must"].as_array().unwrap();
        assert_eq!(must.len(), 3);
        assert_eq!(must[0]["multi_match"]["query"], "alpha beta");
        assert_eq!(must[0]["multi_match"]["type"], "most_fields");
        assert_eq!(must[0]["multi_match"]["fields"][0], "path.ja^2");
        assert_eq!(must[1]["multi_match"]["query"], "one two");
        assert_eq!(must[2]["multi_match"]["type"], "phrase");

        let must_not = bool_query["must_not"].as_array().unwrap();
        assert_eq!(must_not.len(), 2);
        assert_eq!(must_not[0]["multi_match"]["query"], "gamma delta");
        assert_eq!(must_not[0]["multi_match"]["operator"], "or");
        assert_eq!(must_not[0]["multi_match"]["fields"][0], "path.ja");
        assert_eq!(must_not[1]["multi_match"]["query"], "five six");
    }

    #[test]
    fn test_prefix_and_tag_filters() {
        let terms = SearchTerms::new()
            .with(TermKey::Prefix, vec!["/team/", "/docs/"])
            .with(TermKey::NotPrefix, vec!["/user/"])
            .with(TermKey::Tag, vec!["infra", "ops"])
            .with(TermKey::NotTag, vec!["draft"]);
        let request = compiler(AccessPolicy::default()).compile(&terms, None, &SearchOptions::new(), 1);
        let filter = bool_part(&request)["filter"].as_array().unwrap();

        // four term filters plus the access filter
        assert_eq!(filter.len(), 5);
        assert_eq!(filter[0]["bool"]["should"][1]["prefix"]["path.raw"], "/docs/");
        assert_eq!(filter[1]["bool"]["must_not"][0]["prefix"]["path.raw"], "/user/");
        assert_eq!(filter[2]["bool"]["should"][0]["term"]["tag_names"], "infra");
        assert_eq!(filter[3]["bool"]["must_not"][0]["term"]["tag_names"], "draft");
    }

    #[test]
    fn test_access_filter_open_policy() {
        let filter = compiler(AccessPolicy::default()).access_filter(None);
        let should = filter["bool"]["should"].as_array().unwrap();
        let codes: Vec<u64> = should
            .iter()
            .map(|c| c["term"]["grant"].as_u64().unwrap())
            .collect();
        assert_eq!(codes, vec![1, 3, 4, 5]);
    }

    #[test]
    fn test_access_filter_hidden_policy_anonymous() {
        let policy = AccessPolicy {
            hide_restricted_by_owner: true,
            hide_restricted_by_group: true,
        };
        let filter = compiler(policy).access_filter(None);
        assert_eq!(filter["bool"]["should"], json!([{ "term": { "grant": 1 } }]));
    }

    #[test]
    fn test_access_filter_hidden_policy_viewer() {
        let policy = AccessPolicy {
            hide_restricted_by_owner: true,
            hide_restricted_by_group: true,
        };
        let viewer = Viewer::new("u1").with_groups(vec!["g1", "g2"]);
        let filter = compiler(policy).access_filter(Some(&viewer));
        let should = filter["bool"]["should"].as_array().unwrap();

        assert_eq!(should.len(), 4);
        assert_eq!(should[1]["bool"]["must"][0]["term"]["grant"], 3);
        assert_eq!(should[1]["bool"]["must"][1]["term"]["granted_users"], "u1");
        assert_eq!(should[2]["bool"]["must"][0]["term"]["grant"], 4);
        assert_eq!(should[3]["bool"]["must"][1]["terms"]["granted_groups"], json!(["g1", "g2"]));
    }

    #[test]
    fn test_function_score_normalized_by_user_count() {
        let request = compiler(AccessPolicy::default()).compile(
            &SearchTerms::new(),
            None,
            &SearchOptions::new(),
            0,
        );
        let score = &request.body["query"]["function_score"];
        assert_eq!(score["field_value_factor"]["factor"], 10_000.0);
        assert_eq!(score["field_value_factor"]["modifier"], "log1p");
        assert_eq!(score["boost_mode"], "sum");

        let request = compiler(AccessPolicy::default()).compile(
            &SearchTerms::new(),
            None,
            &SearchOptions::new(),
            100,
        );
        assert_eq!(
            request.body["query"]["function_score"]["field_value_factor"]["factor"],
            100.0
        );
    }

    #[test]
    fn test_map_response() {
        let response: SearchResponseBody = serde_json::from_value(json!({
            "took": 7,
            "hits": {
                "total": { "value": 10000, "relation": "gte" },
                "hits": [
                    {
                        "_id": "p1",
                        "_score": 2.5,
                        "_source": { "path": "/a" },
                        "highlight": { "body": ["<em class='highlighted-keyword'>wiki</em>"] }
                    },
                    { "_id": "p2", "_score": null, "_source": { "path": "/b" } }
                ]
            }
        }))
        .unwrap();

        let results = map_response(response);
        assert_eq!(results.meta.total, 10000);
        assert_eq!(results.meta.total_relation, TotalRelation::LowerBound);
        assert_eq!(results.meta.took, 7);
        assert_eq!(results.meta.hits_count, 2);
        assert_eq!(results.ids(), vec!["p1", "p2"]);
        assert_eq!(results.data[0].highlight["body"].len(), 1);
        assert!(results.data[1].score.is_none());
    }
}
