//! Indexed document structures and their cluster representation

use crate::search::client::BulkOperation;
use crate::search::error::SearchResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Access-control classification of a document.
///
/// Serialized as the content store's integer code so that the cluster
/// stores the same value the content store does.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(into = "u8", try_from = "u8")]
#[strum(serialize_all = "snake_case")]
pub enum Grant {
    Public,
    Restricted,
    SpecifiedUsers,
    OwnerOnly,
    UserGroup,
}

impl Grant {
    /// Integer code stored in the `grant` field
    pub fn code(self) -> u8 {
        match self {
            Grant::Public => 1,
            Grant::Restricted => 2,
            Grant::SpecifiedUsers => 3,
            Grant::OwnerOnly => 4,
            Grant::UserGroup => 5,
        }
    }

    /// Whether `granted_users` is meaningful for this grant
    pub fn uses_granted_users(self) -> bool {
        matches!(self, Grant::SpecifiedUsers | Grant::OwnerOnly)
    }

    /// Whether `granted_groups` is meaningful for this grant
    pub fn uses_granted_groups(self) -> bool {
        matches!(self, Grant::UserGroup)
    }
}

impl From<Grant> for u8 {
    fn from(grant: Grant) -> Self {
        grant.code()
    }
}

impl TryFrom<u8> for Grant {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(Grant::Public),
            2 => Ok(Grant::Restricted),
            3 => Ok(Grant::SpecifiedUsers),
            4 => Ok(Grant::OwnerOnly),
            5 => Ok(Grant::UserGroup),
            other => Err(format!("unknown grant code {}", other)),
        }
    }
}

/// A content-store record prepared for indexing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedDocument {
    /// Content-store identity, stable across reindex cycles
    pub id: String,

    /// Hierarchical path, e.g. `/team/infra/runbook`
    pub path: String,

    /// Latest revision body; `None` is indexed as an empty string
    #[serde(default)]
    pub body: Option<String>,

    /// Username of the creator
    #[serde(default)]
    pub creator_name: Option<String>,

    /// Comment bodies
    #[serde(default)]
    pub comments: Vec<String>,

    #[serde(default)]
    pub comment_count: u64,

    #[serde(default)]
    pub bookmark_count: u64,

    #[serde(default)]
    pub like_count: u64,

    #[serde(default)]
    pub seen_users_count: u64,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Tag names, attached by the pipeline's enrichment stage
    #[serde(default)]
    pub tag_names: BTreeSet<String>,

    pub grant: Grant,

    #[serde(default)]
    pub granted_user_ids: BTreeSet<String>,

    #[serde(default)]
    pub granted_group_ids: BTreeSet<String>,
}

/// The document body as stored in the cluster
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterDocument {
    pub path: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comments: Option<Vec<String>>,
    pub comment_count: u64,
    pub bookmark_count: u64,
    pub like_count: u64,
    #[serde(rename = "seenUsers_count")]
    pub seen_users_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub tag_names: Vec<String>,
    pub grant: Grant,
    pub granted_users: Vec<String>,
    pub granted_groups: Vec<String>,
}

impl IndexedDocument {
    /// Create a public document with no counters, tags or comments
    pub fn new(id: impl Into<String>, path: impl Into<String>, body: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            path: path.into(),
            body: Some(body.into()),
            creator_name: None,
            comments: Vec::new(),
            comment_count: 0,
            bookmark_count: 0,
            like_count: 0,
            seen_users_count: 0,
            created_at: now,
            updated_at: now,
            tag_names: BTreeSet::new(),
            grant: Grant::Public,
            granted_user_ids: BTreeSet::new(),
            granted_group_ids: BTreeSet::new(),
        }
    }

    pub fn with_grant(mut self, grant: Grant) -> Self {
        self.grant = grant;
        self
    }

    pub fn with_granted_users(mut self, users: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.granted_user_ids = users.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_granted_groups(mut self, groups: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.granted_group_ids = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_bookmark_count(mut self, count: u64) -> Self {
        self.bookmark_count = count;
        self
    }

    pub fn with_comments(mut self, comments: Vec<String>) -> Self {
        self.comment_count = comments.len() as u64;
        self.comments = comments;
        self
    }

    /// Cut the body to at most `max_chars` characters on a char boundary
    pub fn truncate_body(&mut self, max_chars: usize) {
        if let Some(body) = self.body.as_mut() {
            if let Some((byte_index, _)) = body.char_indices().nth(max_chars) {
                body.truncate(byte_index);
            }
        }
    }

    /// Build the cluster-side representation.
    ///
    /// Granted ids are only carried for the grants that use them.
    pub fn to_cluster_document(&self) -> ClusterDocument {
        let granted_users = if self.grant.uses_granted_users() {
            self.granted_user_ids.iter().cloned().collect()
        } else {
            Vec::new()
        };
        let granted_groups = if self.grant.uses_granted_groups() {
            self.granted_group_ids.iter().cloned().collect()
        } else {
            Vec::new()
        };

        ClusterDocument {
            path: self.path.clone(),
            body: self.body.clone().unwrap_or_default(),
            username: self.creator_name.clone(),
            comments: (self.comment_count > 0).then(|| self.comments.clone()),
            comment_count: self.comment_count,
            bookmark_count: self.bookmark_count,
            like_count: self.like_count,
            seen_users_count: self.seen_users_count,
            created_at: self.created_at,
            updated_at: self.updated_at,
            tag_names: self.tag_names.iter().cloned().collect(),
            grant: self.grant,
            granted_users,
            granted_groups,
        }
    }

    /// Bulk `index` command for this document
    pub fn to_bulk_index(
        &self,
        index: &str,
        doc_type: Option<&'static str>,
    ) -> SearchResult<BulkOperation> {
        Ok(BulkOperation::Index {
            index: index.to_string(),
            doc_type,
            id: self.id.clone(),
            document: serde_json::to_value(self.to_cluster_document())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_grant_codes_round_trip_through_serde() {
        let json = serde_json::to_string(&Grant::OwnerOnly).unwrap();
        assert_eq!(json, "4");
        let grant: Grant = serde_json::from_str("5").unwrap();
        assert_eq!(grant, Grant::UserGroup);
        assert!(serde_json::from_str::<Grant>("9").is_err());
    }

    #[test]
    fn test_grant_names() {
        assert_eq!(Grant::SpecifiedUsers.to_string(), "specified_users");
        assert_eq!(Grant::from_str("owner_only").unwrap(), Grant::OwnerOnly);
    }

    #[test]
    fn test_granted_ids_only_for_grants_that_use_them() {
        let doc = IndexedDocument::new("1", "/a", "body")
            .with_grant(Grant::Public)
            .with_granted_users(["u1"])
            .with_granted_groups(["g1"]);
        let cluster = doc.to_cluster_document();
        assert!(cluster.granted_users.is_empty());
        assert!(cluster.granted_groups.is_empty());

        let doc = doc.with_grant(Grant::OwnerOnly);
        let cluster = doc.to_cluster_document();
        assert_eq!(cluster.granted_users, vec!["u1".to_string()]);
        assert!(cluster.granted_groups.is_empty());

        let doc = doc.with_grant(Grant::UserGroup);
        let cluster = doc.to_cluster_document();
        assert!(cluster.granted_users.is_empty());
        assert_eq!(cluster.granted_groups, vec!["g1".to_string()]);
    }

    #[test]
    fn test_missing_body_indexes_as_empty_string() {
        let mut doc = IndexedDocument::new("1", "/a", "");
        doc.body = None;
        assert_eq!(doc.to_cluster_document().body, "");
    }

    #[test]
    fn test_comments_only_when_counted() {
        let doc = IndexedDocument::new("1", "/a", "body");
        let value = serde_json::to_value(doc.to_cluster_document()).unwrap();
        assert!(value.get("comments").is_none());
        assert_eq!(value["seenUsers_count"], 0);

        let doc = doc.with_comments(vec!["looks good".to_string()]);
        let value = serde_json::to_value(doc.to_cluster_document()).unwrap();
        assert_eq!(value["comments"][0], "looks good");
    }

    #[test]
    fn test_truncate_body_respects_char_boundaries() {
        let mut doc = IndexedDocument::new("1", "/a", "日本語のページ");
        doc.truncate_body(3);
        assert_eq!(doc.body.as_deref(), Some("日本語"));

        let mut doc = IndexedDocument::new("1", "/a", "short");
        doc.truncate_body(100);
        assert_eq!(doc.body.as_deref(), Some("short"));
    }
}
