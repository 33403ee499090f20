//! Index mapping documents, one per supported protocol generation

use serde_json::{json, Value};

/// Dimensions reserved for the (disabled) embedding field
const EMBEDDING_DIMS: u32 = 1536;

/// Mapping for protocol version 7 clusters
pub fn mapping_v7() -> Value {
    build_mapping(json!({
        "type": "dense_vector",
        "dims": EMBEDDING_DIMS,
    }))
}

/// Mapping for protocol version 8 clusters.
///
/// Version 8 dense vectors must declare indexing and similarity explicitly.
pub fn mapping_v8() -> Value {
    build_mapping(json!({
        "type": "dense_vector",
        "dims": EMBEDDING_DIMS,
        "index": true,
        "similarity": "cosine",
    }))
}

fn text_with_language_fields() -> Value {
    json!({
        "type": "text",
        "fields": {
            "ja": {
                "type": "text",
                "analyzer": "japanese",
            },
            "en": {
                "type": "text",
                "analyzer": "english_edge_ngram",
                "search_analyzer": "standard",
            },
        },
    })
}

fn build_mapping(embedding_field: Value) -> Value {
    let mut path = text_with_language_fields();
    path["fields"]["raw"] = json!({ "type": "keyword" });

    json!({
        "settings": {
            "analysis": {
                "filter": {
                    "english_stop": {
                        "type": "stop",
                        "stopwords": "_english_",
                    },
                },
                "tokenizer": {
                    "edge_ngram_tokenizer": {
                        "type": "edge_ngram",
                        "min_gram": 2,
                        "max_gram": 20,
                        "token_chars": ["letter", "digit"],
                    },
                },
                "analyzer": {
                    "japanese": {
                        "tokenizer": "kuromoji_tokenizer",
                        "char_filter": ["icu_normalizer"],
                        "filter": [
                            "kuromoji_baseform",
                            "kuromoji_part_of_speech",
                            "ja_stop",
                            "kuromoji_number",
                            "kuromoji_stemmer",
                        ],
                    },
                    "english_edge_ngram": {
                        "tokenizer": "edge_ngram_tokenizer",
                        "filter": ["lowercase", "english_stop"],
                    },
                },
            },
        },
        "mappings": {
            "properties": {
                "path": path,
                "body": text_with_language_fields(),
                "body_embedded": embedding_field,
                "comments": text_with_language_fields(),
                "username": { "type": "keyword" },
                "comment_count": { "type": "integer" },
                "bookmark_count": { "type": "integer" },
                "like_count": { "type": "integer" },
                "seenUsers_count": { "type": "integer" },
                "created_at": { "type": "date", "format": "date_optional_time" },
                "updated_at": { "type": "date", "format": "date_optional_time" },
                "tag_names": { "type": "keyword" },
                "grant": { "type": "integer" },
                "granted_users": { "type": "keyword" },
                "granted_groups": { "type": "keyword" },
            },
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mappings_share_searchable_fields() {
        for mapping in [mapping_v7(), mapping_v8()] {
            let properties = &mapping["mappings"]["properties"];
            assert_eq!(properties["path"]["fields"]["raw"]["type"], "keyword");
            assert_eq!(properties["body"]["fields"]["ja"]["analyzer"], "japanese");
            assert_eq!(properties["tag_names"]["type"], "keyword");
            assert_eq!(properties["grant"]["type"], "integer");
        }
    }

    #[test]
    fn test_embedding_field_differs_by_version() {
        assert!(mapping_v7()["mappings"]["properties"]["body_embedded"]
            .get("similarity")
            .is_none());
        assert_eq!(
            mapping_v8()["mappings"]["properties"]["body_embedded"]["similarity"],
            "cosine"
        );
    }
}
