//! Normalized search terms and their validation

use crate::search::error::{SearchError, SearchResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The eight supported term categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum TermKey {
    Match,
    NotMatch,
    Phrase,
    NotPhrase,
    Prefix,
    NotPrefix,
    Tag,
    NotTag,
}

impl TermKey {
    /// Resolve a payload key, accepting snake_case and camelCase spellings
    pub fn parse(key: &str) -> Option<Self> {
        match key {
            "match" => Some(TermKey::Match),
            "not_match" | "notMatch" => Some(TermKey::NotMatch),
            "phrase" => Some(TermKey::Phrase),
            "not_phrase" | "notPhrase" => Some(TermKey::NotPhrase),
            "prefix" => Some(TermKey::Prefix),
            "not_prefix" | "notPrefix" => Some(TermKey::NotPrefix),
            "tag" => Some(TermKey::Tag),
            "not_tag" | "notTag" => Some(TermKey::NotTag),
            _ => None,
        }
    }
}

/// Keywords grouped by category, each list in the order the user wrote them.
///
/// Deserialization goes through [`SearchTerms::from_json`], so unknown keys
/// are rejected there too.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "Value")]
pub struct SearchTerms {
    #[serde(rename = "match")]
    pub match_: Vec<String>,
    pub not_match: Vec<String>,
    pub phrase: Vec<String>,
    pub not_phrase: Vec<String>,
    pub prefix: Vec<String>,
    pub not_prefix: Vec<String>,
    pub tag: Vec<String>,
    pub not_tag: Vec<String>,
}

impl TryFrom<Value> for SearchTerms {
    type Error = SearchError;

    fn try_from(payload: Value) -> Result<Self, Self::Error> {
        Self::from_json(&payload)
    }
}

impl SearchTerms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a raw JSON payload.
    ///
    /// Every unknown key is reported at once; a known key whose value is not
    /// an array of strings makes the payload malformed.
    pub fn from_json(payload: &Value) -> SearchResult<Self> {
        let object = payload
            .as_object()
            .ok_or_else(|| SearchError::InvalidTerms("terms must be a JSON object".to_string()))?;

        let unsupported: Vec<String> = object
            .keys()
            .filter(|key| TermKey::parse(key).is_none())
            .cloned()
            .collect();
        if !unsupported.is_empty() {
            return Err(SearchError::UnsupportedTerms(unsupported));
        }

        let mut terms = SearchTerms::default();
        for (key, value) in object {
            let values = value
                .as_array()
                .ok_or_else(|| SearchError::InvalidTerms(format!("'{}' must be an array", key)))?
                .iter()
                .map(|v| {
                    v.as_str().map(str::to_string).ok_or_else(|| {
                        SearchError::InvalidTerms(format!("'{}' must contain only strings", key))
                    })
                })
                .collect::<SearchResult<Vec<_>>>()?;

            // parse() succeeded above for every key
            if let Some(term_key) = TermKey::parse(key) {
                terms.get_mut(term_key).extend(values);
            }
        }

        Ok(terms)
    }

    /// Validate `(key, values)` pairs coming from an already-parsed query
    pub fn from_pairs<I, K>(pairs: I) -> SearchResult<Self>
    where
        I: IntoIterator<Item = (K, Vec<String>)>,
        K: AsRef<str>,
    {
        let mut terms = SearchTerms::default();
        let mut unsupported = Vec::new();

        for (key, values) in pairs {
            match TermKey::parse(key.as_ref()) {
                Some(term_key) => terms.get_mut(term_key).extend(values),
                None => unsupported.push(key.as_ref().to_string()),
            }
        }

        if unsupported.is_empty() {
            Ok(terms)
        } else {
            Err(SearchError::UnsupportedTerms(unsupported))
        }
    }

    pub fn get(&self, key: TermKey) -> &[String] {
        match key {
            TermKey::Match => &self.match_,
            TermKey::NotMatch => &self.not_match,
            TermKey::Phrase => &self.phrase,
            TermKey::NotPhrase => &self.not_phrase,
            TermKey::Prefix => &self.prefix,
            TermKey::NotPrefix => &self.not_prefix,
            TermKey::Tag => &self.tag,
            TermKey::NotTag => &self.not_tag,
        }
    }

    fn get_mut(&mut self, key: TermKey) -> &mut Vec<String> {
        match key {
            TermKey::Match => &mut self.match_,
            TermKey::NotMatch => &mut self.not_match,
            TermKey::Phrase => &mut self.phrase,
            TermKey::NotPhrase => &mut self.not_phrase,
            TermKey::Prefix => &mut self.prefix,
            TermKey::NotPrefix => &mut self.not_prefix,
            TermKey::Tag => &mut self.tag,
            TermKey::NotTag => &mut self.not_tag,
        }
    }

    pub fn with(mut self, key: TermKey, values: Vec<impl Into<String>>) -> Self {
        self.get_mut(key)
            .extend(values.into_iter().map(Into::into));
        self
    }

    pub fn is_empty(&self) -> bool {
        use strum::IntoEnumIterator;
        TermKey::iter().all(|key| self.get(key).is_empty())
    }

    /// Space-joined free text, used to size relevance scoring
    pub fn query_string(&self) -> String {
        self.match_
            .iter()
            .chain(self.phrase.iter())
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ")
    }
}
