//! Error types for search operations

use crate::error::AppError;

/// Result type for search operations
pub type SearchResult<T> = std::result::Result<T, SearchError>;

/// Errors that can occur during indexing and search operations
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    /// Invalid configuration (unsupported protocol version, malformed URI, ...)
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Search terms contained keys outside the supported set
    #[error("Unsupported term(s): {}", .0.join(", "))]
    UnsupportedTerms(Vec<String>),

    /// Search terms payload had the wrong shape
    #[error("Malformed search terms: {0}")]
    InvalidTerms(String),

    /// The cluster answered with a non-success status
    #[error("Cluster responded {status}: {reason}")]
    Cluster { status: u16, reason: String },

    /// The cluster could not be reached
    #[error("Cluster transport error: {0}")]
    Transport(String),

    /// A cluster call exceeded the configured request timeout
    #[error("Cluster request timed out: {0}")]
    Timeout(String),

    /// The content store failed while streaming or looking up documents
    #[error("Content store error: {0}")]
    ContentStore(String),

    /// A rebuild for the same index set is already running
    #[error("Rebuild already in progress for index: {0}")]
    RebuildInProgress(String),

    /// The sync pipeline stopped before draining the source
    #[error("Sync pipeline failed: {0}")]
    Pipeline(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SearchError {
    /// Whether the error rejected a request before any cluster call was made
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SearchError::UnsupportedTerms(_) | SearchError::InvalidTerms(_)
        )
    }
}

impl From<reqwest::Error> for SearchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SearchError::Timeout(err.to_string())
        } else {
            SearchError::Transport(err.to_string())
        }
    }
}

impl From<SearchError> for AppError {
    fn from(err: SearchError) -> Self {
        match err {
            SearchError::InvalidConfiguration(msg) => AppError::Configuration(msg),
            SearchError::UnsupportedTerms(_) | SearchError::InvalidTerms(_) => {
                AppError::Validation(err.to_string())
            }
            SearchError::Timeout(msg) => AppError::Timeout(msg),
            SearchError::Transport(msg) => AppError::Network(msg),
            SearchError::RebuildInProgress(msg) => AppError::Conflict(msg),
            SearchError::Serialization(err) => AppError::Serialization(err.to_string()),
            _ => AppError::Internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_terms_names_every_key() {
        let err = SearchError::UnsupportedTerms(vec!["fuzzy".to_string(), "near".to_string()]);
        assert_eq!(err.to_string(), "Unsupported term(s): fuzzy, near");
        assert!(err.is_validation());
    }

    #[test]
    fn test_conversion_to_app_error() {
        let app: AppError = SearchError::InvalidConfiguration("bad uri".to_string()).into();
        assert_eq!(app.error_code(), "CONFIGURATION_ERROR");

        let app: AppError = SearchError::UnsupportedTerms(vec!["fuzzy".to_string()]).into();
        assert_eq!(app.error_code(), "VALIDATION_ERROR");

        let app: AppError = SearchError::RebuildInProgress("pages".to_string()).into();
        assert_eq!(app.error_code(), "CONFLICT");
    }
}
