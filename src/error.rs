//! Error types for the offline content layer

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MaktabError>;

#[derive(Error, Debug)]
pub enum MaktabError {
    #[error("Store open error: {0}")]
    Open(String),

    #[error("Store transaction error: {0}")]
    Transaction(String),

    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid verse key: {0}")]
    InvalidVerseKey(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl MaktabError {
    /// Whether the UI should offer a retry for this failure.
    ///
    /// Only network failures are transient from the user's point of view;
    /// store failures need a cache clear or more free space instead.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MaktabError::Network(_))
    }

    /// Classify a SQLite error raised after the store has been opened.
    pub(crate) fn from_sqlite(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DiskFull) => MaktabError::QuotaExceeded(err.to_string()),
            _ => MaktabError::Transaction(err.to_string()),
        }
    }
}

impl From<rusqlite::Error> for MaktabError {
    fn from(err: rusqlite::Error) -> Self {
        MaktabError::from_sqlite(err)
    }
}

impl From<reqwest::Error> for MaktabError {
    fn from(err: reqwest::Error) -> Self {
        MaktabError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for MaktabError {
    fn from(err: serde_json::Error) -> Self {
        MaktabError::Other(format!("Malformed payload: {}", err))
    }
}

impl serde::Serialize for MaktabError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_network_errors_are_retryable() {
        assert!(MaktabError::Network("offline".into()).is_retryable());
        assert!(!MaktabError::Transaction("aborted".into()).is_retryable());
        assert!(!MaktabError::QuotaExceeded("full".into()).is_retryable());
        assert!(!MaktabError::Open("locked".into()).is_retryable());
    }

    #[test]
    fn test_serializes_as_display_string() {
        let json = serde_json::to_string(&MaktabError::NotFound("page 605".into())).unwrap();
        assert_eq!(json, "\"Not found: page 605\"");
    }
}
