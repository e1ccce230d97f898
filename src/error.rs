use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodectxError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Embedding request failed: {0}")]
    Embedding(String),

    #[error("Language server error: {0}")]
    LanguageServer(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Context engine not initialized")]
    NotInitialized,
}

impl CodectxError {
    /// Lock poisoning only happens after a panic elsewhere; surface it as a storage failure.
    pub(crate) fn poisoned<T>(_: std::sync::PoisonError<T>) -> Self {
        CodectxError::Storage("storage lock poisoned".to_string())
    }
}

pub type Result<T> = std::result::Result<T, CodectxError>;
