use std::time::Duration;
use thiserror::Error;

/// Errors raised by the durable task store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("failed to encode/decode stored JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupt task row: {0}")]
    Corrupt(String),

    #[error("database connection lock poisoned")]
    Poisoned,
}

/// Errors raised by a generative text provider. All of them are terminal for
/// the task that triggered the call.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Network(String),

    #[error("provider rejected credentials ({status}): {body}")]
    Auth { status: u16, body: String },

    #[error("provider quota exceeded ({status}): {body}")]
    Quota { status: u16, body: String },

    #[error("provider returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("provider did not answer within {0:?}")]
    Timeout(Duration),

    #[error("unexpected provider response: {0}")]
    InvalidResponse(String),

    #[error("provider not configured: {0}")]
    NotConfigured(String),
}

impl ProviderError {
    /// Classify a non-success HTTP status returned by a provider.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => ProviderError::Auth { status, body },
            429 => ProviderError::Quota { status, body },
            _ => ProviderError::Http { status, body },
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        ProviderError::Network(e.to_string())
    }
}

/// Errors surfaced by the task registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("task not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
