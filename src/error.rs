//! Error types for the query store.

use crate::types::ItemId;
use thiserror::Error;

/// Main error type for store and adapter operations.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Item not found: {service}/{id}")]
    NotFound { service: String, id: ItemId },

    #[error("Unknown service: {0}")]
    UnknownService(String),

    #[error("Unknown mutation method: {0}")]
    UnknownMethod(String),

    #[error("Get query on {0} has no resource id")]
    MissingResourceId(String),

    #[error("Item has no id")]
    MissingId,

    #[error("No async runtime available: {0}")]
    NoRuntime(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

/// Result type for store and adapter operations.
pub type Result<T> = std::result::Result<T, CacheError>;
