use thiserror::Error;

/// Errors from persistence adapters.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error: {0}")]
    Connection(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("serialization error: {0}")]
    Serialization(String),
}
