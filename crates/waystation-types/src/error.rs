use thiserror::Error;

/// Errors from repository operations (used by trait definitions in waystation-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}
