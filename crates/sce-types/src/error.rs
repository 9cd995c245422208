use thiserror::Error;

/// Errors raised by the service definition aggregate.
///
/// `Validation` covers structural or input violations caught before any
/// mutation. `State` covers illegal lifecycle transitions. Neither is retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("state error: {0}")]
    State(String),
}

impl DefinitionError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Message without the category prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::Validation(msg) | Self::State(msg) => msg,
        }
    }
}

/// Errors from repository operations (used by trait definitions in sce-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("storage connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}
