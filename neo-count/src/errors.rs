use crate::config::ValidationError;
use crate::store::{PersistError, StoreError};
use http::{Method, StatusCode};
use thiserror::Error;

/// Result type alias for neo-count operations
pub type Result<T, E = NeoCountError> = std::result::Result<T, E>;

/// Errors that can occur while serving count requests
#[derive(Error, Debug)]
pub enum NeoCountError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Failed to read request body: {0}")]
    RequestBodyError(String),

    #[error("Method {0} not allowed")]
    MethodNotAllowed(Method),

    #[error("No route matched for request")]
    NoRouteMatched,

    #[error("Failed to persist counts: {0}")]
    Persist(#[from] PersistError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ValidationError),

    #[error("Response serialization error: {0}")]
    ResponseSerializationError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NeoCountError {
    /// HTTP status reported to the caller for this error
    pub fn status(&self) -> StatusCode {
        match self {
            NeoCountError::BadRequest(_) | NeoCountError::RequestBodyError(_) => {
                StatusCode::BAD_REQUEST
            }
            NeoCountError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            NeoCountError::NoRouteMatched => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
