//! Error taxonomy for the chat core and its mapping onto API errors

use crate::{db::DBError, ApiError, ErrorType, Surface};
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

/// Errors raised by the reconciler, the delivery controller and the
/// entitlement gate.
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Forbidden")]
    Forbidden,
    #[error("{0:?} not found")]
    NotFound(Surface),
    #[error("Daily message quota exhausted")]
    RateLimit,
    #[error("A generation is already running for chat {0}")]
    GenerationInProgress(Uuid),
    #[error("No assistant message found in model response")]
    NoAssistantMessage,
    #[error("Persistence error: {0}")]
    Persistence(#[from] DBError),
}

impl ChatError {
    pub fn validation(msg: impl Into<String>) -> Self {
        ChatError::Validation(msg.into())
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        error_mapping::map_chat_error(err)
    }
}

/// Centralized error mapping utilities
///
/// Validation and auth failures map onto their public categories;
/// everything internal is logged and collapsed into a detail-free 500.
pub mod error_mapping {
    use super::*;

    pub fn map_chat_error(err: ChatError) -> ApiError {
        match err {
            ChatError::Validation(msg) => {
                ApiError::new(ErrorType::BadRequest, Surface::Api).with_cause(msg)
            }
            ChatError::Unauthorized => ApiError::new(ErrorType::Unauthorized, Surface::Chat),
            ChatError::Forbidden => ApiError::new(ErrorType::Forbidden, Surface::Chat),
            // Don't log NotFound as error - it's expected for stale ids
            ChatError::NotFound(surface) => ApiError::new(ErrorType::NotFound, surface),
            ChatError::RateLimit => ApiError::new(ErrorType::RateLimit, Surface::Chat),
            ChatError::GenerationInProgress(_) => {
                ApiError::new(ErrorType::Conflict, Surface::Chat)
            }
            ChatError::NoAssistantMessage => {
                error!("Model response contained no assistant message");
                ApiError::new(ErrorType::Internal, Surface::Chat)
            }
            ChatError::Persistence(e) => map_generic_db_error(e),
        }
    }

    /// Map generic database errors to API errors
    ///
    /// Use this when the specific error type doesn't need special handling
    pub fn map_generic_db_error(e: DBError) -> ApiError {
        error!("Database error: {:?}", e);
        ApiError::new(ErrorType::Internal, Surface::Database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_validation_error_returns_bad_request() {
        let api_error: ApiError = ChatError::validation("missing parts").into();
        assert_eq!(api_error.code(), "bad_request:api");
        assert_eq!(api_error.status(), StatusCode::BAD_REQUEST);
        assert_eq!(api_error.cause.as_deref(), Some("missing parts"));
    }

    #[test]
    fn test_rate_limit_returns_too_many_requests() {
        let api_error: ApiError = ChatError::RateLimit.into();
        assert_eq!(api_error.code(), "rate_limit:chat");
        assert_eq!(api_error.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn test_stream_not_found_keeps_surface() {
        let api_error: ApiError = ChatError::NotFound(Surface::Stream).into();
        assert_eq!(api_error.code(), "not_found:stream");
        assert_eq!(api_error.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_persistence_error_hides_detail() {
        let api_error: ApiError = ChatError::Persistence(DBError::ConnectionError).into();
        assert_eq!(api_error.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(api_error.cause.is_none());
    }

    #[test]
    fn test_forbidden_maps_to_chat_surface() {
        let api_error: ApiError = ChatError::Forbidden.into();
        assert_eq!(api_error.code(), "forbidden:chat");
        assert_eq!(api_error.status(), StatusCode::FORBIDDEN);
    }
}
