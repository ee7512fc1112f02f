use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use huddle_hub::{AttachmentError, HubError};
use huddle_shared::types::Topic;
use huddle_shared::ProtocolError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<HubError> for ServerError {
    fn from(e: HubError) -> Self {
        match e {
            HubError::Closed(_) => ServerError::Unavailable(e.to_string()),
            HubError::Call(e) => ServerError::BadRequest(e.to_string()),
            HubError::Encode(e) => ServerError::Internal(e.to_string()),
            HubError::Attachment(e) => match e {
                AttachmentError::NoMetadata(_) | AttachmentError::Corrupt(_) => {
                    ServerError::NotFound(e.to_string())
                }
                AttachmentError::AlreadyExists(_)
                | AttachmentError::Failed(_)
                | AttachmentError::TimedOut(_)
                | AttachmentError::Incomplete(_) => ServerError::Conflict(e.to_string()),
                AttachmentError::ChunkTooLarge { .. } | AttachmentError::TooLarge { .. } => {
                    ServerError::PayloadTooLarge(e.to_string())
                }
                AttachmentError::Store(_) => ServerError::Internal(e.to_string()),
            },
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::Conflict(_) => (StatusCode::CONFLICT, self.to_string()),
            ServerError::PayloadTooLarge(_) => (StatusCode::PAYLOAD_TOO_LARGE, self.to_string()),
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, self.to_string()),
            ServerError::Unavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "Service unavailable".to_string())
            }
            ServerError::Internal(msg) => {
                tracing::error!(error = %msg, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}

/// Failures while handling one inbound socket event. Reported back to the
/// sending connection only.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("{0}")]
    Protocol(#[from] ProtocolError),

    #[error("{0}")]
    Hub(#[from] HubError),

    #[error("Sign in to use {0}")]
    Anonymous(&'static str),

    #[error("Subscribing to {0} is not permitted")]
    ForbiddenTopic(Topic),
}
