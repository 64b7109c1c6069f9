//! Unified error handling for the node.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tandem_engine::NodeId;

use crate::config::ConfigError;
use crate::session::{ProtocolError, SessionState};
use crate::transport::TransportError;

/// Node error type.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Engine error: {0}")]
    Engine(#[from] tandem_engine::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid schema: {0}")]
    Schema(String),

    #[error("Timed out while {0}")]
    Timeout(SessionState),

    #[error("Session aborted by peer: {0}")]
    Aborted(String),

    #[error("A session with {0} is already active")]
    SessionActive(NodeId),
}

impl NodeError {
    /// Whether retrying the session later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, NodeError::Transport(_) | NodeError::Timeout(_))
    }
}

/// Result type alias for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;

/// HTTP error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Node(#[from] NodeError),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        AppError::Node(NodeError::Database(e))
    }
}

/// Error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message, details) = match &self {
            AppError::Node(NodeError::Database(e)) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Database error".to_string(),
                    None,
                )
            }
            AppError::Node(NodeError::Engine(e)) => {
                tracing::warn!("Engine error: {:?}", e);
                (StatusCode::BAD_REQUEST, e.to_string(), None)
            }
            AppError::Node(e) => {
                tracing::error!("Node error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal error".to_string(),
                    Some(e.to_string()),
                )
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone(), None),
        };

        let body = Json(ErrorResponse {
            error: error_message,
            details,
        });

        (status, body).into_response()
    }
}

/// Result type alias for handlers.
pub type HttpResult<T> = std::result::Result<T, AppError>;
