use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Failures reported by a coordination client.
///
/// The variants mirror the result codes of a ZooKeeper-style store. Callers
/// usually only care about `NodeExists` and `NoNode`; everything else is a
/// transient or backend failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordError {
    #[error("node already exists: {path}")]
    NodeExists { path: String },

    #[error("node does not exist: {path}")]
    NoNode { path: String },

    #[error("node has children: {path}")]
    NotEmpty { path: String },

    #[error("ephemeral nodes cannot have children: {path}")]
    NoChildrenForEphemerals { path: String },

    #[error("invalid path {path:?}: {reason}")]
    BadPath { path: String, reason: String },

    #[error("session expired")]
    SessionExpired,

    #[error("connection lost: {0}")]
    ConnectionLoss(String),

    #[error("coordination backend error: {0}")]
    Backend(String),
}

pub type CoordResult<T> = std::result::Result<T, CoordError>;

/// Unified error type for all API failures.
///
/// Each variant maps to a specific HTTP status code and produces a consistent
/// JSON error response with `error` and `details` fields.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid lock key: {reason}")]
    InvalidLockKey { reason: String },

    #[error("Coordination service error: {0}")]
    Coordination(#[from] CoordError),

    #[error("Bootstrap failed: {0}")]
    Bootstrap(String),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::InvalidLockKey { .. } => (StatusCode::BAD_REQUEST, "Invalid lock key"),
            AppError::Coordination(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "Coordination service error")
            }
            AppError::Bootstrap(_) => (StatusCode::SERVICE_UNAVAILABLE, "Lock service not ready"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error"),
        };

        let body = Json(json!({
            "error": error_message,
            "details": self.to_string()
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
