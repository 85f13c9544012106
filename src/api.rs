//! Caller-facing errors: an HTTP status plus a machine-readable reason code.

use crate::extract::errors::ErrorClass;
use crate::extract::limits::LimitError;
use crate::extract::orchestrator::{TerminalError, TerminalKind};
use crate::extract::planner::PlanError;
use crate::extract::shaping::{ChunkError, ShapeError};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Caller input problem; never reaches a provider.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Limit(#[from] LimitError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error("malformed request JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{message}")]
    Upstream {
        class: ErrorClass,
        message: String,
        retry_after: Option<u64>,
    },
    #[error("model output failed validation: {0}")]
    Validation(String),
    #[error("provider `{0}` has no API key configured")]
    MissingCredentials(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> u16 {
        match self {
            ApiError::InvalidRequest(_)
            | ApiError::Limit(_)
            | ApiError::Plan(_)
            | ApiError::Shape(_)
            | ApiError::Chunk(_)
            | ApiError::Json(_) => 400,
            ApiError::Upstream { class, .. } => class.http_status(),
            ApiError::Validation(_) => 422,
            ApiError::MissingCredentials(_) | ApiError::Internal(_) => 500,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            ApiError::InvalidRequest(_)
            | ApiError::Limit(_)
            | ApiError::Plan(_)
            | ApiError::Shape(_)
            | ApiError::Chunk(_)
            | ApiError::Json(_) => "invalid_request",
            ApiError::Upstream { class, .. } => class.as_str(),
            ApiError::Validation(_) => "validation_failed",
            ApiError::MissingCredentials(_) | ApiError::Internal(_) => "internal",
        }
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            ApiError::Upstream { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn envelope(&self, correlation_id: Option<Uuid>) -> ErrorEnvelope {
        ErrorEnvelope {
            status: self.status(),
            reason: self.reason(),
            message: self.to_string(),
            retry_after: self.retry_after(),
            correlation_id: correlation_id.map(|id| id.to_string()),
        }
    }
}

impl From<TerminalError> for ApiError {
    fn from(err: TerminalError) -> Self {
        match err.kind {
            TerminalKind::Upstream(class) => ApiError::Upstream {
                class,
                message: err.message,
                // Only rate limits carry a hint back to the caller.
                retry_after: if class == ErrorClass::RateLimited {
                    err.retry_after
                } else {
                    None
                },
            },
            TerminalKind::Validation => ApiError::Validation(err.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    pub status: u16,
    pub reason: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}
