//! Mapping of lifecycle failures onto HTTP responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use crate::room::{LifecycleError, StepOutcome};

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// JSON error body: `{"error": ..., "steps": [...]}`
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<StepOutcome>>,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Lifecycle(e) => match e {
                LifecycleError::NotFound(_) => StatusCode::NOT_FOUND,
                LifecycleError::Conflict { .. } | LifecycleError::DuplicateDeviceType { .. } => {
                    StatusCode::CONFLICT
                }
                LifecycleError::InvalidRoom { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                e if e.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
                LifecycleError::Cluster(_)
                | LifecycleError::Ingress(_)
                | LifecycleError::PartialFailure { .. } => StatusCode::BAD_GATEWAY,
                LifecycleError::Manifest(_)
                | LifecycleError::Store(_)
                | LifecycleError::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(status = status.as_u16(), "{}", self);
        }

        let steps = match &self {
            ApiError::Lifecycle(e) => e.report().map(|r| r.steps.clone()),
            ApiError::Internal(_) => None,
        };
        let body = ErrorBody {
            error: self.to_string(),
            steps,
        };

        (status, Json(body)).into_response()
    }
}
