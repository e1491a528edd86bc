use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::client::FetchError;
use crate::collector::CollectError;

/// API error types that can be returned from handlers
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("{0}")]
    QuotaExhausted(String),

    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    #[error("Upstream timeout: {0}")]
    GatewayTimeout(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Classified upstream failure that has no dedicated status code.
    #[error("{message}")]
    Upstream { error_type: &'static str, message: String },

    #[error("Internal server error: {0}")]
    Internal(String),
}

/// Error response that gets serialized to JSON
#[derive(Debug, Serialize)]
struct ErrorResponse {
    status: &'static str,
    error_type: String,
    message: String,
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::QuotaExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Upstream { .. } | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::QuotaExhausted(_) => "rate_limit",
            ApiError::Unauthorized(_) => "auth",
            ApiError::GatewayTimeout(_) => "network",
            ApiError::ServiceUnavailable(_) => "service_unavailable",
            ApiError::Upstream { error_type, .. } => error_type,
            ApiError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match &self {
            ApiError::Internal(_) | ApiError::Upstream { .. } => {
                tracing::error!(error = %self, "API error occurred");
            }
            ApiError::ServiceUnavailable(_) | ApiError::GatewayTimeout(_) => {
                tracing::warn!(error = %self, "upstream unavailable");
            }
            _ => {
                tracing::debug!(error = %self, "client-visible error");
            }
        }

        let body = ErrorResponse {
            status: "error",
            error_type: self.error_type().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<FetchError> for ApiError {
    fn from(error: FetchError) -> Self {
        let message = error.to_string();
        match error {
            FetchError::QuotaExhausted { .. } => ApiError::QuotaExhausted(message),
            FetchError::Auth(_) => ApiError::Unauthorized(message),
            FetchError::Network(_) => ApiError::GatewayTimeout(message),
            FetchError::ServiceUnavailable(_) => ApiError::ServiceUnavailable(message),
            FetchError::VehicleOffline(_) => {
                ApiError::Upstream { error_type: "vehicle_offline", message }
            }
            FetchError::VehicleNotFound(_) => {
                ApiError::Upstream { error_type: "vehicle_not_found", message }
            }
            FetchError::PartialPayload(_) => {
                ApiError::Upstream { error_type: "partial_payload", message }
            }
            FetchError::Unknown(_) => ApiError::Upstream { error_type: "unknown", message },
        }
    }
}

impl From<CollectError> for ApiError {
    fn from(error: CollectError) -> Self {
        match error {
            CollectError::Fetch(fetch) => fetch.into(),
            CollectError::Storage(err) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        ApiError::Internal(error.to_string())
    }
}
