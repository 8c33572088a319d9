//! Unified error response handling for the gateway
//!
//! Every failure the gateway reports, whether raised by the gateway itself or
//! delivered as a terminal status by the interception pipeline, is rendered
//! as the same JSON body with the request ID attached.

use crate::proxy::headers::X_REQUEST_ID;
use crate::proxy::http_types::NetError;
use crate::proxy::hyper_transport::{ERR_FILE_TOO_BIG, ERR_TIMED_OUT};
use crate::proxy::types::ProxyError;
use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

/// Standard error response format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Unique error code for programmatic handling
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Request ID for correlation
    pub request_id: Option<String>,
    /// Additional error details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            request_id: None,
            details: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Convert to HTTP response with proper headers
    pub fn into_response_with_status(self, status: StatusCode) -> Response {
        let request_id = self.request_id.clone();
        let mut response = (status, Json(self)).into_response();

        if let Some(id) = request_id {
            if let Ok(header_value) = HeaderValue::from_str(&id) {
                response.headers_mut().insert(X_REQUEST_ID, header_value);
            }
        }

        response
    }
}

/// Extension trait for consistent error formatting
pub trait ErrorResponseExt {
    /// Convert to standardized error response
    fn to_error_response(&self) -> ErrorResponse;

    /// Get the appropriate HTTP status code
    fn status_code(&self) -> StatusCode;
}

impl ErrorResponseExt for NetError {
    fn to_error_response(&self) -> ErrorResponse {
        match self {
            NetError::BlockedByClient => {
                ErrorResponse::new("BLOCKED_BY_CLIENT", "Request blocked by policy")
            }
            NetError::Aborted => ErrorResponse::new("ABORTED", "Request was aborted"),
            NetError::InvalidRedirect(msg) => {
                ErrorResponse::new("INVALID_REDIRECT", format!("Invalid redirect: {msg}"))
            }
            NetError::Transport { code, message } => {
                let kind = match *code {
                    ERR_TIMED_OUT => "UPSTREAM_TIMEOUT",
                    ERR_FILE_TOO_BIG => "RESPONSE_TOO_LARGE",
                    _ => "CONNECTION_ERROR",
                };
                ErrorResponse::new(kind, message.clone())
                    .with_details(serde_json::json!({ "net_error": code }))
            }
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            NetError::BlockedByClient => StatusCode::FORBIDDEN,
            NetError::Transport {
                code: ERR_TIMED_OUT,
                ..
            } => StatusCode::GATEWAY_TIMEOUT,
            NetError::Aborted | NetError::InvalidRedirect(_) | NetError::Transport { .. } => {
                StatusCode::BAD_GATEWAY
            }
        }
    }
}

impl ErrorResponseExt for ProxyError {
    fn to_error_response(&self) -> ErrorResponse {
        use ProxyError::*;

        match self {
            InvalidTargetUrl(msg) => {
                ErrorResponse::new("INVALID_TARGET_URL", format!("Invalid target URL: {msg}"))
            }
            InvalidResponseHeaders(msg) => ErrorResponse::new(
                "INVALID_RESPONSE_HEADERS",
                format!("Invalid response headers: {msg}"),
            ),
            RequestTooLarge { max_size } => ErrorResponse::new(
                "REQUEST_TOO_LARGE",
                format!("Request body exceeds maximum {max_size}"),
            ),
            TooManyRedirects(limit) => ErrorResponse::new(
                "TOO_MANY_REDIRECTS",
                format!("Gave up after {limit} redirects"),
            ),
            Net(error) => error.to_error_response(),
            FactoryClosed => {
                ErrorResponse::new("SERVICE_UNAVAILABLE", "Interception proxy is shut down")
            }
            HttpError(e) => ErrorResponse::new("HTTP_ERROR", format!("HTTP error: {e}")),
            HyperError(e) => {
                ErrorResponse::new("CONNECTION_ERROR", format!("Connection error: {e}"))
            }
            Internal(msg) => ErrorResponse::new("INTERNAL_ERROR", msg.clone()),
        }
    }

    fn status_code(&self) -> StatusCode {
        use ProxyError::*;

        match self {
            InvalidTargetUrl(_) => StatusCode::BAD_REQUEST,
            RequestTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            InvalidResponseHeaders(_) | TooManyRedirects(_) => StatusCode::BAD_GATEWAY,
            Net(error) => error.status_code(),
            FactoryClosed => StatusCode::SERVICE_UNAVAILABLE,
            HttpError(_) | HyperError(_) => StatusCode::BAD_GATEWAY,
            Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error conversion for Axum responses using standardized format
impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        self.to_error_response().into_response_with_status(status)
    }
}

/// Helper to extract request ID from headers
pub fn extract_request_id(headers: &http::HeaderMap) -> Option<String> {
    headers
        .get(X_REQUEST_ID)
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string())
}
