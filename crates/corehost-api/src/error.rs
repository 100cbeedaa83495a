//! API error types and HTTP response mapping.

use axum::Json;
use axum::http::HeaderValue;
use axum::http::StatusCode;
use axum::http::header::HeaderName;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use utoipa::ToSchema;

use corehost_core::Error as CoreError;
use corehost_release::ReleaseError;

/// API result type.
pub type ApiResult<T> = Result<T, ApiError>;

/// Standard JSON error response body.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorBody {
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message (safe for clients).
    pub message: String,
    /// Optional error category (e.g., `unprocessable_entity`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Optional request ID for correlation.
    pub request_id: Option<String>,
}

/// HTTP API error with stable machine-readable code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    error: Option<&'static str>,
    request_id: Option<String>,
    retry_after_secs: Option<u64>,
}

impl ApiError {
    /// Returns an error response for invalid input.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    /// Returns an error response for authentication failures.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    /// Returns an error response when the Authorization header is missing.
    #[must_use]
    pub fn missing_auth() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "MISSING_AUTH",
            "Authorization header required",
        )
    }

    /// Returns an error response when the bearer token is invalid.
    #[must_use]
    pub fn invalid_token() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "INVALID_TOKEN",
            "Invalid bearer token",
        )
    }

    /// Returns an error response for authorization failures.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "FORBIDDEN", message)
    }

    /// Returns an error response for missing resources.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    /// Returns an error response for conflicts (lock held / CAS exhausted).
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "CONFLICT", message)
    }

    /// Returns an error response when upstream could not be used.
    pub fn bad_gateway(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, code, message)
    }

    /// Returns an internal error response.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", message)
    }

    /// Returns an unprocessable entity error response.
    pub fn unprocessable_entity(code: &'static str, message: impl Into<String>) -> Self {
        Self::new_with_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            code,
            message,
            Some("unprocessable_entity"),
        )
    }

    /// Attaches a request ID for correlation.
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Returns the HTTP status code for this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the human-readable error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the request ID, if one was attached.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// Returns the stable machine-readable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.code
    }

    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self::new_with_error(status, code, message, None)
    }

    fn new_with_error(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        error: Option<&'static str>,
    ) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            error,
            request_id: None,
            retry_after_secs: None,
        }
    }

    /// Attaches a Retry-After header value in seconds.
    #[must_use]
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after_secs = Some(seconds);
        self
    }

    /// Returns a 409 Conflict for a deployment that is already running.
    #[must_use]
    pub fn conflict_in_progress(message: impl Into<String>, retry_after_secs: u64) -> Self {
        Self::new(StatusCode::CONFLICT, "DEPLOY_IN_PROGRESS", message)
            .with_retry_after(retry_after_secs)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let request_id = self.request_id;
        let retry_after_secs = self.retry_after_secs;
        let mut response = (
            self.status,
            Json(ApiErrorBody {
                code: self.code.to_string(),
                message: self.message,
                error: self.error.map(str::to_string),
                request_id: request_id.clone(),
            }),
        )
            .into_response();

        if let Some(request_id) = request_id {
            if let Ok(value) = HeaderValue::from_str(&request_id) {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static("x-request-id"), value);
            }
        }

        if let Some(secs) = retry_after_secs {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static("retry-after"), value);
            }
        }

        response
    }
}

impl From<ReleaseError> for ApiError {
    fn from(value: ReleaseError) -> Self {
        match value {
            ReleaseError::Validation { message } => Self::bad_request(message),
            err @ ReleaseError::NotFound { .. } => Self::not_found(err.to_string()),
            ReleaseError::Forbidden { message } => Self::forbidden(message),
            ReleaseError::InvalidOperation { message } => {
                Self::unprocessable_entity("INVALID_OPERATION", message)
            }
            ReleaseError::Conflict { message } => Self::conflict(message),
            ReleaseError::UpstreamUnavailable { message } => {
                Self::bad_gateway("UPSTREAM_UNAVAILABLE", message)
            }
            ReleaseError::MalformedResponse { message } => {
                Self::bad_gateway("UPSTREAM_MALFORMED", message)
            }
            ReleaseError::Io { message }
            | ReleaseError::Storage { message }
            | ReleaseError::Serialization { message }
            | ReleaseError::Internal { message } => {
                tracing::error!(error = %message, "request failed");
                Self::internal(message)
            }
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(value: CoreError) -> Self {
        ReleaseError::from(value).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_in_progress_has_retry_after() {
        let error = ApiError::conflict_in_progress("a deployment is already in progress", 5);
        assert_eq!(error.status(), StatusCode::CONFLICT);
        assert_eq!(error.code(), "DEPLOY_IN_PROGRESS");
        assert!(error.message().contains("in progress"));

        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let retry_after = response
            .headers()
            .get("retry-after")
            .expect("Retry-After header should be present");
        assert_eq!(retry_after.to_str().unwrap(), "5");
    }

    #[test]
    fn test_regular_conflict_has_no_retry_after() {
        let response = ApiError::conflict("test").into_response();
        assert!(response.headers().get("retry-after").is_none());
    }

    #[test]
    fn test_release_errors_map_to_status_codes() {
        let cases = [
            (ReleaseError::validation("bad"), StatusCode::BAD_REQUEST),
            (ReleaseError::not_found("version", "v9.9.9"), StatusCode::NOT_FOUND),
            (ReleaseError::forbidden("no"), StatusCode::FORBIDDEN),
            (
                ReleaseError::invalid_operation("in use"),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (ReleaseError::conflict("held"), StatusCode::CONFLICT),
            (ReleaseError::upstream("down"), StatusCode::BAD_GATEWAY),
            (ReleaseError::malformed("html"), StatusCode::BAD_GATEWAY),
            (ReleaseError::io("copy", "denied"), StatusCode::INTERNAL_SERVER_ERROR),
            (ReleaseError::internal("oops"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn test_invalid_operation_keeps_message() {
        let err = ApiError::from(ReleaseError::invalid_operation(
            "No previous version to rollback to",
        ));
        assert_eq!(err.code(), "INVALID_OPERATION");
        assert_eq!(err.message(), "No previous version to rollback to");
    }

    #[test]
    fn test_request_id_header_is_set() {
        let response = ApiError::not_found("missing")
            .with_request_id("req-1")
            .into_response();
        assert_eq!(
            response.headers().get("x-request-id").and_then(|v| v.to_str().ok()),
            Some("req-1")
        );
    }
}
