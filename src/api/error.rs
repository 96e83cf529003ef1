//! Maps `ControlError` onto HTTP responses.
//!
//! Every error body is `{"message": ...}`. Backend failures surface as 503
//! only on endpoints that actually need the backend; the control path never
//! sees them.

use crate::error::ControlError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug)]
pub struct ApiError(pub ControlError);

impl From<ControlError> for ApiError {
    fn from(e: ControlError) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self(ControlError::Unauthorized(message.into()))
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self(ControlError::Forbidden(message.into()))
    }

    fn status(&self) -> StatusCode {
        match &self.0 {
            ControlError::Validation(_) => StatusCode::BAD_REQUEST,
            ControlError::NotFound(_) => StatusCode::NOT_FOUND,
            ControlError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ControlError::Forbidden(_) => StatusCode::FORBIDDEN,
            ControlError::Conflict(_) => StatusCode::CONFLICT,
            ControlError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ControlError::Backend(_) => StatusCode::SERVICE_UNAVAILABLE,
            ControlError::Hardware(_)
            | ControlError::Io(_)
            | ControlError::Serde(_)
            | ControlError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({ "message": self.0.to_string() }));
        if status == StatusCode::UNAUTHORIZED {
            (
                status,
                [("WWW-Authenticate", "Bearer")],
                body,
            )
                .into_response()
        } else {
            (status, body).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError(ControlError::NotFound("x".into())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError(ControlError::Backend("x".into())).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError(ControlError::Validation("x".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError(ControlError::Timeout("x".into())).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }
}
