// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Errors returned by handlers and services, and their HTTP mapping.

use crate::backend::BackendError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// No signed-in user
    #[error("Authentication required")]
    Unauthorized,

    /// Signed in, but the server did not confirm admin access
    #[error("Admin access required")]
    Forbidden,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        AppError::BadRequest(errors.to_string())
    }
}

impl AppError {
    /// Status and stable error code for the response body.
    pub fn status(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            AppError::Forbidden => (StatusCode::FORBIDDEN, "forbidden"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            AppError::Backend(err) if err.is_no_rows() => (StatusCode::NOT_FOUND, "not_found"),
            AppError::Backend(err) if err.is_session_missing() => {
                (StatusCode::UNAUTHORIZED, "unauthorized")
            }
            AppError::Backend(BackendError::Timeout(_)) => {
                (StatusCode::GATEWAY_TIMEOUT, "backend_timeout")
            }
            AppError::Backend(_) => (StatusCode::BAD_GATEWAY, "backend_error"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }

    /// Extra text safe to show the user. Internal details never leave the server.
    fn details(&self) -> Option<String> {
        match self {
            AppError::NotFound(what) => Some(what.clone()),
            AppError::BadRequest(msg) => Some(msg.clone()),
            AppError::Backend(err) if !err.is_no_rows() && !err.is_session_missing() => {
                match err {
                    BackendError::Timeout(_) => None,
                    other => Some(other.user_message()),
                }
            }
            _ => None,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error) = self.status();

        if status.is_server_error() {
            tracing::error!(error = %self, status = status.as_u16(), "Request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "Request rejected");
        }

        let body = ErrorBody {
            error,
            details: self.details(),
        };
        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors_are_bad_requests() {
        use validator::Validate;

        #[derive(Validate)]
        struct Form {
            #[validate(length(min = 1))]
            name: String,
        }

        let err: AppError = Form {
            name: String::new(),
        }
        .validate()
        .unwrap_err()
        .into();
        assert_eq!(err.status().0, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_timeout_has_no_details() {
        let err = AppError::from(BackendError::Timeout(std::time::Duration::from_secs(5)));
        assert_eq!(err.status().1, "backend_timeout");
        assert!(err.details().is_none());
    }
}
