// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

use axum::http::StatusCode;
use axum::response::IntoResponse;
use primefit_session::backend::BackendError;
use primefit_session::error::AppError;
use std::time::Duration;

mod common;

#[test]
fn test_plain_error_statuses() {
    assert_eq!(
        AppError::Unauthorized.into_response().status(),
        StatusCode::UNAUTHORIZED
    );
    assert_eq!(
        AppError::Forbidden.into_response().status(),
        StatusCode::FORBIDDEN
    );
    assert_eq!(
        AppError::NotFound("profile".to_string())
            .into_response()
            .status(),
        StatusCode::NOT_FOUND
    );
    assert_eq!(
        AppError::Internal(anyhow::anyhow!("boom"))
            .into_response()
            .status(),
        StatusCode::INTERNAL_SERVER_ERROR
    );
}

#[test]
fn test_backend_error_statuses() {
    let no_rows = BackendError::Api {
        status: 406,
        code: Some(BackendError::NO_ROWS_CODE.to_string()),
        message: "no rows".to_string(),
    };
    assert_eq!(
        AppError::from(no_rows).into_response().status(),
        StatusCode::NOT_FOUND
    );

    assert_eq!(
        AppError::from(BackendError::NotAuthenticated)
            .into_response()
            .status(),
        StatusCode::UNAUTHORIZED
    );

    assert_eq!(
        AppError::from(BackendError::Timeout(Duration::from_secs(5)))
            .into_response()
            .status(),
        StatusCode::GATEWAY_TIMEOUT
    );

    assert_eq!(
        AppError::from(BackendError::Unavailable("down".to_string()))
            .into_response()
            .status(),
        StatusCode::BAD_GATEWAY
    );
}

#[tokio::test]
async fn test_backend_error_body_carries_user_message() {
    let err = AppError::from(BackendError::Api {
        status: 500,
        code: None,
        message: "Banco indisponível".to_string(),
    });

    let body = common::body_json(err.into_response()).await;
    assert_eq!(body["error"], "backend_error");
    assert_eq!(body["details"], "Banco indisponível");
}

#[tokio::test]
async fn test_unauthorized_body_has_no_details() {
    let body = common::body_json(AppError::Unauthorized.into_response()).await;
    assert_eq!(body["error"], "unauthorized");
    assert!(body.get("details").is_none());
}
