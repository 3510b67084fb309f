// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Email/password authentication routes.

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use validator::Validate;
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

use crate::error::Result;
use crate::services::AuthFailure;
use crate::AppState;

/// How long sign-in waits for the session to be reflected locally.
const SIGN_IN_SETTLE_TIMEOUT: Duration = Duration::from_secs(15);

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/auth/sign-in", post(sign_in))
        .route("/auth/sign-up", post(sign_up))
        .route("/auth/sign-out", post(sign_out))
        .route("/auth/reset-password", post(reset_password))
}

#[derive(Debug, Deserialize, Validate)]
pub struct SignInRequest {
    #[validate(email(message = "E-mail inválido"))]
    pub email: String,
    #[validate(length(min = 6, message = "A senha deve ter no mínimo 6 caracteres"))]
    pub password: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SignUpRequest {
    #[validate(email(message = "E-mail inválido"))]
    pub email: String,
    #[validate(length(min = 6, message = "A senha deve ter no mínimo 6 caracteres"))]
    pub password: String,
    #[serde(default, alias = "full_name")]
    #[validate(length(max = 120, message = "Nome muito longo"))]
    pub nome: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ResetPasswordRequest {
    #[validate(email(message = "E-mail inválido"))]
    pub email: String,
}

/// Result of an auth form submission.
#[derive(Debug, Default, Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub struct AuthResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Sign-up accepted but the email must be confirmed before signing in
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub needs_confirmation: bool,
}

impl AuthResponse {
    fn ok(user_id: Option<String>) -> Self {
        Self {
            success: true,
            user_id,
            ..Default::default()
        }
    }

    fn failed(status: StatusCode, failure: AuthFailure) -> (StatusCode, Json<Self>) {
        (
            status,
            Json(Self {
                success: false,
                message: Some(failure.message),
                ..Default::default()
            }),
        )
    }
}

/// Sign in, then wait until the synchronizer reflects the new user.
async fn sign_in(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SignInRequest>,
) -> Result<(StatusCode, Json<AuthResponse>)> {
    body.validate()?;

    let session = match state.auth.sign_in(&body.email, &body.password).await {
        Ok(session) => session,
        Err(failure) => return Ok(AuthResponse::failed(StatusCode::UNAUTHORIZED, failure)),
    };

    let user_id = session.user.id;
    let settled = tokio::time::timeout(
        SIGN_IN_SETTLE_TIMEOUT,
        state
            .session
            .wait_for(|s| s.user_id() == Some(user_id.as_str()) && !s.loading),
    )
    .await;
    if !matches!(settled, Ok(Some(_))) {
        tracing::warn!(user_id = %user_id, "Session not settled after sign-in");
    }

    Ok((StatusCode::OK, Json(AuthResponse::ok(Some(user_id)))))
}

async fn sign_up(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SignUpRequest>,
) -> Result<(StatusCode, Json<AuthResponse>)> {
    body.validate()?;

    match state
        .auth
        .sign_up(&body.email, &body.password, &body.nome)
        .await
    {
        Ok(result) => {
            let response = AuthResponse {
                needs_confirmation: result.session.is_none(),
                ..AuthResponse::ok(Some(result.user.id))
            };
            Ok((StatusCode::CREATED, Json(response)))
        }
        Err(failure) => Ok(AuthResponse::failed(StatusCode::BAD_REQUEST, failure)),
    }
}

/// Local state is cleared even if the backend call fails. A request that
/// joined a sign-out already in flight reports that one's outcome.
async fn sign_out(State(state): State<Arc<AppState>>) -> Json<AuthResponse> {
    let ran = state.auth.sign_out().await;
    let signed_out = state.session.current_user().is_none();
    if !signed_out {
        tracing::warn!(ran, "A user is still signed in after sign-out");
        return Json(AuthResponse {
            success: false,
            message: Some("Outro usuário entrou durante a saída".to_string()),
            ..Default::default()
        });
    }
    Json(AuthResponse::ok(None))
}

async fn reset_password(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ResetPasswordRequest>,
) -> Result<(StatusCode, Json<AuthResponse>)> {
    body.validate()?;

    match state.auth.reset_password(&body.email).await {
        Ok(()) => Ok((
            StatusCode::OK,
            Json(AuthResponse {
                message: Some("Enviamos um link de redefinição para o seu e-mail".to_string()),
                ..AuthResponse::ok(None)
            }),
        )),
        Err(failure) => Ok(AuthResponse::failed(StatusCode::BAD_REQUEST, failure)),
    }
}
