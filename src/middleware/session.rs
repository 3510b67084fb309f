// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Session and admin gates.

use crate::error::AppError;
use crate::models::AuthUser;
use crate::AppState;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use std::time::Duration;

/// Longest a request waits for an in-progress profile load.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(15);

/// Signed-in user, inserted by [`require_session`].
#[derive(Debug, Clone)]
pub struct CurrentUser(pub AuthUser);

/// Middleware that requires a signed-in user.
///
/// Waits for a profile load in progress to settle first, so handlers see a
/// profile that matches the user.
pub async fn require_session(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let mut snapshot = state.session.snapshot();
    if snapshot.loading {
        snapshot = tokio::time::timeout(SETTLE_TIMEOUT, state.session.wait_until_settled())
            .await
            .ok()
            .flatten()
            .unwrap_or(snapshot);
    }

    let user = snapshot.user.ok_or(AppError::Unauthorized)?;
    request.extensions_mut().insert(CurrentUser(user));

    Ok(next.run(request).await)
}

/// Middleware that requires a server-confirmed admin.
///
/// The cached role and admin flag are not trusted here; every request asks
/// the backend again, and any failure denies access.
pub async fn require_admin(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let user = state.session.current_user().ok_or(AppError::Unauthorized)?;
    let Some(email) = user.email.as_deref().filter(|e| !e.is_empty()) else {
        return Err(AppError::Forbidden);
    };

    if !state.loader.check_admin(email).await {
        tracing::warn!(user_id = %user.id, "Admin route denied");
        return Err(AppError::Forbidden);
    }

    Ok(next.run(request).await)
}
