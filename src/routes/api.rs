// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Session and profile routes.

use crate::error::{AppError, Result};
use crate::middleware::CurrentUser;
use crate::models::{AuthUser, Profile, ProfileUpdate};
use crate::services::{ProfileSource, SessionSnapshot};
use crate::AppState;
use axum::{
    extract::State,
    routing::{get, post, put},
    Extension, Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use validator::Validate;
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

/// Routes open to everyone.
pub fn public_routes() -> Router<Arc<AppState>> {
    Router::new().route("/api/session", get(get_session))
}

/// Routes for a signed-in user.
/// The session middleware is applied in routes/mod.rs for these routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/me", get(get_me))
        .route("/api/profile", put(update_profile))
        .route("/api/profile/refresh", post(refresh_profile))
}

// ─── Session ─────────────────────────────────────────────────

/// Current synchronizer state.
#[derive(Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub struct SessionResponse {
    #[serde(flatten)]
    pub snapshot: SessionSnapshot,
    pub is_authenticated: bool,
    pub is_profile_complete: bool,
}

impl From<SessionSnapshot> for SessionResponse {
    fn from(snapshot: SessionSnapshot) -> Self {
        Self {
            is_authenticated: snapshot.is_authenticated(),
            is_profile_complete: snapshot.is_profile_complete(),
            snapshot,
        }
    }
}

async fn get_session(State(state): State<Arc<AppState>>) -> Json<SessionResponse> {
    Json(state.session.snapshot().into())
}

// ─── User Profile ────────────────────────────────────────────

/// Signed-in user with their profile.
#[derive(Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub struct MeResponse {
    pub user: AuthUser,
    pub profile: Option<Profile>,
    pub is_admin: bool,
    pub profile_source: Option<ProfileSource>,
    pub is_profile_complete: bool,
}

async fn get_me(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> Result<Json<MeResponse>> {
    let snapshot = state.session.snapshot();

    // Signed out (or switched users) after the gate ran.
    if snapshot.user_id() != Some(user.id.as_str()) {
        return Err(AppError::Unauthorized);
    }

    Ok(Json(MeResponse {
        is_admin: snapshot.is_admin(),
        is_profile_complete: snapshot.is_profile_complete(),
        profile_source: snapshot.profile_source,
        profile: snapshot.profile,
        user,
    }))
}

async fn update_profile(
    State(state): State<Arc<AppState>>,
    Json(update): Json<ProfileUpdate>,
) -> Result<Json<Profile>> {
    update.validate()?;
    let profile = state.auth.update_profile(update).await?;
    Ok(Json(profile))
}

async fn refresh_profile(State(state): State<Arc<AppState>>) -> Result<Json<SessionResponse>> {
    let snapshot = state
        .session
        .refresh_profile()
        .await
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("Session synchronizer stopped")))?;
    Ok(Json(snapshot.into()))
}
