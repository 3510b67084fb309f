// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Admin routes.
//!
//! Gated by a fresh server-side admin check (see `middleware::require_admin`).

use crate::error::Result;
use crate::models::{Profile, Role};
use crate::services::check_id;
use crate::AppState;
use axum::{
    extract::{Path, State},
    routing::{get, put},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/admin/profiles", get(list_profiles))
        .route("/api/admin/profiles/{id}/role", put(set_role))
}

#[derive(Debug, Deserialize)]
pub struct SetRoleRequest {
    pub role: Role,
}

async fn list_profiles(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Profile>>> {
    Ok(Json(state.backend.profiles.list_profiles().await?))
}

async fn set_role(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<SetRoleRequest>,
) -> Result<Json<Profile>> {
    check_id(&id, "profile")?;
    let profile = state.backend.profiles.set_role(&id, body.role).await?;
    tracing::info!(profile_id = %id, role = %body.role, "Role changed");

    // Keep the local copy current when admins edit themselves.
    if state.session.current_user().is_some_and(|u| u.id == id) {
        state.session.profile_saved(profile.clone()).await;
    }

    Ok(Json(profile))
}
