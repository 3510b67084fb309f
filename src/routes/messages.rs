// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Chat routes.

use crate::error::Result;
use crate::models::ChatMessage;
use crate::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use validator::Validate;
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

/// The session middleware is applied in routes/mod.rs for these routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/messages", post(send_message))
        .route("/api/messages/unread", get(unread_counts))
        // Same parameter name as the read route; here it is the peer's user id.
        .route("/api/messages/{id}", get(conversation))
        .route("/api/messages/{id}/read", put(mark_read))
}

#[derive(Debug, Deserialize, Validate)]
pub struct SendMessageRequest {
    #[validate(length(min = 1, message = "Destinatário obrigatório"))]
    pub receiver_id: String,
    pub content: String,
}

/// Unread incoming messages per sender.
#[derive(Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub struct UnreadResponse {
    pub counts: HashMap<String, usize>,
    pub total: usize,
}

async fn conversation(
    State(state): State<Arc<AppState>>,
    Path(peer_id): Path<String>,
) -> Result<Json<Vec<ChatMessage>>> {
    Ok(Json(state.chat.conversation(&peer_id).await?))
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<ChatMessage>)> {
    body.validate()?;
    let message = state.chat.send(&body.receiver_id, &body.content).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn mark_read(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.chat.mark_read(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn unread_counts(State(state): State<Arc<AppState>>) -> Json<UnreadResponse> {
    let counts = state.chat.unread_counts();
    let total = counts.values().sum();
    Json(UnreadResponse { counts, total })
}
