// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

use axum::response::Response;
use primefit_session::backend::{Backend, MemoryBackend};
use primefit_session::config::Config;
use primefit_session::models::{AuthUser, Profile};
use primefit_session::routes::create_router;
use primefit_session::services::{
    ProfileLoader, RetryPolicy, SessionHandle, SessionSnapshot, SessionSynchronizer,
};
use primefit_session::AppState;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub const EMAIL: &str = "a@b.com";
pub const PASSWORD: &str = "secret123";

/// Memory backend with one account (`EMAIL` / `PASSWORD`).
#[allow(dead_code)]
pub fn backend_with_account() -> (MemoryBackend, AuthUser) {
    let backend = MemoryBackend::new();
    let user = backend.add_account(EMAIL, PASSWORD);
    (backend, user)
}

/// A stored profile row for `user`.
#[allow(dead_code)]
pub fn stored_profile(user: &AuthUser, nome: &str) -> Profile {
    let mut profile = Profile::fallback(&user.id, user.email.as_deref().unwrap_or_default());
    profile.nome = Some(nome.to_string());
    profile.objetivo = Some("hipertrofia".to_string());
    profile.created_at = Some("2025-01-01T00:00:00.000Z".to_string());
    profile
}

/// Loader over the memory backend with the default retry contract.
#[allow(dead_code)]
pub fn loader(backend: &MemoryBackend) -> ProfileLoader {
    ProfileLoader::new(Arc::new(backend.clone()), RetryPolicy::default())
}

/// Start a synchronizer over the memory backend.
#[allow(dead_code)]
pub fn spawn_synchronizer(backend: &MemoryBackend) -> (SessionHandle, JoinHandle<()>) {
    SessionSynchronizer::spawn(Arc::new(backend.clone()), loader(backend))
}

/// Panics if the snapshot exposes a profile for anyone but the current user.
#[allow(dead_code)]
pub fn assert_consistent(snapshot: &SessionSnapshot) {
    match (&snapshot.user, &snapshot.profile) {
        (None, Some(profile)) => panic!("profile {} exposed without a user", profile.id),
        (Some(user), Some(profile)) => assert_eq!(
            user.id, profile.id,
            "profile {} attached to user {}",
            profile.id, user.id
        ),
        _ => {}
    }
}

/// Create a test app over `backend`.
/// Returns the router and the shared state.
#[allow(dead_code)]
pub fn create_test_app(backend: MemoryBackend) -> (axum::Router, Arc<AppState>) {
    let (state, _synchronizer) = AppState::start(Config::test_default(), Backend::memory(backend));
    (create_router(state.clone()), state)
}

/// Sign in through the service and wait for the profile to load.
#[allow(dead_code)]
pub async fn sign_in(state: &AppState) -> SessionSnapshot {
    state
        .auth
        .sign_in(EMAIL, PASSWORD)
        .await
        .expect("sign-in should succeed");
    state
        .session
        .wait_for(|s| s.user.is_some() && !s.loading)
        .await
        .expect("synchronizer running")
}

#[allow(dead_code)]
pub async fn body_json(response: Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("JSON body")
}
