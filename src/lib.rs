// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! PrimeFit session service
//!
//! Keeps "who is signed in", their profile and their admin status in sync
//! with the hosted auth + database backend, and serves that state (plus
//! auth, profile and chat operations) to the dashboard over HTTP.

pub mod backend;
pub mod config;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod time_utils;

use backend::Backend;
use config::Config;
use services::{
    AuthService, ChatService, ProfileLoader, RetryPolicy, SessionHandle, SessionSynchronizer,
};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub backend: Backend,
    pub loader: ProfileLoader,
    pub session: SessionHandle,
    pub auth: AuthService,
    pub chat: ChatService,
}

impl AppState {
    /// Wire the services over `backend` and start the session synchronizer.
    ///
    /// Background tasks (auto-refresh, message feed) are left to the caller.
    pub fn start(config: Config, backend: Backend) -> (Arc<Self>, JoinHandle<()>) {
        let loader = ProfileLoader::new(
            backend.profiles.clone(),
            RetryPolicy::from_config(&config),
        );
        let (session, synchronizer) =
            SessionSynchronizer::spawn(backend.auth.clone(), loader.clone());
        let auth = AuthService::new(
            backend.auth.clone(),
            backend.profiles.clone(),
            session.clone(),
        );
        let chat = ChatService::new(backend.messages.clone(), session.clone());

        let state = Arc::new(Self {
            config,
            backend,
            loader,
            session,
            auth,
            chat,
        });
        (state, synchronizer)
    }
}
