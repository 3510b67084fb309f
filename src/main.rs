// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! PrimeFit session gateway
//!
//! Signs in against Supabase, keeps the session and profile in sync and
//! serves them to the dashboard.

use primefit_session::{
    backend::{Backend, SupabaseClient},
    config::Config,
    AppState,
};
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize structured JSON logging
    init_logging()?;

    // Load configuration from environment
    let config = Config::from_env()?;
    tracing::info!(port = config.port, "Starting PrimeFit session gateway");

    let supabase = SupabaseClient::from_config(&config);
    let refresh_task = supabase.spawn_auto_refresh();
    tracing::info!(url = %config.supabase_url, "Supabase client initialized");

    let (state, synchronizer) = AppState::start(config.clone(), Backend::supabase(supabase));
    let feed_task = state.chat.spawn_feed(config.chat_poll_interval);

    // Build router
    let app = primefit_session::routes::create_router(state.clone());

    // Start server
    let addr = SocketAddr::new(config.bind_addr, config.port);
    if !addr.ip().is_loopback() {
        tracing::warn!(address = %addr, "Listening beyond loopback; anyone who can connect acts as the signed-in user");
    }
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(address = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down");
    state.session.shutdown().await;
    refresh_task.abort();
    feed_task.abort();
    synchronizer.await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

/// Initialize structured JSON logging.
fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    let format = tracing_subscriber::fmt::layer()
        .json()
        .with_target(false)
        .with_current_span(true)
        .flatten_event(true);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("primefit_session=debug".parse()?)
                .add_directive("info".parse()?),
        )
        .with(format)
        .init();
    Ok(())
}
