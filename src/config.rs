// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Application configuration loaded from environment variables.

use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    // --- Backend ---
    /// Supabase project URL
    pub supabase_url: String,
    /// Supabase public anon key
    pub supabase_anon_key: String,
    /// Where the session is persisted between runs (None = memory only)
    pub session_file: Option<PathBuf>,

    // --- HTTP gateway ---
    /// Dashboard origin allowed by CORS
    pub frontend_url: String,
    /// Listen address. Loopback unless deliberately exposed: every caller
    /// acts as the signed-in user.
    pub bind_addr: IpAddr,
    /// Server port
    pub port: u16,

    // --- Profile loading ---
    /// Profile lookup attempts before falling back
    pub profile_fetch_attempts: u32,
    /// Timeout for each profile or admin lookup
    pub profile_fetch_timeout: Duration,
    /// Backoff step between attempts (attempt n waits n × step)
    pub profile_retry_backoff: Duration,

    // --- Chat ---
    /// Change-feed polling interval
    pub chat_poll_interval: Duration,
}

impl Default for Config {
    /// Default config for testing only.
    fn default() -> Self {
        Self {
            supabase_url: "http://localhost:54321".to_string(),
            supabase_anon_key: "test_anon_key".to_string(),
            session_file: None,
            frontend_url: "http://localhost:5173".to_string(),
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8080,
            profile_fetch_attempts: 3,
            profile_fetch_timeout: Duration::from_secs(5),
            profile_retry_backoff: Duration::from_secs(1),
            chat_poll_interval: Duration::from_secs(3),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// A `.env` file in the working directory is read first if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let defaults = Self::default();

        Ok(Self {
            supabase_url: required("SUPABASE_URL")?,
            supabase_anon_key: required("SUPABASE_ANON_KEY")?,
            session_file: env::var("SESSION_FILE")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            frontend_url: env::var("FRONTEND_URL").unwrap_or(defaults.frontend_url),
            bind_addr: parsed("BIND_ADDR")?.unwrap_or(defaults.bind_addr),
            port: parsed("PORT")?.unwrap_or(defaults.port),
            profile_fetch_attempts: parsed::<u32>("PROFILE_FETCH_ATTEMPTS")?
                .unwrap_or(defaults.profile_fetch_attempts)
                .max(1),
            profile_fetch_timeout: parsed("PROFILE_FETCH_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.profile_fetch_timeout),
            profile_retry_backoff: parsed("PROFILE_RETRY_BACKOFF_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.profile_retry_backoff),
            chat_poll_interval: parsed("CHAT_POLL_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.chat_poll_interval),
        })
    }

    /// Config for tests: defaults with fast retries.
    pub fn test_default() -> Self {
        Self {
            profile_fetch_timeout: Duration::from_millis(200),
            profile_retry_backoff: Duration::from_millis(10),
            chat_poll_interval: Duration::from_millis(20),
            ..Self::default()
        }
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name)
        .map(|v| v.trim().to_string())
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing(name))
}

fn parsed<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(name, raw)),
        Err(_) => Ok(None),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {0}: {1:?}")]
    Invalid(&'static str, String),
}
