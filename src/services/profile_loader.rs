// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Profile and admin-status loading.
//!
//! The profile lookup and the admin check run concurrently and both settle
//! before a result is returned. Failures never surface to the caller:
//! - the profile degrades to [`Profile::fallback`] (see [`ProfileSource`])
//! - the admin flag degrades to `false`

use crate::backend::{BackendError, ProfileStore};
use crate::config::Config;
use crate::models::{AuthUser, Profile};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

/// Retry contract for profile lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total lookup attempts (at least 1)
    pub max_attempts: u32,
    /// Bound on each lookup, insert and admin check
    pub attempt_timeout: Duration,
    /// Wait before attempt n+1 is `n × backoff_step`
    pub backoff_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(5),
            backoff_step: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.profile_fetch_attempts.max(1),
            attempt_timeout: config.profile_fetch_timeout,
            backoff_step: config.profile_retry_backoff,
        }
    }

    /// Backoff after the given (1-based) failed attempt.
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        self.backoff_step * attempt
    }
}

/// Where a loaded profile came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
#[serde(rename_all = "snake_case")]
pub enum ProfileSource {
    /// Existing row
    Stored,
    /// No row existed; a basic row was inserted
    Created,
    /// Synthesized locally, nothing stored
    Fallback,
}

/// Profile and admin flag, committed together.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedProfile {
    pub profile: Profile,
    pub is_admin: bool,
    pub source: ProfileSource,
}

/// Loads profile + admin status for a user.
#[derive(Clone)]
pub struct ProfileLoader {
    store: Arc<dyn ProfileStore>,
    policy: RetryPolicy,
}

impl ProfileLoader {
    pub fn new(store: Arc<dyn ProfileStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Load the profile and admin flag for `user`.
    ///
    /// Always returns a profile whose id is `user.id`.
    pub async fn load(&self, user: &AuthUser) -> LoadedProfile {
        let Some(email) = user.email.as_deref().filter(|e| !e.is_empty()) else {
            tracing::warn!(user_id = %user.id, "User has no email, using fallback profile");
            return LoadedProfile {
                profile: Profile::fallback(&user.id, ""),
                is_admin: false,
                source: ProfileSource::Fallback,
            };
        };

        let ((profile, source), is_admin) =
            tokio::join!(self.fetch_profile(user, email), self.check_admin(email));

        LoadedProfile {
            profile,
            is_admin,
            source,
        }
    }

    /// Server-side admin check, bounded by the attempt timeout.
    ///
    /// Any failure counts as "not admin".
    pub async fn check_admin(&self, email: &str) -> bool {
        match tokio::time::timeout(
            self.policy.attempt_timeout,
            self.store.is_admin_by_email(email),
        )
        .await
        {
            Ok(Ok(is_admin)) => is_admin,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Admin check failed, treating as non-admin");
                false
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.policy.attempt_timeout.as_millis() as u64,
                    "Admin check timed out, treating as non-admin"
                );
                false
            }
        }
    }

    async fn fetch_profile(&self, user: &AuthUser, email: &str) -> (Profile, ProfileSource) {
        let user_id = user.id.as_str();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.lookup_once(user_id).await {
                Ok(Some(profile)) if profile.id == user_id => {
                    return (profile, ProfileSource::Stored);
                }
                Ok(Some(profile)) => {
                    tracing::error!(
                        expected = %user_id,
                        got = %profile.id,
                        "Profile lookup returned another user's row"
                    );
                    return (Profile::fallback(user_id, email), ProfileSource::Fallback);
                }
                Ok(None) => return self.create_basic(user, email).await,
                Err(e) if attempt < self.policy.max_attempts => {
                    let backoff = self.policy.backoff_after(attempt);
                    tracing::warn!(
                        user_id = %user_id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Profile lookup failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    tracing::error!(
                        user_id = %user_id,
                        attempts = attempt,
                        error = %e,
                        "Profile lookup failed, storing a basic profile"
                    );
                    // An existing row makes the insert conflict; it is never
                    // overwritten and the caller gets the fallback.
                    return self.create_basic(user, email).await;
                }
            }
        }
    }

    async fn lookup_once(&self, user_id: &str) -> Result<Option<Profile>, BackendError> {
        let timeout = self.policy.attempt_timeout;
        match tokio::time::timeout(timeout, self.store.get_profile(user_id)).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(timeout)),
        }
    }

    /// First login: store a basic row, or fall back to it unstored.
    ///
    /// The row takes the name given at sign-up when there is one.
    async fn create_basic(&self, user: &AuthUser, email: &str) -> (Profile, ProfileSource) {
        let user_id = user.id.as_str();
        let mut basic = Profile::fallback(user_id, email);
        if let Some(nome) = signup_name(user) {
            basic.nome = Some(nome);
        }
        let timeout = self.policy.attempt_timeout;

        match tokio::time::timeout(timeout, self.store.insert_profile(&basic)).await {
            Ok(Ok(created)) => {
                tracing::info!(user_id = %user_id, "Created basic profile");
                (created, ProfileSource::Created)
            }
            Ok(Err(e)) => {
                tracing::warn!(user_id = %user_id, error = %e, "Profile insert failed, using fallback profile");
                (basic, ProfileSource::Fallback)
            }
            Err(_) => {
                tracing::warn!(user_id = %user_id, "Profile insert timed out, using fallback profile");
                (basic, ProfileSource::Fallback)
            }
        }
    }
}

fn signup_name(user: &AuthUser) -> Option<String> {
    user.user_metadata
        .get("nome")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
