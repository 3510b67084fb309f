// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Sign-in, sign-up, sign-out, password reset and self-service profile edits.
//!
//! Successful sign-in and sign-up do not touch session state directly; the
//! resulting auth event drives the synchronizer.

use super::session::SessionHandle;
use crate::backend::{AuthBackend, BackendError, ProfileStore, SignUpResult};
use crate::error::{AppError, Result};
use crate::models::{Profile, ProfileUpdate, Session};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Failed auth request, with a message fit for a form.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct AuthFailure {
    pub message: String,
}

impl From<BackendError> for AuthFailure {
    fn from(err: BackendError) -> Self {
        Self {
            message: err.user_message(),
        }
    }
}

/// Auth operations on behalf of the dashboard.
#[derive(Clone)]
pub struct AuthService {
    auth: Arc<dyn AuthBackend>,
    profiles: Arc<dyn ProfileStore>,
    session: SessionHandle,
    /// Held for the whole of a sign-out
    sign_out_lock: Arc<Mutex<()>>,
    /// Completed sign-outs
    sign_outs: Arc<AtomicU64>,
}

impl AuthService {
    pub fn new(
        auth: Arc<dyn AuthBackend>,
        profiles: Arc<dyn ProfileStore>,
        session: SessionHandle,
    ) -> Self {
        Self {
            auth,
            profiles,
            session,
            sign_out_lock: Arc::new(Mutex::new(())),
            sign_outs: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> std::result::Result<Session, AuthFailure> {
        match self.auth.sign_in_with_password(email.trim(), password).await {
            Ok(session) => {
                tracing::info!(user_id = %session.user.id, "Sign-in succeeded");
                Ok(session)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Sign-in failed");
                Err(e.into())
            }
        }
    }

    /// Register a new account. `nome` is stored as sign-up metadata and
    /// becomes the display name of the first profile row.
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        nome: &str,
    ) -> std::result::Result<SignUpResult, AuthFailure> {
        let metadata = serde_json::json!({ "nome": nome.trim() });
        match self.auth.sign_up(email.trim(), password, metadata).await {
            Ok(result) => {
                tracing::info!(
                    user_id = %result.user.id,
                    needs_confirmation = result.session.is_none(),
                    "Sign-up succeeded"
                );
                Ok(result)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Sign-up failed");
                Err(e.into())
            }
        }
    }

    pub async fn reset_password(&self, email: &str) -> std::result::Result<(), AuthFailure> {
        self.auth
            .reset_password_for_email(email.trim())
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "Password reset request failed");
                AuthFailure::from(e)
            })
    }

    /// Sign out and clear local state.
    ///
    /// Local state is cleared even when the backend call fails. The work runs
    /// on its own task, so it completes even if the caller is dropped.
    ///
    /// A call made while another sign-out is running waits for that one and
    /// returns false instead of signing out a second time. Either way the
    /// session is clear when this returns.
    pub async fn sign_out(&self) -> bool {
        let seen = self.sign_outs.load(Ordering::SeqCst);
        let guard = self.sign_out_lock.clone().lock_owned().await;
        if self.sign_outs.load(Ordering::SeqCst) != seen {
            tracing::debug!("Joined a sign-out that was already running");
            return false;
        }

        let service = self.clone();
        let task = tokio::spawn(async move {
            let _guard = guard;
            service.sign_out_now().await;
        });
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Sign-out task failed, clearing local session");
            self.session.clear_local().await;
        }
        true
    }

    async fn sign_out_now(&self) {
        match self.auth.sign_out().await {
            Ok(()) => tracing::info!("Signed out"),
            Err(e) if e.is_session_missing() => {
                tracing::debug!(error = %e, "No server session to sign out of");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Sign-out request failed, clearing local session anyway");
            }
        }

        self.session.clear_local().await;
        self.sign_outs.fetch_add(1, Ordering::SeqCst);
    }

    /// Apply a self-service edit to the current user's profile.
    ///
    /// An edit with nothing to change returns the current profile untouched.
    /// A user still on a fallback profile gets the row created.
    pub async fn update_profile(&self, update: ProfileUpdate) -> Result<Profile> {
        let snapshot = self.session.snapshot();
        let Some(user) = snapshot.user else {
            return Err(AppError::Unauthorized);
        };

        let changes = update.into_changes();
        if changes.is_empty() {
            return snapshot
                .profile
                .ok_or_else(|| AppError::NotFound("profile".to_string()));
        }

        let profile = match self.profiles.update_profile(&user.id, &changes).await {
            Ok(profile) => profile,
            Err(e) if e.is_no_rows() => {
                tracing::info!(user_id = %user.id, "No profile row yet, creating it");
                let mut profile = snapshot.profile.unwrap_or_else(|| {
                    Profile::fallback(&user.id, user.email.as_deref().unwrap_or_default())
                });
                changes.apply_to(&mut profile);
                profile.created_at = None;
                self.profiles.insert_profile(&profile).await?
            }
            Err(e) => return Err(e.into()),
        };

        tracing::info!(user_id = %user.id, "Profile updated");
        self.session.profile_saved(profile.clone()).await;
        Ok(profile)
    }

    /// Access token of the current session, if any.
    pub async fn session_token(&self) -> Option<String> {
        match self.auth.get_session().await {
            Ok(session) => session.map(|s| s.access_token),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read session token");
                None
            }
        }
    }

    pub fn is_profile_complete(&self) -> bool {
        self.session.snapshot().is_profile_complete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_uses_backend_message() {
        let failure = AuthFailure::from(BackendError::Api {
            status: 400,
            code: Some("invalid_credentials".to_string()),
            message: "Invalid login credentials".to_string(),
        });
        assert_eq!(failure.to_string(), "Invalid login credentials");
    }
}
