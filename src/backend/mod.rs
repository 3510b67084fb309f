// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Backend-as-a-service collaborators (auth, profile rows, messages).
//!
//! The rest of the crate only talks to the backend through the traits below.
//! `SupabaseClient` is the production implementation; `MemoryBackend` serves
//! offline runs and tests.

pub mod memory;
pub mod supabase;

pub use memory::MemoryBackend;
pub use supabase::SupabaseClient;

use crate::models::{AuthEvent, AuthUser, ChatMessage, NewMessage, Profile, ProfileChanges, Role, Session};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Table and procedure names.
pub mod tables {
    pub const PROFILES: &str = "profiles";
    pub const MESSAGES: &str = "mensagens";
    /// RPC taking `{user_email}` and returning a boolean
    pub const IS_ADMIN_RPC: &str = "is_admin_by_email";
}

/// Errors reported by backend collaborators.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Request failed: {0}")]
    Http(String),

    #[error("Backend returned {status}: {message}")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("Unexpected response body: {0}")]
    Decode(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("No active session")]
    NotAuthenticated,

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

impl BackendError {
    /// PostgREST code for "single row requested, zero rows returned".
    pub const NO_ROWS_CODE: &'static str = "PGRST116";

    /// Message GoTrue returns when signing out without a session.
    pub const SESSION_MISSING: &'static str = "Auth session missing!";

    /// True for the "no row found" response of a single-row select.
    pub fn is_no_rows(&self) -> bool {
        matches!(self, BackendError::Api { code: Some(code), .. } if code == Self::NO_ROWS_CODE)
    }

    /// True when the server no longer knows the session being used.
    pub fn is_session_missing(&self) -> bool {
        match self {
            BackendError::NotAuthenticated => true,
            BackendError::Api {
                status, message, ..
            } => *status == 401 || *status == 403 || message == Self::SESSION_MISSING,
            _ => false,
        }
    }

    /// True when a refresh token was rejected and the session cannot recover.
    pub fn is_invalid_grant(&self) -> bool {
        match self {
            BackendError::Api {
                status, code, message,
            } => {
                (*status == 400 || *status == 401)
                    && (code.as_deref() == Some("invalid_grant")
                        || code.as_deref() == Some("refresh_token_not_found")
                        || message.contains("Invalid Refresh Token"))
            }
            _ => false,
        }
    }

    /// Message suitable for showing next to a form.
    pub fn user_message(&self) -> String {
        match self {
            BackendError::Api { message, .. } => message.clone(),
            BackendError::Timeout(_) => "O servidor demorou para responder. Tente novamente.".to_string(),
            BackendError::NotAuthenticated => "Usuário não autenticado".to_string(),
            _ => "Erro ao processar solicitação. Tente novamente.".to_string(),
        }
    }
}

/// Result of a sign-up request.
#[derive(Debug, Clone)]
pub struct SignUpResult {
    pub user: AuthUser,
    /// `None` when the account still needs email confirmation
    pub session: Option<Session>,
}

/// Auth service client.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Current session, if any.
    async fn get_session(&self) -> Result<Option<Session>, BackendError>;

    /// Subscribe to auth state changes. Dropping the receiver unsubscribes.
    fn on_auth_state_change(&self) -> broadcast::Receiver<AuthEvent>;

    async fn sign_in_with_password(&self, email: &str, password: &str)
        -> Result<Session, BackendError>;

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: serde_json::Value,
    ) -> Result<SignUpResult, BackendError>;

    async fn sign_out(&self) -> Result<(), BackendError>;

    async fn reset_password_for_email(&self, email: &str) -> Result<(), BackendError>;

    /// Exchange the refresh token for a new session.
    async fn refresh_session(&self) -> Result<Session, BackendError>;
}

/// Profile rows plus the server-side admin check.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Look up a profile by user id. `Ok(None)` when no row exists.
    async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>, BackendError>;

    async fn insert_profile(&self, profile: &Profile) -> Result<Profile, BackendError>;

    async fn update_profile(
        &self,
        user_id: &str,
        changes: &ProfileChanges,
    ) -> Result<Profile, BackendError>;

    async fn list_profiles(&self) -> Result<Vec<Profile>, BackendError>;

    async fn set_role(&self, user_id: &str, role: Role) -> Result<Profile, BackendError>;

    /// Server-confirmed admin status for an email.
    async fn is_admin_by_email(&self, email: &str) -> Result<bool, BackendError>;
}

/// Chat message rows.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Messages exchanged between two users, oldest first.
    async fn conversation(&self, user_id: &str, peer_id: &str)
        -> Result<Vec<ChatMessage>, BackendError>;

    async fn send_message(&self, message: &NewMessage) -> Result<ChatMessage, BackendError>;

    async fn mark_read(&self, message_id: &str) -> Result<(), BackendError>;

    /// Messages involving `user_id` inserted strictly after `since` (RFC 3339).
    async fn inserted_since(
        &self,
        user_id: &str,
        since: &str,
    ) -> Result<Vec<ChatMessage>, BackendError>;
}

/// The set of collaborators the application is wired with.
#[derive(Clone)]
pub struct Backend {
    pub auth: Arc<dyn AuthBackend>,
    pub profiles: Arc<dyn ProfileStore>,
    pub messages: Arc<dyn MessageStore>,
}

impl Backend {
    pub fn supabase(client: SupabaseClient) -> Self {
        let client = Arc::new(client);
        Self {
            auth: client.clone(),
            profiles: client.clone(),
            messages: client,
        }
    }

    pub fn memory(backend: MemoryBackend) -> Self {
        let backend = Arc::new(backend);
        Self {
            auth: backend.clone(),
            profiles: backend.clone(),
            messages: backend,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(status: u16, code: Option<&str>, message: &str) -> BackendError {
        BackendError::Api {
            status,
            code: code.map(str::to_string),
            message: message.to_string(),
        }
    }

    #[test]
    fn test_no_rows_detection() {
        assert!(api(406, Some("PGRST116"), "JSON object requested").is_no_rows());
        assert!(!api(500, Some("XX000"), "boom").is_no_rows());
        assert!(!BackendError::Http("reset".to_string()).is_no_rows());
    }

    #[test]
    fn test_session_missing_detection() {
        assert!(api(400, None, BackendError::SESSION_MISSING).is_session_missing());
        assert!(api(401, None, "jwt expired").is_session_missing());
        assert!(BackendError::NotAuthenticated.is_session_missing());
        assert!(!api(500, None, "boom").is_session_missing());
    }

    #[test]
    fn test_invalid_grant_detection() {
        assert!(api(400, Some("refresh_token_not_found"), "Invalid Refresh Token").is_invalid_grant());
        assert!(api(400, None, "Invalid Refresh Token: Already Used").is_invalid_grant());
        assert!(!api(503, None, "unavailable").is_invalid_grant());
    }

    #[test]
    fn test_user_message_passes_api_message() {
        assert_eq!(
            api(400, Some("invalid_credentials"), "Invalid login credentials").user_message(),
            "Invalid login credentials"
        );
    }
}
