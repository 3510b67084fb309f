// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Auth identity, session and auth-state-change events.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

/// Identity record owned by the auth service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub struct AuthUser {
    /// Stable user id (also the profile row id)
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    /// Free-form metadata supplied at sign-up
    #[serde(default)]
    #[cfg_attr(feature = "binding-generation", ts(type = "Record<string, unknown>"))]
    pub user_metadata: serde_json::Value,
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// Credential issued by the auth service.
///
/// The refresh cycle belongs to the auth service; the synchronizer only reads
/// the embedded user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    /// Lifetime in seconds, as returned by the token endpoint
    #[serde(default)]
    pub expires_in: Option<i64>,
    /// Expiry as a Unix timestamp
    #[serde(default)]
    pub expires_at: Option<i64>,
    pub user: AuthUser,
}

impl Session {
    /// Fill in `expires_at` from `expires_in` when the server omitted it.
    pub fn normalized(mut self, now: DateTime<Utc>) -> Self {
        if self.expires_at.is_none() {
            if let Some(expires_in) = self.expires_in {
                self.expires_at = Some(now.timestamp() + expires_in);
            }
        }
        self
    }

    /// Expiry time, if known.
    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        self.expires_at
            .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
    }

    /// True when the access token expires within `margin` of `now`.
    pub fn expires_within(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        match self.expiry() {
            Some(expiry) => now + margin >= expiry,
            None => false,
        }
    }
}

/// Kind of auth state change pushed by the auth service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthChange {
    InitialSession,
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
    PasswordRecovery,
}

/// An auth state change together with the session it carries.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthEvent {
    pub kind: AuthChange,
    pub session: Option<Session>,
}

impl AuthEvent {
    pub fn new(kind: AuthChange, session: Option<Session>) -> Self {
        Self { kind, session }
    }

    pub fn signed_in(session: Session) -> Self {
        Self::new(AuthChange::SignedIn, Some(session))
    }

    pub fn signed_out() -> Self {
        Self::new(AuthChange::SignedOut, None)
    }

    pub fn token_refreshed(session: Session) -> Self {
        Self::new(AuthChange::TokenRefreshed, Some(session))
    }

    /// User id carried by the event, for logging.
    pub fn user_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.user.id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(expires_in: Option<i64>, expires_at: Option<i64>) -> Session {
        Session {
            access_token: "at".to_string(),
            refresh_token: "rt".to_string(),
            token_type: Some("bearer".to_string()),
            expires_in,
            expires_at,
            user: AuthUser {
                id: "U1".to_string(),
                email: Some("a@b.com".to_string()),
                user_metadata: serde_json::Value::Null,
                updated_at: None,
            },
        }
    }

    #[test]
    fn test_normalized_derives_expiry_from_lifetime() {
        let now = Utc::now();
        let s = session(Some(3600), None).normalized(now);
        assert_eq!(s.expires_at, Some(now.timestamp() + 3600));
    }

    #[test]
    fn test_normalized_keeps_server_expiry() {
        let s = session(Some(3600), Some(42)).normalized(Utc::now());
        assert_eq!(s.expires_at, Some(42));
    }

    #[test]
    fn test_expires_within_margin() {
        let now = Utc::now();
        let s = session(None, Some((now + Duration::minutes(3)).timestamp()));
        assert!(s.expires_within(now, Duration::minutes(5)));
        assert!(!s.expires_within(now, Duration::minutes(1)));
    }

    #[test]
    fn test_unknown_expiry_never_expires() {
        let s = session(None, None);
        assert!(!s.expires_within(Utc::now(), Duration::days(365)));
    }

    #[test]
    fn test_auth_change_wire_names() {
        let json = serde_json::to_string(&AuthChange::TokenRefreshed).unwrap();
        assert_eq!(json, "\"TOKEN_REFRESHED\"");
    }
}
