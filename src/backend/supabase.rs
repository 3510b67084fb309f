// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Supabase client (GoTrue auth + PostgREST).
//!
//! Handles:
//! - Password sign-in, sign-up, sign-out and password recovery
//! - Session storage (in memory, optionally persisted to a file)
//! - Token refresh ahead of expiry, with auth events on every change
//! - Profile rows and the admin RPC
//! - Chat message rows

use super::{tables, AuthBackend, BackendError, MessageStore, ProfileStore, SignUpResult};
use crate::config::Config;
use crate::models::{
    AuthEvent, AuthUser, ChatMessage, NewMessage, Profile, ProfileChanges, Role, Session,
};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use reqwest::header::ACCEPT;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

/// Margin before token expiration when we proactively refresh (5 minutes).
const TOKEN_REFRESH_MARGIN_SECS: i64 = 5 * 60;
/// How often the refresh task looks again while signed out.
const IDLE_REFRESH_CHECK: Duration = Duration::from_secs(30);
/// Lower bound between refresh attempts.
const MIN_REFRESH_WAIT: Duration = Duration::from_secs(5);
const EVENT_BUFFER: usize = 64;

/// Ask PostgREST for a single JSON object instead of an array.
const SINGLE_OBJECT: &str = "application/vnd.pgrst.object+json";
const PREFER: &str = "Prefer";
const RETURN_REPRESENTATION: &str = "return=representation";

fn refresh_margin() -> ChronoDuration {
    ChronoDuration::seconds(TOKEN_REFRESH_MARGIN_SECS)
}

/// Supabase API client.
///
/// Cloning is cheap; clones share the session and event channel.
#[derive(Clone)]
pub struct SupabaseClient {
    http: reqwest::Client,
    base_url: String,
    anon_key: String,
    session: Arc<RwLock<Option<Session>>>,
    /// Serializes refresh-token exchanges (a refresh token is single-use).
    refresh_lock: Arc<Mutex<()>>,
    /// Serializes writes of the session file.
    persist_lock: Arc<Mutex<()>>,
    events: broadcast::Sender<AuthEvent>,
    session_file: Option<PathBuf>,
}

impl SupabaseClient {
    /// Create a client for a project URL and its public anon key.
    pub fn new(base_url: &str, anon_key: &str) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            anon_key: anon_key.to_string(),
            session: Arc::new(RwLock::new(None)),
            refresh_lock: Arc::new(Mutex::new(())),
            persist_lock: Arc::new(Mutex::new(())),
            events,
            session_file: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let client = Self::new(&config.supabase_url, &config.supabase_anon_key);
        match &config.session_file {
            Some(path) => client.with_session_file(path.clone()),
            None => client,
        }
    }

    /// Persist the session to `path` and restore it now if the file exists.
    pub fn with_session_file(mut self, path: PathBuf) -> Self {
        match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Session>(&raw) {
                Ok(session) => {
                    tracing::info!(user_id = %session.user.id, "Restored persisted session");
                    self.session = Arc::new(RwLock::new(Some(session)));
                }
                Err(e) => {
                    tracing::warn!(error = %e, path = %path.display(), "Ignoring unreadable session file");
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "Failed to read session file");
            }
        }
        self.session_file = Some(path);
        self
    }

    fn auth_url(&self, path: &str) -> String {
        format!("{}/auth/v1/{}", self.base_url, path)
    }

    fn rest_url(&self, path: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, path)
    }

    fn current(&self) -> Option<Session> {
        self.session.read().clone()
    }

    /// Bearer token for data requests: the user's access token, or the anon
    /// key while signed out.
    fn bearer(&self) -> String {
        self.session
            .read()
            .as_ref()
            .map(|s| s.access_token.clone())
            .unwrap_or_else(|| self.anon_key.clone())
    }

    fn request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header("apikey", &self.anon_key)
            .bearer_auth(self.bearer())
    }

    fn emit(&self, event: AuthEvent) {
        tracing::debug!(event = ?event.kind, user_id = ?event.user_id(), "Emitting auth event");
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn store_session(&self, session: Option<Session>) {
        *self.session.write() = session;
        self.persist().await;
    }

    /// Replace the session only while it still holds `refresh_token`.
    ///
    /// Returns false when something else replaced it first; `next` is then
    /// dropped.
    async fn replace_session(&self, refresh_token: &str, next: Option<Session>) -> bool {
        {
            let mut slot = self.session.write();
            if slot.as_ref().map(|s| s.refresh_token.as_str()) != Some(refresh_token) {
                return false;
            }
            *slot = next;
        }
        self.persist().await;
        true
    }

    /// Drop the session holding `refresh_token` and emit `SIGNED_OUT`.
    async fn end_session(&self, refresh_token: &str) {
        if self.replace_session(refresh_token, None).await {
            self.emit(AuthEvent::signed_out());
        }
    }

    /// Write the session as it is now. Callers racing each other all end up
    /// writing the latest state, so the file never lags memory.
    async fn persist(&self) {
        let Some(path) = &self.session_file else {
            return;
        };

        let _guard = self.persist_lock.lock().await;
        let session = self.current();
        let result = match &session {
            Some(session) => match serde_json::to_vec_pretty(session) {
                Ok(bytes) => tokio::fs::write(path, bytes).await,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to serialize session");
                    return;
                }
            },
            None => match tokio::fs::remove_file(path).await {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            },
        };

        if let Err(e) = result {
            tracing::warn!(error = %e, path = %path.display(), "Failed to persist session");
        }
    }

    /// POST to the token endpoint with the given grant.
    async fn token_request(
        &self,
        grant_type: &str,
        body: serde_json::Value,
    ) -> Result<Session, BackendError> {
        let response = self
            .http
            .post(self.auth_url("token"))
            .query(&[("grant_type", grant_type)])
            .header("apikey", &self.anon_key)
            .json(&body)
            .send()
            .await
            .map_err(http_error)?;

        let session: Session = check_response_json(response).await?;
        Ok(session.normalized(Utc::now()))
    }

    /// How long the refresh task should sleep before looking again.
    fn time_until_refresh(&self) -> Duration {
        let Some(expiry) = self.current().and_then(|s| s.expiry()) else {
            return IDLE_REFRESH_CHECK;
        };
        (expiry - refresh_margin() - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
            .max(MIN_REFRESH_WAIT)
    }

    /// Spawn the background task that refreshes the session ahead of expiry.
    ///
    /// A rejected refresh token ends the session: it is cleared locally and
    /// `SIGNED_OUT` is emitted.
    pub fn spawn_auto_refresh(&self) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(client.time_until_refresh()).await;

                let Some(due) = client
                    .current()
                    .filter(|s| s.expires_within(Utc::now(), refresh_margin()))
                else {
                    continue;
                };

                match client.refresh_session().await {
                    Ok(session) => {
                        tracing::info!(user_id = %session.user.id, "Session refreshed ahead of expiry");
                    }
                    Err(e) if e.is_invalid_grant() => {
                        tracing::warn!(error = %e, "Refresh token rejected, ending session");
                        client.end_session(&due.refresh_token).await;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Session refresh failed, will retry");
                    }
                }
            }
        })
    }
}

#[async_trait]
impl AuthBackend for SupabaseClient {
    async fn get_session(&self) -> Result<Option<Session>, BackendError> {
        let Some(session) = self.current() else {
            return Ok(None);
        };

        if !session.expires_within(Utc::now(), refresh_margin()) {
            return Ok(Some(session));
        }

        tracing::debug!(user_id = %session.user.id, "Stored session near expiry, refreshing");
        match self.refresh_session().await {
            Ok(session) => Ok(Some(session)),
            // Signed out while we were refreshing.
            Err(BackendError::NotAuthenticated) => Ok(self.current()),
            Err(e) if e.is_invalid_grant() || session.expires_within(Utc::now(), ChronoDuration::zero()) => {
                tracing::warn!(
                    error = %e,
                    user_id = %session.user.id,
                    "Session refresh failed and the token is unusable, ending session"
                );
                self.end_session(&session.refresh_token).await;
                Err(e)
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    user_id = %session.user.id,
                    "Session refresh failed, keeping the unexpired token"
                );
                Ok(Some(session))
            }
        }
    }

    fn on_auth_state_change(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, BackendError> {
        let session = self
            .token_request("password", json!({ "email": email, "password": password }))
            .await?;

        self.store_session(Some(session.clone())).await;
        tracing::info!(user_id = %session.user.id, "Signed in with password");
        self.emit(AuthEvent::signed_in(session.clone()));
        Ok(session)
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: serde_json::Value,
    ) -> Result<SignUpResult, BackendError> {
        let response = self
            .http
            .post(self.auth_url("signup"))
            .header("apikey", &self.anon_key)
            .json(&json!({ "email": email, "password": password, "data": metadata }))
            .send()
            .await
            .map_err(http_error)?;

        let body: serde_json::Value = check_response_json(response).await?;

        // Auto-confirmed projects answer with a session, others with the user.
        if body.get("access_token").is_some() {
            let session: Session = serde_json::from_value(body)
                .map_err(|e| BackendError::Decode(e.to_string()))?;
            let session = session.normalized(Utc::now());
            self.store_session(Some(session.clone())).await;
            self.emit(AuthEvent::signed_in(session.clone()));
            return Ok(SignUpResult {
                user: session.user.clone(),
                session: Some(session),
            });
        }

        let user: AuthUser = serde_json::from_value(body.get("user").cloned().unwrap_or(body))
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        tracing::info!(user_id = %user.id, "Sign-up pending email confirmation");
        Ok(SignUpResult {
            user,
            session: None,
        })
    }

    async fn sign_out(&self) -> Result<(), BackendError> {
        let token = self.current().map(|s| s.access_token);

        let result = match token {
            None => Err(BackendError::Api {
                status: 400,
                code: None,
                message: BackendError::SESSION_MISSING.to_string(),
            }),
            Some(token) => {
                match self
                    .http
                    .post(self.auth_url("logout"))
                    .header("apikey", &self.anon_key)
                    .bearer_auth(token)
                    .send()
                    .await
                {
                    Ok(response) => check_response(response).await,
                    Err(e) => Err(http_error(e)),
                }
            }
        };

        // The local session is dropped whatever the server answered.
        self.store_session(None).await;
        self.emit(AuthEvent::signed_out());
        result
    }

    async fn reset_password_for_email(&self, email: &str) -> Result<(), BackendError> {
        let response = self
            .http
            .post(self.auth_url("recover"))
            .header("apikey", &self.anon_key)
            .json(&json!({ "email": email }))
            .send()
            .await
            .map_err(http_error)?;

        check_response(response).await
    }

    async fn refresh_session(&self) -> Result<Session, BackendError> {
        let stale = self
            .current()
            .map(|s| s.refresh_token)
            .ok_or(BackendError::NotAuthenticated)?;

        let _guard = self.refresh_lock.lock().await;

        // Another task may have refreshed while we were waiting.
        match self.current() {
            Some(current) if current.refresh_token != stale => return Ok(current),
            Some(_) => {}
            None => return Err(BackendError::NotAuthenticated),
        }

        let session = self
            .token_request("refresh_token", json!({ "refresh_token": stale }))
            .await?;

        // A sign-out during the exchange wins; the new tokens are dropped.
        if !self.replace_session(&stale, Some(session.clone())).await {
            tracing::info!(user_id = %session.user.id, "Session changed during refresh, discarding new tokens");
            return self.current().ok_or(BackendError::NotAuthenticated);
        }
        self.emit(AuthEvent::token_refreshed(session.clone()));
        Ok(session)
    }
}

#[async_trait]
impl ProfileStore for SupabaseClient {
    async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>, BackendError> {
        let filter = format!("eq.{}", user_id);
        let response = self
            .request(Method::GET, &self.rest_url(tables::PROFILES))
            .query(&[("select", "*"), ("id", filter.as_str())])
            .header(ACCEPT, SINGLE_OBJECT)
            .send()
            .await
            .map_err(http_error)?;

        match check_response_json::<Profile>(response).await {
            Ok(profile) => Ok(Some(profile)),
            Err(e) if e.is_no_rows() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn insert_profile(&self, profile: &Profile) -> Result<Profile, BackendError> {
        let response = self
            .request(Method::POST, &self.rest_url(tables::PROFILES))
            .header(ACCEPT, SINGLE_OBJECT)
            .header(PREFER, RETURN_REPRESENTATION)
            .json(profile)
            .send()
            .await
            .map_err(http_error)?;

        check_response_json(response).await
    }

    async fn update_profile(
        &self,
        user_id: &str,
        changes: &ProfileChanges,
    ) -> Result<Profile, BackendError> {
        let filter = format!("eq.{}", user_id);
        let response = self
            .request(Method::PATCH, &self.rest_url(tables::PROFILES))
            .query(&[("id", filter.as_str())])
            .header(ACCEPT, SINGLE_OBJECT)
            .header(PREFER, RETURN_REPRESENTATION)
            .json(changes)
            .send()
            .await
            .map_err(http_error)?;

        check_response_json(response).await
    }

    async fn list_profiles(&self) -> Result<Vec<Profile>, BackendError> {
        let response = self
            .request(Method::GET, &self.rest_url(tables::PROFILES))
            .query(&[("select", "*"), ("order", "created_at.desc")])
            .send()
            .await
            .map_err(http_error)?;

        check_response_json(response).await
    }

    async fn set_role(&self, user_id: &str, role: Role) -> Result<Profile, BackendError> {
        let filter = format!("eq.{}", user_id);
        let response = self
            .request(Method::PATCH, &self.rest_url(tables::PROFILES))
            .query(&[("id", filter.as_str())])
            .header(ACCEPT, SINGLE_OBJECT)
            .header(PREFER, RETURN_REPRESENTATION)
            .json(&json!({ "role": role }))
            .send()
            .await
            .map_err(http_error)?;

        check_response_json(response).await
    }

    async fn is_admin_by_email(&self, email: &str) -> Result<bool, BackendError> {
        let url = self.rest_url(&format!("rpc/{}", tables::IS_ADMIN_RPC));
        let response = self
            .request(Method::POST, &url)
            .json(&json!({ "user_email": email }))
            .send()
            .await
            .map_err(http_error)?;

        let value: serde_json::Value = check_response_json(response).await?;
        Ok(value == serde_json::Value::Bool(true))
    }
}

#[async_trait]
impl MessageStore for SupabaseClient {
    async fn conversation(
        &self,
        user_id: &str,
        peer_id: &str,
    ) -> Result<Vec<ChatMessage>, BackendError> {
        let filter = format!(
            "(and(sender_id.eq.{u},receiver_id.eq.{p}),and(sender_id.eq.{p},receiver_id.eq.{u}))",
            u = quoted(user_id),
            p = quoted(peer_id)
        );
        let response = self
            .request(Method::GET, &self.rest_url(tables::MESSAGES))
            .query(&[
                ("select", "*"),
                ("or", filter.as_str()),
                ("order", "created_at.asc"),
            ])
            .send()
            .await
            .map_err(http_error)?;

        check_response_json(response).await
    }

    async fn send_message(&self, message: &NewMessage) -> Result<ChatMessage, BackendError> {
        let response = self
            .request(Method::POST, &self.rest_url(tables::MESSAGES))
            .header(ACCEPT, SINGLE_OBJECT)
            .header(PREFER, RETURN_REPRESENTATION)
            .json(message)
            .send()
            .await
            .map_err(http_error)?;

        check_response_json(response).await
    }

    async fn mark_read(&self, message_id: &str) -> Result<(), BackendError> {
        let filter = format!("eq.{}", message_id);
        let response = self
            .request(Method::PATCH, &self.rest_url(tables::MESSAGES))
            .query(&[("id", filter.as_str())])
            .json(&json!({ "is_read": true }))
            .send()
            .await
            .map_err(http_error)?;

        check_response(response).await
    }

    async fn inserted_since(
        &self,
        user_id: &str,
        since: &str,
    ) -> Result<Vec<ChatMessage>, BackendError> {
        let participant = format!(
            "(sender_id.eq.{u},receiver_id.eq.{u})",
            u = quoted(user_id)
        );
        let after = format!("gt.{}", since);
        let response = self
            .request(Method::GET, &self.rest_url(tables::MESSAGES))
            .query(&[
                ("select", "*"),
                ("or", participant.as_str()),
                ("created_at", after.as_str()),
                ("order", "created_at.asc"),
            ])
            .send()
            .await
            .map_err(http_error)?;

        check_response_json(response).await
    }
}

/// Quote a value for a PostgREST logic tree (`or=(...)`), so reserved
/// characters in it cannot change the filter.
fn quoted(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn http_error(e: reqwest::Error) -> BackendError {
    BackendError::Http(e.to_string())
}

/// Build an API error from a GoTrue or PostgREST error body.
///
/// GoTrue uses `error_code`/`msg` (older versions `error`/`error_description`),
/// PostgREST uses `code`/`message`.
fn api_error(status: u16, body: &str) -> BackendError {
    let parsed: serde_json::Value = serde_json::from_str(body).unwrap_or_default();
    let field = |key: &str| parsed.get(key).and_then(|v| v.as_str()).map(str::to_string);

    let code = field("error_code")
        .or_else(|| field("code"))
        .or_else(|| field("error"));
    let message = field("msg")
        .or_else(|| field("message"))
        .or_else(|| field("error_description"))
        .unwrap_or_else(|| {
            if body.is_empty() {
                format!("HTTP {}", status)
            } else {
                body.to_string()
            }
        });

    BackendError::Api {
        status,
        code,
        message,
    }
}

/// Check response status and return error if not successful.
async fn check_response(response: reqwest::Response) -> Result<(), BackendError> {
    if response.status().is_success() {
        return Ok(());
    }

    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    if status == 429 {
        tracing::warn!("Supabase rate limit hit (429)");
    }
    Err(api_error(status, &body))
}

/// Check response and parse JSON body.
async fn check_response_json<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, BackendError> {
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        if status == 429 {
            tracing::warn!("Supabase rate limit hit (429)");
        }
        return Err(api_error(status, &body));
    }

    response
        .json()
        .await
        .map_err(|e| BackendError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_postgrest_body() {
        let err = api_error(
            406,
            r#"{"code":"PGRST116","details":"The result contains 0 rows","hint":null,"message":"JSON object requested, multiple (or no) rows returned"}"#,
        );
        assert!(err.is_no_rows());
    }

    #[test]
    fn test_api_error_gotrue_body() {
        let err = api_error(
            400,
            r#"{"code":400,"error_code":"invalid_credentials","msg":"Invalid login credentials"}"#,
        );
        match err {
            BackendError::Api { code, message, .. } => {
                assert_eq!(code.as_deref(), Some("invalid_credentials"));
                assert_eq!(message, "Invalid login credentials");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_api_error_legacy_gotrue_body() {
        let err = api_error(
            400,
            r#"{"error":"invalid_grant","error_description":"Invalid Refresh Token: Refresh Token Not Found"}"#,
        );
        assert!(err.is_invalid_grant());
    }

    #[test]
    fn test_api_error_plain_body() {
        match api_error(502, "") {
            BackendError::Api { message, .. } => assert_eq!(message, "HTTP 502"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_filter_values_are_quoted() {
        assert_eq!(quoted("user-1"), r#""user-1""#);
        assert_eq!(
            quoted(r#"x"),sender_id.neq.\"#),
            r#""x\"),sender_id.neq.\\""#
        );
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let client = SupabaseClient::new("https://proj.supabase.co/", "anon");
        assert_eq!(
            client.rest_url("profiles"),
            "https://proj.supabase.co/rest/v1/profiles"
        );
        assert_eq!(client.auth_url("token"), "https://proj.supabase.co/auth/v1/token");
    }

    #[test]
    fn test_bearer_falls_back_to_anon_key() {
        let client = SupabaseClient::new("https://proj.supabase.co", "anon");
        assert_eq!(client.bearer(), "anon");
    }
}
