// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! In-memory backend for offline mode and tests.
//!
//! Behaves like the hosted service for the operations the crate uses, and
//! supports injecting delays and failures through [`Faults`].

use super::{AuthBackend, BackendError, MessageStore, ProfileStore, SignUpResult};
use crate::models::{
    AuthEvent, AuthUser, ChatMessage, NewMessage, Profile, ProfileChanges, Role, Session,
};
use crate::time_utils::format_utc_rfc3339_millis;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const EVENT_BUFFER: usize = 64;
const SESSION_LIFETIME_SECS: i64 = 3600;

/// Injected delays and failures.
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Delay before `get_session` answers
    pub session_delay: Option<Duration>,
    /// `get_session` fails
    pub session_error: bool,
    /// Number of upcoming profile lookups that fail
    pub profile_failures: u32,
    /// Delay before each profile lookup answers
    pub profile_delay: Option<Duration>,
    /// Admin RPC fails
    pub admin_error: bool,
    /// Delay before the admin RPC answers
    pub admin_delay: Option<Duration>,
    /// Profile inserts fail
    pub insert_error: bool,
    /// Sign-out request fails (local session is kept)
    pub sign_out_error: bool,
    /// Delay before the sign-out request answers
    pub sign_out_delay: Option<Duration>,
}

struct Account {
    user: AuthUser,
    password: String,
}

struct Inner {
    accounts: DashMap<String, Account>,
    profiles: DashMap<String, Profile>,
    admins: Mutex<HashSet<String>>,
    messages: Mutex<Vec<ChatMessage>>,
    last_message_millis: Mutex<Option<i64>>,
    session: Mutex<Option<Session>>,
    events: broadcast::Sender<AuthEvent>,
    faults: Mutex<Faults>,
    password_resets: Mutex<Vec<String>>,
    require_confirmation: AtomicBool,
    profile_lookups: AtomicUsize,
    admin_checks: AtomicUsize,
    profile_inserts: AtomicUsize,
    next_id: AtomicU64,
}

/// In-memory stand-in for the hosted backend.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(Inner {
                accounts: DashMap::new(),
                profiles: DashMap::new(),
                admins: Mutex::new(HashSet::new()),
                messages: Mutex::new(Vec::new()),
                last_message_millis: Mutex::new(None),
                session: Mutex::new(None),
                events,
                faults: Mutex::new(Faults::default()),
                password_resets: Mutex::new(Vec::new()),
                require_confirmation: AtomicBool::new(false),
                profile_lookups: AtomicUsize::new(0),
                admin_checks: AtomicUsize::new(0),
                profile_inserts: AtomicUsize::new(0),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    // ─── Seeding ─────────────────────────────────────────────────

    /// Register an account that can sign in with `password`.
    pub fn add_account(&self, email: &str, password: &str) -> AuthUser {
        let user = AuthUser {
            id: format!("user-{}", self.next_id()),
            email: Some(email.to_string()),
            user_metadata: serde_json::Value::Null,
            updated_at: None,
        };
        self.inner.accounts.insert(
            email.to_string(),
            Account {
                user: user.clone(),
                password: password.to_string(),
            },
        );
        user
    }

    pub fn add_profile(&self, profile: Profile) {
        self.inner.profiles.insert(profile.id.clone(), profile);
    }

    pub fn profile(&self, user_id: &str) -> Option<Profile> {
        self.inner.profiles.get(user_id).map(|p| p.value().clone())
    }

    pub fn grant_admin(&self, email: &str) {
        self.inner.admins.lock().insert(email.to_string());
    }

    /// Make `user` the current session without emitting an event
    /// (a session restored from storage).
    pub fn start_session(&self, user: &AuthUser) -> Session {
        let session = self.issue_session(user);
        *self.inner.session.lock() = Some(session.clone());
        session
    }

    /// Push an auth event to subscribers.
    pub fn emit(&self, event: AuthEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    pub fn set_faults(&self, faults: Faults) {
        *self.inner.faults.lock() = faults;
    }

    pub fn update_faults(&self, f: impl FnOnce(&mut Faults)) {
        f(&mut self.inner.faults.lock());
    }

    /// New sign-ups wait for email confirmation instead of signing in.
    pub fn require_email_confirmation(&self, required: bool) {
        self.inner
            .require_confirmation
            .store(required, Ordering::Relaxed);
    }

    // ─── Inspection ──────────────────────────────────────────────

    pub fn profile_lookups(&self) -> usize {
        self.inner.profile_lookups.load(Ordering::SeqCst)
    }

    pub fn admin_checks(&self) -> usize {
        self.inner.admin_checks.load(Ordering::SeqCst)
    }

    /// Insert attempts, including rejected ones.
    pub fn profile_inserts(&self) -> usize {
        self.inner.profile_inserts.load(Ordering::SeqCst)
    }

    pub fn password_resets(&self) -> Vec<String> {
        self.inner.password_resets.lock().clone()
    }

    pub fn current_session(&self) -> Option<Session> {
        self.inner.session.lock().clone()
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.inner.messages.lock().clone()
    }

    fn issue_session(&self, user: &AuthUser) -> Session {
        let n = self.next_id();
        Session {
            access_token: format!("mem-access-{}", n),
            refresh_token: format!("mem-refresh-{}", n),
            token_type: Some("bearer".to_string()),
            expires_in: Some(SESSION_LIFETIME_SECS),
            expires_at: Some(Utc::now().timestamp() + SESSION_LIFETIME_SECS),
            user: user.clone(),
        }
    }

    /// Strictly increasing insert timestamps so cursor queries never skip rows.
    fn next_message_timestamp(&self) -> String {
        let mut last = self.inner.last_message_millis.lock();
        let mut millis = Utc::now().timestamp_millis();
        if let Some(prev) = *last {
            if millis <= prev {
                millis = prev + 1;
            }
        }
        *last = Some(millis);
        format_utc_rfc3339_millis(DateTime::from_timestamp_millis(millis).unwrap_or_default())
    }

    fn faults(&self) -> Faults {
        self.inner.faults.lock().clone()
    }
}

async fn maybe_sleep(delay: Option<Duration>) {
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
}

fn no_rows() -> BackendError {
    BackendError::Api {
        status: 406,
        code: Some(BackendError::NO_ROWS_CODE.to_string()),
        message: "JSON object requested, multiple (or no) rows returned".to_string(),
    }
}

#[async_trait]
impl AuthBackend for MemoryBackend {
    async fn get_session(&self) -> Result<Option<Session>, BackendError> {
        let faults = self.faults();
        maybe_sleep(faults.session_delay).await;
        if faults.session_error {
            return Err(BackendError::Unavailable(
                "injected session lookup failure".to_string(),
            ));
        }
        Ok(self.inner.session.lock().clone())
    }

    fn on_auth_state_change(&self) -> broadcast::Receiver<AuthEvent> {
        self.inner.events.subscribe()
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, BackendError> {
        let user = match self.inner.accounts.get(email) {
            Some(account) if account.password == password => account.user.clone(),
            _ => {
                return Err(BackendError::Api {
                    status: 400,
                    code: Some("invalid_credentials".to_string()),
                    message: "Invalid login credentials".to_string(),
                })
            }
        };

        let session = self.start_session(&user);
        self.emit(AuthEvent::signed_in(session.clone()));
        Ok(session)
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: serde_json::Value,
    ) -> Result<SignUpResult, BackendError> {
        if self.inner.accounts.contains_key(email) {
            return Err(BackendError::Api {
                status: 422,
                code: Some("user_already_exists".to_string()),
                message: "User already registered".to_string(),
            });
        }

        let mut user = self.add_account(email, password);
        user.user_metadata = metadata;
        if let Some(mut account) = self.inner.accounts.get_mut(email) {
            account.user = user.clone();
        }

        if self.inner.require_confirmation.load(Ordering::Relaxed) {
            return Ok(SignUpResult {
                user,
                session: None,
            });
        }

        let session = self.start_session(&user);
        self.emit(AuthEvent::signed_in(session.clone()));
        Ok(SignUpResult {
            user,
            session: Some(session),
        })
    }

    async fn sign_out(&self) -> Result<(), BackendError> {
        let faults = self.faults();
        maybe_sleep(faults.sign_out_delay).await;
        if faults.sign_out_error {
            return Err(BackendError::Unavailable(
                "injected sign-out failure".to_string(),
            ));
        }

        let previous = self.inner.session.lock().take();
        if previous.is_none() {
            return Err(BackendError::Api {
                status: 400,
                code: None,
                message: BackendError::SESSION_MISSING.to_string(),
            });
        }

        self.emit(AuthEvent::signed_out());
        Ok(())
    }

    async fn reset_password_for_email(&self, email: &str) -> Result<(), BackendError> {
        self.inner.password_resets.lock().push(email.to_string());
        Ok(())
    }

    async fn refresh_session(&self) -> Result<Session, BackendError> {
        let user = self
            .inner
            .session
            .lock()
            .as_ref()
            .map(|s| s.user.clone())
            .ok_or(BackendError::NotAuthenticated)?;

        let session = self.start_session(&user);
        self.emit(AuthEvent::token_refreshed(session.clone()));
        Ok(session)
    }
}

#[async_trait]
impl ProfileStore for MemoryBackend {
    async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>, BackendError> {
        self.inner.profile_lookups.fetch_add(1, Ordering::SeqCst);

        let (delay, fail) = {
            let mut faults = self.inner.faults.lock();
            let fail = faults.profile_failures > 0;
            if fail {
                faults.profile_failures -= 1;
            }
            (faults.profile_delay, fail)
        };

        maybe_sleep(delay).await;
        if fail {
            return Err(BackendError::Unavailable(
                "injected profile lookup failure".to_string(),
            ));
        }

        Ok(self.profile(user_id))
    }

    async fn insert_profile(&self, profile: &Profile) -> Result<Profile, BackendError> {
        self.inner.profile_inserts.fetch_add(1, Ordering::SeqCst);
        if self.faults().insert_error {
            return Err(BackendError::Unavailable(
                "injected profile insert failure".to_string(),
            ));
        }
        if self.inner.profiles.contains_key(&profile.id) {
            return Err(BackendError::Api {
                status: 409,
                code: Some("23505".to_string()),
                message: "duplicate key value violates unique constraint \"profiles_pkey\""
                    .to_string(),
            });
        }

        let mut stored = profile.clone();
        stored.created_at = Some(format_utc_rfc3339_millis(Utc::now()));
        self.add_profile(stored.clone());
        Ok(stored)
    }

    async fn update_profile(
        &self,
        user_id: &str,
        changes: &ProfileChanges,
    ) -> Result<Profile, BackendError> {
        let mut entry = self.inner.profiles.get_mut(user_id).ok_or_else(no_rows)?;
        changes.apply_to(&mut entry);
        Ok(entry.value().clone())
    }

    async fn list_profiles(&self) -> Result<Vec<Profile>, BackendError> {
        let mut profiles: Vec<Profile> = self
            .inner
            .profiles
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        profiles.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(profiles)
    }

    async fn set_role(&self, user_id: &str, role: Role) -> Result<Profile, BackendError> {
        let mut entry = self.inner.profiles.get_mut(user_id).ok_or_else(no_rows)?;
        entry.role = role;
        Ok(entry.value().clone())
    }

    async fn is_admin_by_email(&self, email: &str) -> Result<bool, BackendError> {
        self.inner.admin_checks.fetch_add(1, Ordering::SeqCst);

        let faults = self.faults();
        maybe_sleep(faults.admin_delay).await;
        if faults.admin_error {
            return Err(BackendError::Unavailable(
                "injected admin check failure".to_string(),
            ));
        }

        Ok(self.inner.admins.lock().contains(email))
    }
}

#[async_trait]
impl MessageStore for MemoryBackend {
    async fn conversation(
        &self,
        user_id: &str,
        peer_id: &str,
    ) -> Result<Vec<ChatMessage>, BackendError> {
        let mut thread: Vec<ChatMessage> = self
            .inner
            .messages
            .lock()
            .iter()
            .filter(|m| m.involves(user_id) && m.involves(peer_id))
            .cloned()
            .collect();
        thread.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(thread)
    }

    async fn send_message(&self, message: &NewMessage) -> Result<ChatMessage, BackendError> {
        let stored = ChatMessage {
            id: format!("msg-{}", self.next_id()),
            sender_id: message.sender_id.clone(),
            receiver_id: message.receiver_id.clone(),
            content: message.content.clone(),
            is_read: message.is_read,
            created_at: self.next_message_timestamp(),
        };
        self.inner.messages.lock().push(stored.clone());
        Ok(stored)
    }

    async fn mark_read(&self, message_id: &str) -> Result<(), BackendError> {
        let mut messages = self.inner.messages.lock();
        match messages.iter_mut().find(|m| m.id == message_id) {
            Some(m) => {
                m.is_read = true;
                Ok(())
            }
            None => Err(BackendError::Api {
                status: 404,
                code: None,
                message: format!("Message {} not found", message_id),
            }),
        }
    }

    async fn inserted_since(
        &self,
        user_id: &str,
        since: &str,
    ) -> Result<Vec<ChatMessage>, BackendError> {
        let mut fresh: Vec<ChatMessage> = self
            .inner
            .messages
            .lock()
            .iter()
            .filter(|m| m.involves(user_id) && m.created_at.as_str() > since)
            .cloned()
            .collect();
        fresh.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sign_in_emits_signed_in() {
        let backend = MemoryBackend::new();
        let user = backend.add_account("a@b.com", "secret1");
        let mut events = backend.on_auth_state_change();

        let session = backend
            .sign_in_with_password("a@b.com", "secret1")
            .await
            .unwrap();
        assert_eq!(session.user.id, user.id);

        let event = events.recv().await.unwrap();
        assert_eq!(event, AuthEvent::signed_in(session));
    }

    #[tokio::test]
    async fn test_wrong_password_rejected() {
        let backend = MemoryBackend::new();
        backend.add_account("a@b.com", "secret1");
        let err = backend
            .sign_in_with_password("a@b.com", "nope")
            .await
            .unwrap_err();
        assert_eq!(err.user_message(), "Invalid login credentials");
        assert!(backend.current_session().is_none());
    }

    #[tokio::test]
    async fn test_sign_out_without_session_reports_missing() {
        let backend = MemoryBackend::new();
        let err = backend.sign_out().await.unwrap_err();
        assert!(err.is_session_missing());
    }

    #[tokio::test]
    async fn test_injected_profile_failures_are_consumed() {
        let backend = MemoryBackend::new();
        backend.add_profile(Profile::fallback("U1", "a@b.com"));
        backend.update_faults(|f| f.profile_failures = 1);

        assert!(backend.get_profile("U1").await.is_err());
        assert!(backend.get_profile("U1").await.unwrap().is_some());
        assert_eq!(backend.profile_lookups(), 2);
    }

    #[tokio::test]
    async fn test_update_missing_profile_is_no_rows() {
        let backend = MemoryBackend::new();
        let err = backend
            .update_profile("nobody", &ProfileChanges::default())
            .await
            .unwrap_err();
        assert!(err.is_no_rows());
    }

    #[tokio::test]
    async fn test_message_timestamps_strictly_increase() {
        let backend = MemoryBackend::new();
        let msg = NewMessage {
            sender_id: "U1".to_string(),
            receiver_id: "U2".to_string(),
            content: "oi".to_string(),
            is_read: false,
        };
        let first = backend.send_message(&msg).await.unwrap();
        let second = backend.send_message(&msg).await.unwrap();
        assert!(second.created_at > first.created_at);

        let fresh = backend
            .inserted_since("U2", &first.created_at)
            .await
            .unwrap();
        assert_eq!(fresh, vec![second]);
    }
}
