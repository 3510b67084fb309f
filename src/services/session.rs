// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Session/profile synchronizer.
//!
//! One actor task owns "who is signed in" and "what is their profile", and
//! publishes it as a [`SessionSnapshot`] on a watch channel. It consumes, one
//! at a time:
//! - auth state changes from the auth backend
//! - commands from [`SessionHandle`]s
//! - completions of the profile fetches it spawned
//!
//! The initial session check runs to completion before any auth event is
//! looked at. Events that arrived meanwhile are discarded; if there were any,
//! the session is re-read once so a real change is not lost.
//!
//! Each profile fetch is tagged with a generation. Clearing the session or
//! starting another fetch bumps the generation, so late results for a
//! superseded session are dropped instead of committed.

use super::profile_loader::{LoadedProfile, ProfileLoader, ProfileSource};
use crate::backend::AuthBackend;
use crate::models::{AuthChange, AuthEvent, AuthUser, Profile, Session};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

const COMMAND_BUFFER: usize = 32;
const FETCH_BUFFER: usize = 8;

/// Synchronizer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionPhase {
    Initializing,
    AuthenticatedLoadingProfile,
    AuthenticatedReady,
    Unauthenticated,
}

/// Everything observers can see, replaced as a whole on every transition.
///
/// Invariant: `profile` is `None` whenever `user` is `None`, and otherwise
/// `profile.id == user.id`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    pub user: Option<AuthUser>,
    pub profile: Option<Profile>,
    /// Server-confirmed admin flag; `None` until known
    pub is_admin: Option<bool>,
    pub loading: bool,
    pub profile_source: Option<ProfileSource>,
}

impl SessionSnapshot {
    pub fn initializing() -> Self {
        Self {
            phase: SessionPhase::Initializing,
            user: None,
            profile: None,
            is_admin: None,
            loading: true,
            profile_source: None,
        }
    }

    fn unauthenticated(is_admin: Option<bool>) -> Self {
        Self {
            phase: SessionPhase::Unauthenticated,
            user: None,
            profile: None,
            is_admin,
            loading: false,
            profile_source: None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }

    /// Admin flag with "unknown" treated as "no".
    pub fn is_admin(&self) -> bool {
        self.is_admin == Some(true)
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.id.as_str())
    }

    pub fn is_profile_complete(&self) -> bool {
        self.profile.as_ref().is_some_and(Profile::is_complete)
    }
}

enum Command {
    /// Re-fetch profile and admin flag for the current user
    Refresh(oneshot::Sender<()>),
    /// Commit a profile the caller just saved; acked with whether it applied
    ProfileSaved(Profile, oneshot::Sender<bool>),
    /// Force the signed-out state
    ClearLocal(oneshot::Sender<()>),
    Shutdown,
}

struct FetchDone {
    generation: u64,
    user_id: String,
    loaded: LoadedProfile,
}

/// Outcome of a future raced against incoming commands.
enum Step<T> {
    Done(T),
    Cleared,
    Stopped,
}

/// Cheap, clonable view of the synchronizer.
#[derive(Clone)]
pub struct SessionHandle {
    state: watch::Receiver<SessionSnapshot>,
    commands: mpsc::Sender<Command>,
}

impl SessionHandle {
    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    pub fn current_user(&self) -> Option<AuthUser> {
        self.state.borrow().user.clone()
    }

    pub fn current_profile(&self) -> Option<Profile> {
        self.state.borrow().profile.clone()
    }

    pub fn is_admin(&self) -> bool {
        self.state.borrow().is_admin()
    }

    /// Receiver notified on every committed snapshot.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.clone()
    }

    /// Wait for a snapshot matching `pred`. `None` if the synchronizer stopped.
    pub async fn wait_for(
        &self,
        pred: impl FnMut(&SessionSnapshot) -> bool,
    ) -> Option<SessionSnapshot> {
        let mut rx = self.state.clone();
        let found = rx.wait_for(pred).await.ok().map(|s| s.clone());
        found
    }

    /// Wait until nothing is loading.
    pub async fn wait_until_settled(&self) -> Option<SessionSnapshot> {
        self.wait_for(|s| !s.loading).await
    }

    /// Re-fetch the profile and admin flag, then wait for the result.
    pub async fn refresh_profile(&self) -> Option<SessionSnapshot> {
        let (ack, done) = oneshot::channel();
        self.commands.send(Command::Refresh(ack)).await.ok()?;
        done.await.ok()?;
        self.wait_until_settled().await
    }

    /// Commit a freshly saved profile. False if it does not belong to the
    /// current user.
    pub async fn profile_saved(&self, profile: Profile) -> bool {
        let (ack, done) = oneshot::channel();
        if self
            .commands
            .send(Command::ProfileSaved(profile, ack))
            .await
            .is_err()
        {
            return false;
        }
        done.await.unwrap_or(false)
    }

    /// Drop local session state now, without any network call.
    pub async fn clear_local(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::ClearLocal(ack)).await.is_ok() {
            let _ = done.await;
        }
    }

    /// Stop the synchronizer. Observers see the last snapshot.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

/// The actor. Created and driven by [`SessionSynchronizer::spawn`].
pub struct SessionSynchronizer {
    auth: Arc<dyn AuthBackend>,
    loader: ProfileLoader,
    state: watch::Sender<SessionSnapshot>,
    generation: u64,
    in_flight: Option<JoinHandle<()>>,
    fetch_tx: mpsc::Sender<FetchDone>,
}

impl SessionSynchronizer {
    /// Start the synchronizer task.
    ///
    /// The task stops on [`SessionHandle::shutdown`] or once every handle
    /// has been dropped.
    pub fn spawn(auth: Arc<dyn AuthBackend>, loader: ProfileLoader) -> (SessionHandle, JoinHandle<()>) {
        let (state_tx, state_rx) = watch::channel(SessionSnapshot::initializing());
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (fetch_tx, fetch_rx) = mpsc::channel(FETCH_BUFFER);

        // Subscribe before the initial check so changes during it are noticed.
        let events = auth.on_auth_state_change();

        let actor = Self {
            auth,
            loader,
            state: state_tx,
            generation: 0,
            in_flight: None,
            fetch_tx,
        };
        let task = tokio::spawn(actor.run(events, command_rx, fetch_rx));

        (
            SessionHandle {
                state: state_rx,
                commands: command_tx,
            },
            task,
        )
    }

    async fn run(
        mut self,
        mut events: broadcast::Receiver<AuthEvent>,
        mut commands: mpsc::Receiver<Command>,
        mut fetches: mpsc::Receiver<FetchDone>,
    ) {
        tracing::info!("Session synchronizer started");

        if !self.initialize(&mut commands).await {
            self.stop();
            return;
        }

        let mut discarded = 0u64;
        loop {
            match events.try_recv() {
                Ok(event) => {
                    tracing::debug!(event = ?event.kind, "Ignoring auth event from before initial check");
                    discarded += 1;
                }
                Err(TryRecvError::Lagged(n)) => discarded += n,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        if discarded > 0 {
            self.resync().await;
        }

        let mut events_open = true;
        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    None | Some(Command::Shutdown) => break,
                    Some(command) => self.handle_command(command),
                },

                event = events.recv(), if events_open => match event {
                    Ok(event) => self.handle_event(event),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Auth events lagged, resynchronizing");
                        self.resync().await;
                    }
                    Err(RecvError::Closed) => {
                        tracing::warn!("Auth event stream closed");
                        events_open = false;
                    }
                },

                Some(done) = fetches.recv() => self.handle_fetch(done),
            }
        }

        self.stop();
    }

    fn stop(&mut self) {
        if let Some(task) = self.in_flight.take() {
            task.abort();
        }
        tracing::info!("Session synchronizer stopped");
    }

    // ─── State helpers ───────────────────────────────────────────

    fn current(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    /// Publish `next` in one step; observers are only woken if it differs.
    fn commit(&self, next: SessionSnapshot) {
        self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn commit_loaded(&self, loaded: LoadedProfile) {
        let mut next = self.current();
        tracing::info!(
            user_id = %loaded.profile.id,
            source = ?loaded.source,
            is_admin = loaded.is_admin,
            "Profile loaded"
        );
        next.phase = SessionPhase::AuthenticatedReady;
        next.loading = false;
        next.is_admin = Some(loaded.is_admin);
        next.profile_source = Some(loaded.source);
        next.profile = Some(loaded.profile);
        self.commit(next);
    }

    /// Drop everything about the current session, without any network call.
    fn clear(&mut self) {
        self.generation += 1;
        if let Some(task) = self.in_flight.take() {
            task.abort();
        }
        tracing::info!("Session cleared");
        self.commit(SessionSnapshot::unauthenticated(None));
    }

    /// Enter the loading state for `user` and fetch its profile.
    ///
    /// The profile stays visible when the identity is unchanged.
    fn begin_load(&mut self, user: AuthUser) {
        let mut next = self.current();
        if next.user_id() != Some(user.id.as_str()) {
            next.profile = None;
            next.is_admin = None;
            next.profile_source = None;
        }
        next.phase = SessionPhase::AuthenticatedLoadingProfile;
        next.loading = true;
        next.user = Some(user.clone());
        self.commit(next);
        self.spawn_fetch(user);
    }

    fn spawn_fetch(&mut self, user: AuthUser) {
        self.generation += 1;
        if let Some(task) = self.in_flight.take() {
            task.abort();
        }

        let generation = self.generation;
        let loader = self.loader.clone();
        let done = self.fetch_tx.clone();
        tracing::debug!(user_id = %user.id, generation, "Fetching profile");

        self.in_flight = Some(tokio::spawn(async move {
            let loaded = loader.load(&user).await;
            // A closed channel means the synchronizer is gone.
            let _ = done
                .send(FetchDone {
                    generation,
                    user_id: user.id,
                    loaded,
                })
                .await;
        }));
    }

    // ─── Initial check ───────────────────────────────────────────

    /// Run `fut` while still serving commands. A clear or shutdown abandons it.
    async fn interruptible<T>(
        &mut self,
        fut: impl Future<Output = T>,
        commands: &mut mpsc::Receiver<Command>,
    ) -> Step<T> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    None | Some(Command::Shutdown) => return Step::Stopped,
                    Some(Command::ClearLocal(ack)) => {
                        self.clear();
                        let _ = ack.send(());
                        return Step::Cleared;
                    }
                    // Already loading; the caller waits for it to settle.
                    Some(Command::Refresh(ack)) => {
                        let _ = ack.send(());
                    }
                    Some(Command::ProfileSaved(_, ack)) => {
                        let _ = ack.send(false);
                    }
                },

                out = &mut fut => return Step::Done(out),
            }
        }
    }

    /// Initial session lookup, then (if signed in) the awaited profile load.
    ///
    /// Returns false if the synchronizer was stopped meanwhile.
    async fn initialize(&mut self, commands: &mut mpsc::Receiver<Command>) -> bool {
        let auth = self.auth.clone();
        let timeout = self.loader.policy().attempt_timeout;
        let lookup = async move { tokio::time::timeout(timeout, auth.get_session()).await };

        let session = match self.interruptible(lookup, commands).await {
            Step::Done(Ok(Ok(session))) => session,
            Step::Done(Ok(Err(e))) => {
                tracing::warn!(error = %e, "Initial session check failed, treating as signed out");
                None
            }
            Step::Done(Err(_)) => {
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Initial session check timed out, treating as signed out"
                );
                None
            }
            Step::Cleared => return true,
            Step::Stopped => return false,
        };

        let Some(Session { user, .. }) = session else {
            tracing::info!("No active session");
            self.commit(SessionSnapshot::unauthenticated(Some(false)));
            return true;
        };

        tracing::info!(user_id = %user.id, "Found existing session");
        self.commit(SessionSnapshot {
            phase: SessionPhase::AuthenticatedLoadingProfile,
            user: Some(user.clone()),
            profile: None,
            is_admin: None,
            loading: true,
            profile_source: None,
        });

        let loader = self.loader.clone();
        let load = async move { loader.load(&user).await };
        match self.interruptible(load, commands).await {
            Step::Done(loaded) => {
                self.commit_loaded(loaded);
                true
            }
            Step::Cleared => true,
            Step::Stopped => false,
        }
    }

    // ─── Event loop handlers ─────────────────────────────────────

    fn handle_event(&mut self, event: AuthEvent) {
        tracing::debug!(event = ?event.kind, user_id = ?event.user_id(), "Auth state change");

        match (event.kind, event.session) {
            (AuthChange::SignedIn, Some(session)) => self.begin_load(session.user),
            (AuthChange::SignedOut, _) => self.clear(),
            (AuthChange::TokenRefreshed, Some(session)) => self.token_refreshed(session.user),
            (AuthChange::TokenRefreshed, None) => {
                tracing::warn!("Token refresh without a session, signing out");
                self.clear();
            }
            (AuthChange::UserUpdated, Some(session)) => self.begin_load(session.user),
            (AuthChange::InitialSession, session) => self.reconcile(session),
            (AuthChange::PasswordRecovery, _) => {
                tracing::info!("Password recovery started");
            }
            (kind, None) => {
                tracing::warn!(event = ?kind, "Auth event without a session, ignoring");
            }
        }
    }

    /// Refreshed token: swap the user only if it changed; no fetch, no loading.
    fn token_refreshed(&mut self, user: AuthUser) {
        let mut next = self.current();
        match next.user.as_ref() {
            Some(current) if current.id == user.id => {
                if *current != user {
                    tracing::debug!(user_id = %user.id, "User record changed on token refresh");
                    next.user = Some(user);
                    self.commit(next);
                }
            }
            _ => {
                tracing::info!(user_id = %user.id, "Token refresh carried a new identity");
                self.begin_load(user);
            }
        }
    }

    /// Act only where `session` disagrees with the current state.
    fn reconcile(&mut self, session: Option<Session>) {
        let current = self.current();
        match (session, current.user_id()) {
            (Some(session), Some(id)) if session.user.id == id => self.token_refreshed(session.user),
            (Some(session), _) => self.begin_load(session.user),
            (None, Some(_)) => self.clear(),
            (None, None) => {}
        }
    }

    /// Re-read the session from the backend and reconcile.
    async fn resync(&mut self) {
        match self.auth.get_session().await {
            Ok(session) => self.reconcile(session),
            Err(e) => tracing::warn!(error = %e, "Session resync failed, keeping current state"),
        }
    }

    fn handle_fetch(&mut self, done: FetchDone) {
        if done.generation != self.generation {
            tracing::debug!(
                generation = done.generation,
                current = self.generation,
                "Discarding stale profile fetch"
            );
            return;
        }

        let current = self.current();
        if current.user_id() != Some(done.user_id.as_str()) || done.loaded.profile.id != done.user_id
        {
            tracing::warn!(user_id = %done.user_id, "Discarding profile fetch for another identity");
            return;
        }

        self.in_flight = None;
        self.commit_loaded(done.loaded);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Refresh(ack) => {
                if let Some(user) = self.current().user {
                    self.begin_load(user);
                }
                let _ = ack.send(());
            }
            Command::ProfileSaved(profile, ack) => {
                let mut next = self.current();
                let applies = next.user_id() == Some(profile.id.as_str());
                if applies {
                    next.profile = Some(profile);
                    next.profile_source = Some(ProfileSource::Stored);
                    self.commit(next);
                } else {
                    tracing::warn!(profile_id = %profile.id, "Saved profile does not match current user");
                }
                let _ = ack.send(applies);
            }
            Command::ClearLocal(ack) => {
                self.clear();
                let _ = ack.send(());
            }
            // Handled by the run loop.
            Command::Shutdown => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> AuthUser {
        AuthUser {
            id: id.to_string(),
            email: Some(format!("{id}@example.com")),
            user_metadata: serde_json::Value::Null,
            updated_at: None,
        }
    }

    #[test]
    fn test_initializing_snapshot() {
        let s = SessionSnapshot::initializing();
        assert!(s.loading);
        assert!(!s.is_authenticated());
        assert_eq!(s.is_admin, None);
        assert!(!s.is_admin());
    }

    #[test]
    fn test_profile_completeness_needs_profile() {
        let mut s = SessionSnapshot::unauthenticated(Some(false));
        assert!(!s.is_profile_complete());

        let mut profile = Profile::fallback("U1", "a@b.com");
        profile.objetivo = Some("forca".to_string());
        s.user = Some(user("U1"));
        s.profile = Some(profile);
        assert!(s.is_profile_complete());
    }

    #[test]
    fn test_snapshot_serializes_phase() {
        let json = serde_json::to_value(SessionSnapshot::unauthenticated(Some(false))).unwrap();
        assert_eq!(json["phase"], "UNAUTHENTICATED");
        assert_eq!(json["is_admin"], false);
        assert_eq!(json["loading"], false);
    }
}
