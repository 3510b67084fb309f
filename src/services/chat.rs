// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Chat between a client and their trainer.
//!
//! New messages are picked up by polling for rows inserted after a cursor,
//! filtered to the current user, and fanned out to subscribers.

use super::check_id;
use super::session::SessionHandle;
use crate::backend::MessageStore;
use crate::error::{AppError, Result};
use crate::models::{ChatMessage, NewMessage};
use crate::time_utils::format_utc_rfc3339_millis;
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use futures_util::{stream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Longest message accepted, in characters.
pub const MAX_MESSAGE_LEN: usize = 2000;

const FEED_BUFFER: usize = 64;
const MAX_CONCURRENT_MARK_READ: usize = 4;

/// Position of the change feed.
#[derive(Debug, Clone, Default)]
pub struct FeedCursor {
    user_id: Option<String>,
    since: Option<String>,
}

#[derive(Clone)]
pub struct ChatService {
    messages: Arc<dyn MessageStore>,
    session: SessionHandle,
    /// Unread incoming message ids, per sender
    unread: Arc<DashMap<String, HashSet<String>>>,
    feed: broadcast::Sender<ChatMessage>,
}

impl ChatService {
    pub fn new(messages: Arc<dyn MessageStore>, session: SessionHandle) -> Self {
        let (feed, _) = broadcast::channel(FEED_BUFFER);
        Self {
            messages,
            session,
            unread: Arc::new(DashMap::new()),
            feed,
        }
    }

    fn require_user(&self) -> Result<String> {
        self.session
            .current_user()
            .map(|u| u.id)
            .ok_or(AppError::Unauthorized)
    }

    /// Thread with `peer_id`, oldest first. Messages the current user
    /// received are marked read.
    pub async fn conversation(&self, peer_id: &str) -> Result<Vec<ChatMessage>> {
        let user_id = self.require_user()?;
        check_id(peer_id, "peer")?;
        let mut thread = self.messages.conversation(&user_id, peer_id).await?;

        let unread: Vec<String> = thread
            .iter()
            .filter(|m| m.receiver_id == user_id && !m.is_read)
            .map(|m| m.id.clone())
            .collect();

        if !unread.is_empty() {
            let results: Vec<(String, bool)> = stream::iter(unread)
                .map(|id| async move {
                    match self.messages.mark_read(&id).await {
                        Ok(()) => (id, true),
                        Err(e) => {
                            tracing::warn!(message_id = %id, error = %e, "Failed to mark message read");
                            (id, false)
                        }
                    }
                })
                .buffer_unordered(MAX_CONCURRENT_MARK_READ)
                .collect()
                .await;

            for (id, marked) in results {
                if !marked {
                    continue;
                }
                if let Some(message) = thread.iter_mut().find(|m| m.id == id) {
                    message.is_read = true;
                }
                self.forget_unread(&id);
            }
        }

        Ok(thread)
    }

    pub async fn send(&self, receiver_id: &str, content: &str) -> Result<ChatMessage> {
        let user_id = self.require_user()?;
        check_id(receiver_id, "receiver")?;
        let content = content.trim();

        if content.is_empty() {
            return Err(AppError::BadRequest("Message is empty".to_string()));
        }
        if content.chars().count() > MAX_MESSAGE_LEN {
            return Err(AppError::BadRequest(format!(
                "Message longer than {} characters",
                MAX_MESSAGE_LEN
            )));
        }
        if receiver_id == user_id {
            return Err(AppError::BadRequest(
                "Cannot send a message to yourself".to_string(),
            ));
        }

        let message = self
            .messages
            .send_message(&NewMessage {
                sender_id: user_id,
                receiver_id: receiver_id.to_string(),
                content: content.to_string(),
                is_read: false,
            })
            .await?;

        tracing::debug!(message_id = %message.id, receiver_id = %receiver_id, "Message sent");
        Ok(message)
    }

    pub async fn mark_read(&self, message_id: &str) -> Result<()> {
        self.require_user()?;
        check_id(message_id, "message")?;
        self.messages.mark_read(message_id).await?;
        self.forget_unread(message_id);
        Ok(())
    }

    /// Unread incoming messages per sender, as seen by the change feed.
    pub fn unread_counts(&self) -> HashMap<String, usize> {
        self.unread
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| (entry.key().clone(), entry.value().len()))
            .collect()
    }

    fn forget_unread(&self, message_id: &str) {
        for mut entry in self.unread.iter_mut() {
            entry.value_mut().remove(message_id);
        }
        self.unread.retain(|_, ids| !ids.is_empty());
    }

    /// New messages involving the current user.
    pub fn subscribe(&self) -> broadcast::Receiver<ChatMessage> {
        self.feed.subscribe()
    }

    /// One round of the change feed. Returns how many messages were delivered.
    ///
    /// When the signed-in identity changes the cursor restarts at the current
    /// time and unread counts are dropped; history is not replayed.
    pub async fn poll(&self, cursor: &mut FeedCursor) -> Result<usize> {
        let Some(user_id) = self.session.current_user().map(|u| u.id) else {
            if cursor.user_id.is_some() {
                *cursor = FeedCursor::default();
                self.unread.clear();
            }
            return Ok(0);
        };

        if cursor.user_id.as_deref() != Some(user_id.as_str()) {
            tracing::debug!(user_id = %user_id, "Starting message feed");
            // Back off a millisecond so rows stamped in the current one are not skipped.
            let start = Utc::now() - ChronoDuration::milliseconds(1);
            *cursor = FeedCursor {
                user_id: Some(user_id),
                since: Some(format_utc_rfc3339_millis(start)),
            };
            self.unread.clear();
            return Ok(0);
        }

        let since = cursor.since.clone().unwrap_or_default();
        let fresh = self.messages.inserted_since(&user_id, &since).await?;

        let mut delivered = 0;
        for message in fresh {
            if cursor.since.as_deref().map_or(true, |s| message.created_at.as_str() > s) {
                cursor.since = Some(message.created_at.clone());
            }
            if !message.involves(&user_id) {
                continue;
            }
            if message.receiver_id == user_id && !message.is_read {
                self.unread
                    .entry(message.sender_id.clone())
                    .or_default()
                    .insert(message.id.clone());
            }
            // No subscribers is fine.
            let _ = self.feed.send(message);
            delivered += 1;
        }

        Ok(delivered)
    }

    /// Spawn the polling task. It ends when the session synchronizer stops.
    pub fn spawn_feed(&self, interval: Duration) -> JoinHandle<()> {
        let chat = self.clone();
        tokio::spawn(async move {
            let mut session = chat.session.subscribe();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut cursor = FeedCursor::default();

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = session.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }

                if let Err(e) = chat.poll(&mut cursor).await {
                    tracing::warn!(error = %e, "Message feed poll failed");
                }
            }

            tracing::info!("Message feed stopped");
        })
    }
}
