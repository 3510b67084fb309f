// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Chat service and change feed tests.

use primefit_session::backend::{MemoryBackend, MessageStore};
use primefit_session::error::AppError;
use primefit_session::models::{AuthUser, NewMessage};
use primefit_session::services::{FeedCursor, MAX_MESSAGE_LEN};
use std::time::Duration;

mod common;

use common::{backend_with_account, create_test_app, sign_in};

/// A second account that messages the signed-in user.
fn add_peer(backend: &MemoryBackend) -> AuthUser {
    backend.add_account("coach@b.com", "coach123")
}

fn incoming(from: &AuthUser, to: &AuthUser, content: &str) -> NewMessage {
    NewMessage {
        sender_id: from.id.clone(),
        receiver_id: to.id.clone(),
        content: content.to_string(),
        is_read: false,
    }
}

#[tokio::test]
async fn test_send_validates_content() {
    let (backend, _user) = backend_with_account();
    let peer = add_peer(&backend);
    let (_app, state) = create_test_app(backend.clone());
    state.session.wait_until_settled().await;
    let me = sign_in(&state).await.user.unwrap();

    let err = state.chat.send(&peer.id, "   ").await.unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));

    let long = "x".repeat(MAX_MESSAGE_LEN + 1);
    let err = state.chat.send(&peer.id, &long).await.unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));

    let err = state.chat.send(&me.id, "oi").await.unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));

    let exact = "é".repeat(MAX_MESSAGE_LEN);
    assert!(state.chat.send(&peer.id, &exact).await.is_ok());

    let sent = state.chat.send(&peer.id, "  bom dia  ").await.unwrap();
    assert_eq!(sent.content, "bom dia");
    assert_eq!(sent.sender_id, me.id);
    assert!(!sent.is_read);
    assert_eq!(backend.messages().len(), 2);
}

#[tokio::test]
async fn test_chat_requires_user() {
    let (backend, _user) = backend_with_account();
    let peer = add_peer(&backend);
    let (_app, state) = create_test_app(backend);
    state.session.wait_until_settled().await;

    let err = state.chat.send(&peer.id, "oi").await.unwrap_err();
    assert!(matches!(err, AppError::Unauthorized));
    let err = state.chat.conversation(&peer.id).await.unwrap_err();
    assert!(matches!(err, AppError::Unauthorized));
}

#[tokio::test]
async fn test_malformed_ids_rejected() {
    let (backend, _user) = backend_with_account();
    let peer = add_peer(&backend);
    let (_app, state) = create_test_app(backend.clone());
    state.session.wait_until_settled().await;
    let me = sign_in(&state).await.user.unwrap();
    backend.send_message(&incoming(&peer, &me, "oi")).await.unwrap();

    let spliced = format!("{}),sender_id.neq.0", peer.id);
    let err = state.chat.conversation(&spliced).await.unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));
    let err = state.chat.send("", "oi").await.unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));
    let err = state.chat.mark_read("msg-1,msg-2").await.unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));

    assert_eq!(backend.messages().len(), 1);
    assert!(!backend.messages()[0].is_read);
}

#[tokio::test]
async fn test_conversation_marks_incoming_read() {
    let (backend, _user) = backend_with_account();
    let peer = add_peer(&backend);
    let (_app, state) = create_test_app(backend.clone());
    state.session.wait_until_settled().await;
    let me = sign_in(&state).await.user.unwrap();

    backend.send_message(&incoming(&peer, &me, "tudo bem?")).await.unwrap();
    state.chat.send(&peer.id, "tudo!").await.unwrap();
    backend.send_message(&incoming(&peer, &me, "ótimo")).await.unwrap();

    let thread = state.chat.conversation(&peer.id).await.unwrap();
    let contents: Vec<&str> = thread.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["tudo bem?", "tudo!", "ótimo"]);
    assert!(thread
        .iter()
        .filter(|m| m.receiver_id == me.id)
        .all(|m| m.is_read));

    // Outgoing messages stay unread until the peer opens them.
    let stored = backend.messages();
    let outgoing = stored.iter().find(|m| m.sender_id == me.id).unwrap();
    assert!(!outgoing.is_read);
    assert!(stored
        .iter()
        .filter(|m| m.receiver_id == me.id)
        .all(|m| m.is_read));
}

#[tokio::test]
async fn test_feed_delivers_new_messages_and_counts_unread() {
    let (backend, _user) = backend_with_account();
    let peer = add_peer(&backend);
    let (_app, state) = create_test_app(backend.clone());
    state.session.wait_until_settled().await;
    let me = sign_in(&state).await.user.unwrap();

    // Sent before the feed started: not replayed.
    backend.send_message(&incoming(&peer, &me, "antigo")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let mut cursor = FeedCursor::default();
    let mut feed = state.chat.subscribe();
    assert_eq!(state.chat.poll(&mut cursor).await.unwrap(), 0);

    let first = backend.send_message(&incoming(&peer, &me, "treino hoje?")).await.unwrap();
    backend.send_message(&incoming(&peer, &me, "18h")).await.unwrap();
    state.chat.send(&peer.id, "fechado").await.unwrap();

    assert_eq!(state.chat.poll(&mut cursor).await.unwrap(), 3);
    assert_eq!(feed.recv().await.unwrap(), first);
    assert_eq!(state.chat.unread_counts().get(&peer.id), Some(&2));
    assert_eq!(state.chat.unread_counts().len(), 1);

    // Nothing new.
    assert_eq!(state.chat.poll(&mut cursor).await.unwrap(), 0);

    state.chat.mark_read(&first.id).await.unwrap();
    assert_eq!(state.chat.unread_counts().get(&peer.id), Some(&1));

    state.chat.conversation(&peer.id).await.unwrap();
    assert!(state.chat.unread_counts().is_empty());
}

#[tokio::test]
async fn test_feed_restarts_on_identity_change() {
    let (backend, _user) = backend_with_account();
    let peer = add_peer(&backend);
    let (_app, state) = create_test_app(backend.clone());
    state.session.wait_until_settled().await;
    let me = sign_in(&state).await.user.unwrap();

    let mut cursor = FeedCursor::default();
    state.chat.poll(&mut cursor).await.unwrap();
    backend.send_message(&incoming(&peer, &me, "oi")).await.unwrap();
    assert_eq!(state.chat.poll(&mut cursor).await.unwrap(), 1);
    assert_eq!(state.chat.unread_counts().get(&peer.id), Some(&1));

    state.auth.sign_out().await;
    assert_eq!(state.chat.poll(&mut cursor).await.unwrap(), 0);
    assert!(state.chat.unread_counts().is_empty());

    // The peer signs in; the old message is history, not a new delivery.
    state.auth.sign_in("coach@b.com", "coach123").await.unwrap();
    let peer_id = peer.id.clone();
    state
        .session
        .wait_for(|s| s.user_id() == Some(peer_id.as_str()) && !s.loading)
        .await
        .unwrap();
    assert_eq!(state.chat.poll(&mut cursor).await.unwrap(), 0);
    assert_eq!(state.chat.poll(&mut cursor).await.unwrap(), 0);
    assert!(state.chat.unread_counts().is_empty());
}

#[tokio::test]
async fn test_spawned_feed_stops_with_synchronizer() {
    let (backend, _user) = backend_with_account();
    let peer = add_peer(&backend);
    let (_app, state) = create_test_app(backend.clone());
    state.session.wait_until_settled().await;
    let me = sign_in(&state).await.user.unwrap();

    let mut feed = state.chat.subscribe();
    let task = state.chat.spawn_feed(Duration::from_millis(10));
    tokio::time::sleep(Duration::from_millis(30)).await;

    let sent = backend.send_message(&incoming(&peer, &me, "bora")).await.unwrap();
    let received = tokio::time::timeout(Duration::from_secs(2), feed.recv())
        .await
        .expect("feed delivered in time")
        .unwrap();
    assert_eq!(received, sent);

    state.session.shutdown().await;
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("feed task stopped")
        .unwrap();
}
