// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Profile loader retry, timeout and fallback behavior (paused clock).

use primefit_session::models::{AuthUser, Role};
use primefit_session::services::ProfileSource;
use std::time::Duration;
use tokio::time::Instant;

mod common;

use common::{backend_with_account, loader, stored_profile, EMAIL};

#[tokio::test(start_paused = true)]
async fn test_stored_profile_and_admin_flag() {
    let (backend, user) = backend_with_account();
    backend.add_profile(stored_profile(&user, "Ana"));
    backend.grant_admin(EMAIL);

    let loaded = loader(&backend).load(&user).await;
    assert_eq!(loaded.source, ProfileSource::Stored);
    assert_eq!(loaded.profile.nome.as_deref(), Some("Ana"));
    assert!(loaded.is_admin);
    assert_eq!(backend.profile_lookups(), 1);
    assert_eq!(backend.admin_checks(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_missing_row_is_not_retried_and_gets_created() {
    let (backend, user) = backend_with_account();

    let loaded = loader(&backend).load(&user).await;
    assert_eq!(loaded.source, ProfileSource::Created);
    assert_eq!(backend.profile_lookups(), 1);

    let stored = backend.profile(&user.id).expect("row inserted");
    assert_eq!(stored.nome.as_deref(), Some("a"));
    assert_eq!(stored.role, Role::Cliente);
}

#[tokio::test(start_paused = true)]
async fn test_created_row_uses_signup_name() {
    let (backend, mut user) = backend_with_account();
    user.user_metadata = serde_json::json!({ "nome": "Ana Lima" });

    let loaded = loader(&backend).load(&user).await;
    assert_eq!(loaded.source, ProfileSource::Created);
    assert_eq!(loaded.profile.nome.as_deref(), Some("Ana Lima"));
}

#[tokio::test(start_paused = true)]
async fn test_failed_insert_falls_back_without_storing() {
    let (backend, user) = backend_with_account();
    backend.update_faults(|f| f.insert_error = true);

    let loaded = loader(&backend).load(&user).await;
    assert_eq!(loaded.source, ProfileSource::Fallback);
    assert_eq!(loaded.profile.id, user.id);
    assert!(backend.profile(&user.id).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_retry_with_linear_backoff() {
    let (backend, user) = backend_with_account();
    backend.add_profile(stored_profile(&user, "Ana"));
    backend.update_faults(|f| f.profile_failures = 2);

    let started = Instant::now();
    let loaded = loader(&backend).load(&user).await;
    let elapsed = started.elapsed();

    assert_eq!(loaded.source, ProfileSource::Stored);
    assert_eq!(backend.profile_lookups(), 3);
    // 1s after the first failure, 2s after the second.
    assert!(elapsed >= Duration::from_secs(3), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(4), "elapsed {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_fall_back() {
    let (backend, user) = backend_with_account();
    backend.add_profile(stored_profile(&user, "Ana"));
    backend.update_faults(|f| f.profile_failures = 10);

    let loaded = loader(&backend).load(&user).await;
    assert_eq!(loaded.source, ProfileSource::Fallback);
    assert_eq!(loaded.profile.id, user.id);
    assert_eq!(loaded.profile.email, EMAIL);
    assert_eq!(loaded.profile.role, Role::Cliente);
    assert_eq!(backend.profile_lookups(), 3);

    // The basic row was offered; the stored one wins and is left alone.
    assert_eq!(backend.profile_inserts(), 1);
    assert_eq!(backend.profile(&user.id), Some(stored_profile(&user, "Ana")));
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_store_basic_row() {
    let (backend, user) = backend_with_account();
    backend.update_faults(|f| f.profile_failures = 10);

    let loaded = loader(&backend).load(&user).await;
    assert_eq!(loaded.source, ProfileSource::Created);
    assert_eq!(backend.profile_lookups(), 3);
    assert_eq!(backend.profile_inserts(), 1);

    let stored = backend.profile(&user.id).unwrap();
    assert_eq!(stored.email, EMAIL);
    assert_eq!(stored.role, Role::Cliente);
}

#[tokio::test(start_paused = true)]
async fn test_each_attempt_is_bounded_by_timeout() {
    let (backend, user) = backend_with_account();
    backend.add_profile(stored_profile(&user, "Ana"));
    backend.update_faults(|f| f.profile_delay = Some(Duration::from_secs(60)));

    let started = Instant::now();
    let loaded = loader(&backend).load(&user).await;
    let elapsed = started.elapsed();

    assert_eq!(loaded.source, ProfileSource::Fallback);
    assert_eq!(backend.profile_lookups(), 3);
    // Three 5s timeouts plus 1s and 2s of backoff.
    assert!(elapsed >= Duration::from_secs(18), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(19), "elapsed {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn test_lookups_run_concurrently() {
    let (backend, user) = backend_with_account();
    backend.add_profile(stored_profile(&user, "Ana"));
    backend.update_faults(|f| {
        f.profile_delay = Some(Duration::from_secs(2));
        f.admin_delay = Some(Duration::from_secs(2));
    });

    let started = Instant::now();
    loader(&backend).load(&user).await;
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_admin_check_fails_closed() {
    let (backend, user) = backend_with_account();
    backend.grant_admin(EMAIL);

    backend.update_faults(|f| f.admin_error = true);
    assert!(!loader(&backend).load(&user).await.is_admin);

    backend.update_faults(|f| {
        f.admin_error = false;
        f.admin_delay = Some(Duration::from_secs(30));
    });
    assert!(!loader(&backend).check_admin(EMAIL).await);
}

#[tokio::test(start_paused = true)]
async fn test_user_without_email_skips_lookups() {
    let (backend, _user) = backend_with_account();
    let user = AuthUser {
        id: "phone-only".to_string(),
        email: None,
        user_metadata: serde_json::Value::Null,
        updated_at: None,
    };

    let loaded = loader(&backend).load(&user).await;
    assert_eq!(loaded.source, ProfileSource::Fallback);
    assert_eq!(loaded.profile.id, "phone-only");
    assert_eq!(loaded.profile.email, "");
    assert!(!loaded.is_admin);
    assert_eq!(backend.profile_lookups(), 0);
    assert_eq!(backend.admin_checks(), 0);
}
