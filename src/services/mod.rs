// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Services module - business logic layer.

pub mod auth;
pub mod chat;
pub mod profile_loader;
pub mod session;

pub use auth::{AuthFailure, AuthService};
pub use chat::{ChatService, FeedCursor, MAX_MESSAGE_LEN};
pub use profile_loader::{LoadedProfile, ProfileLoader, ProfileSource, RetryPolicy};
pub use session::{SessionHandle, SessionPhase, SessionSnapshot, SessionSynchronizer};

use crate::error::{AppError, Result};
use crate::models::is_record_id;

/// Reject a caller-supplied row id that is not a plain key.
pub(crate) fn check_id(id: &str, what: &str) -> Result<()> {
    if is_record_id(id) {
        Ok(())
    } else {
        Err(AppError::BadRequest(format!("Invalid {what} id")))
    }
}
