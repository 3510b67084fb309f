// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Data models for the application.

pub mod auth;
pub mod message;
pub mod profile;

pub use auth::{AuthChange, AuthEvent, AuthUser, Session};
pub use message::{ChatMessage, NewMessage};
pub use profile::{Profile, ProfileChanges, ProfileUpdate, Role};

/// Longest row id accepted from callers.
pub const MAX_RECORD_ID_LEN: usize = 64;

/// True for ids that look like row keys (UUIDs and the like).
///
/// Ids end up inside PostgREST filter expressions, so anything with filter
/// syntax in it is refused before it reaches the backend.
pub fn is_record_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_RECORD_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_ids() {
        assert!(is_record_id("3f2b8c1e-6a7d-4e0f-9b21-5c8d7e6f1a2b"));
        assert!(is_record_id("user-12"));
        assert!(!is_record_id(""));
        assert!(!is_record_id("x),sender_id.neq.0"));
        assert!(!is_record_id("a,b"));
        assert!(!is_record_id("a b"));
        assert!(!is_record_id(&"a".repeat(MAX_RECORD_ID_LEN + 1)));
    }
}
