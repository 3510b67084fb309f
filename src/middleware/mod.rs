// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Middleware modules (session gates, security headers).

pub mod security;
pub mod session;

pub use session::{require_admin, require_session, CurrentUser};
