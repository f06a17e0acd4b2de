//! Wall-clock time helpers.
//!
//! Expirations are absolute unix timestamps because they outlive the
//! process: they are written to snapshot files and propagated to
//! replicas as EXPIREAT. Millisecond resolution internally, second
//! resolution at the protocol surface.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in milliseconds.
#[inline]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

/// Current unix time in whole seconds.
#[inline]
pub fn now_secs() -> u64 {
    now_ms() / 1000
}

/// Returns true if an absolute expiry (unix ms) has passed.
#[inline]
pub fn is_expired(expires_at_ms: u64) -> bool {
    now_ms() >= expires_at_ms
}

/// Remaining whole seconds until `expires_at_ms`, saturating at zero.
#[inline]
pub fn remaining_secs(expires_at_ms: u64) -> u64 {
    expires_at_ms.saturating_sub(now_ms()) / 1000
}
