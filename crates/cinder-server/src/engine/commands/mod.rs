//! Command handlers, grouped by data type.
//!
//! Every handler has the same shape: it gets the executor, the
//! calling client's state, and the raw argv (already arity-checked
//! by the dispatcher), and returns a [`HandlerResult`] — almost
//! always a plain reply. Handlers mark mutations through
//! [`Engine::add_dirty`]; the dispatcher turns that into journal
//! appends and replica feeds after the handler returns.

pub(crate) mod hashes;
pub(crate) mod keys;
pub(crate) mod lists;
pub(crate) mod server;
pub(crate) mod sets;
pub(crate) mod strings;
pub(crate) mod zsets;

use bytes::Bytes;
use cinder_protocol::Reply;

pub(crate) const WRONGTYPE: &str =
    "WRONGTYPE Operation against a key holding the wrong kind of value";

pub(crate) fn wrong_type_reply() -> Reply {
    Reply::raw_error(WRONGTYPE)
}

/// Parses an argument as an i64 with the stock error message.
pub(crate) fn parse_int(arg: &[u8]) -> Result<i64, Reply> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Reply::error("value is not an integer or out of range"))
}

/// Parses an argument as a finite-or-infinite f64 score.
pub(crate) fn parse_float(arg: &[u8]) -> Result<f64, Reply> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|v| !v.is_nan())
        .ok_or_else(|| Reply::error("value is not a valid float"))
}

/// Formats a score the way replies and journal frames spell doubles.
pub(crate) fn format_score(score: f64) -> Bytes {
    Bytes::from(cinder_persistence::length::format_g17(score))
}

/// Uppercases a (short) argument for keyword comparison.
pub(crate) fn upper(arg: &[u8]) -> Vec<u8> {
    arg.to_ascii_uppercase()
}
