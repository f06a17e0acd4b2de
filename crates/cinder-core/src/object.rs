//! The stored value model.
//!
//! Each keyspace entry holds a [`Value`]: a tagged variant owning its
//! payload. Strings additionally carry an encoding — raw bytes, or a
//! plain `i64` when the bytes are the canonical decimal of one. The
//! integer form halves the footprint of counter-style keys and lets
//! the snapshot writer emit them as fixed-width integers.

use std::collections::VecDeque;

use ahash::AHashSet;
use bytes::Bytes;

use crate::types::hash::Hash;
use crate::types::sorted_set::SortedSet;

/// A string payload in one of its two encodings.
///
/// `Int` is chosen opportunistically at creation: the original bytes
/// must round-trip through `i64` exactly (no sign prefix games, no
/// leading zeroes), so decoding always reproduces them.
#[derive(Debug, Clone)]
pub enum StrValue {
    /// Raw binary-safe bytes.
    Raw(Bytes),
    /// Canonical decimal integer, stored decoded.
    Int(i64),
}

impl StrValue {
    /// Creates a string value, preferring the integer encoding when
    /// the bytes are a canonical `i64` decimal.
    pub fn new(data: Bytes) -> StrValue {
        match canonical_i64(&data) {
            Some(n) => StrValue::Int(n),
            None => StrValue::Raw(data),
        }
    }

    /// Creates a raw value without attempting integer encoding.
    pub fn raw(data: Bytes) -> StrValue {
        StrValue::Raw(data)
    }

    /// The decoded byte form. For `Int` this is the minimal decimal
    /// representation; it allocates.
    pub fn as_bytes(&self) -> Bytes {
        match self {
            StrValue::Raw(data) => data.clone(),
            StrValue::Int(n) => Bytes::from(n.to_string()),
        }
    }

    /// Byte length of the decoded form. For `Int` this is the
    /// printable decimal width, computed without allocating.
    pub fn len(&self) -> usize {
        match self {
            StrValue::Raw(data) => data.len(),
            StrValue::Int(n) => decimal_width(*n),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The integer payload, when integer-encoded.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            StrValue::Int(n) => Some(*n),
            StrValue::Raw(_) => None,
        }
    }

    /// Parses the value as an `i64` regardless of encoding.
    pub fn to_i64(&self) -> Option<i64> {
        match self {
            StrValue::Int(n) => Some(*n),
            StrValue::Raw(data) => canonical_i64(data),
        }
    }

    /// Encoding name as reported by DEBUG OBJECT.
    pub fn encoding_name(&self) -> &'static str {
        match self {
            StrValue::Raw(_) => "raw",
            StrValue::Int(_) => "int",
        }
    }
}

impl PartialEq for StrValue {
    /// Byte equality after decoding; two integer-encoded operands
    /// compare numerically, mixed operands through the canonical
    /// decimal form.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (StrValue::Int(a), StrValue::Int(b)) => a == b,
            (StrValue::Raw(a), StrValue::Raw(b)) => a == b,
            (StrValue::Int(n), StrValue::Raw(data)) | (StrValue::Raw(data), StrValue::Int(n)) => {
                canonical_i64(data) == Some(*n)
            }
        }
    }
}

impl Eq for StrValue {}

/// A stored value: one variant per data type.
#[derive(Debug, Clone)]
pub enum Value {
    Str(StrValue),
    List(VecDeque<Bytes>),
    Set(AHashSet<Bytes>),
    Zset(SortedSet),
    Hash(Hash),
}

impl Value {
    /// Convenience constructor applying the string encoding pass.
    pub fn str(data: Bytes) -> Value {
        Value::Str(StrValue::new(data))
    }

    /// Type name as reported by the TYPE command.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Zset(_) => "zset",
            Value::Hash(_) => "hash",
        }
    }

    /// Rough serialized size in bytes. Drives the swap-out score and
    /// DEBUG OBJECT; it does not need to match the snapshot encoding
    /// exactly, only to rank values sensibly.
    pub fn approx_size(&self) -> usize {
        match self {
            Value::Str(s) => s.len(),
            Value::List(items) => items.iter().map(|i| i.len() + 8).sum(),
            Value::Set(members) => members.iter().map(|m| m.len() + 8).sum(),
            Value::Zset(zset) => zset.iter().map(|(m, _)| m.len() + 16).sum(),
            Value::Hash(hash) => hash.iter().map(|(f, v)| f.len() + v.len() + 8).sum(),
        }
    }
}

/// Converts Redis-style signed indices into a clamped inclusive
/// `(start, stop)` pair. Negative indices count back from `len`.
/// A hugely negative stop clamps to -1 so the caller sees an empty
/// range (`start > stop`).
pub fn normalize_range(start: i64, stop: i64, len: i64) -> (i64, i64) {
    if len == 0 {
        return (0, -1);
    }
    let s = if start < 0 { (len + start).max(0) } else { start };
    let e = if stop < 0 {
        (len + stop).max(-1)
    } else {
        stop.min(len - 1)
    };
    (s, e)
}

/// Parses `data` as a canonical `i64` decimal: what `to_string`
/// would produce. Rejects empty input, leading zeroes, a bare or
/// positive sign, and "-0".
pub fn canonical_i64(data: &[u8]) -> Option<i64> {
    if data.is_empty() || data.len() > 20 {
        return None;
    }
    let s = std::str::from_utf8(data).ok()?;
    let n: i64 = s.parse().ok()?;
    // round-trip check rejects "+1", "007", "-0", etc.
    if n.to_string().as_bytes() == data {
        Some(n)
    } else {
        None
    }
}

/// Printable width of a decimal i64, sign included.
fn decimal_width(mut n: i64) -> usize {
    let mut width = if n < 0 { 1 } else { 0 };
    loop {
        width += 1;
        n /= 10;
        if n == 0 {
            return width;
        }
    }
}
