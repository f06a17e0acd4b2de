//! Reply model and direct-to-buffer serialization.
//!
//! The reply types mirror the wire protocol exactly: status (`+`),
//! error (`-`), integer (`:`), bulk (`$`) and multi-bulk (`*`).
//! Common constant replies (`+OK`, `+PONG`, `+QUEUED`) are borrowed
//! statics so the hot path allocates nothing for them.

use std::borrow::Cow;

use bytes::{BufMut, Bytes, BytesMut};

/// A single reply to be written back to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// One-line status, e.g. `+OK\r\n`.
    Status(Cow<'static, str>),

    /// One-line error, e.g. `-ERR unknown command\r\n`.
    Error(Cow<'static, str>),

    /// Signed integer, e.g. `:42\r\n`.
    Integer(i64),

    /// Binary-safe bulk payload, e.g. `$5\r\nhello\r\n`.
    Bulk(Bytes),

    /// Missing bulk value, `$-1\r\n`.
    Nil,

    /// Ordered sequence of replies, e.g. `*2\r\n...`.
    MultiBulk(Vec<Reply>),

    /// Missing multi-bulk value, `*-1\r\n` (e.g. a timed-out BLPOP).
    NilMultiBulk,
}

impl Reply {
    /// The shared `+OK` status.
    pub fn ok() -> Reply {
        Reply::Status(Cow::Borrowed("OK"))
    }

    /// The shared `+PONG` status.
    pub fn pong() -> Reply {
        Reply::Status(Cow::Borrowed("PONG"))
    }

    /// The shared `+QUEUED` status a transaction answers with.
    pub fn queued() -> Reply {
        Reply::Status(Cow::Borrowed("QUEUED"))
    }

    /// An owned `-ERR ...` reply.
    pub fn error(msg: impl Into<String>) -> Reply {
        Reply::Error(Cow::Owned(format!("ERR {}", msg.into())))
    }

    /// An error reply with a non-ERR prefix already in place
    /// (e.g. `WRONGTYPE ...`).
    pub fn raw_error(msg: impl Into<Cow<'static, str>>) -> Reply {
        Reply::Error(msg.into())
    }

    /// Bulk reply from anything byte-like.
    pub fn bulk(data: impl Into<Bytes>) -> Reply {
        Reply::Bulk(data.into())
    }

    /// `:1` / `:0` from a boolean outcome.
    pub fn from_bool(b: bool) -> Reply {
        Reply::Integer(i64::from(b))
    }

    /// Returns `true` for error replies.
    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// Appends the wire form of this reply to `dst`.
    pub fn serialize(&self, dst: &mut BytesMut) {
        match self {
            Reply::Status(s) => {
                dst.put_u8(b'+');
                dst.put_slice(s.as_bytes());
                dst.put_slice(b"\r\n");
            }
            Reply::Error(s) => {
                dst.put_u8(b'-');
                dst.put_slice(s.as_bytes());
                dst.put_slice(b"\r\n");
            }
            Reply::Integer(n) => {
                dst.put_u8(b':');
                put_decimal(dst, *n);
                dst.put_slice(b"\r\n");
            }
            Reply::Bulk(data) => {
                dst.put_u8(b'$');
                put_decimal(dst, data.len() as i64);
                dst.put_slice(b"\r\n");
                dst.put_slice(data);
                dst.put_slice(b"\r\n");
            }
            Reply::Nil => dst.put_slice(b"$-1\r\n"),
            Reply::MultiBulk(items) => {
                dst.put_u8(b'*');
                put_decimal(dst, items.len() as i64);
                dst.put_slice(b"\r\n");
                for item in items {
                    item.serialize(dst);
                }
            }
            Reply::NilMultiBulk => dst.put_slice(b"*-1\r\n"),
        }
    }
}

/// Writes a signed decimal without going through `format!`.
fn put_decimal(dst: &mut BytesMut, n: i64) {
    let mut buf = itoa_buf();
    dst.put_slice(write_decimal(&mut buf, n));
}

/// Stack buffer sized for i64::MIN plus sign.
fn itoa_buf() -> [u8; 20] {
    [0u8; 20]
}

/// Formats `n` into `buf` back to front, returning the written slice.
fn write_decimal(buf: &mut [u8; 20], n: i64) -> &[u8] {
    if n == 0 {
        buf[0] = b'0';
        return &buf[..1];
    }
    let negative = n < 0;
    // accumulate digits on the unsigned magnitude so i64::MIN works
    let mut m = n.unsigned_abs();
    let mut pos = buf.len();
    while m > 0 {
        pos -= 1;
        buf[pos] = b'0' + (m % 10) as u8;
        m /= 10;
    }
    if negative {
        pos -= 1;
        buf[pos] = b'-';
    }
    &buf[pos..]
}
