//! Incremental request parser.
//!
//! Operates on a per-connection `BytesMut` that the caller fills from
//! the socket. Nothing is consumed until a complete request is
//! available, so the caller simply retries after the next read.
//!
//! Two framings share the buffer:
//!
//! * **Multi-bulk** — `*<argc>\r\n` then `argc` arguments, each
//!   `$<len>\r\n<payload>\r\n`. This is what well-behaved clients and
//!   the journal use.
//! * **Inline** — a single line of space-separated tokens, newline
//!   terminated (CR optional). Commands registered as "bulk" carry
//!   their final argument out of line: the last token is a byte count
//!   and the payload follows the line. The caller arms that read via
//!   [`RequestParser::arm_trailing_bulk`] once it has looked the
//!   command up; the payload may already be fully buffered (the
//!   exact-fit case) in which case the very next poll completes it.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Hard cap on a single request. Crossing it is a fatal protocol
/// error that closes the connection.
pub const REQUEST_MAX_SIZE: usize = 256 * 1024 * 1024;

/// Cap on the multi-bulk argument count. Far above any real command,
/// low enough that a hostile `*2147483647` cannot reserve memory.
const MAX_MULTIBULK_ARGS: i64 = 1024 * 1024;

/// Trailing-bulk read armed after an inline bulk command's line.
#[derive(Debug)]
struct TrailingBulk {
    argv: Vec<Bytes>,
    len: usize,
}

/// Incremental parser state for one connection.
#[derive(Debug, Default)]
pub struct RequestParser {
    trailing: Option<TrailingBulk>,
    last_inline: bool,
}

impl RequestParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the read of a trailing bulk payload of `len` bytes that
    /// will complete `argv`. The caller has already stripped the
    /// length token off `argv`.
    pub fn arm_trailing_bulk(&mut self, argv: Vec<Bytes>, len: usize) {
        self.trailing = Some(TrailingBulk { argv, len });
    }

    /// Whether a trailing bulk read is currently armed.
    pub fn awaiting_trailing_bulk(&self) -> bool {
        self.trailing.is_some()
    }

    /// Whether the last request returned came from the inline
    /// framing. Only inline requests are candidates for a trailing
    /// bulk argument.
    pub fn last_was_inline(&self) -> bool {
        self.last_inline
    }

    /// Drops any partial state. Called after a recoverable protocol
    /// error so the next bytes start a fresh request.
    pub fn reset(&mut self) {
        self.trailing = None;
    }

    /// Extracts the next complete request from `buf`, consuming its
    /// bytes. Returns `Ok(None)` when more data is needed.
    pub fn next_request(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Vec<Bytes>>, ProtocolError> {
        if buf.len() > REQUEST_MAX_SIZE {
            return Err(ProtocolError::RequestTooLarge(REQUEST_MAX_SIZE));
        }

        // an armed trailing bulk has priority over new requests
        if let Some(t) = self.trailing.take() {
            if buf.len() < t.len + 2 {
                self.trailing = Some(t);
                return Ok(None);
            }
            let payload = buf.split_to(t.len).freeze();
            buf.advance(2); // CRLF after the payload
            let mut argv = t.argv;
            argv.push(payload);
            self.last_inline = false; // complete; must not re-arm
            return Ok(Some(argv));
        }

        loop {
            if buf.is_empty() {
                return Ok(None);
            }
            if buf[0] == b'*' {
                return match parse_multibulk(buf)? {
                    Some(MultiBulk::Request(argv, consumed)) => {
                        buf.advance(consumed);
                        self.last_inline = false;
                        Ok(Some(argv))
                    }
                    Some(MultiBulk::Empty(consumed)) => {
                        buf.advance(consumed);
                        continue;
                    }
                    None => Ok(None),
                };
            }
            match parse_inline(buf)? {
                Some(argv) if argv.is_empty() => continue, // blank line
                Some(argv) => {
                    self.last_inline = true;
                    return Ok(Some(argv));
                }
                None => return Ok(None),
            }
        }
    }
}

enum MultiBulk {
    Request(Vec<Bytes>, usize),
    /// `*0` — a frame with no arguments; consumed and skipped.
    Empty(usize),
}

/// Parses one multi-bulk request without consuming `buf`. Returns the
/// argv plus the byte count to consume on success.
fn parse_multibulk(buf: &BytesMut) -> Result<Option<MultiBulk>, ProtocolError> {
    let data = &buf[..];
    let mut pos = 1; // past '*'

    let count = match read_line(data, &mut pos) {
        Some(line) => parse_i64(line)?,
        None => return Ok(None),
    };
    if count < 0 || count > MAX_MULTIBULK_ARGS {
        return Err(ProtocolError::InvalidMultibulkCount(count));
    }
    if count == 0 {
        return Ok(Some(MultiBulk::Empty(pos)));
    }

    let mut argv = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if pos >= data.len() {
            return Ok(None);
        }
        if data[pos] != b'$' {
            return Err(ProtocolError::InvalidBulkLength(-1));
        }
        pos += 1;
        let len = match read_line(data, &mut pos) {
            Some(line) => parse_i64(line)?,
            None => return Ok(None),
        };
        if len < 0 || len as usize > REQUEST_MAX_SIZE {
            return Err(ProtocolError::InvalidBulkLength(len));
        }
        let len = len as usize;
        if data.len() < pos + len + 2 {
            return Ok(None);
        }
        argv.push(Bytes::copy_from_slice(&data[pos..pos + len]));
        pos += len + 2; // payload + CRLF
    }

    Ok(Some(MultiBulk::Request(argv, pos)))
}

/// Parses one inline line into tokens, consuming it from `buf`.
/// Returns an empty argv for a blank line.
fn parse_inline(buf: &mut BytesMut) -> Result<Option<Vec<Bytes>>, ProtocolError> {
    let nl = match memchr::memchr(b'\n', &buf[..]) {
        Some(nl) => nl,
        None => return Ok(None),
    };

    let mut line_end = nl;
    if line_end > 0 && buf[line_end - 1] == b'\r' {
        line_end -= 1;
    }

    let mut argv = Vec::new();
    let mut start = None;
    for i in 0..line_end {
        if buf[i] == b' ' {
            if let Some(s) = start.take() {
                argv.push(Bytes::copy_from_slice(&buf[s..i]));
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        argv.push(Bytes::copy_from_slice(&buf[s..line_end]));
    }

    buf.advance(nl + 1);
    Ok(Some(argv))
}

/// Returns the line ending at the next CRLF (or bare LF), advancing
/// `pos` past the terminator. `None` when the buffer ends first.
fn read_line<'a>(data: &'a [u8], pos: &mut usize) -> Option<&'a [u8]> {
    let nl = memchr::memchr(b'\n', &data[*pos..])? + *pos;
    let mut end = nl;
    if end > *pos && data[end - 1] == b'\r' {
        end -= 1;
    }
    let line = &data[*pos..end];
    *pos = nl + 1;
    Some(line)
}

/// Parses a signed decimal from raw bytes with overflow checking.
pub(crate) fn parse_i64(buf: &[u8]) -> Result<i64, ProtocolError> {
    if buf.is_empty() {
        return Err(ProtocolError::InvalidInteger);
    }
    let (negative, digits) = if buf[0] == b'-' {
        (true, &buf[1..])
    } else {
        (false, buf)
    };
    if digits.is_empty() {
        return Err(ProtocolError::InvalidInteger);
    }

    // accumulate in the negative direction so i64::MIN parses
    let mut n: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(ProtocolError::InvalidInteger);
        }
        n = n
            .checked_mul(10)
            .and_then(|n| n.checked_sub((b - b'0') as i64))
            .ok_or(ProtocolError::InvalidInteger)?;
    }
    if negative {
        Ok(n)
    } else {
        n.checked_neg().ok_or(ProtocolError::InvalidInteger)
    }
}

/// Appends a multi-bulk command frame for `argv` to `dst` — the exact
/// bytes a client would send. Used by the journal and the
/// replication feed.
pub fn encode_command(dst: &mut BytesMut, argv: &[Bytes]) {
    dst.put_u8(b'*');
    dst.put_slice(argv.len().to_string().as_bytes());
    dst.put_slice(b"\r\n");
    for arg in argv {
        dst.put_u8(b'$');
        dst.put_slice(arg.len().to_string().as_bytes());
        dst.put_slice(b"\r\n");
        dst.put_slice(arg);
        dst.put_slice(b"\r\n");
    }
}
