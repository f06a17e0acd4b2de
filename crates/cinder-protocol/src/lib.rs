//! cinder-protocol: wire protocol for the cinder server.
//!
//! Requests arrive in one of two framings — a single space-separated
//! inline line, or a multi-bulk frame (`*<argc>` followed by
//! length-prefixed arguments). Replies are serialized directly into
//! an output buffer: status, error, integer, bulk and multi-bulk.
//!
//! # quick start
//!
//! ```
//! use bytes::BytesMut;
//! use cinder_protocol::{Reply, RequestParser};
//!
//! let mut parser = RequestParser::new();
//! let mut buf = BytesMut::from(&b"*1\r\n$4\r\nPING\r\n"[..]);
//! let argv = parser.next_request(&mut buf).unwrap().unwrap();
//! assert_eq!(&argv[0][..], b"PING");
//!
//! let mut out = BytesMut::new();
//! Reply::ok().serialize(&mut out);
//! assert_eq!(&out[..], b"+OK\r\n");
//! ```

pub mod error;
pub mod reply;
pub mod request;

pub use error::ProtocolError;
pub use reply::Reply;
pub use request::{encode_command, RequestParser, REQUEST_MAX_SIZE};
