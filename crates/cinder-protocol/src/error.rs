//! Protocol-level errors.
//!
//! A `Fatal` error closes the connection; everything else is reported
//! to the client as an error reply and the parser state is reset.

use thiserror::Error;

/// Errors produced while framing client requests.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Multi-bulk argument count was negative or absurdly large.
    #[error("invalid multi bulk count")]
    InvalidMultibulkCount(i64),

    /// A `$<len>` bulk length was negative or over the request cap.
    #[error("invalid bulk length")]
    InvalidBulkLength(i64),

    /// A trailing bulk argument of an inline command carried a bad length.
    #[error("invalid bulk write count")]
    InvalidTrailingBulk,

    /// A length field was not a valid decimal integer.
    #[error("invalid integer in request")]
    InvalidInteger,

    /// The accumulated request exceeded the hard size cap. The
    /// connection must be closed.
    #[error("request exceeds maximum size of {0} bytes")]
    RequestTooLarge(usize),
}

impl ProtocolError {
    /// Whether the connection should be torn down rather than kept
    /// alive with an error reply.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProtocolError::RequestTooLarge(_))
    }
}
