//! STUN message parsing and validation errors
//!
//! This module defines error types that can occur while unmarshaling STUN
//! datagrams. All errors implement the standard Error trait for proper
//! error propagation and handling.

use std::fmt;
use std::fmt::Display;

/// STUN message parsing errors
///
/// Represents the failure modes that can occur when decoding a datagram
/// as a STUN message: incomplete data, wrong protocol, and malformed
/// attribute lists.
#[derive(Debug)]
pub enum StunError {
    /// Buffer is too short to contain a complete message
    ///
    /// Occurs when:
    /// - Buffer length < 20 bytes (header size)
    /// - Buffer length < header_size + declared message length
    ///
    /// Typically a truncated or foreign datagram.
    TooShort,

    /// Message header is not a STUN message this crate understands
    ///
    /// Occurs when:
    /// - Magic cookie is not 0x2112A442
    /// - Message type is unknown (not a binding request/response)
    /// - Declared message length is not 32-bit aligned
    Invalid,

    /// An attribute's declared length runs past the end of the message
    ///
    /// The attribute list is walked with 4-byte alignment; a length field
    /// pointing beyond the buffer means the datagram is corrupt.
    TruncatedAttribute,

    /// An address attribute carries a family other than IPv4 or IPv6
    UnsupportedFamily(u8),
}

impl std::error::Error for StunError {}

impl Display for StunError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StunError::TooShort => "datagram ended early".fmt(fmt),
            StunError::Invalid => "not a valid stun message".fmt(fmt),
            StunError::TruncatedAttribute => "attribute past end of message".fmt(fmt),
            StunError::UnsupportedFamily(f) => write!(fmt, "unsupported address family: {:#04x}", f),
        }
    }
}
