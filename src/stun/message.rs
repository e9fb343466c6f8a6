//! STUN message definitions for NAT discovery
//!
//! This module defines the message structures and attribute constants used
//! by the binding exchange. Only the binding method is modeled; that is all
//! NAT classification needs.
//!
//! # Message Header Format (20 bytes)
//! ```text
//! +--------+--------+--------+--------+
//! |  Type (2 bytes) | Length (2 bytes)|
//! +--------+--------+--------+--------+
//! |     Magic Cookie 0x2112A442       |
//! +--------+--------+--------+--------+
//! |                                   |
//! |      Transaction ID (12 bytes)    |
//! |                                   |
//! +--------+--------+--------+--------+
//! ```
//!
//! - Type: 0x0001 binding request, 0x0101 binding success response
//! - Length: size of the attribute section in bytes (32-bit aligned)
//! - Magic Cookie: fixed 0x2112A442, also the XOR key for address attributes
//! - Transaction ID: 96-bit random value correlating request and response

pub(crate) use crate::stun::errors::StunError;
use std::fmt::Display;
use std::net::SocketAddr;

/// Message header length in bytes
///
/// Header format: Type(2) + Length(2) + Magic(4) + TransactionID(12) = 20 bytes
pub(crate) const HDR_LEN: usize = 20;

/// Fixed magic cookie value, second header word of every message
pub const MAGIC_COOKIE: u32 = 0x2112A442;

/// Transaction ID length in bytes (96 bits)
pub const TXN_ID_LEN: usize = 12;

/// 96-bit transaction ID correlating one request with its response
pub type TxnId = [u8; TXN_ID_LEN];

// Attribute type registry subset used by the discovery flow.
pub(crate) const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
pub(crate) const ATTR_CHANGE_REQUEST: u16 = 0x0003;
pub(crate) const ATTR_SOURCE_ADDRESS: u16 = 0x0004;
pub(crate) const ATTR_CHANGED_ADDRESS: u16 = 0x0005;
pub(crate) const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
// Pre-standard XOR-MAPPED-ADDRESS number still emitted by older servers.
pub(crate) const ATTR_XOR_MAPPED_ADDRESS_LEGACY: u16 = 0x8020;
pub(crate) const ATTR_SOFTWARE: u16 = 0x8022;
// RFC 5780 successor of CHANGED-ADDRESS.
pub(crate) const ATTR_OTHER_ADDRESS: u16 = 0x802C;

/// CHANGE-REQUEST flag: respond from a different IP
pub(crate) const CHANGE_IP_FLAG: u32 = 0x0000_0004;
/// CHANGE-REQUEST flag: respond from a different port
pub(crate) const CHANGE_PORT_FLAG: u32 = 0x0000_0002;

/// Address attribute family octet for IPv4
pub(crate) const FAMILY_IPV4: u8 = 0x01;
/// Address attribute family octet for IPv6
pub(crate) const FAMILY_IPV6: u8 = 0x02;

/// Message type identifiers
///
/// Only the binding method appears on the wire in this crate:
/// - BindingRequest: sent by the probe
/// - BindingResponse: success answer carrying the mapped address
/// - BindingErrorResponse: server-side rejection, discarded by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Binding request (0x0001)
    BindingRequest = 0x0001,
    /// Binding success response (0x0101)
    BindingResponse = 0x0101,
    /// Binding error response (0x0111)
    BindingErrorResponse = 0x0111,
}

impl TryFrom<u16> for MessageType {
    type Error = StunError;

    /// Converts a header type field to a MessageType
    ///
    /// # Returns
    /// * `Ok(MessageType)` if the value is a binding message
    /// * `Err(StunError::Invalid)` for anything else
    fn try_from(v: u16) -> Result<Self, Self::Error> {
        match v {
            0x0001 => Ok(MessageType::BindingRequest),
            0x0101 => Ok(MessageType::BindingResponse),
            0x0111 => Ok(MessageType::BindingErrorResponse),
            _ => Err(StunError::Invalid),
        }
    }
}

/// STUN message enum
///
/// Represents the two message shapes the discovery flow exchanges. Binding
/// error responses are not modeled as data; the parser rejects them and the
/// client treats the datagram as noise.
#[derive(Debug)]
pub enum Message {
    /// Binding request carrying optional CHANGE-REQUEST flags
    Request(BindingRequest),
    /// Binding success response carrying address attributes
    Reply(BindingReply),
}

impl Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::Request(req) => write!(
                f,
                "binding request (change ip: {}, change port: {})",
                req.change_ip, req.change_port
            ),
            Message::Reply(reply) => match reply.reflexive() {
                Some(mapped) => write!(f, "binding response mapped to {}", mapped),
                None => write!(f, "binding response without mapped address"),
            },
        }
    }
}

/// Binding request sent toward a STUN server
///
/// The transaction ID must be freshly generated for every datagram sent;
/// the client uses it to reject late answers from earlier attempts that
/// share the same socket.
#[derive(Debug, Clone)]
pub struct BindingRequest {
    /// Random 96-bit transaction ID for this attempt
    pub txn_id: TxnId,

    /// Ask the server to answer from a different IP (CHANGE-REQUEST 0x04)
    pub change_ip: bool,

    /// Ask the server to answer from a different port (CHANGE-REQUEST 0x02)
    pub change_port: bool,

    /// SOFTWARE attribute value advertised to the server
    pub software: Option<String>,
}

impl BindingRequest {
    /// Creates a plain binding request with no change flags
    pub fn new(txn_id: TxnId) -> Self {
        BindingRequest {
            txn_id,
            change_ip: false,
            change_port: false,
            software: None,
        }
    }

    /// CHANGE-REQUEST flag word for the wire
    pub(crate) fn change_flags(&self) -> u32 {
        let mut flags = 0;
        if self.change_ip {
            flags |= CHANGE_IP_FLAG;
        }
        if self.change_port {
            flags |= CHANGE_PORT_FLAG;
        }
        flags
    }
}

/// Binding success response as decoded from the wire
///
/// All address attributes are optional on the wire; `reflexive()` applies
/// the XOR-preferred selection the discovery flow relies on.
#[derive(Debug, Clone, Default)]
pub struct BindingReply {
    /// Transaction ID echoed by the server
    pub txn_id: TxnId,

    /// MAPPED-ADDRESS attribute (plain encoding)
    pub mapped: Option<SocketAddr>,

    /// XOR-MAPPED-ADDRESS attribute (cookie-obfuscated encoding)
    pub xor_mapped: Option<SocketAddr>,

    /// SOURCE-ADDRESS attribute: the address the server answered from
    pub source: Option<SocketAddr>,

    /// CHANGED-ADDRESS / OTHER-ADDRESS attribute: the server's alternate
    /// endpoint, target of the mapping-consistency probe
    pub alternate: Option<SocketAddr>,

    /// SOFTWARE attribute advertised by the server
    pub software: Option<String>,
}

impl BindingReply {
    /// Server-reflexive address reported by this response
    ///
    /// XOR-MAPPED-ADDRESS is preferred because middleboxes cannot rewrite
    /// it in transit; MAPPED-ADDRESS is the fallback for servers that only
    /// speak the classic dialect.
    pub fn reflexive(&self) -> Option<SocketAddr> {
        self.xor_mapped.or(self.mapped)
    }
}
