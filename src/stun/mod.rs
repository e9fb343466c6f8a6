//! STUN wire protocol and binding exchange
//!
//! This module implements the subset of STUN (RFC 5389, with the classic
//! RFC 3489 CHANGE-REQUEST extension) needed for NAT behavior discovery:
//! marshaling and unmarshaling binding messages, plus the retrying
//! request/response exchange over a shared UDP socket.

pub mod client;
pub mod errors;
pub mod message;
pub mod parser;

pub use client::{BindingProber, ProbeResult, StunClient};
pub use message::{BindingReply, BindingRequest, Message, MessageType};
pub use parser::Parser;
