//! NAT behavior classification
//!
//! This module derives a NAT classification from a sequence of STUN
//! binding exchanges. The verdict tells a caller how traffic toward the
//! host's external mapping will be treated: anything from "no NAT at all"
//! down to "every destination gets its own mapping".

pub mod classifier;

pub use classifier::classify;

use serde::Serialize;
use std::fmt::Display;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// NAT classifications derived from the RFC 3489 discovery flow
///
/// The first five are the classic taxonomy; the remaining three cover the
/// non-NAT outcomes a run can end in. `Blocked` is total failure (nothing
/// answered at all), `Unknown` is partial failure (the flow could not
/// finish with a comparable result) and is deliberately kept distinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NatType {
    /// No NAT and no filtering, the host is directly reachable
    OpenInternet,

    /// One external mapping reused for all destinations, any external host
    /// can send to it
    FullCone,

    /// External hosts can answer only from an IP the host already
    /// contacted (any port)
    RestrictedCone,

    /// External hosts can answer only from the exact IP:port the host
    /// already contacted
    PortRestrictedCone,

    /// A distinct external mapping per destination endpoint
    Symmetric,

    /// No address translation, but inbound UDP from unknown sources is
    /// filtered
    SymmetricUDPFirewall,

    /// UDP egress blocked or no STUN server reachable
    Blocked,

    /// The discovery flow could not complete with a comparable result
    Unknown,
}

impl NatType {
    /// Returns a human-readable description of the NAT type
    pub fn description(&self) -> &'static str {
        match self {
            NatType::OpenInternet => "No NAT (public internet)",
            NatType::FullCone => "Full cone NAT (endpoint-independent)",
            NatType::RestrictedCone => "Restricted cone NAT (address-dependent filtering)",
            NatType::PortRestrictedCone => {
                "Port-restricted cone NAT (address and port dependent filtering)"
            }
            NatType::Symmetric => "Symmetric NAT (new mapping per destination)",
            NatType::SymmetricUDPFirewall => "No NAT, but a firewall filters inbound UDP",
            NatType::Blocked => "UDP blocked or no STUN server reachable",
            NatType::Unknown => "NAT behavior could not be determined",
        }
    }
}

impl Display for NatType {
    /// Formats the verdict in its wire form, the exact token callers see
    /// in the result string
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NatType::OpenInternet => "OpenInternet",
            NatType::FullCone => "FullCone",
            NatType::RestrictedCone => "RestrictedCone",
            NatType::PortRestrictedCone => "PortRestrictedCone",
            NatType::Symmetric => "Symmetric",
            NatType::SymmetricUDPFirewall => "SymmetricUDPFirewall",
            NatType::Blocked => "Blocked",
            NatType::Unknown => "Unknown",
        };
        name.fmt(f)
    }
}

/// A configured STUN server after name resolution
///
/// The name is kept alongside the address so reports and logs can show
/// which server decided the run.
#[derive(Debug, Clone)]
pub struct ResolvedServer {
    pub name: String,
    pub addr: SocketAddr,
}

/// Outcome of one classification run
#[derive(Debug, Clone)]
pub struct Classification {
    pub verdict: NatType,
    /// External mapping observed by the first successful probe
    pub reflexive: Option<SocketAddr>,
    /// Server that anchored the run
    pub server: Option<String>,
}

impl Classification {
    pub(crate) fn blocked() -> Self {
        Classification {
            verdict: NatType::Blocked,
            reflexive: None,
            server: None,
        }
    }

    pub(crate) fn unknown(reflexive: Option<SocketAddr>, server: Option<String>) -> Self {
        Classification {
            verdict: NatType::Unknown,
            reflexive,
            server,
        }
    }
}

/// Report returned by a test session
///
/// This is the structured form behind the pipe-delimited caller string;
/// `fault` is the diagnostic side channel for runs that ended in a safe
/// default verdict because of an internal error.
#[derive(Debug, Clone)]
pub struct NatReport {
    pub verdict: NatType,
    pub external_ip: Option<IpAddr>,
    pub external_port: Option<u16>,
    pub server: Option<String>,
    pub elapsed: Duration,
    pub fault: Option<String>,
}

impl NatReport {
    pub(crate) fn from_classification(outcome: Classification, elapsed: Duration) -> Self {
        NatReport {
            verdict: outcome.verdict,
            external_ip: outcome.reflexive.map(|a| a.ip()),
            external_port: outcome.reflexive.map(|a| a.port()),
            server: outcome.server,
            elapsed,
            fault: None,
        }
    }

    pub(crate) fn fault(message: String, elapsed: Duration) -> Self {
        NatReport {
            verdict: NatType::Unknown,
            external_ip: None,
            external_port: None,
            server: None,
            elapsed,
            fault: Some(message),
        }
    }
}
