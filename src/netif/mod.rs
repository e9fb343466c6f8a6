//! Local network interface discovery
//!
//! Small helpers around the host's own addressing: which IPv4 interfaces
//! exist and which address outbound traffic will leave from. Nothing here
//! talks STUN; these feed source address selection and reporting.

use ipnet::Ipv4Net;
use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::time::Duration;
use tracing::{debug, warn};

/// Destination used to learn the preferred outbound address. The socket
/// is only connected, no packet ever leaves.
const ROUTE_PROBE_DESTINATION: &str = "8.8.8.8:80";

/// Public IP echo services consulted when STUN never answered
const IP_ECHO_ENDPOINTS: [&str; 3] = [
    "https://api.ipify.org",
    "https://icanhazip.com",
    "https://ident.me",
];

/// Errors from local interface and route discovery
#[derive(Debug)]
pub enum NetifError {
    /// The OS refused to enumerate network interfaces
    Enumeration(std::io::Error),

    /// No usable route toward the public internet
    RouteUnavailable(std::io::Error),
}

impl Display for NetifError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetifError::Enumeration(err) => write!(f, "interface enumeration failed: {}", err),
            NetifError::RouteUnavailable(err) => write!(f, "no usable outbound route: {}", err),
        }
    }
}

impl std::error::Error for NetifError {}

/// An IPv4 address together with the interface carrying it
#[derive(Debug, Clone)]
pub struct InterfaceAddr {
    pub name: String,
    pub addr: Ipv4Addr,

    /// True when outbound traffic currently leaves from this address
    pub is_default: bool,
}

/// Lists the IPv4 addresses of all non-loopback interfaces
pub fn list_ipv4() -> Result<Vec<InterfaceAddr>, NetifError> {
    list_ipv4_with(false)
}

/// Interface listing with loopback addresses optionally included
///
/// Each snapshot entry is marked against the current outbound address, so
/// callers can preselect the interface a probe would naturally run from.
pub fn list_ipv4_with(include_loopback: bool) -> Result<Vec<InterfaceAddr>, NetifError> {
    let interfaces = if_addrs::get_if_addrs().map_err(NetifError::Enumeration)?;
    let outbound = match default_outbound_ip() {
        Ok(IpAddr::V4(addr)) => Some(addr),
        _ => None,
    };
    let mut found = Vec::new();
    for interface in interfaces {
        if let IpAddr::V4(addr) = interface.ip() {
            if addr.is_loopback() && !include_loopback {
                continue;
            }
            debug!(interface = %interface.name, %addr, "found ipv4 interface");
            found.push(InterfaceAddr {
                name: interface.name,
                addr,
                is_default: Some(addr) == outbound,
            });
        }
    }
    Ok(found)
}

/// Learns the address outbound traffic leaves from
///
/// Connects a UDP socket toward a public destination and reads the local
/// address the kernel picked for it. Works without sending anything, but
/// needs a route to exist.
pub fn default_outbound_ip() -> Result<IpAddr, NetifError> {
    let socket = UdpSocket::bind("0.0.0.0:0").map_err(NetifError::RouteUnavailable)?;
    socket
        .connect(ROUTE_PROBE_DESTINATION)
        .map_err(NetifError::RouteUnavailable)?;
    let local = socket.local_addr().map_err(NetifError::RouteUnavailable)?;
    Ok(local.ip())
}

/// True when `addr` falls in the carrier-grade NAT range 100.64.0.0/10
///
/// A mapped address in this range means the reported external IP is not
/// reachable from the internet even under a cone verdict.
pub fn is_cgnat(addr: Ipv4Addr) -> bool {
    Ipv4Net::new(Ipv4Addr::new(100, 64, 0, 0), 10)
        .map(|net| net.contains(&addr))
        .unwrap_or(false)
}

/// Asks public IP echo services for this host's address over HTTPS
///
/// Last resort for runs where no STUN server answered; this can recover
/// the external address but never a NAT verdict.
pub fn public_ip_via_https() -> Option<IpAddr> {
    for endpoint in IP_ECHO_ENDPOINTS {
        debug!(%endpoint, "requesting public ip");
        let response = match ureq::get(endpoint).timeout(Duration::from_secs(5)).call() {
            Ok(response) => response,
            Err(err) => {
                debug!(%endpoint, error = %err, "request failed");
                continue;
            }
        };
        let body = match response.into_string() {
            Ok(body) => body,
            Err(err) => {
                debug!(%endpoint, error = %err, "reading body failed");
                continue;
            }
        };
        match body.trim().parse::<IpAddr>() {
            Ok(addr) => return Some(addr),
            Err(_) => warn!(%endpoint, "service did not return an ip address"),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cgnat_range_boundaries() {
        assert!(is_cgnat(Ipv4Addr::new(100, 64, 0, 0)));
        assert!(is_cgnat(Ipv4Addr::new(100, 64, 0, 1)));
        assert!(is_cgnat(Ipv4Addr::new(100, 127, 255, 255)));
        assert!(!is_cgnat(Ipv4Addr::new(100, 63, 255, 255)));
        assert!(!is_cgnat(Ipv4Addr::new(100, 128, 0, 0)));
        assert!(!is_cgnat(Ipv4Addr::new(192, 168, 1, 1)));
        assert!(!is_cgnat(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn interface_listing_excludes_loopback() {
        let interfaces = list_ipv4().expect("interface enumeration");
        for interface in interfaces {
            assert!(!interface.addr.is_loopback());
        }
    }

    #[test]
    fn loopback_flag_widens_the_listing() {
        let without = list_ipv4().expect("interface enumeration");
        let with = list_ipv4_with(true).expect("interface enumeration");
        assert!(with.len() >= without.len());
        for interface in without {
            assert!(with.iter().any(|i| i.addr == interface.addr));
        }
    }

    #[test]
    fn at_most_one_interface_is_marked_default() {
        let interfaces = list_ipv4_with(true).expect("interface enumeration");
        assert!(interfaces.iter().filter(|i| i.is_default).count() <= 1);
    }

    #[test]
    #[ignore] // Requires network access
    fn outbound_ip_is_not_loopback() {
        let addr = default_outbound_ip().expect("outbound route");
        assert!(!addr.is_loopback());
        assert!(!addr.is_unspecified());
    }

    #[test]
    #[ignore] // Requires network access
    fn ip_echo_services_answer() {
        let addr = public_ip_via_https().expect("at least one echo service");
        assert!(!addr.is_loopback());
    }
}
