//! Caller-facing bridge surface
//!
//! Thin string-typed wrappers shaped for an embedding UI. Richer data
//! stays structured inside the crate; this layer serializes at the
//! boundary and never returns errors, only safe defaults or an error
//! sentence.

use crate::config::ProbeConfig;
use crate::netif;
use crate::probe::NatReport;
use crate::session;
use tokio_util::sync::CancellationToken;
use tracing::error;

/// Lists the host's non-loopback IPv4 addresses as strings
///
/// Enumeration failure yields an empty list rather than an error.
pub fn get_all_ipv4_interfaces() -> Vec<String> {
    match netif::list_ipv4() {
        Ok(interfaces) => interfaces.iter().map(|i| i.addr.to_string()).collect(),
        Err(err) => {
            error!(error = %err, "interface enumeration failed");
            Vec::new()
        }
    }
}

/// Returns the preferred outbound IPv4 address, `"0.0.0.0"` when no
/// route is available
pub fn get_defaul_outbound_ip() -> String {
    match netif::default_outbound_ip() {
        Ok(addr) => addr.to_string(),
        Err(err) => {
            error!(error = %err, "outbound address lookup failed");
            "0.0.0.0".to_string()
        }
    }
}

/// Runs a discovery session with default settings and renders the
/// result string
///
/// The result is `"<verdict>|<external-ip>"` with the external half
/// empty when no address was learned. Session rejections come back as
/// an error sentence instead of the pipe form.
pub async fn get_ip_info(source_ip: &str) -> String {
    let config = ProbeConfig::default();
    match session::run_test(&config, source_ip, None, CancellationToken::new()).await {
        Ok(report) => result_string(&report),
        Err(err) => format!("Error discovering NAT type: {}", err),
    }
}

/// Serializes a report into the pipe-delimited caller form
pub fn result_string(report: &NatReport) -> String {
    let external = report
        .external_ip
        .map(|ip| ip.to_string())
        .unwrap_or_default();
    format!("{}|{}", report.verdict, external)
}
