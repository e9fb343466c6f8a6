//! Discovery session orchestration
//!
//! A session owns everything one NAT discovery run needs: the probe
//! socket, server resolution, the classification flow, and the final
//! report. Sessions are single-flight per process; callers racing for a
//! second one are rejected rather than queued.

use crate::config::ProbeConfig;
use crate::netif;
use crate::probe::{classify, Classification, NatReport, ResolvedServer};
use crate::stun::client::resolve;
use crate::stun::StunClient;
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt::Display;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Global session state (one discovery run at a time, last report kept)
static SESSION_STATE: once_cell::sync::Lazy<Arc<RwLock<SessionState>>> =
    once_cell::sync::Lazy::new(|| Arc::new(RwLock::new(SessionState::default())));

#[derive(Debug, Default)]
struct SessionState {
    /// Source address of the run currently holding the single-flight slot
    active_source: Option<String>,
    last: Option<NatReport>,
}

/// Defined ways a session can end without a report
///
/// These are rejections, not internal faults. Faults fold into an
/// `Unknown` report with the failure recorded on the side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Another discovery session is already running in this process
    Busy,

    /// The session was cancelled before reaching a verdict
    Cancelled,
}

impl Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Busy => write!(f, "another nat discovery session is already running"),
            SessionError::Cancelled => write!(f, "nat discovery session cancelled"),
        }
    }
}

impl std::error::Error for SessionError {}

/// Releases the single-flight slot when the session ends, however it ends
#[derive(Debug)]
struct SessionGuard;

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let mut state = SESSION_STATE.write().unwrap_or_else(|e| e.into_inner());
        state.active_source = None;
    }
}

fn try_acquire(source_ip: &str) -> Result<SessionGuard, SessionError> {
    let mut state = SESSION_STATE.write().unwrap_or_else(|e| e.into_inner());
    if let Some(active) = &state.active_source {
        debug!(%active, "a discovery session is already running, rejecting start");
        return Err(SessionError::Busy);
    }
    state.active_source = Some(source_ip.to_string());
    Ok(SessionGuard)
}

fn remember(report: &NatReport) {
    let mut state = SESSION_STATE.write().unwrap_or_else(|e| e.into_inner());
    state.last = Some(report.clone());
}

/// Returns the report of the most recently finished session
pub fn last_report() -> Option<NatReport> {
    let state = SESSION_STATE.read().unwrap_or_else(|e| e.into_inner());
    state.last.clone()
}

/// Runs one NAT discovery session
///
/// A second call while one session is running is rejected with
/// `SessionError::Busy`. Cancelling through `cancel` aborts the run and
/// releases the probe socket. Internal failures never surface as errors
/// here; they fold into an `Unknown` report carrying the fault.
pub async fn run_test(
    config: &ProbeConfig,
    source_ip: &str,
    stun_host: Option<&str>,
    cancel: CancellationToken,
) -> Result<NatReport, SessionError> {
    let _guard = try_acquire(source_ip)?;
    let started = Instant::now();
    info!(%source_ip, "starting nat discovery session");

    let outcome = tokio::select! {
        _ = cancel.cancelled() => {
            info!("discovery session cancelled");
            return Err(SessionError::Cancelled);
        }
        outcome = discover(config, source_ip, stun_host) => outcome,
    };

    let report = match outcome {
        Ok(classification) => NatReport::from_classification(classification, started.elapsed()),
        Err(err) => {
            error!(error = %err, "discovery failed, reporting Unknown");
            NatReport::fault(err.to_string(), started.elapsed())
        }
    };

    info!(verdict = %report.verdict, elapsed = ?report.elapsed, "session finished");
    remember(&report);
    Ok(report)
}

/// Binds the socket, resolves servers and runs the discovery flow
async fn discover(
    config: &ProbeConfig,
    source_ip: &str,
    stun_host: Option<&str>,
) -> crate::Result<Classification> {
    let source: IpAddr = source_ip
        .parse()
        .map_err(|_| format!("invalid source address {:?}", source_ip))?;
    let socket = bind_probe_socket(SocketAddr::new(source, config.source_port))?;
    let local = effective_local(&socket)?;
    info!(%local, "probe socket bound");
    if let IpAddr::V4(ip) = local.ip() {
        if netif::is_cgnat(ip) {
            warn!(
                source = %ip,
                "source address is in the carrier-grade nat range 100.64.0.0/10, the isp applies another translation layer"
            );
        }
    }

    let servers = resolve_servers(config, stun_host).await;
    let client = StunClient::new(Arc::new(socket))
        .with_attempts(config.attempts)
        .with_timeout(Duration::from_millis(config.timeout_ms));
    classify(&client, local, &servers).await
}

/// Binds the probe socket with address reuse, so back-to-back sessions
/// can keep the same fixed source port
fn bind_probe_socket(source: SocketAddr) -> crate::Result<tokio::net::UdpSocket> {
    let domain = if source.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&source.into())?;
    socket.set_nonblocking(true)?;
    let socket = tokio::net::UdpSocket::from_std(socket.into())?;
    Ok(socket)
}

/// Local address used for the mapped-vs-local comparison
///
/// A wildcard bind reveals nothing to compare against, so the routed
/// outbound address stands in for it. When no route exists the wildcard
/// is kept; the flow then cannot mistake the host for unmapped.
fn effective_local(socket: &tokio::net::UdpSocket) -> crate::Result<SocketAddr> {
    let local = socket.local_addr()?;
    if !local.ip().is_unspecified() {
        return Ok(local);
    }
    match netif::default_outbound_ip() {
        Ok(ip) => Ok(SocketAddr::new(ip, local.port())),
        Err(err) => {
            debug!(error = %err, "keeping wildcard local address");
            Ok(local)
        }
    }
}

/// Resolves the configured endpoints, skipping the ones DNS cannot serve
async fn resolve_servers(config: &ProbeConfig, stun_host: Option<&str>) -> Vec<ResolvedServer> {
    let mut servers = Vec::new();
    for endpoint in config.endpoints(stun_host) {
        match resolve(&endpoint).await {
            Ok(addr) => {
                debug!(server = %endpoint, %addr, "resolved stun server");
                servers.push(ResolvedServer {
                    name: endpoint,
                    addr,
                });
            }
            Err(err) => warn!(server = %endpoint, error = %err, "skipping unresolvable server"),
        }
    }
    servers
}
