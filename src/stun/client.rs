//! Retrying STUN binding exchange over a shared UDP socket
//!
//! All probes of one classification run go through the same socket so the
//! NAT keeps one external mapping for the whole run; the client only
//! borrows the socket per exchange. Responses are matched by transaction
//! ID, so late answers from earlier attempts and unrelated datagrams on
//! the shared socket are discarded instead of corrupting a probe.

use crate::stun::message::{BindingReply, BindingRequest, Message, TxnId};
use crate::stun::parser::Parser;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

/// Receive buffer size for one STUN datagram
const RECV_BUFFER_SIZE: usize = 2048;

/// SOFTWARE attribute value sent with every request
const SOFTWARE_TAG: &str = concat!("natprobe/", env!("CARGO_PKG_VERSION"));

/// Default number of attempts per probe
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Default deadline for the first attempt; it doubles on every retry
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

/// Outcome of one binding exchange
///
/// `reply: None` means the server never answered within the retry budget;
/// the classifier folds that into its decision logic instead of treating
/// it as an error.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    /// Server the exchange targeted
    pub server: SocketAddr,

    /// Local address of the socket the exchange used
    pub local: SocketAddr,

    /// Decoded response, when one arrived in time
    pub reply: Option<BindingReply>,

    /// Time from the first send until the response (or until giving up)
    pub rtt: Duration,
}

impl ProbeResult {
    pub fn responded(&self) -> bool {
        self.reply.is_some()
    }
}

/// Seam between the classifier and the network
///
/// The classifier only ever talks to this trait, so tests can drive the
/// full decision table with scripted outcomes and no sockets.
#[async_trait]
pub trait BindingProber: Send + Sync {
    /// Runs one binding exchange against `server`, optionally asking the
    /// server to answer from a different IP and/or port
    async fn probe(
        &self,
        server: SocketAddr,
        change_ip: bool,
        change_port: bool,
    ) -> crate::Result<ProbeResult>;
}

/// STUN client driving binding exchanges over one shared socket
pub struct StunClient {
    socket: Arc<UdpSocket>,
    attempts: u32,
    timeout: Duration,
}

impl StunClient {
    /// Creates a client with the default retry budget
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        StunClient {
            socket,
            attempts: DEFAULT_ATTEMPTS,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Sets the per-probe attempt cap
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// Sets the deadline of the first attempt (doubles per retry)
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Reads datagrams until a response matching `txn_id` arrives or the
    /// deadline passes, discarding everything else
    async fn await_reply(
        &self,
        txn_id: &TxnId,
        deadline: Duration,
    ) -> crate::Result<Option<BindingReply>> {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let until = Instant::now() + deadline;
        loop {
            let remaining = until.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match tokio::time::timeout(remaining, self.socket.recv_from(&mut buf)).await {
                Err(_) => return Ok(None),
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok((len, from))) => match Parser::unmarshal(&buf[..len]) {
                    Ok(Message::Reply(reply)) if reply.txn_id == *txn_id => {
                        return Ok(Some(reply));
                    }
                    Ok(msg) => {
                        tracing::trace!("discarding {} from {}", msg, from);
                    }
                    Err(e) => {
                        tracing::trace!("discarding undecodable datagram from {}: {}", from, e);
                    }
                },
            }
        }
    }
}

#[async_trait]
impl BindingProber for StunClient {
    async fn probe(
        &self,
        server: SocketAddr,
        change_ip: bool,
        change_port: bool,
    ) -> crate::Result<ProbeResult> {
        let local = self.socket.local_addr()?;
        let started = Instant::now();
        let mut deadline = self.timeout;

        for attempt in 1..=self.attempts {
            // A fresh transaction ID per attempt keeps answers to earlier
            // sends from being mistaken for this one.
            let txn_id: TxnId = rand::random();
            let mut request = BindingRequest::new(txn_id);
            request.change_ip = change_ip;
            request.change_port = change_port;
            request.software = Some(SOFTWARE_TAG.to_string());
            let datagram = Parser::marshal(&Message::Request(request));

            self.socket.send_to(&datagram, server).await?;
            tracing::debug!(
                "sendto: {} (attempt {}/{}, change ip: {}, change port: {})",
                server,
                attempt,
                self.attempts,
                change_ip,
                change_port
            );

            match self.await_reply(&txn_id, deadline).await {
                Ok(Some(reply)) => {
                    let rtt = started.elapsed();
                    tracing::debug!("recvfrom: {} answered in {:?}", server, rtt);
                    return Ok(ProbeResult {
                        server,
                        local,
                        reply: Some(reply),
                        rtt,
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("receive failed while waiting on {}: {}", server, e);
                }
            }
            deadline *= 2;
        }

        tracing::debug!("no answer from {} after {} attempts", server, self.attempts);
        Ok(ProbeResult {
            server,
            local,
            reply: None,
            rtt: started.elapsed(),
        })
    }
}

/// Resolves a `host:port` server string, preferring IPv4 addresses since
/// the classification semantics are IPv4
pub async fn resolve(server: &str) -> crate::Result<SocketAddr> {
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(server).await?.collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| format!("no addresses resolved for {}", server).into())
}
