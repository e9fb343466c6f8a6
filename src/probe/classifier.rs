//! Classic four-probe NAT discovery flow
//!
//! The flow walks the configured server list until one answers a plain
//! binding request, then narrows the verdict with up to three more
//! probes:
//!
//! 1. Plain binding request. The mapped address it returns, compared
//!    against the local socket address, decides whether any translation
//!    is happening at all.
//! 2. Binding request asking the server to answer from its alternate IP
//!    and port. Only an unfiltered path or a full cone mapping lets that
//!    response through.
//! 3. Plain binding request to a second server endpoint. A different
//!    mapped address here means the NAT allocates per destination.
//! 4. Binding request to the alternate IP on the original port, asking
//!    for a port change in the answer. Distinguishes address-restricted
//!    from port-restricted filtering.
//!
//! The flow never guesses: when it cannot finish a stage with a
//! comparable result it degrades to `Unknown` instead of picking the
//! more likely verdict.

use crate::probe::{Classification, NatType, ResolvedServer};
use crate::stun::{BindingProber, BindingReply};
use std::net::SocketAddr;
use tracing::{debug, info, warn};

/// Runs the discovery flow and derives a verdict
///
/// `local` is the address the probe socket is bound to, with the real
/// outbound IP substituted when the bind was to a wildcard. The first
/// server that answers anchors the rest of the flow; if none does the
/// verdict is `Blocked`.
pub async fn classify<P: BindingProber>(
    prober: &P,
    local: SocketAddr,
    servers: &[ResolvedServer],
) -> crate::Result<Classification> {
    let Some((anchor, first)) = select_anchor(prober, servers).await else {
        info!("no stun server answered, reporting Blocked");
        return Ok(Classification::blocked());
    };

    let Some(mapped) = first.reflexive() else {
        warn!(server = %anchor.name, "binding reply carried no usable mapped address");
        return Ok(Classification::unknown(None, Some(anchor.name.clone())));
    };

    debug!(server = %anchor.name, %mapped, %local, "anchored discovery flow");

    let verdict = if mapped == local {
        // No translation observed. A change-both probe tells filtering
        // apart from a truly open path.
        if prober.probe(anchor.addr, true, true).await?.responded() {
            NatType::OpenInternet
        } else {
            NatType::SymmetricUDPFirewall
        }
    } else {
        classify_behind_nat(prober, anchor, servers, mapped, &first).await?
    };

    info!(%verdict, %mapped, server = %anchor.name, "discovery flow finished");
    Ok(Classification {
        verdict,
        reflexive: Some(mapped),
        server: Some(anchor.name.clone()),
    })
}

/// Continues the flow once translation has been established
async fn classify_behind_nat<P: BindingProber>(
    prober: &P,
    anchor: &ResolvedServer,
    servers: &[ResolvedServer],
    mapped: SocketAddr,
    first: &BindingReply,
) -> crate::Result<NatType> {
    // Probe 2: only a full cone mapping passes a response sent from an
    // address the host never contacted.
    if prober.probe(anchor.addr, true, true).await?.responded() {
        return Ok(NatType::FullCone);
    }

    let Some(alternate) = alternate_endpoint(first, anchor, servers) else {
        warn!(server = %anchor.name, "no alternate endpoint available to continue the flow");
        return Ok(NatType::Unknown);
    };

    // Probe 3: a mapping that changes across destinations is symmetric,
    // and nothing further can be learned about its filtering here.
    let third = prober.probe(alternate, false, false).await?;
    let Some(remapped) = third.reply.as_ref().and_then(BindingReply::reflexive) else {
        debug!(%alternate, "alternate endpoint did not answer");
        return Ok(NatType::Unknown);
    };

    if remapped != mapped {
        debug!(%mapped, %remapped, "mapping differs across destinations");
        return Ok(NatType::Symmetric);
    }

    // Probe 4: same alternate IP, original port, change-port answer. An
    // address-restricted cone accepts it, a port-restricted cone drops it.
    let probe4 = SocketAddr::new(alternate.ip(), anchor.addr.port());
    if prober.probe(probe4, false, true).await?.responded() {
        Ok(NatType::RestrictedCone)
    } else {
        Ok(NatType::PortRestrictedCone)
    }
}

/// Walks the server list until one answers a plain binding request
///
/// Send failures count as silence here; a host with no route to one
/// server may still reach the next.
async fn select_anchor<'a, P: BindingProber>(
    prober: &P,
    servers: &'a [ResolvedServer],
) -> Option<(&'a ResolvedServer, BindingReply)> {
    for server in servers {
        match prober.probe(server.addr, false, false).await {
            Ok(result) => {
                if let Some(reply) = result.reply {
                    debug!(server = %server.name, rtt = ?result.rtt, "server answered");
                    return Some((server, reply));
                }
                debug!(server = %server.name, "server did not answer");
            }
            Err(err) => warn!(server = %server.name, error = %err, "probe failed"),
        }
    }
    None
}

/// Picks the endpoint for the third probe
///
/// Prefers the alternate address the anchor advertised; a missing or
/// degenerate value falls back to the next configured server with a
/// distinct address.
fn alternate_endpoint(
    first: &BindingReply,
    anchor: &ResolvedServer,
    servers: &[ResolvedServer],
) -> Option<SocketAddr> {
    if let Some(advertised) = first.alternate {
        let degenerate = advertised.ip().is_unspecified()
            || advertised.port() == 0
            || advertised == anchor.addr;
        if !degenerate {
            return Some(advertised);
        }
        debug!(%advertised, "ignoring degenerate alternate address");
    }
    let fallback = servers.iter().find(|s| s.addr != anchor.addr)?;
    debug!(server = %fallback.name, "falling back to another configured server");
    Some(fallback.addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stun::ProbeResult;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Prober with a fixed answer per (target, change flags) triple;
    /// anything not scripted stays silent
    struct ScriptedProber {
        replies: HashMap<(SocketAddr, bool, bool), BindingReply>,
        failing: HashSet<SocketAddr>,
        calls: Mutex<Vec<(SocketAddr, bool, bool)>>,
    }

    impl ScriptedProber {
        fn new() -> Self {
            ScriptedProber {
                replies: HashMap::new(),
                failing: HashSet::new(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn answer(
            mut self,
            target: SocketAddr,
            change_ip: bool,
            change_port: bool,
            mapped: SocketAddr,
            alternate: Option<SocketAddr>,
        ) -> Self {
            let reply = BindingReply {
                xor_mapped: Some(mapped),
                alternate,
                ..Default::default()
            };
            self.replies.insert((target, change_ip, change_port), reply);
            self
        }

        fn fail(mut self, target: SocketAddr) -> Self {
            self.failing.insert(target);
            self
        }

        fn calls(&self) -> Vec<(SocketAddr, bool, bool)> {
            self.calls.lock().expect("calls lock").clone()
        }
    }

    #[async_trait]
    impl BindingProber for ScriptedProber {
        async fn probe(
            &self,
            server: SocketAddr,
            change_ip: bool,
            change_port: bool,
        ) -> crate::Result<ProbeResult> {
            self.calls
                .lock()
                .expect("calls lock")
                .push((server, change_ip, change_port));
            if self.failing.contains(&server) {
                return Err("sendto: network is unreachable".into());
            }
            Ok(ProbeResult {
                server,
                local: local_addr(),
                reply: self.replies.get(&(server, change_ip, change_port)).cloned(),
                rtt: Duration::from_millis(1),
            })
        }
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().expect("test address")
    }

    fn local_addr() -> SocketAddr {
        addr("192.168.1.2:54320")
    }

    fn primary() -> ResolvedServer {
        ResolvedServer {
            name: "stun.example.net:3478".to_string(),
            addr: addr("203.0.113.1:3478"),
        }
    }

    fn secondary() -> ResolvedServer {
        ResolvedServer {
            name: "stun.backup.example:3478".to_string(),
            addr: addr("203.0.113.9:3478"),
        }
    }

    fn alternate() -> SocketAddr {
        addr("203.0.113.2:3479")
    }

    fn public_mapped() -> SocketAddr {
        addr("198.51.100.7:41641")
    }

    async fn run(prober: &ScriptedProber, servers: &[ResolvedServer]) -> Classification {
        classify(prober, local_addr(), servers)
            .await
            .expect("classification")
    }

    #[tokio::test]
    async fn blocked_when_nothing_answers() {
        let prober = ScriptedProber::new();
        let outcome = run(&prober, &[primary(), secondary()]).await;

        assert_eq!(outcome.verdict, NatType::Blocked);
        assert!(outcome.reflexive.is_none());
        assert!(outcome.server.is_none());
    }

    #[tokio::test]
    async fn open_internet_when_unmapped_and_change_both_answers() {
        let prober = ScriptedProber::new()
            .answer(primary().addr, false, false, local_addr(), Some(alternate()))
            .answer(primary().addr, true, true, local_addr(), None);
        let outcome = run(&prober, &[primary()]).await;

        assert_eq!(outcome.verdict, NatType::OpenInternet);
        assert_eq!(outcome.reflexive, Some(local_addr()));
    }

    #[tokio::test]
    async fn firewall_when_unmapped_but_change_both_is_filtered() {
        let prober = ScriptedProber::new().answer(
            primary().addr,
            false,
            false,
            local_addr(),
            Some(alternate()),
        );
        let outcome = run(&prober, &[primary()]).await;

        assert_eq!(outcome.verdict, NatType::SymmetricUDPFirewall);
    }

    #[tokio::test]
    async fn full_cone_when_change_both_passes_the_nat() {
        let prober = ScriptedProber::new()
            .answer(primary().addr, false, false, public_mapped(), Some(alternate()))
            .answer(primary().addr, true, true, public_mapped(), None);
        let outcome = run(&prober, &[primary()]).await;

        assert_eq!(outcome.verdict, NatType::FullCone);
        assert_eq!(outcome.reflexive, Some(public_mapped()));
        assert_eq!(outcome.server.as_deref(), Some("stun.example.net:3478"));
    }

    #[tokio::test]
    async fn restricted_cone_when_changed_port_still_arrives() {
        let probe4 = addr("203.0.113.2:3478");
        let prober = ScriptedProber::new()
            .answer(primary().addr, false, false, public_mapped(), Some(alternate()))
            .answer(alternate(), false, false, public_mapped(), None)
            .answer(probe4, false, true, public_mapped(), None);
        let outcome = run(&prober, &[primary()]).await;

        assert_eq!(outcome.verdict, NatType::RestrictedCone);
        // The last probe targets the alternate IP on the original port.
        let calls = prober.calls();
        assert_eq!(calls.last(), Some(&(probe4, false, true)));
    }

    #[tokio::test]
    async fn port_restricted_cone_when_changed_port_is_filtered() {
        let prober = ScriptedProber::new()
            .answer(primary().addr, false, false, public_mapped(), Some(alternate()))
            .answer(alternate(), false, false, public_mapped(), None);
        let outcome = run(&prober, &[primary()]).await;

        assert_eq!(outcome.verdict, NatType::PortRestrictedCone);
    }

    #[tokio::test]
    async fn symmetric_when_second_destination_sees_a_new_mapping() {
        let prober = ScriptedProber::new()
            .answer(primary().addr, false, false, public_mapped(), Some(alternate()))
            .answer(alternate(), false, false, addr("198.51.100.7:41999"), None);
        let outcome = run(&prober, &[primary()]).await;

        assert_eq!(outcome.verdict, NatType::Symmetric);
        assert_eq!(outcome.reflexive, Some(public_mapped()));
        // Symmetric is decided on the third probe, nothing follows it.
        assert_eq!(prober.calls().len(), 3);
    }

    #[tokio::test]
    async fn unknown_when_alternate_endpoint_is_silent() {
        let prober = ScriptedProber::new().answer(
            primary().addr,
            false,
            false,
            public_mapped(),
            Some(alternate()),
        );
        let outcome = run(&prober, &[primary()]).await;

        assert_eq!(outcome.verdict, NatType::Unknown);
        assert_eq!(outcome.reflexive, Some(public_mapped()));
    }

    #[tokio::test]
    async fn unknown_when_no_alternate_exists_at_all() {
        let prober =
            ScriptedProber::new().answer(primary().addr, false, false, public_mapped(), None);
        let outcome = run(&prober, &[primary()]).await;

        assert_eq!(outcome.verdict, NatType::Unknown);
    }

    #[tokio::test]
    async fn unknown_when_reply_has_no_mapped_address() {
        let mut prober = ScriptedProber::new();
        prober
            .replies
            .insert((primary().addr, false, false), BindingReply::default());
        let outcome = run(&prober, &[primary()]).await;

        assert_eq!(outcome.verdict, NatType::Unknown);
        assert!(outcome.reflexive.is_none());
        assert_eq!(outcome.server.as_deref(), Some("stun.example.net:3478"));
    }

    #[tokio::test]
    async fn missing_alternate_falls_back_to_second_server() {
        let prober = ScriptedProber::new()
            .answer(primary().addr, false, false, public_mapped(), None)
            .answer(secondary().addr, false, false, addr("198.51.100.7:42000"), None);
        let outcome = run(&prober, &[primary(), secondary()]).await;

        assert_eq!(outcome.verdict, NatType::Symmetric);
    }

    #[tokio::test]
    async fn degenerate_alternate_falls_back_to_second_server() {
        let probe4 = addr("203.0.113.9:3478");
        let prober = ScriptedProber::new()
            .answer(primary().addr, false, false, public_mapped(), Some(primary().addr))
            .answer(secondary().addr, false, false, public_mapped(), None)
            .answer(probe4, false, true, public_mapped(), None);
        let outcome = run(&prober, &[primary(), secondary()]).await;

        assert_eq!(outcome.verdict, NatType::RestrictedCone);
    }

    #[tokio::test]
    async fn anchor_walk_skips_unresponsive_and_failing_servers() {
        let third = ResolvedServer {
            name: "stun.third.example:3478".to_string(),
            addr: addr("203.0.113.20:3478"),
        };
        let prober = ScriptedProber::new()
            .fail(primary().addr)
            .answer(third.addr, false, false, local_addr(), None)
            .answer(third.addr, true, true, local_addr(), None);
        let outcome = run(&prober, &[primary(), secondary(), third.clone()]).await;

        assert_eq!(outcome.verdict, NatType::OpenInternet);
        assert_eq!(outcome.server.as_deref(), Some("stun.third.example:3478"));
    }

    #[tokio::test]
    async fn verdict_is_stable_across_runs() {
        let prober = ScriptedProber::new()
            .answer(primary().addr, false, false, public_mapped(), Some(alternate()))
            .answer(alternate(), false, false, public_mapped(), None);

        let first = run(&prober, &[primary()]).await;
        let second = run(&prober, &[primary()]).await;

        assert_eq!(first.verdict, NatType::PortRestrictedCone);
        assert_eq!(first.verdict, second.verdict);
        assert_eq!(first.reflexive, second.reflexive);
    }
}
