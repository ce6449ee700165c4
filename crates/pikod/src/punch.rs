//! NAT endpoint discovery against the punch peer.
//!
//! The punch peer sits in the mesh and replies to any datagram with the
//! sender's externally visible `host:port`. Probing it over the tunnel
//! (the punch peer is installed as a WireGuard peer) tells us the endpoint
//! our NAT maps this node to; that endpoint goes back to the rendezvous as
//! a gateway `Ping` so other nodes can reach us directly.

use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use piko_rendezvous::{Gateway, GatewayMsg};

/// UDP port the punch peer answers on.
pub const PUNCH_PORT: u16 = 8743;

/// Grace after tunnel bring-up before the first probe.
const SETTLE_GRACE: Duration = Duration::from_secs(2);

/// One full probe attempt is bounded by this deadline.
const PROBE_DEADLINE: Duration = Duration::from_secs(30);

/// Datagram resend interval within one probe.
const PROBE_RETRY: Duration = Duration::from_secs(5);

/// Cadence of the overall probe cycle.
const PROBE_CYCLE: Duration = Duration::from_secs(20);

// Zero-length UDP writes fail on Windows; a single zero byte works the
// same on the punch side.
#[cfg(windows)]
const PROBE_PAYLOAD: &[u8] = &[0];
#[cfg(not(windows))]
const PROBE_PAYLOAD: &[u8] = &[];

/// Probe the punch peer every 20 s and report the discovered endpoint
/// through the gateway. Runs until cancelled.
pub async fn run(
    local_ip: Ipv6Addr,
    punch_ip: Ipv6Addr,
    device_id: i64,
    gateway: Arc<Gateway>,
    cancel: CancellationToken,
) {
    let target = SocketAddr::new(punch_ip.into(), PUNCH_PORT);

    // Let the tunnel settle before the first probe.
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(SETTLE_GRACE) => {}
    }

    loop {
        let probe = tokio::select! {
            _ = cancel.cancelled() => return,
            r = probe_endpoint(local_ip, target) => r,
        };

        match probe {
            Ok(endpoint) => {
                tracing::debug!(%endpoint, "endpoint probe succeeded");
                let msg = GatewayMsg::ping(device_id, Some(endpoint));
                if let Err(e) = gateway.send(&msg).await {
                    tracing::warn!(error = %e, "failed to report endpoint");
                }
            }
            Err(e) => tracing::warn!(error = %e, "endpoint probe failed"),
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(PROBE_CYCLE) => {}
        }
    }
}

/// One probe: send datagrams to `target` from `local_ip` until a reply
/// arrives, then strip the trailing byte and return the ASCII endpoint.
pub async fn probe_endpoint(local_ip: Ipv6Addr, target: SocketAddr) -> Result<String> {
    tokio::time::timeout(PROBE_DEADLINE, async {
        let socket = UdpSocket::bind(SocketAddr::new(local_ip.into(), 0))
            .await
            .context("failed to bind probe socket")?;
        socket
            .connect(target)
            .await
            .context("failed to connect probe socket")?;

        socket.send(PROBE_PAYLOAD).await.context("probe send failed")?;

        let mut buf = [0u8; 64];
        loop {
            tokio::select! {
                r = socket.recv(&mut buf) => {
                    let n = r.context("probe recv failed")?;
                    if n == 0 {
                        continue;
                    }
                    // The reply is "host:port" plus one trailing byte.
                    return Ok(String::from_utf8_lossy(&buf[..n - 1]).into_owned());
                }
                _ = tokio::time::sleep(PROBE_RETRY) => {
                    socket.send(PROBE_PAYLOAD).await.context("probe resend failed")?;
                }
            }
        }
    })
    .await
    .context("endpoint probe timed out")?
}
