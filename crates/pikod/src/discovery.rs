//! Local-link peer discovery.
//!
//! Joins the discovery multicast group on every suitable interface and
//! listens for Hello datagrams from nearby nodes. A Hello is answered with
//! exactly one HelloReply; a HelloReply is never answered. A spontaneous
//! Hello goes out once a minute, with the timer pushed back by every Hello
//! sent through any path, damping amplification on busy links.
//!
//! Every valid observation lands in the [`DiscoveryCache`]. When the
//! observed key belongs to a peer the engine already knows, the peer is
//! installed into WireGuard with the locally observed endpoint, bypassing
//! the rendezvous-reported one — that endpoint is usually not reachable
//! from inside the same LAN.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashMap;
use nix::net::if_::InterfaceFlags;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use piko_core::wire::{
    decode_hello, encode_hello, WireError, DISCOVERY_GROUP, DISCOVERY_PORT,
};
use piko_engine::Engine;

use crate::tunnel::TunnelActuator;

/// How long a discovery observation stays usable as an endpoint hint.
const GRACE_WINDOW: Duration = Duration::from_secs(120);

/// Cadence of spontaneous Hello messages.
const HELLO_INTERVAL: Duration = Duration::from_secs(60);

/// Maximum discovery datagram we will read.
const MAX_DATAGRAM: usize = 512;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub last_seen: Instant,
    pub endpoint: SocketAddr,
}

/// Observations from the local link, keyed by base64 public key.
#[derive(Clone, Default)]
pub struct DiscoveryCache(Arc<DashMap<String, CacheEntry>>);

impl DiscoveryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, key: String, endpoint: SocketAddr) {
        self.0.insert(
            key,
            CacheEntry {
                last_seen: Instant::now(),
                endpoint,
            },
        );
    }

    /// The observed endpoint for `key`, if seen within the grace window.
    pub fn hint(&self, key: &str) -> Option<SocketAddr> {
        let entry = self.0.get(key)?;
        (entry.last_seen.elapsed() <= GRACE_WINDOW).then_some(entry.endpoint)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Deadline for the next spontaneous Hello. Every sent Hello, spontaneous
/// or not, pushes it a full interval out.
struct HelloTimer(StdMutex<Instant>);

impl HelloTimer {
    fn new() -> Self {
        Self(StdMutex::new(Instant::now() + HELLO_INTERVAL))
    }

    fn reset(&self) {
        *self.0.lock().unwrap() = Instant::now() + HELLO_INTERVAL;
    }

    fn deadline(&self) -> Instant {
        *self.0.lock().unwrap()
    }

    fn due(&self) -> bool {
        Instant::now() >= self.deadline()
    }
}

/// The discovery listener.
pub struct Discovery {
    listener: UdpSocket,
    sender: StdMutex<Socket>,
    interfaces: Vec<Ipv4Addr>,

    cache: DiscoveryCache,
    local_key: String,
    listen_port: u16,

    timer: HelloTimer,
    ready_tx: watch::Sender<bool>,
}

impl Discovery {
    /// Bind the discovery sockets and join the multicast group on every
    /// suitable interface.
    pub fn new(local_key: String, listen_port: u16, cache: DiscoveryCache) -> Result<Arc<Self>> {
        let interfaces = multicast_interfaces();
        if interfaces.is_empty() {
            tracing::warn!("no multicast-capable interfaces found");
        }

        let listener = bind_listener()?;
        for iface in &interfaces {
            if let Err(e) = listener.join_multicast_v4(DISCOVERY_GROUP, *iface) {
                tracing::debug!(interface = %iface, error = %e, "multicast join failed, skipping");
            }
        }

        let sender = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .context("failed to create discovery send socket")?;
        // Link-local only, do not route beyond this link.
        sender
            .set_multicast_ttl_v4(1)
            .context("IP_MULTICAST_TTL")?;

        let (ready_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            listener,
            sender: StdMutex::new(sender),
            interfaces,
            cache,
            local_key,
            listen_port,
            timer: HelloTimer::new(),
            ready_tx,
        }))
    }

    /// Fires once the listener is bound, joined, and prepared to send.
    /// Wait for it before sending the first Hello.
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.ready_tx.subscribe()
    }

    /// Send one Hello (or HelloReply) on every selected interface.
    pub fn send_hello(&self, reply: bool) {
        self.timer.reset();

        let packet = encode_hello(self.listen_port, &self.local_key, reply);
        let dest: socket2::SockAddr =
            SocketAddrV4::new(DISCOVERY_GROUP, DISCOVERY_PORT).into();

        let sender = self.sender.lock().unwrap();
        for iface in &self.interfaces {
            if let Err(e) = sender.set_multicast_if_v4(iface) {
                tracing::debug!(interface = %iface, error = %e, "IP_MULTICAST_IF failed");
                continue;
            }
            if let Err(e) = sender.send_to(&packet, &dest) {
                tracing::debug!(interface = %iface, error = %e, "discovery send failed");
            }
        }
    }

    /// Listen for discovery datagrams until cancelled.
    pub async fn run(
        self: Arc<Self>,
        engine: Arc<Engine>,
        tunnel: Arc<TunnelActuator>,
        cancel: CancellationToken,
    ) {
        tracing::info!(
            interfaces = self.interfaces.len(),
            port = DISCOVERY_PORT,
            "discovery listener starting"
        );
        self.ready_tx.send_replace(true);

        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    for iface in &self.interfaces {
                        let _ = self.listener.leave_multicast_v4(DISCOVERY_GROUP, *iface);
                    }
                    tracing::debug!("discovery listener stopping");
                    return;
                }

                _ = tokio::time::sleep_until(self.timer.deadline()) => {
                    // The deadline may have moved while we slept.
                    if self.timer.due() {
                        self.send_hello(false);
                    }
                }

                r = self.listener.recv_from(&mut buf) => {
                    let (len, peer) = match r {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "discovery recv_from failed");
                            continue;
                        }
                    };
                    self.handle_datagram(&buf[..len], peer, &engine, &tunnel).await;
                }
            }
        }
    }

    async fn handle_datagram(
        &self,
        datagram: &[u8],
        peer: SocketAddr,
        engine: &Engine,
        tunnel: &TunnelActuator,
    ) {
        let msg = match decode_hello(datagram) {
            Ok(msg) => msg,
            Err(WireError::UnknownType(t)) => {
                tracing::debug!(kind = t, %peer, "unknown discovery message type");
                return;
            }
            Err(_) => return, // short or foreign datagram, drop silently
        };

        if msg.key == self.local_key {
            return;
        }

        let endpoint = SocketAddr::new(peer.ip(), msg.port);
        tracing::debug!(%peer, port = msg.port, key = %msg.key, reply = msg.reply, "discovered peer");

        self.cache.observe(msg.key.clone(), endpoint);

        if !msg.reply {
            // Replying to a reply would let two nodes flood the link.
            self.send_hello(true);
        }

        // Read the engine first, then write to the tunnel; the two locks
        // are never held together. The decision can go stale, in which
        // case the next engine event corrects the device.
        if let Some(dev) = engine.peer_by_key(&msg.key).await {
            tunnel.install_peer(&dev, endpoint).await;
        }
    }
}

fn bind_listener() -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .context("failed to create discovery socket")?;
    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;

    let bind = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DISCOVERY_PORT);
    socket
        .bind(&bind.into())
        .with_context(|| format!("failed to bind {bind}"))?;

    UdpSocket::from_std(socket.into()).context("failed to convert discovery socket")
}

/// IPv4 interfaces suitable for discovery: up, not loopback, and
/// multicast-capable.
fn multicast_interfaces() -> Vec<Ipv4Addr> {
    let addrs = match nix::ifaddrs::getifaddrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            tracing::warn!(error = %e, "getifaddrs failed");
            return Vec::new();
        }
    };

    let mut out = Vec::new();
    for ifaddr in addrs {
        let flags = ifaddr.flags;
        if !flags.contains(InterfaceFlags::IFF_UP)
            || flags.contains(InterfaceFlags::IFF_LOOPBACK)
            || !flags.contains(InterfaceFlags::IFF_MULTICAST)
        {
            continue;
        }

        let Some(addr) = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()) else {
            continue;
        };

        let ip = addr.ip();
        if !out.contains(&ip) {
            out.push(ip);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn cache_hint_expires_after_grace_window() {
        let cache = DiscoveryCache::new();
        let endpoint: SocketAddr = "192.168.1.42:51820".parse().unwrap();
        assert!(cache.is_empty());

        cache.observe("key9".into(), endpoint);
        assert_eq!(cache.hint("key9"), Some(endpoint));
        assert_eq!(cache.hint("other"), None);

        tokio::time::advance(Duration::from_secs(119)).await;
        assert_eq!(cache.hint("key9"), Some(endpoint));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.hint("key9"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn cache_observation_refreshes_entry() {
        let cache = DiscoveryCache::new();
        let first: SocketAddr = "192.168.1.42:51820".parse().unwrap();
        let second: SocketAddr = "192.168.1.42:51821".parse().unwrap();

        cache.observe("key9".into(), first);
        tokio::time::advance(Duration::from_secs(115)).await;
        cache.observe("key9".into(), second);
        tokio::time::advance(Duration::from_secs(115)).await;

        assert_eq!(cache.hint("key9"), Some(second));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hello_timer_resets_to_a_full_interval() {
        let timer = HelloTimer::new();
        assert!(!timer.due());

        // Just short of firing...
        tokio::time::advance(Duration::from_millis(59_500)).await;
        assert!(!timer.due());

        // ...a Hello goes out through some other path: full minute again.
        timer.reset();
        tokio::time::advance(Duration::from_millis(59_900)).await;
        assert!(!timer.due());

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(timer.due());
    }
}
