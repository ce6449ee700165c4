//! Capability traits for the tunnel device and its network interface.
//!
//! The daemon core only talks to these traits; the platform-specific
//! control paths live behind them. A peer install is an upsert — adding a
//! key that is already configured updates its endpoint and allowed IPs.

use std::net::{Ipv6Addr, SocketAddr};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use piko_core::WgKey;

/// Keepalive configured on every peer, punching a hole through NATs often
/// enough to keep the mapping alive.
pub const PERSISTENT_KEEPALIVE: Duration = Duration::from_secs(20);

/// One WireGuard peer as the actuator installs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSpec {
    pub public_key: WgKey,

    /// The peer's overlay address; allowed IPs become `<addr>/128`.
    pub allowed_ip: Ipv6Addr,

    /// Wire endpoint, when one is known. Without one, WireGuard waits for
    /// the peer to reach us first.
    pub endpoint: Option<SocketAddr>,
}

/// Control surface of the WireGuard device itself.
#[async_trait]
pub trait TunnelDevice: Send + Sync {
    /// Set the device private key.
    async fn set_key(&self, key: &WgKey) -> Result<()>;

    /// Set the UDP port WireGuard listens on.
    async fn set_listen_port(&self, port: u16) -> Result<()>;

    /// Add a peer, or update it if the key is already configured.
    async fn add_peer(&self, peer: &PeerSpec) -> Result<()>;

    /// Remove a peer by public key. Removing an unknown key is not an
    /// error.
    async fn remove_peer(&self, key: &WgKey) -> Result<()>;

    /// Release the device handle.
    async fn close(&self) -> Result<()>;
}

/// Control surface of the network interface carrying the tunnel.
#[async_trait]
pub trait Interface: Send + Sync {
    /// Bring the interface up or down.
    async fn set_up(&self, up: bool) -> Result<()>;

    /// Assign the overlay address.
    async fn set_addr(&self, addr: Ipv6Addr) -> Result<()>;

    /// Route `dst/128` over the interface.
    async fn add_route(&self, dst: Ipv6Addr) -> Result<()>;

    /// Drop the route for `dst/128`.
    async fn delete_route(&self, dst: Ipv6Addr) -> Result<()>;

    /// Delete the interface.
    async fn delete(&self) -> Result<()>;
}
