//! Tunnel actuator — keeps the WireGuard device in line with the engine.
//!
//! The actuator owns a shadow copy of the last peer set it applied. On
//! every engine event it diffs the engine's peers against that shadow by
//! device id and issues exactly the peer removals and additions of the
//! symmetric difference, plus the matching route changes. Its mutex is the
//! serialization point shared with the discovery side path; the last
//! writer wins and the next engine event converges the result.

mod device;
mod linux;

pub use device::{Interface, PeerSpec, TunnelDevice};
pub use linux::LinuxTunnel;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::Mutex;

use piko_core::{Device, WgKey};

use crate::discovery::DiscoveryCache;

pub struct TunnelActuator {
    device: Arc<dyn TunnelDevice>,
    iface: Arc<dyn Interface>,

    /// Discovery observations; a fresh entry beats the rendezvous-reported
    /// endpoint, which is usually unreachable from the same LAN.
    hints: DiscoveryCache,

    last_peers: Mutex<Vec<Device>>,
}

impl TunnelActuator {
    pub fn new(
        device: Arc<dyn TunnelDevice>,
        iface: Arc<dyn Interface>,
        hints: DiscoveryCache,
    ) -> Arc<Self> {
        Arc::new(Self {
            device,
            iface,
            hints,
            last_peers: Mutex::new(Vec::new()),
        })
    }

    /// Converge the device onto `peers`.
    pub async fn sync(&self, peers: &[Device]) {
        let mut last = self.last_peers.lock().await;

        for old in last.iter() {
            if peers.iter().any(|p| p.id == old.id) {
                continue;
            }
            self.uninstall(old).await;
        }

        for new in peers {
            if last.iter().any(|p| p.id == new.id) {
                continue;
            }
            self.install(new, None).await;
        }

        *last = peers.to_vec();
    }

    /// Re-apply a peer whose attributes changed (typically the endpoint).
    /// A device we are not currently peered with is ignored — the join
    /// event is what introduces peers.
    pub async fn handle_update(&self, dev: &Device) {
        let mut last = self.last_peers.lock().await;

        let Some(existing) = last.iter_mut().find(|p| p.id == dev.id) else {
            return;
        };

        self.install(dev, None).await;
        *existing = dev.clone();
    }

    /// Discovery side path: install `dev` with an endpoint observed on the
    /// local link, bypassing whatever the rendezvous reported.
    pub async fn install_peer(&self, dev: &Device, endpoint: SocketAddr) {
        let _last = self.last_peers.lock().await;
        self.install(dev, Some(endpoint)).await;
    }

    async fn install(&self, dev: &Device, endpoint_override: Option<SocketAddr>) {
        let key = match WgKey::from_base64(&dev.public_key) {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(device = dev.id, error = %e, "peer has a bad public key");
                return;
            }
        };

        let Some(allowed_ip) = dev.overlay_ip() else {
            tracing::warn!(device = dev.id, ip = %dev.ip, "peer has no usable overlay address");
            return;
        };

        let endpoint = endpoint_override
            .or_else(|| self.hints.hint(&dev.public_key))
            .or_else(|| dev.wire_endpoint());

        tracing::info!(device = dev.id, ip = %allowed_ip, ?endpoint, "adding peer");

        let spec = PeerSpec {
            public_key: key,
            allowed_ip,
            endpoint,
        };
        if let Err(e) = self.device.add_peer(&spec).await {
            tracing::warn!(device = dev.id, error = %e, "failed to add peer");
        }
        if let Err(e) = self.iface.add_route(allowed_ip).await {
            tracing::warn!(device = dev.id, error = %e, "failed to add route");
        }
    }

    async fn uninstall(&self, dev: &Device) {
        let key = match WgKey::from_base64(&dev.public_key) {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(device = dev.id, error = %e, "peer has a bad public key");
                return;
            }
        };

        tracing::info!(device = dev.id, ip = %dev.ip, "removing peer");

        if let Err(e) = self.device.remove_peer(&key).await {
            tracing::warn!(device = dev.id, error = %e, "failed to remove peer");
        }
        if let Some(ip) = dev.overlay_ip() {
            if let Err(e) = self.iface.delete_route(ip).await {
                tracing::warn!(device = dev.id, error = %e, "failed to delete route");
            }
        }
    }
}
