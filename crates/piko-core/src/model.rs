//! Rendezvous data model — devices and networks as the server reports them.
//!
//! A `Network` owns its device list; a `Device` carries only its own
//! attributes. The membership view (which devices share a network with us)
//! is reconstructed by the engine, so there is no device→network back
//! reference here.

use std::net::{Ipv6Addr, SocketAddr};

use serde::{Deserialize, Serialize};

/// A node known to the rendezvous server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: i64,

    #[serde(default)]
    pub owner: i64,

    #[serde(default)]
    pub name: String,

    /// Base64 WireGuard public key.
    #[serde(rename = "key")]
    pub public_key: String,

    /// Overlay IPv6 address in fd00::/32, routable only inside the mesh.
    #[serde(default)]
    pub ip: String,

    /// Wire endpoint `host:port`, when the rendezvous knows one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl Device {
    /// The overlay address, if the server sent a parseable one.
    pub fn overlay_ip(&self) -> Option<Ipv6Addr> {
        self.ip.parse().ok()
    }

    /// The wire endpoint, if present and parseable.
    pub fn wire_endpoint(&self) -> Option<SocketAddr> {
        self.endpoint.as_deref()?.parse().ok()
    }
}

/// A named bag of devices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub id: i64,

    #[serde(default)]
    pub owner: i64,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub devices: Vec<Device>,
}

impl Network {
    pub fn contains(&self, device_id: i64) -> bool {
        self.devices.iter().any(|d| d.id == device_id)
    }

    /// Append `device` unless a device with the same id is already listed.
    pub fn push_device(&mut self, device: Device) {
        if !self.contains(device.id) {
            self.devices.push(device);
        }
    }

    pub fn remove_device(&mut self, device_id: i64) {
        self.devices.retain(|d| d.id != device_id);
    }
}
