//! Naming actuator — the name→overlay-IP table behind the DNS server.
//!
//! On every engine event the table upserts an entry for each device in
//! `peers ∪ {self}` under its own lock. Names are never collected; a
//! renamed or departed device leaves its old entry behind until restart.

use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::sync::{Arc, Mutex};

use piko_core::Device;
use piko_dns::Resolver;

/// Map a device name onto a DNS-safe label: lowercase, with every rune
/// outside `[0-9a-z]` replaced by `-`.
pub fn domainify(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[derive(Default)]
pub struct NameTable {
    entries: Mutex<HashMap<String, Ipv6Addr>>,
}

impl NameTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Upsert entries for every given device.
    pub fn update<'a>(&self, devices: impl IntoIterator<Item = &'a Device>) {
        let mut entries = self.entries.lock().unwrap();
        for dev in devices {
            let Some(ip) = dev.overlay_ip() else {
                tracing::debug!(device = dev.id, ip = %dev.ip, "skipping unnamed or unaddressed device");
                continue;
            };
            entries.insert(domainify(&dev.name), ip);
        }
    }

    pub fn lookup(&self, label: &[u8]) -> Option<Ipv6Addr> {
        let label = std::str::from_utf8(label).ok()?;
        self.entries.lock().unwrap().get(label).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The resolver closure handed to the DNS server. Looks up the last
    /// label before the overlay suffix, so `x.alice.pn.local` resolves
    /// like `alice.pn.local`.
    pub fn resolver(self: &Arc<Self>) -> Resolver {
        let table = self.clone();
        Arc::new(move |rest: &[Vec<u8>]| {
            let last = rest.last()?;
            table.lookup(last)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(name: &str, ip: &str) -> Device {
        Device {
            id: 1,
            name: name.to_string(),
            ip: ip.to_string(),
            ..Device::default()
        }
    }

    #[test]
    fn domainify_maps_names_to_labels() {
        assert_eq!(domainify("alice"), "alice");
        assert_eq!(domainify("Alice's Laptop"), "alice-s-laptop");
        assert_eq!(domainify("node_42"), "node-42");
        assert_eq!(domainify("ÜBER"), "-ber");
    }

    #[test]
    fn update_and_lookup() {
        let table = NameTable::new();
        table.update([device("Alice", "fd00::1")].iter());

        assert_eq!(table.lookup(b"alice"), Some("fd00::1".parse().unwrap()));
        assert_eq!(table.lookup(b"bob"), None);
    }

    #[test]
    fn stale_entries_survive_updates() {
        let table = NameTable::new();
        table.update([device("alice", "fd00::1")].iter());
        table.update([device("bob", "fd00::2")].iter());

        assert_eq!(table.lookup(b"alice"), Some("fd00::1".parse().unwrap()));
        assert_eq!(table.lookup(b"bob"), Some("fd00::2".parse().unwrap()));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn unparseable_address_is_skipped() {
        let table = NameTable::new();
        table.update([device("alice", "")].iter());
        assert!(table.is_empty());
    }

    #[test]
    fn resolver_consults_last_remaining_label() {
        let table = NameTable::new();
        table.update([device("alice", "fd00::1")].iter());
        let resolver = table.resolver();

        let direct = vec![b"alice".to_vec()];
        let nested = vec![b"x".to_vec(), b"alice".to_vec()];
        let empty: Vec<Vec<u8>> = Vec::new();

        assert_eq!(resolver(&direct), Some("fd00::1".parse().unwrap()));
        assert_eq!(resolver(&nested), Some("fd00::1".parse().unwrap()));
        assert_eq!(resolver(&empty), None);
    }
}
