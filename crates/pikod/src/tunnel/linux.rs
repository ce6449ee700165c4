//! Linux tunnel control via `ip(8)` and `wg(8)`.
//!
//! The interface is created with netlink link type `wireguard` through the
//! `ip` command; device configuration goes through `wg set`. Both tools
//! must be on PATH. Private keys are handed to `wg` through a 0600 temp
//! file, never on the command line.

use std::io::Write;
use std::net::Ipv6Addr;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

use piko_core::WgKey;

use super::device::{Interface, PeerSpec, TunnelDevice, PERSISTENT_KEEPALIVE};

/// A WireGuard interface managed through the system tools.
///
/// Implements both [`TunnelDevice`] and [`Interface`]; on Linux the two
/// capabilities happen to share one underlying object.
#[derive(Debug, Clone)]
pub struct LinuxTunnel {
    name: String,
}

impl LinuxTunnel {
    /// Create the interface, down. An interface left behind by a previous
    /// run is reused.
    pub async fn create(name: &str) -> Result<Self> {
        let output = Command::new("ip")
            .args(["link", "add", name, "type", "wireguard"])
            .output()
            .await
            .context("failed to run ip(8) — is iproute2 installed?")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("File exists") {
                bail!("failed to create interface {name}: {}", stderr.trim());
            }
            tracing::debug!(name, "reusing existing interface");
        }

        Ok(Self {
            name: name.to_string(),
        })
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<()> {
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .with_context(|| format!("failed to run {program}"))?;

        if !output.status.success() {
            bail!(
                "{program} {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    /// Like `run`, but tolerates stderr matching `benign` — used for
    /// add/delete operations that may race a previous run.
    async fn run_tolerant(&self, program: &str, args: &[&str], benign: &str) -> Result<()> {
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .with_context(|| format!("failed to run {program}"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains(benign) {
                bail!("{program} {} failed: {}", args.join(" "), stderr.trim());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TunnelDevice for LinuxTunnel {
    async fn set_key(&self, key: &WgKey) -> Result<()> {
        let mut file = tempfile::Builder::new()
            .prefix("pikonet-key")
            .tempfile()
            .context("failed to create key file")?;
        file.write_all(key.to_base64().as_bytes())
            .context("failed to write key file")?;

        let path = file.path().to_string_lossy().into_owned();
        self.run("wg", &["set", &self.name, "private-key", &path])
            .await
    }

    async fn set_listen_port(&self, port: u16) -> Result<()> {
        self.run("wg", &["set", &self.name, "listen-port", &port.to_string()])
            .await
    }

    async fn add_peer(&self, peer: &PeerSpec) -> Result<()> {
        let key = peer.public_key.to_base64();
        let allowed = format!("{}/128", peer.allowed_ip);
        let keepalive = PERSISTENT_KEEPALIVE.as_secs().to_string();
        let endpoint = peer.endpoint.map(|e| e.to_string());

        let mut args: Vec<&str> = vec![
            "set",
            self.name.as_str(),
            "peer",
            key.as_str(),
            "allowed-ips",
            allowed.as_str(),
            "persistent-keepalive",
            keepalive.as_str(),
        ];
        if let Some(endpoint) = endpoint.as_deref() {
            args.push("endpoint");
            args.push(endpoint);
        }

        self.run("wg", &args).await
    }

    async fn remove_peer(&self, key: &WgKey) -> Result<()> {
        let key = key.to_base64();
        self.run("wg", &["set", &self.name, "peer", &key, "remove"])
            .await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Interface for LinuxTunnel {
    async fn set_up(&self, up: bool) -> Result<()> {
        let state = if up { "up" } else { "down" };
        self.run("ip", &["link", "set", "dev", &self.name, state])
            .await
    }

    async fn set_addr(&self, addr: Ipv6Addr) -> Result<()> {
        let cidr = format!("{addr}/128");
        self.run_tolerant(
            "ip",
            &["-6", "addr", "add", &cidr, "dev", &self.name],
            "File exists",
        )
        .await
    }

    async fn add_route(&self, dst: Ipv6Addr) -> Result<()> {
        let cidr = format!("{dst}/128");
        self.run_tolerant(
            "ip",
            &["-6", "route", "add", &cidr, "dev", &self.name],
            "File exists",
        )
        .await
    }

    async fn delete_route(&self, dst: Ipv6Addr) -> Result<()> {
        let cidr = format!("{dst}/128");
        self.run_tolerant(
            "ip",
            &["-6", "route", "del", &cidr, "dev", &self.name],
            "No such process",
        )
        .await
    }

    async fn delete(&self) -> Result<()> {
        self.run("ip", &["link", "del", "dev", &self.name]).await
    }
}
