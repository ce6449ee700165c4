//! pikod — pikonet node daemon.
//!
//! Assembles the engine, the gateway channel, the tunnel and naming
//! actuators, local-link discovery, the endpoint prober, and the DNS
//! server, then waits for an interrupt.

use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use piko_core::config::Config;
use piko_core::{Device, KeyPair, Network, WgKey};
use piko_engine::{Engine, MembershipSource};
use piko_rendezvous::{ApiError, Client, Gateway, GatewayKind, GatewayMsg, PunchDetails};

mod discovery;
mod naming;
mod punch;
mod status;
mod tunnel;

use discovery::{Discovery, DiscoveryCache};
use naming::NameTable;
use tunnel::{Interface, LinuxTunnel, PeerSpec, TunnelActuator, TunnelDevice};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut config = Config::load().context("failed to load config file")?;
    if config.ensure_listen_port() {
        config.save().context("failed to save config file")?;
    }

    let cancel = CancellationToken::new();

    // Tunnel interface, created down.
    let tunnel_ctl = Arc::new(
        LinuxTunnel::create(&config.interface_name)
            .await
            .context("failed to create tunnel interface")?,
    );
    let device_ctl: Arc<dyn TunnelDevice> = tunnel_ctl.clone();
    let iface_ctl: Arc<dyn Interface> = tunnel_ctl.clone();

    // Our device, registered with the rendezvous if this is a first run.
    let client = Client::new(&config.rendezvous, &config.token);
    let our_device = ensure_device(&client, &mut config).await?;
    tracing::info!(name = %our_device.name, id = our_device.id, "this device");

    let private_key =
        WgKey::from_base64(&config.private_key).context("malformed private key in config")?;
    device_ctl
        .set_key(&private_key)
        .await
        .context("failed to set device key")?;
    device_ctl
        .set_listen_port(config.listen_port)
        .await
        .context("failed to set listen port")?;
    tracing::info!(
        interface = %config.interface_name,
        listen_port = config.listen_port,
        "wireguard configured"
    );

    match our_device.overlay_ip() {
        Some(ip) => iface_ctl
            .set_addr(ip)
            .await
            .context("failed to assign overlay address")?,
        None => tracing::warn!(ip = %our_device.ip, "rendezvous reported no usable overlay address"),
    }
    iface_ctl
        .set_up(true)
        .await
        .context("failed to bring the tunnel up")?;

    // Engine fed by the gateway channel.
    let source = Arc::new(RendezvousSource {
        client: client.clone(),
    });
    let engine = Arc::new(Engine::new(our_device.clone(), source));

    let gateway = Arc::new(Gateway::new(&config.rendezvous, &config.token)?);
    let (event_tx, event_rx) = mpsc::channel(100);
    {
        let gateway = gateway.clone();
        let cancel = cancel.clone();
        let device_id = our_device.id;
        tokio::spawn(async move { gateway.run(device_id, event_tx, cancel).await });
    }
    tokio::spawn(dispatch(engine.clone(), event_rx, cancel.clone()));

    // Punch peer and the endpoint prober.
    match client.punch_details().await {
        Ok(pd) => {
            if let Err(e) = start_prober(
                &pd,
                &our_device,
                &device_ctl,
                &iface_ctl,
                gateway.clone(),
                cancel.clone(),
            )
            .await
            {
                tracing::warn!(error = %e, "endpoint prober not started");
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "punch details unavailable, endpoint discovery disabled")
        }
    }

    // Local-link discovery.
    let cache = DiscoveryCache::new();
    let actuator = TunnelActuator::new(device_ctl.clone(), iface_ctl.clone(), cache.clone());
    let discovery = Discovery::new(config.public_key.clone(), config.listen_port, cache.clone())
        .context("failed to start discovery")?;
    let mut ready = discovery.ready();
    {
        let discovery = discovery.clone();
        let engine = engine.clone();
        let actuator = actuator.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { discovery.run(engine, actuator, cancel).await });
    }

    // Introduce ourselves once the listener is prepared to send.
    if ready.wait_for(|ready| *ready).await.is_ok() {
        discovery.send_hello(false);
    }

    // Actuators observe the engine from here on.
    let name_table = NameTable::new();
    register_observers(&engine, &actuator, &name_table).await;

    // DNS server.
    let dns_listen: SocketAddr = config
        .dns_listen
        .parse()
        .context("malformed DnsListen address")?;
    let dns_fallback: Option<SocketAddr> = if config.dns_fallback.is_empty() {
        None
    } else {
        Some(
            config
                .dns_fallback
                .parse()
                .context("malformed DnsFallback address")?,
        )
    };
    let dns_socket = tokio::net::UdpSocket::bind(dns_listen)
        .await
        .with_context(|| format!("failed to bind DNS server on {dns_listen}"))?;
    let dns_server = piko_dns::Server::new(dns_fallback, &config.dns_suffix, name_table.resolver());
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = dns_server.run(dns_socket, cancel).await {
                tracing::error!(error = %e, "dns server failed");
            }
        });
    }
    tracing::info!(listen = %dns_listen, suffix = %config.dns_suffix, "dns server started");

    // Optional status endpoint.
    if config.status_port > 0 {
        let state = status::StatusState {
            engine: engine.clone(),
            cache: cache.clone(),
        };
        let port = config.status_port;
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = status::serve(state, port, cancel).await {
                tracing::error!(error = %e, "status endpoint failed");
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for interrupt")?;
    tracing::info!("interrupt received, shutting down");

    cancel.cancel();

    if let Err(e) = iface_ctl.set_up(false).await {
        tracing::warn!(error = %e, "failed to bring the tunnel down");
    }
    if let Err(e) = device_ctl.close().await {
        tracing::warn!(error = %e, "failed to close the device");
    }
    if let Err(e) = iface_ctl.delete().await {
        tracing::warn!(error = %e, "failed to delete the interface");
    }

    Ok(())
}

/// The engine's view of the rendezvous.
struct RendezvousSource {
    client: Client,
}

#[async_trait]
impl MembershipSource for RendezvousSource {
    async fn list_networks(&self) -> Result<Vec<Network>> {
        Ok(self.client.networks().await?)
    }

    async fn fetch_network(&self, id: i64) -> Result<Network> {
        Ok(self.client.network(id).await?)
    }
}

/// Fetch our device from the rendezvous; register a fresh one when the
/// config has no device yet or the server no longer knows it.
async fn ensure_device(client: &Client, config: &mut Config) -> Result<Device> {
    if config.device_id == 0 {
        return register_device(client, config).await;
    }

    match client.device(config.device_id).await {
        Ok(dev) => Ok(dev),
        Err(ApiError::NotFound) => {
            tracing::warn!(
                device_id = config.device_id,
                "rendezvous does not know this device, registering a new one"
            );
            register_device(client, config).await
        }
        Err(e) => Err(e).context("failed to fetch our device"),
    }
}

async fn register_device(client: &Client, config: &mut Config) -> Result<Device> {
    if !config.private_key.is_empty() {
        bail!("refusing to register a new device with an already configured private key");
    }

    let pair = KeyPair::generate();
    config.private_key = pair.private;
    config.public_key = pair.public;

    let hostname = nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "<unknown>".to_string());

    let dev = client
        .new_device(&hostname, &config.public_key)
        .await
        .context("failed to register device")?;

    config.device_id = dev.id;
    config.save().context("failed to save config file")?;

    tracing::info!(id = dev.id, name = %dev.name, "registered new device");
    Ok(dev)
}

/// Install the punch peer and start the prober against it.
async fn start_prober(
    pd: &PunchDetails,
    our_device: &Device,
    device: &Arc<dyn TunnelDevice>,
    iface: &Arc<dyn Interface>,
    gateway: Arc<Gateway>,
    cancel: CancellationToken,
) -> Result<()> {
    let public_key = WgKey::from_base64(&pd.public_key).context("bad punch peer key")?;
    let punch_ip: Ipv6Addr = pd.ip.parse().context("bad punch peer address")?;
    let endpoint: SocketAddr = pd.endpoint.parse().context("bad punch peer endpoint")?;

    device
        .add_peer(&PeerSpec {
            public_key,
            allowed_ip: punch_ip,
            endpoint: Some(endpoint),
        })
        .await
        .context("failed to add punch peer")?;
    iface
        .add_route(punch_ip)
        .await
        .context("failed to route punch peer")?;

    let local_ip = our_device
        .overlay_ip()
        .context("no overlay address to probe from")?;

    tracing::info!(punch = %punch_ip, "endpoint prober starting");
    tokio::spawn(punch::run(
        local_ip,
        punch_ip,
        our_device.id,
        gateway,
        cancel,
    ));
    Ok(())
}

/// Apply gateway events to the engine, strictly in arrival order.
async fn dispatch(
    engine: Arc<Engine>,
    mut events: mpsc::Receiver<GatewayMsg>,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => return,
            msg = events.recv() => match msg {
                Some(msg) => msg,
                None => return,
            },
        };

        match msg.kind {
            GatewayKind::Connect => {
                tracing::info!("connected to rendezvous");
                engine.resync().await;
            }
            GatewayKind::Disconnect => {
                tracing::warn!(
                    delay = ?msg.delay,
                    error = msg.error.as_deref().unwrap_or("unknown"),
                    "disconnected from rendezvous"
                );
            }
            GatewayKind::NetworkJoin => match (msg.network, msg.device) {
                (Some(nw), Some(dev)) => engine.handle_join(nw, dev).await,
                _ => tracing::warn!("malformed NetworkJoin event"),
            },
            GatewayKind::NetworkLeave => match (msg.network, msg.device) {
                (Some(nw), Some(dev)) => engine.handle_leave(nw, dev).await,
                _ => tracing::warn!("malformed NetworkLeave event"),
            },
            GatewayKind::DeviceUpdate => match msg.device {
                Some(dev) => engine.handle_update(dev).await,
                None => tracing::warn!("malformed DeviceUpdate event"),
            },
            GatewayKind::Ping | GatewayKind::Other(_) => {
                tracing::debug!(kind = ?msg.kind, "ignoring gateway message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};

    /// Bootstrap with no device: keys are generated, the device is
    /// registered, and the assigned id lands in the config file.
    #[tokio::test]
    async fn bootstrap_registers_device_and_saves_config() {
        let app = Router::new()
            .route(
                "/new/device",
                post(|Json(body): Json<serde_json::Value>| async move {
                    Json(serde_json::json!({
                        "id": 7,
                        "owner": 1,
                        "name": body["name"],
                        "key": body["key"],
                        "ip": "fd00::7"
                    }))
                }),
            )
            .route(
                "/device/info",
                get(|| async { (StatusCode::NOT_FOUND, "no such device") }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let dir = std::env::temp_dir().join(format!("pikod-bootstrap-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        unsafe {
            std::env::set_var("PIKONET_CONFIG", dir.join("config.json"));
        }

        // Stale device id: the 404 must fall through to registration.
        let mut config = Config::default();
        config.rendezvous = format!("http://{addr}");
        config.device_id = 99;

        let client = Client::new(&config.rendezvous, "");
        let dev = ensure_device(&client, &mut config).await.unwrap();

        assert_eq!(dev.id, 7);
        assert_eq!(dev.ip, "fd00::7");
        assert_eq!(config.device_id, 7);
        assert_eq!(config.private_key.len(), 44);
        assert_eq!(config.public_key.len(), 44);

        let reloaded = Config::load().unwrap();
        assert_eq!(reloaded.device_id, 7);

        // A configured private key must never be overwritten.
        let mut occupied = Config::default();
        occupied.rendezvous = format!("http://{addr}");
        occupied.private_key = "configured".to_string();
        assert!(register_device(&client, &mut occupied).await.is_err());

        unsafe {
            std::env::remove_var("PIKONET_CONFIG");
        }
        let _ = std::fs::remove_dir_all(&dir);
    }
}

/// Wire the tunnel and naming actuators into the engine.
async fn register_observers(
    engine: &Arc<Engine>,
    actuator: &Arc<TunnelActuator>,
    names: &Arc<NameTable>,
) {
    let tunnel = actuator.clone();
    engine
        .on_rebuild(Box::new(move |snap| {
            let tunnel = tunnel.clone();
            Box::pin(async move { tunnel.sync(&snap.peers).await })
        }))
        .await;

    let tunnel = actuator.clone();
    engine
        .on_join(Box::new(move |snap, _nw, _dev| {
            let tunnel = tunnel.clone();
            Box::pin(async move { tunnel.sync(&snap.peers).await })
        }))
        .await;

    let tunnel = actuator.clone();
    engine
        .on_leave(Box::new(move |snap, _nw, _dev| {
            let tunnel = tunnel.clone();
            Box::pin(async move { tunnel.sync(&snap.peers).await })
        }))
        .await;

    let tunnel = actuator.clone();
    engine
        .on_update(Box::new(move |_snap, dev| {
            let tunnel = tunnel.clone();
            Box::pin(async move { tunnel.handle_update(&dev).await })
        }))
        .await;

    let table = names.clone();
    engine
        .on_rebuild(Box::new(move |snap| {
            let table = table.clone();
            Box::pin(async move {
                table.update(snap.peers.iter().chain(std::iter::once(&snap.device)));
            })
        }))
        .await;

    let table = names.clone();
    engine
        .on_join(Box::new(move |snap, _nw, _dev| {
            let table = table.clone();
            Box::pin(async move {
                table.update(snap.peers.iter().chain(std::iter::once(&snap.device)));
            })
        }))
        .await;

    let table = names.clone();
    engine
        .on_leave(Box::new(move |snap, _nw, _dev| {
            let table = table.clone();
            Box::pin(async move {
                table.update(snap.peers.iter().chain(std::iter::once(&snap.device)));
            })
        }))
        .await;

    let table = names.clone();
    engine
        .on_update(Box::new(move |snap, _dev| {
            let table = table.clone();
            Box::pin(async move {
                table.update(snap.peers.iter().chain(std::iter::once(&snap.device)));
            })
        }))
        .await;
}
