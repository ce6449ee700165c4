//! Local status endpoint — exposes daemon state as JSON.
//!
//! Bound to loopback only; this is an operator convenience, not an API.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use piko_engine::Engine;

use crate::discovery::DiscoveryCache;

#[derive(Clone)]
pub struct StatusState {
    pub engine: Arc<Engine>,
    pub cache: DiscoveryCache,
}

#[derive(Serialize)]
struct StatusResponse {
    device: DeviceInfo,
    networks: Vec<NetworkInfo>,
    peers: Vec<DeviceInfo>,
    discovered: usize,
}

#[derive(Serialize)]
struct DeviceInfo {
    id: i64,
    name: String,
    ip: String,
    endpoint: Option<String>,
}

#[derive(Serialize)]
struct NetworkInfo {
    id: i64,
    name: String,
    devices: usize,
}

impl From<piko_core::Device> for DeviceInfo {
    fn from(dev: piko_core::Device) -> Self {
        Self {
            id: dev.id,
            name: dev.name,
            ip: dev.ip,
            endpoint: dev.endpoint,
        }
    }
}

async fn handle_status(State(state): State<StatusState>) -> Json<StatusResponse> {
    let device = state.engine.self_device().await.into();
    let networks = state
        .engine
        .networks()
        .await
        .into_iter()
        .map(|nw| NetworkInfo {
            id: nw.id,
            name: nw.name,
            devices: nw.devices.len(),
        })
        .collect();
    let peers = state
        .engine
        .peers()
        .await
        .into_iter()
        .map(DeviceInfo::from)
        .collect();

    Json(StatusResponse {
        device,
        networks,
        peers,
        discovered: state.cache.len(),
    })
}

/// Serve `GET /status` on `127.0.0.1:<port>` until cancelled.
pub async fn serve(state: StatusState, port: u16, cancel: CancellationToken) -> Result<()> {
    let app = Router::new()
        .route("/status", get(handle_status))
        .with_state(state);

    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind status endpoint on {addr}"))?;

    tracing::info!(%addr, "status endpoint listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("status endpoint failed")
}
