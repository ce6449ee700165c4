//! Gateway push channel.
//!
//! A single long-lived WebSocket carries JSON-encoded [`GatewayMsg`] frames
//! in both directions. The connection loop reconnects forever with
//! exponential backoff (1 s doubling, capped at 10 minutes) and injects two
//! synthetic message kinds into the subscriber channel: `Disconnect` with
//! the delay about to be slept, and `Connect` on success.
//!
//! Writes are serialized by a mutex held across reconnect attempts, so
//! senders block until the next connection instead of failing.

use std::time::Duration;

use anyhow::anyhow;
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use piko_core::{Device, Network};

/// Initial reconnect delay.
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Reconnect delay ceiling.
const MAX_BACKOFF: Duration = Duration::from_secs(600);

/// Kind tag of a gateway frame. `Disconnect` and `Connect` never appear on
/// the wire — the client injects them into the inbound channel itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum GatewayKind {
    #[default]
    Ping,
    NetworkJoin,
    NetworkLeave,
    DeviceUpdate,
    Disconnect,
    Connect,
    Other(i32),
}

impl From<i32> for GatewayKind {
    fn from(v: i32) -> Self {
        match v {
            0 => GatewayKind::Ping,
            1 => GatewayKind::NetworkJoin,
            2 => GatewayKind::NetworkLeave,
            3 => GatewayKind::DeviceUpdate,
            -1 => GatewayKind::Disconnect,
            -2 => GatewayKind::Connect,
            other => GatewayKind::Other(other),
        }
    }
}

impl From<GatewayKind> for i32 {
    fn from(k: GatewayKind) -> Self {
        match k {
            GatewayKind::Ping => 0,
            GatewayKind::NetworkJoin => 1,
            GatewayKind::NetworkLeave => 2,
            GatewayKind::DeviceUpdate => 3,
            GatewayKind::Disconnect => -1,
            GatewayKind::Connect => -2,
            GatewayKind::Other(other) => other,
        }
    }
}

/// One gateway frame. Unused fields are omitted on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayMsg {
    #[serde(rename = "type")]
    pub kind: GatewayKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<Device>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<Network>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub remove: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<i64>,

    /// Reconnect delay, set on synthetic `Disconnect` messages only.
    #[serde(skip)]
    pub delay: Option<Duration>,

    /// Triggering error, set on synthetic `Disconnect` messages only.
    #[serde(skip)]
    pub error: Option<String>,
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl GatewayMsg {
    /// The hello frame sent right after connecting, and also how the
    /// endpoint prober reports a discovered endpoint.
    pub fn ping(device_id: i64, endpoint: Option<String>) -> Self {
        Self {
            kind: GatewayKind::Ping,
            device_id: Some(device_id),
            endpoint,
            ..Self::default()
        }
    }

    fn connected() -> Self {
        Self {
            kind: GatewayKind::Connect,
            ..Self::default()
        }
    }

    fn disconnected(delay: Duration, error: &anyhow::Error) -> Self {
        Self {
            kind: GatewayKind::Disconnect,
            delay: Some(delay),
            error: Some(error.to_string()),
            ..Self::default()
        }
    }
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// The gateway connection. `run` owns the connection lifecycle; `send` may
/// be called from any task and blocks while the channel is reconnecting.
pub struct Gateway {
    url: String,
    token: String,
    writer: Mutex<Option<WsSink>>,
}

impl Gateway {
    /// `base` is the rendezvous API root; the gateway lives at
    /// `<base>/gateway` with the scheme switched to ws(s).
    pub fn new(base: &str, token: &str) -> anyhow::Result<Self> {
        let mut url = url::Url::parse(base)?;
        match url.scheme() {
            "http" => url.set_scheme("ws").map_err(|_| anyhow!("bad scheme"))?,
            "https" => url.set_scheme("wss").map_err(|_| anyhow!("bad scheme"))?,
            "ws" | "wss" => {}
            other => return Err(anyhow!("unsupported rendezvous scheme {other}")),
        }

        let url = format!("{}/gateway", url.as_str().trim_end_matches('/'));
        Ok(Self {
            url,
            token: token.to_string(),
            writer: Mutex::new(None),
        })
    }

    /// Send one frame over the current connection.
    ///
    /// Blocks while the connection loop holds the writer lock during a
    /// reconnect. Fails if the loop has not produced a connection yet.
    pub async fn send(&self, msg: &GatewayMsg) -> anyhow::Result<()> {
        let mut guard = self.writer.lock().await;
        let sink = guard
            .as_mut()
            .ok_or_else(|| anyhow!("gateway is not connected"))?;

        let text = serde_json::to_string(msg)?;
        sink.send(WsMessage::Text(text)).await?;
        Ok(())
    }

    /// Run the connection loop until cancelled.
    ///
    /// Every received frame is forwarded into `events`, along with the
    /// synthetic `Connect`/`Disconnect` messages.
    pub async fn run(
        &self,
        device_id: i64,
        events: mpsc::Sender<GatewayMsg>,
        cancel: CancellationToken,
    ) {
        let mut delay = INITIAL_BACKOFF;

        // Held while there is no live connection, so senders queue up
        // behind the reconnect instead of failing.
        let mut guard = self.writer.lock().await;

        loop {
            let stream = match self.dial().await {
                Ok(ws) => ws,
                Err(e) => {
                    delay = next_delay(delay);
                    tracing::warn!(error = %e, ?delay, "gateway dial failed");

                    let _ = events.send(GatewayMsg::disconnected(delay, &e)).await;
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            delay = INITIAL_BACKOFF;
            tracing::info!(url = %self.url, "gateway connected");

            let (sink, mut reader) = stream.split();
            *guard = Some(sink);
            drop(guard);

            let _ = events.send(GatewayMsg::connected()).await;

            // Introduce ourselves.
            if let Err(e) = self.send(&GatewayMsg::ping(device_id, None)).await {
                tracing::warn!(error = %e, "failed to send gateway hello");
            }

            let err = loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        self.close().await;
                        return;
                    }

                    frame = reader.next() => match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            match serde_json::from_str::<GatewayMsg>(&text) {
                                Ok(msg) => {
                                    if events.send(msg).await.is_err() {
                                        // Subscriber is gone; nothing left to do.
                                        self.close().await;
                                        return;
                                    }
                                }
                                Err(e) => break anyhow!("bad gateway frame: {e}"),
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break anyhow!("gateway closed"),
                        Some(Ok(_)) => {} // ping/pong/binary
                        Some(Err(e)) => break anyhow!(e),
                    }
                }
            };

            guard = self.writer.lock().await;
            *guard = None;

            tracing::warn!(error = %err, ?delay, "gateway connection lost");
            let _ = events.send(GatewayMsg::disconnected(delay, &err)).await;

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn dial(&self) -> anyhow::Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
        let mut request = self.url.as_str().into_client_request()?;
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", self.token).parse()?,
        );

        let (stream, _) = connect_async(request).await?;
        Ok(stream)
    }

    /// Close the socket with a normal-closure frame.
    async fn close(&self) {
        let mut guard = self.writer.lock().await;
        if let Some(mut sink) = guard.take() {
            let _ = sink
                .send(WsMessage::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "closing".into(),
                })))
                .await;
            let _ = sink.close().await;
        }
    }
}

/// The delay to sleep after one more consecutive failure.
fn next_delay(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}
