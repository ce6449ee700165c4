//! Split-resolution DNS server.
//!
//! Names under the overlay suffix are answered from the injected resolver;
//! everything else is forwarded to the fallback resolver and relayed back.
//! One task is spawned per inbound datagram.

use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::message::{
    Message, Question, Record, RCODE_FORMAT_ERROR, RCODE_NXDOMAIN, RCODE_OK, TYPE_A, TYPE_AAAA,
};

/// Answer TTL for overlay names.
const OVERLAY_TTL: u32 = 600;

/// How long to wait for the fallback resolver before giving up.
const FALLBACK_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_DATAGRAM: usize = 64 * 1024;

/// Resolves the labels left after stripping the overlay suffix.
pub type Resolver = Arc<dyn Fn(&[Vec<u8>]) -> Option<Ipv6Addr> + Send + Sync>;

/// The overlay DNS server.
pub struct Server {
    /// Upstream `host:port` for queries outside the overlay suffix.
    /// Without one, those queries get NXDOMAIN.
    fallback: Option<SocketAddr>,

    /// The overlay suffix as labels, e.g. `["pn", "local"]`.
    suffix: Vec<Vec<u8>>,

    resolver: Resolver,
}

impl Server {
    pub fn new(fallback: Option<SocketAddr>, suffix: &str, resolver: Resolver) -> Self {
        Self {
            fallback,
            suffix: suffix
                .split('.')
                .filter(|s| !s.is_empty())
                .map(|s| s.as_bytes().to_vec())
                .collect(),
            resolver,
        }
    }

    /// Serve queries on `socket` until cancelled.
    pub async fn run(self, socket: UdpSocket, cancel: CancellationToken) -> Result<()> {
        let server = Arc::new(self);
        let socket = Arc::new(socket);

        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let (len, peer) = tokio::select! {
                r = socket.recv_from(&mut buf) => r.context("dns recv_from failed")?,
                _ = cancel.cancelled() => {
                    tracing::debug!("dns server stopping");
                    return Ok(());
                }
            };

            let datagram = buf[..len].to_vec();
            let server = server.clone();
            let socket = socket.clone();

            tokio::spawn(async move {
                if let Err(e) = server.handle(&socket, peer, &datagram).await {
                    tracing::debug!(error = %e, %peer, "dns query handling failed");
                }
            });
        }
    }

    async fn handle(&self, socket: &UdpSocket, peer: SocketAddr, datagram: &[u8]) -> Result<()> {
        let msg = match Message::parse(datagram) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(error = %e, %peer, "dropping malformed query");
                // Echo the id back when at least that much parsed.
                let id = match datagram {
                    [hi, lo, ..] => u16::from_be_bytes([*hi, *lo]),
                    _ => 0,
                };
                return self
                    .send_failure(socket, peer, id, Vec::new(), RCODE_FORMAT_ERROR)
                    .await;
            }
        };

        // Multi-question queries are not supported by anyone in practice,
        // and zero-question queries have nothing to answer.
        if msg.questions.len() != 1 {
            return self
                .send_failure(socket, peer, msg.id, msg.questions, RCODE_FORMAT_ERROR)
                .await;
        }

        let question = &msg.questions[0];
        let overlay = self.under_suffix(&question.labels);

        if overlay && question.qtype == TYPE_A {
            return self.answer_overlay(socket, peer, msg).await;
        }

        if overlay && question.qtype == TYPE_AAAA {
            // The name exists; the record type is absent.
            return self
                .send_failure(socket, peer, msg.id, msg.questions, RCODE_OK)
                .await;
        }

        self.forward(socket, peer, msg).await
    }

    /// True if `labels` end with the overlay suffix.
    fn under_suffix(&self, labels: &[Vec<u8>]) -> bool {
        if self.suffix.is_empty() || labels.len() < self.suffix.len() {
            return false;
        }
        labels[labels.len() - self.suffix.len()..] == self.suffix[..]
    }

    async fn answer_overlay(
        &self,
        socket: &UdpSocket,
        peer: SocketAddr,
        mut msg: Message,
    ) -> Result<()> {
        let question = msg.questions[0].clone();
        let rest = &question.labels[..question.labels.len() - self.suffix.len()];

        let Some(ip) = (self.resolver)(rest) else {
            return self
                .send_failure(socket, peer, msg.id, msg.questions, RCODE_NXDOMAIN)
                .await;
        };

        msg.answers.push(Record {
            labels: question.labels,
            rtype: question.qtype,
            class: question.class,
            ttl: OVERLAY_TTL,
            rdata: ip.octets().to_vec(),
        });
        msg.response = true;
        msg.recursion_available = true;

        socket
            .send_to(&msg.serialize(), peer)
            .await
            .context("failed to send answer")?;
        Ok(())
    }

    /// Relay the query to the fallback resolver and the response back.
    async fn forward(&self, socket: &UdpSocket, peer: SocketAddr, msg: Message) -> Result<()> {
        let Some(fallback) = self.fallback else {
            return self
                .send_failure(socket, peer, msg.id, msg.questions, RCODE_NXDOMAIN)
                .await;
        };

        let bind: SocketAddr = if fallback.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let upstream = UdpSocket::bind(bind)
            .await
            .context("failed to bind fallback socket")?;
        upstream
            .connect(fallback)
            .await
            .context("failed to connect to fallback resolver")?;

        upstream
            .send(&msg.serialize())
            .await
            .context("failed to forward query")?;

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let len = tokio::time::timeout(FALLBACK_TIMEOUT, upstream.recv(&mut buf))
            .await
            .context("fallback resolver timed out")?
            .context("failed to read fallback response")?;

        let mut reply = Message::parse(&buf[..len]).context("bad fallback response")?;
        reply.recursion_available = true;

        socket
            .send_to(&reply.serialize(), peer)
            .await
            .context("failed to relay response")?;
        Ok(())
    }

    async fn send_failure(
        &self,
        socket: &UdpSocket,
        peer: SocketAddr,
        id: u16,
        questions: Vec<Question>,
        rcode: u8,
    ) -> Result<()> {
        let reply = Message {
            id,
            response: true,
            recursion_available: true,
            rcode,
            questions,
            ..Message::default()
        };

        socket
            .send_to(&reply.serialize(), peer)
            .await
            .context("failed to send failure reply")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver_with(name: &'static str, ip: Ipv6Addr) -> Resolver {
        Arc::new(move |labels: &[Vec<u8>]| {
            let last = labels.last()?;
            (last.as_slice() == name.as_bytes()).then_some(ip)
        })
    }

    #[test]
    fn suffix_matching() {
        let server = Server::new(None, "pn.local", resolver_with("alice", "fd00::1".parse().unwrap()));

        let alice = vec![b"alice".to_vec(), b"pn".to_vec(), b"local".to_vec()];
        let example = vec![b"example".to_vec(), b"com".to_vec()];
        let bare = vec![b"pn".to_vec(), b"local".to_vec()];
        let close = vec![b"alice".to_vec(), b"pn".to_vec(), b"locale".to_vec()];

        assert!(server.under_suffix(&alice));
        assert!(server.under_suffix(&bare));
        assert!(!server.under_suffix(&example));
        assert!(!server.under_suffix(&close));
    }
}
