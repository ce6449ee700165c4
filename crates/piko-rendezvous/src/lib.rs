//! piko-rendezvous — the client side of the rendezvous service.
//!
//! [`client`] wraps the REST endpoints (bearer-token auth, JSON bodies);
//! [`gateway`] maintains the long-lived push WebSocket with reconnect and
//! exponential backoff.

pub mod client;
pub mod gateway;

pub use client::{ApiError, Client, PunchDetails};
pub use gateway::{Gateway, GatewayKind, GatewayMsg};
