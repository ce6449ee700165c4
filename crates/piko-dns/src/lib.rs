//! piko-dns — a small DNS server for the overlay.
//!
//! [`message`] implements just enough of the RFC 1035 wire format for
//! A/AAAA queries and responses, including compression-pointer parsing.
//! [`server`] answers overlay-suffix names from an injected resolver and
//! forwards everything else to a fallback resolver.

pub mod message;
pub mod server;

pub use message::{Message, ParseError, Question, Record};
pub use server::{Resolver, Server};
