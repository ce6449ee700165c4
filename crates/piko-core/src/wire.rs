//! Discovery wire format — the on-link peer discovery datagram.
//!
//! The discovery protocol is a single fixed 51-byte UDP payload sent to the
//! multicast group 239.112.110.100 on port 28779:
//!
//! ```text
//! offset  size  field
//! 0       4     magic "PIKO"
//! 4       1     type (0x01 Hello, 0x02 HelloReply)
//! 5       2     uint16 big-endian WireGuard listen port
//! 7       44    ASCII base64 WireGuard public key
//! ```
//!
//! Hello announces a node; HelloReply is sent only in response to a Hello,
//! never to another HelloReply. The layout is #[repr(C, packed)] with
//! zerocopy derives for allocation-free encode/decode. There is no unsafe
//! code in this module.

use std::net::Ipv4Addr;

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U16};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Multicast group the discovery protocol operates on.
pub const DISCOVERY_GROUP: Ipv4Addr = Ipv4Addr::new(239, 112, 110, 100);

/// UDP port the discovery protocol operates on.
pub const DISCOVERY_PORT: u16 = 28779;

/// Magic prefix of every discovery datagram.
pub const DISCOVERY_MAGIC: [u8; 4] = *b"PIKO";

/// Hello — announces this node's listen port and public key.
pub const TYPE_HELLO: u8 = 0x01;

/// HelloReply — same payload as Hello, sent only as a reply to a Hello.
pub const TYPE_HELLO_REPLY: u8 = 0x02;

/// Length of a base64-encoded 32-byte WireGuard key, padding included.
pub const KEY_LEN: usize = 44;

/// The discovery datagram. Wire size: 51 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct HelloPacket {
    pub magic: [u8; 4],
    pub kind: u8,
    pub port: U16<BigEndian>,
    pub key: [u8; KEY_LEN],
}

assert_eq_size!(HelloPacket, [u8; 51]);

/// A decoded Hello or HelloReply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloMessage {
    /// True for HelloReply. Replies must never be answered.
    pub reply: bool,
    /// The sender's WireGuard listen port.
    pub port: u16,
    /// The sender's base64 WireGuard public key.
    pub key: String,
}

/// Errors that can arise when interpreting a discovery datagram.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("datagram too short: {0} bytes")]
    TooShort(usize),

    #[error("bad magic")]
    BadMagic,

    #[error("unknown discovery message type 0x{0:02x}")]
    UnknownType(u8),

    #[error("public key is not ASCII")]
    BadKey,
}

/// Encode a Hello (or HelloReply) for `port` and `key`.
///
/// Keys shorter than 44 bytes are zero-padded, longer ones truncated; real
/// WireGuard keys are exactly 44 bytes of base64.
pub fn encode_hello(port: u16, key: &str, reply: bool) -> [u8; 51] {
    let mut packet = HelloPacket {
        magic: DISCOVERY_MAGIC,
        kind: if reply { TYPE_HELLO_REPLY } else { TYPE_HELLO },
        port: U16::new(port),
        key: [0u8; KEY_LEN],
    };

    let bytes = key.as_bytes();
    let n = bytes.len().min(KEY_LEN);
    packet.key[..n].copy_from_slice(&bytes[..n]);

    let mut out = [0u8; 51];
    out.copy_from_slice(packet.as_bytes());
    out
}

/// Decode a discovery datagram.
///
/// Rejects payloads shorter than 5 bytes, payloads without the `PIKO`
/// magic, unknown message types, and truncated Hello payloads.
pub fn decode_hello(buf: &[u8]) -> Result<HelloMessage, WireError> {
    if buf.len() < 5 {
        return Err(WireError::TooShort(buf.len()));
    }
    if buf[..4] != DISCOVERY_MAGIC {
        return Err(WireError::BadMagic);
    }

    match buf[4] {
        TYPE_HELLO | TYPE_HELLO_REPLY => {
            let packet = HelloPacket::read_from_prefix(buf)
                .ok_or(WireError::TooShort(buf.len()))?;

            let key = std::str::from_utf8(&packet.key)
                .map_err(|_| WireError::BadKey)?
                .to_owned();

            Ok(HelloMessage {
                reply: packet.kind == TYPE_HELLO_REPLY,
                port: packet.port.get(),
                key,
            })
        }
        other => Err(WireError::UnknownType(other)),
    }
}
