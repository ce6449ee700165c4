//! DNS wire format.
//!
//! Covers the subset the overlay server needs: the 12-byte header, the
//! question section, and resource records for A/AAAA answers. The parser
//! follows compression pointers (top two bits `11`, 14-bit offset into the
//! original message) with a bounded depth; the serializer always writes
//! uncompressed labels.

/// A record (IPv4 host address).
pub const TYPE_A: u16 = 1;

/// AAAA record (IPv6 host address).
pub const TYPE_AAAA: u16 = 28;

/// The IN class.
pub const CLASS_IN: u16 = 1;

/// Standard query opcode.
pub const OPCODE_QUERY: u8 = 0;

pub const RCODE_OK: u8 = 0;
/// The server was unable to interpret the query.
pub const RCODE_FORMAT_ERROR: u8 = 1;
/// The queried domain does not exist.
pub const RCODE_NXDOMAIN: u8 = 3;

/// Maximum number of compression pointers followed while reading one name.
const MAX_POINTER_DEPTH: usize = 5;

/// A single entry in the question section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Question {
    pub labels: Vec<Vec<u8>>,
    pub qtype: u16,
    pub class: u16,
}

/// A resource record, used for answers, authority, and additional data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    pub labels: Vec<Vec<u8>>,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

/// A DNS message. Section counts are derived from the section vectors on
/// serialization, so a parsed-then-reserialized message stays consistent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub id: u16,
    /// Wire QR bit: false for queries, true for responses.
    pub response: bool,
    pub opcode: u8,
    pub authoritative: bool,
    pub truncated: bool,
    pub recursion_desired: bool,
    pub recursion_available: bool,
    pub rcode: u8,

    pub questions: Vec<Question>,
    pub answers: Vec<Record>,
    pub authority: Vec<Record>,
    pub additional: Vec<Record>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("message too short: {0} bytes")]
    TooShort(usize),

    #[error("label length overruns the message")]
    LabelOverrun,

    #[error("truncated compression pointer")]
    ShortPointer,

    #[error("compression pointer offset 0x{0:04x} out of bounds")]
    PointerOutOfBounds(usize),

    #[error("compression pointer chain too deep")]
    PointerTooDeep,

    #[error("incomplete question section")]
    IncompleteQuestion,

    #[error("incomplete record section")]
    IncompleteRecord,

    #[error("rdlength {0} exceeds remaining message")]
    RdataOverrun(u16),
}

/// Read a name starting at `start`, following pointers into `msg`.
///
/// Returns the labels and the number of bytes consumed at the original
/// position (a pointer consumes two bytes regardless of what it expands to).
fn parse_labels(
    msg: &[u8],
    start: usize,
    depth: usize,
) -> Result<(Vec<Vec<u8>>, usize), ParseError> {
    let mut labels = Vec::new();
    let mut pos = start;

    while pos < msg.len() {
        let len_byte = msg[pos];

        if len_byte == 0 {
            pos += 1;
            break;
        }

        if len_byte & 0b1100_0000 == 0b1100_0000 {
            if depth >= MAX_POINTER_DEPTH {
                return Err(ParseError::PointerTooDeep);
            }
            if pos + 2 > msg.len() {
                return Err(ParseError::ShortPointer);
            }

            let offset =
                (u16::from_be_bytes([msg[pos], msg[pos + 1]]) & 0x3fff) as usize;
            if offset > msg.len() {
                return Err(ParseError::PointerOutOfBounds(offset));
            }

            let (mut rest, _) = parse_labels(msg, offset, depth + 1)?;
            labels.append(&mut rest);

            // A pointer terminates the name.
            return Ok((labels, pos + 2 - start));
        }

        let len = (len_byte & 0b0011_1111) as usize;
        if pos + 1 + len > msg.len() {
            return Err(ParseError::LabelOverrun);
        }

        labels.push(msg[pos + 1..pos + 1 + len].to_vec());
        pos += 1 + len;
    }

    Ok((labels, pos - start))
}

/// Read up to `count` records starting at `start`.
fn parse_records(
    msg: &[u8],
    start: usize,
    count: u16,
) -> Result<(Vec<Record>, usize), ParseError> {
    let mut records = Vec::new();
    let mut pos = start;

    for _ in 0..count {
        if pos >= msg.len() {
            break;
        }

        let (labels, consumed) = parse_labels(msg, pos, 0)?;
        pos += consumed;

        if pos + 10 > msg.len() {
            return Err(ParseError::IncompleteRecord);
        }

        let rtype = u16::from_be_bytes([msg[pos], msg[pos + 1]]);
        let class = u16::from_be_bytes([msg[pos + 2], msg[pos + 3]]);
        let ttl = u32::from_be_bytes([msg[pos + 4], msg[pos + 5], msg[pos + 6], msg[pos + 7]]);
        let rdlen = u16::from_be_bytes([msg[pos + 8], msg[pos + 9]]);
        pos += 10;

        if pos + rdlen as usize > msg.len() {
            return Err(ParseError::RdataOverrun(rdlen));
        }

        records.push(Record {
            labels,
            rtype,
            class,
            ttl,
            rdata: msg[pos..pos + rdlen as usize].to_vec(),
        });
        pos += rdlen as usize;
    }

    Ok((records, pos - start))
}

impl Message {
    /// Parse a DNS message.
    pub fn parse(buf: &[u8]) -> Result<Self, ParseError> {
        if buf.len() <= 12 {
            return Err(ParseError::TooShort(buf.len()));
        }

        let mut msg = Message {
            id: u16::from_be_bytes([buf[0], buf[1]]),
            response: buf[2] & 0b1000_0000 != 0,
            opcode: (buf[2] >> 3) & 0b1111,
            authoritative: buf[2] & 0b0000_0100 != 0,
            truncated: buf[2] & 0b0000_0010 != 0,
            recursion_desired: buf[2] & 0b0000_0001 != 0,
            recursion_available: buf[3] & 0b1000_0000 != 0,
            rcode: buf[3] & 0b0000_1111,
            ..Message::default()
        };

        let qdcount = u16::from_be_bytes([buf[4], buf[5]]);
        let ancount = u16::from_be_bytes([buf[6], buf[7]]);
        let nscount = u16::from_be_bytes([buf[8], buf[9]]);
        let arcount = u16::from_be_bytes([buf[10], buf[11]]);

        let mut pos = 12;
        for _ in 0..qdcount {
            if pos >= buf.len() {
                break;
            }

            let (labels, consumed) = parse_labels(buf, pos, 0)?;
            pos += consumed;

            if pos + 4 > buf.len() {
                return Err(ParseError::IncompleteQuestion);
            }

            msg.questions.push(Question {
                labels,
                qtype: u16::from_be_bytes([buf[pos], buf[pos + 1]]),
                class: u16::from_be_bytes([buf[pos + 2], buf[pos + 3]]),
            });
            pos += 4;
        }

        let (answers, consumed) = parse_records(buf, pos, ancount)?;
        msg.answers = answers;
        pos += consumed;

        let (authority, consumed) = parse_records(buf, pos, nscount)?;
        msg.authority = authority;
        pos += consumed;

        let (additional, _) = parse_records(buf, pos, arcount)?;
        msg.additional = additional;

        Ok(msg)
    }

    /// Serialize the message. Labels are written uncompressed.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);

        out.extend_from_slice(&self.id.to_be_bytes());

        let mut b2 = 0u8;
        if self.response {
            b2 |= 1 << 7;
        }
        b2 |= (self.opcode & 0b1111) << 3;
        if self.authoritative {
            b2 |= 0b100;
        }
        if self.truncated {
            b2 |= 0b10;
        }
        if self.recursion_desired {
            b2 |= 1;
        }
        out.push(b2);

        let mut b3 = 0u8;
        if self.recursion_available {
            b3 |= 1 << 7;
        }
        b3 |= self.rcode & 0b1111;
        out.push(b3);

        out.extend_from_slice(&(self.questions.len() as u16).to_be_bytes());
        out.extend_from_slice(&(self.answers.len() as u16).to_be_bytes());
        out.extend_from_slice(&(self.authority.len() as u16).to_be_bytes());
        out.extend_from_slice(&(self.additional.len() as u16).to_be_bytes());

        for q in &self.questions {
            serialize_labels(&mut out, &q.labels);
            out.extend_from_slice(&q.qtype.to_be_bytes());
            out.extend_from_slice(&q.class.to_be_bytes());
        }

        for r in self
            .answers
            .iter()
            .chain(&self.authority)
            .chain(&self.additional)
        {
            serialize_labels(&mut out, &r.labels);
            out.extend_from_slice(&r.rtype.to_be_bytes());
            out.extend_from_slice(&r.class.to_be_bytes());
            out.extend_from_slice(&r.ttl.to_be_bytes());
            out.extend_from_slice(&(r.rdata.len() as u16).to_be_bytes());
            out.extend_from_slice(&r.rdata);
        }

        out
    }
}

fn serialize_labels(out: &mut Vec<u8>, labels: &[Vec<u8>]) {
    for label in labels {
        out.push((label.len() & 0x3f) as u8);
        out.extend_from_slice(label);
    }
    out.push(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(parts: &[&str]) -> Vec<Vec<u8>> {
        parts.iter().map(|p| p.as_bytes().to_vec()).collect()
    }

    const QUERY_EXAMPLE_COM: &[u8] = &[
        0xc2, 0x22, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x07, b'e',
        b'x', b'a', b'm', b'p', b'l', b'e', 0x03, b'c', b'o', b'm', 0x00, 0x00, 0x01, 0x00,
        0x01,
    ];

    const RESPONSE_EXAMPLE_COM: &[u8] = &[
        0xa9, 0x56, 0x81, 0x80, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x07, b'e',
        b'x', b'a', b'm', b'p', b'l', b'e', 0x03, b'c', b'o', b'm', 0x00, 0x00, 0x01, 0x00,
        0x01, 0x07, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 0x03, b'c', b'o', b'm', 0x00,
        0x00, 0x01, 0x00, 0x01, 0x00, 0x01, 0x3b, 0x7a, 0x00, 0x04, 0x5d, 0xb8, 0xd8, 0x22,
    ];

    fn query_message() -> Message {
        Message {
            id: 0xc222,
            recursion_desired: true,
            questions: vec![Question {
                labels: labels(&["example", "com"]),
                qtype: TYPE_A,
                class: CLASS_IN,
            }],
            ..Message::default()
        }
    }

    fn response_message() -> Message {
        Message {
            id: 0xa956,
            response: true,
            recursion_desired: true,
            recursion_available: true,
            questions: vec![Question {
                labels: labels(&["example", "com"]),
                qtype: TYPE_A,
                class: CLASS_IN,
            }],
            answers: vec![Record {
                labels: labels(&["example", "com"]),
                rtype: TYPE_A,
                class: CLASS_IN,
                ttl: 80762,
                rdata: vec![0x5d, 0xb8, 0xd8, 0x22],
            }],
            ..Message::default()
        }
    }

    #[test]
    fn serialize_query_golden() {
        assert_eq!(query_message().serialize(), QUERY_EXAMPLE_COM);
    }

    #[test]
    fn serialize_response_golden() {
        assert_eq!(response_message().serialize(), RESPONSE_EXAMPLE_COM);
    }

    #[test]
    fn parse_query_golden() {
        let msg = Message::parse(QUERY_EXAMPLE_COM).unwrap();
        assert_eq!(msg, query_message());
    }

    #[test]
    fn parse_response_golden() {
        let msg = Message::parse(RESPONSE_EXAMPLE_COM).unwrap();
        assert_eq!(msg, response_message());
    }

    #[test]
    fn parse_serialize_idempotent() {
        for m in [query_message(), response_message()] {
            assert_eq!(Message::parse(&m.serialize()).unwrap(), m);
        }
    }

    #[test]
    fn parse_follows_compression_pointer() {
        // Response whose answer name is a pointer back to the question name
        // at offset 12.
        let mut buf = Vec::new();
        buf.extend_from_slice(&[
            0xa9, 0x56, 0x81, 0x80, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00,
        ]);
        buf.extend_from_slice(b"\x07example\x03com\x00");
        buf.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
        buf.extend_from_slice(&[0xc0, 0x0c]); // pointer to offset 12
        buf.extend_from_slice(&[0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x3c, 0x00, 0x04]);
        buf.extend_from_slice(&[93, 184, 216, 34]);

        let msg = Message::parse(&buf).unwrap();
        assert_eq!(msg.answers.len(), 1);
        assert_eq!(msg.answers[0].labels, labels(&["example", "com"]));
        assert_eq!(msg.answers[0].rdata, vec![93, 184, 216, 34]);
    }

    #[test]
    fn parse_rejects_short_messages() {
        assert_eq!(Message::parse(&[]), Err(ParseError::TooShort(0)));
        assert_eq!(Message::parse(&[0u8; 12]), Err(ParseError::TooShort(12)));
    }

    #[test]
    fn parse_rejects_pointer_out_of_bounds() {
        let mut buf = vec![0u8; 12];
        buf[5] = 1; // one question
        buf.extend_from_slice(&[0xff, 0xff]); // pointer to 0x3fff
        buf.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);

        assert_eq!(
            Message::parse(&buf),
            Err(ParseError::PointerOutOfBounds(0x3fff))
        );
    }

    #[test]
    fn parse_rejects_pointer_loop() {
        let mut buf = vec![0u8; 12];
        buf[5] = 1;
        buf.extend_from_slice(&[0xc0, 0x0c]); // pointer to itself
        buf.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);

        assert_eq!(Message::parse(&buf), Err(ParseError::PointerTooDeep));
    }

    #[test]
    fn parse_rejects_label_overrun() {
        let mut buf = vec![0u8; 12];
        buf[5] = 1;
        buf.extend_from_slice(&[0x3f, b'a', b'b']); // claims 63 bytes, has 2

        assert_eq!(Message::parse(&buf), Err(ParseError::LabelOverrun));
    }

    #[test]
    fn parse_rejects_rdata_overrun() {
        let mut buf = vec![0u8; 12];
        buf[7] = 1; // one answer, no questions
        buf.extend_from_slice(b"\x01a\x00");
        buf.extend_from_slice(&[0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x3c]);
        buf.extend_from_slice(&[0x00, 0x20]); // rdlength 32, but no data follows

        assert_eq!(Message::parse(&buf), Err(ParseError::RdataOverrun(32)));
    }
}
