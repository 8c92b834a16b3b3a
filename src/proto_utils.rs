use std::net::{IpAddr, SocketAddr};

use hickory_proto::op::ResponseCode;
use hickory_proto::rr::{DNSClass, RecordType};

/// Longest encoded name allowed on the wire, terminator included.
const MAX_WIRE_NAME: usize = 255;
const MAX_LABEL: usize = 63;

/// Decoded header and first question of an incoming request.
///
/// The name is kept in wire format exactly as the client sent it (case
/// preserved, compression resolved) because store keys are built from those
/// bytes. A lowercase dotted copy is kept for the text matchers.
#[derive(Debug, Clone)]
pub struct Query {
    pub tx_id: u16,
    pub recursion_desired: bool,
    pub peer: SocketAddr,
    pub qtype: RecordType,
    pub qclass: DNSClass,
    qname_wire: Vec<u8>,
    /// Offset of every label's length byte inside `qname_wire`.
    label_offsets: Vec<u8>,
    qname: String,
}

impl Query {
    #[inline]
    pub fn qname_wire(&self) -> &[u8] {
        &self.qname_wire
    }

    /// Lowercase presentation form without the trailing dot, empty for the root.
    #[inline]
    pub fn qname(&self) -> &str {
        &self.qname
    }

    #[inline]
    pub fn label_count(&self) -> usize {
        self.label_offsets.len()
    }

    /// Source address with IPv4-mapped IPv6 folded back to IPv4.
    #[inline]
    pub fn client_ip(&self) -> IpAddr {
        match self.peer.ip() {
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => IpAddr::V4(v4),
                None => IpAddr::V6(v6),
            },
            v4 => v4,
        }
    }

    /// Wire-format suffixes from the full name down to the root.
    ///
    /// Every suffix is a tail slice of the original encoding, so it is already
    /// correctly terminated.
    pub fn wire_suffixes(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.label_offsets
            .iter()
            .map(|&off| &self.qname_wire[off as usize..])
            .chain(std::iter::once(&self.qname_wire[self.qname_wire.len() - 1..]))
    }

    #[cfg(test)]
    pub fn from_name(name: &str, qtype: RecordType, peer: SocketAddr) -> Self {
        let mut wire = Vec::with_capacity(name.len() + 2);
        for label in name.trim_end_matches('.').split('.').filter(|l| !l.is_empty()) {
            wire.push(label.len() as u8);
            wire.extend_from_slice(label.as_bytes());
        }
        wire.push(0);
        let label_offsets = label_offsets(&wire);
        let qname = presentation(&wire).to_ascii_lowercase();
        Self {
            tx_id: 0x1234,
            recursion_desired: true,
            peer,
            qtype,
            qclass: DNSClass::IN,
            qname_wire: wire,
            label_offsets,
            qname: if qname == "." { String::new() } else { qname },
        }
    }
}

fn label_offsets(wire: &[u8]) -> Vec<u8> {
    let mut offsets = Vec::new();
    let mut pos = 0usize;
    while pos < wire.len() && wire[pos] != 0 {
        offsets.push(pos as u8);
        pos += 1 + wire[pos] as usize;
    }
    offsets
}

/// Presentation form of an uncompressed wire name, root rendered as ".".
///
/// Dots and backslashes inside labels are escaped, as are bytes outside
/// printable ASCII (`\DDD`).
pub fn presentation(wire: &[u8]) -> String {
    let mut out = String::with_capacity(wire.len());
    let mut pos = 0usize;
    while pos < wire.len() && wire[pos] != 0 {
        let len = wire[pos] as usize;
        let end = (pos + 1 + len).min(wire.len());
        if !out.is_empty() {
            out.push('.');
        }
        for &b in &wire[pos + 1..end] {
            match b {
                b'.' => out.push_str("\\."),
                b'\\' => out.push_str("\\\\"),
                0x21..=0x7e => out.push(b as char),
                _ => out.push_str(&format!("\\{:03}", b)),
            }
        }
        pos = end;
    }
    if out.is_empty() {
        out.push('.');
    }
    out
}

/// Decode the DNS header and first question without building a full `Message`.
///
/// Returns `None` for anything that is not a well-formed query with at least
/// one question.
pub fn parse_query(packet: &[u8], peer: SocketAddr) -> Option<Query> {
    if packet.len() < 12 {
        return None;
    }

    let tx_id = u16::from_be_bytes([packet[0], packet[1]]);
    // QR must be clear for queries
    if packet[2] & 0x80 != 0 {
        return None;
    }
    let recursion_desired = packet[2] & 0x01 != 0;

    let qd_count = u16::from_be_bytes([packet[4], packet[5]]);
    if qd_count == 0 {
        return None;
    }

    let mut pos = 12;
    let mut jumped = false;
    let mut max_jumps = 5;
    let mut current_pos = pos;
    let packet_len = packet.len();

    let mut wire = Vec::with_capacity(64);
    let mut text = Vec::with_capacity(64);

    loop {
        if current_pos >= packet_len {
            return None;
        }
        let len = packet[current_pos];

        if len == 0 {
            if !jumped {
                pos = current_pos + 1;
            }
            break;
        }

        if (len & 0xC0) == 0xC0 {
            if packet_len < current_pos + 2 {
                return None;
            }
            if !jumped {
                pos = current_pos + 2;
                jumped = true;
            }
            let offset = (((len as u16) & 0x3F) << 8) | (packet[current_pos + 1] as u16);
            current_pos = offset as usize;
            max_jumps -= 1;
            if max_jumps == 0 {
                return None;
            }
            continue;
        }
        if (len & 0xC0) != 0 {
            // extended label types are obsolete
            return None;
        }

        let label_len = len as usize;
        if label_len > MAX_LABEL {
            return None;
        }
        current_pos += 1;
        if packet_len < current_pos + label_len {
            return None;
        }
        if wire.len() + 1 + label_len + 1 > MAX_WIRE_NAME {
            return None;
        }

        let label_bytes = &packet[current_pos..current_pos + label_len];
        wire.push(len);
        wire.extend_from_slice(label_bytes);

        if !text.is_empty() {
            text.push(b'.');
        }
        text.extend(label_bytes.iter().map(|b| b.to_ascii_lowercase()));

        current_pos += label_len;
    }
    wire.push(0);

    if packet.len() < pos + 4 {
        return None;
    }
    let qtype = u16::from_be_bytes([packet[pos], packet[pos + 1]]);
    let qclass = u16::from_be_bytes([packet[pos + 2], packet[pos + 3]]);

    let qname = match String::from_utf8(text) {
        Ok(s) => s,
        Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
    };
    let label_offsets = label_offsets(&wire);

    Some(Query {
        tx_id,
        recursion_desired,
        peer,
        qtype: RecordType::from(qtype),
        qclass: DNSClass::from(qclass),
        qname_wire: wire,
        label_offsets,
        qname,
    })
}

/// Read the RCODE of a response without decoding it.
pub fn response_rcode(packet: &[u8]) -> Option<ResponseCode> {
    if packet.len() < 12 {
        return None;
    }
    // Flags: QR(1) Opcode(4) AA(1) TC(1) RD(1) RA(1) Z(3) RCODE(4)
    Some(ResponseCode::from(0, packet[3] & 0x0F))
}
