//! Wire format: fixed 12-byte header, optional extension chain, payload.
//!
//! The original engine never converts byte order explicitly and relies on
//! both peers running the same architecture. SPEC_FULL.md §9 flags this as
//! an open question the implementer must decide deliberately; this crate
//! picks network byte order (big-endian) for every multi-byte field so two
//! engines on different architectures interoperate.

use std::cmp;

pub const VERSION: u8 = 1;
pub const HEADER_SIZE: usize = 12;
pub const SACK_EXTENSION_ID: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Data,
    Fin,
    State,
    Reset,
    Syn,
}

impl PacketType {
    fn to_nibble(self) -> u8 {
        match self {
            PacketType::Data => 0,
            PacketType::Fin => 1,
            PacketType::State => 2,
            PacketType::Reset => 3,
            PacketType::Syn => 4,
        }
    }

    fn from_nibble(n: u8) -> Option<Self> {
        match n {
            0 => Some(PacketType::Data),
            1 => Some(PacketType::Fin),
            2 => Some(PacketType::State),
            3 => Some(PacketType::Reset),
            4 => Some(PacketType::Syn),
            _ => None,
        }
    }
}

/// A decoded header plus slices into the caller's buffer for the extension
/// chain and payload. Borrows from the datagram it was parsed out of.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub packet_type: PacketType,
    pub conn_id: u16,
    pub window: u32,
    pub seq_nr: u16,
    pub ack_nr: u16,
}

#[derive(Debug)]
pub struct ParsedPacket<'a> {
    pub header: Header,
    /// Present iff a SACK extension record was found in the chain.
    pub sack_mask: Option<&'a [u8]>,
    pub payload: &'a [u8],
}

/// Parse a raw UDP datagram. Rejects anything shorter than the fixed header
/// or carrying an unsupported protocol version — both are silently-dropped
/// protocol violations per spec.md §7, so the caller just treats `None` as
/// "ignore this datagram".
pub fn parse(buf: &[u8]) -> Option<ParsedPacket<'_>> {
    if buf.len() < HEADER_SIZE {
        return None;
    }

    let version_and_type = buf[0];
    let version = version_and_type & 0x0f;
    if version != VERSION {
        return None;
    }
    let packet_type = PacketType::from_nibble(version_and_type >> 4)?;

    let extension = buf[1];
    let conn_id = u16::from_be_bytes([buf[2], buf[3]]);
    let window = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let seq_nr = u16::from_be_bytes([buf[8], buf[9]]);
    let ack_nr = u16::from_be_bytes([buf[10], buf[11]]);

    let header = Header {
        packet_type,
        conn_id,
        window,
        seq_nr,
        ack_nr,
    };

    let mut cursor = &buf[HEADER_SIZE..];
    let mut sack_mask = None;
    let mut next_ext = extension;

    while next_ext != 0 {
        if cursor.len() < 2 {
            return None;
        }
        let this_ext = next_ext;
        next_ext = cursor[0];
        let len = cursor[1] as usize;
        if cursor.len() < 2 + len {
            return None;
        }
        let data = &cursor[2..2 + len];
        if this_ext == SACK_EXTENSION_ID {
            sack_mask = Some(data);
        }
        cursor = &cursor[2 + len..];
    }

    Some(ParsedPacket {
        header,
        sack_mask,
        payload: cursor,
    })
}

/// Encode a bare header (no extensions) followed by `payload` into `out`,
/// overwriting its contents. Returns the number of bytes written.
pub fn encode(
    out: &mut Vec<u8>,
    packet_type: PacketType,
    conn_id: u16,
    window: u32,
    seq_nr: u16,
    ack_nr: u16,
    payload: &[u8],
) -> usize {
    out.clear();
    out.reserve(HEADER_SIZE + payload.len());
    out.push((VERSION & 0x0f) | (packet_type.to_nibble() << 4));
    out.push(0);
    out.extend_from_slice(&conn_id.to_be_bytes());
    out.extend_from_slice(&window.to_be_bytes());
    out.extend_from_slice(&seq_nr.to_be_bytes());
    out.extend_from_slice(&ack_nr.to_be_bytes());
    out.extend_from_slice(payload);
    out.len()
}

/// Encode a STATE packet carrying a SACK extension. `mask` is the
/// already-built bitmap (a multiple of 4 bytes, per `build_sack_mask`).
pub fn encode_with_sack(
    out: &mut Vec<u8>,
    conn_id: u16,
    window: u32,
    seq_nr: u16,
    ack_nr: u16,
    mask: &[u8],
) -> usize {
    out.clear();
    out.reserve(HEADER_SIZE + 2 + mask.len());
    out.push((VERSION & 0x0f) | (PacketType::State.to_nibble() << 4));
    out.push(SACK_EXTENSION_ID);
    out.extend_from_slice(&conn_id.to_be_bytes());
    out.extend_from_slice(&window.to_be_bytes());
    out.extend_from_slice(&seq_nr.to_be_bytes());
    out.extend_from_slice(&ack_nr.to_be_bytes());
    out.push(0); // next_ext_id: chain terminates after this record
    out.push(mask.len() as u8);
    out.extend_from_slice(mask);
    out.len()
}

/// Size in bytes of a SACK bitmap able to cover `out_of_order_cnt` bits:
/// `ceil(out_of_order_cnt / 8) + 1`, rounded up to a multiple of 4, at
/// least 4.
pub fn sack_mask_size(out_of_order_cnt: u16) -> usize {
    let bytes = out_of_order_cnt as usize / 8 + 1;
    let rounded = (bytes + 3) & !3;
    cmp::max(4, rounded)
}
