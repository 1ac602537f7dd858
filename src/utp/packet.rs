//! uTP Packet Encoding/Decoding (BEP 29)
//!
//! A uTP datagram is a 20-byte header followed by a chain of optional
//! extensions and the payload. Every field is read through an explicit,
//! length-checked big-endian decode; nothing is cast onto the wire bytes.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{MalformedKind, Result, UtpError};

/// uTP packet header size
pub const HEADER_SIZE: usize = 20;

/// uTP protocol version
pub const UTP_VERSION: u8 = 1;

/// Number of packets a selective ACK bitmap can describe
pub const SELECTIVE_ACK_BITS: u16 = 32;

/// Size in bytes of the bitmap we emit
const SELECTIVE_ACK_LEN: usize = (SELECTIVE_ACK_BITS / 8) as usize;

/// Packet type values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Regular data packet
    Data = 0,
    /// Connection teardown
    Fin = 1,
    /// Acknowledgment (no payload)
    State = 2,
    /// Connection reset
    Reset = 3,
    /// Connection initiation
    Syn = 4,
}

impl TryFrom<u8> for PacketType {
    type Error = UtpError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Data),
            1 => Ok(Self::Fin),
            2 => Ok(Self::State),
            3 => Ok(Self::Reset),
            4 => Ok(Self::Syn),
            _ => Err(UtpError::malformed(
                MalformedKind::UnknownPacketType,
                format!("Invalid packet type: {}", value),
            )),
        }
    }
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Data => write!(f, "ST_DATA"),
            Self::Fin => write!(f, "ST_FIN"),
            Self::State => write!(f, "ST_STATE"),
            Self::Reset => write!(f, "ST_RESET"),
            Self::Syn => write!(f, "ST_SYN"),
        }
    }
}

/// Extension type values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExtensionType {
    /// No extension / end of extensions
    None = 0,
    /// Selective ACK extension
    SelectiveAck = 1,
}

/// Selective ACK extension data
///
/// Bit `i` of the bitmap flags sequence number `ack_nr + 2 + i`. Bits are
/// packed least significant first within each byte.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectiveAck {
    pub bitmask: Vec<u8>,
}

impl SelectiveAck {
    /// Create a new SelectiveAck with the given bitmask
    pub fn new(bitmask: Vec<u8>) -> Self {
        Self { bitmask }
    }

    /// Empty 32-bit bitmap
    pub fn empty() -> Self {
        Self {
            bitmask: vec![0; SELECTIVE_ACK_LEN],
        }
    }

    /// Check if a specific packet (relative to ack_nr + 2) is acknowledged
    pub fn is_acked(&self, offset: u16) -> bool {
        let byte_idx = offset as usize / 8;
        let bit_idx = offset as usize % 8;

        match self.bitmask.get(byte_idx) {
            Some(byte) => byte & (1 << bit_idx) != 0,
            None => false,
        }
    }

    /// Set a packet (relative to ack_nr + 2) as acknowledged
    pub fn set_acked(&mut self, offset: u16) {
        let byte_idx = offset as usize / 8;
        let bit_idx = offset as usize % 8;

        // Bitmaps grow in 4-byte steps
        while self.bitmask.len() <= byte_idx {
            self.bitmask.extend_from_slice(&[0; 4]);
        }

        self.bitmask[byte_idx] |= 1 << bit_idx;
    }

    /// Number of packets the bitmap can describe
    pub fn bit_len(&self) -> u16 {
        (self.bitmask.len() * 8).min(u16::MAX as usize) as u16
    }

    /// Offsets of all flagged packets
    pub fn acked_offsets(&self) -> impl Iterator<Item = u16> + '_ {
        (0..self.bit_len()).filter(move |&i| self.is_acked(i))
    }

    pub fn is_empty(&self) -> bool {
        self.bitmask.iter().all(|&b| b == 0)
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(ExtensionType::None as u8); // Next extension (none)
        buf.put_u8(self.bitmask.len() as u8);
        buf.put_slice(&self.bitmask);
    }
}

/// Fixed-size uTP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub packet_type: PacketType,

    pub version: u8,

    /// Id of the first extension, 0 if none
    pub extension: u8,

    pub connection_id: u16,

    /// Sender's clock at send time
    pub timestamp_us: u32,

    /// Last one-way delay measured by the sender
    pub timestamp_diff_us: u32,

    /// Free receive buffer space of the sender
    pub wnd_size: u32,

    pub seq_nr: u16,

    /// Highest contiguous sequence number the sender has received
    pub ack_nr: u16,
}

impl Header {
    /// Create a new header with zeroed timing fields
    pub fn new(packet_type: PacketType, connection_id: u16, seq_nr: u16, ack_nr: u16) -> Self {
        Self {
            packet_type,
            version: UTP_VERSION,
            extension: ExtensionType::None as u8,
            connection_id,
            timestamp_us: 0,
            timestamp_diff_us: 0,
            wnd_size: 0,
            seq_nr,
            ack_nr,
        }
    }

    /// Set timestamps
    pub fn with_timestamps(mut self, timestamp_us: u32, timestamp_diff_us: u32) -> Self {
        self.timestamp_us = timestamp_us;
        self.timestamp_diff_us = timestamp_diff_us;
        self
    }

    /// Set window size
    pub fn with_window(mut self, wnd_size: u32) -> Self {
        self.wnd_size = wnd_size;
        self
    }

    /// Decode the fixed header
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(UtpError::malformed(
                MalformedKind::Truncated,
                format!("Packet too short: {} bytes", data.len()),
            ));
        }

        let version = data[0] & 0x0F;
        if version != UTP_VERSION {
            return Err(UtpError::malformed(
                MalformedKind::UnsupportedVersion,
                format!("Unsupported uTP version: {}", version),
            ));
        }
        let packet_type = PacketType::try_from(data[0] >> 4)?;

        Ok(Self {
            packet_type,
            version,
            extension: data[1],
            connection_id: read_u16(data, 2),
            timestamp_us: read_u32(data, 4),
            timestamp_diff_us: read_u32(data, 8),
            wnd_size: read_u32(data, 12),
            seq_nr: read_u16(data, 16),
            ack_nr: read_u16(data, 18),
        })
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8((self.packet_type as u8) << 4 | (self.version & 0x0F));
        buf.put_u8(self.extension);
        buf.put_u16(self.connection_id);
        buf.put_u32(self.timestamp_us);
        buf.put_u32(self.timestamp_diff_us);
        buf.put_u32(self.wnd_size);
        buf.put_u16(self.seq_nr);
        buf.put_u16(self.ack_nr);
    }
}

fn read_u16(data: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([data[at], data[at + 1]])
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

/// A decoded datagram; the payload is `raw[payload_offset..]`
#[derive(Debug, Clone)]
pub struct ParsedPacket {
    pub header: Header,
    pub selective_ack: Option<SelectiveAck>,
    pub payload_offset: usize,
}

impl ParsedPacket {
    pub fn payload<'a>(&self, raw: &'a [u8]) -> &'a [u8] {
        &raw[self.payload_offset.min(raw.len())..]
    }
}

/// Decode a datagram: header, extension chain and payload offset
pub fn decode_packet(data: &[u8]) -> Result<ParsedPacket> {
    let header = Header::decode(data)?;

    let mut offset = HEADER_SIZE;
    let mut selective_ack = None;
    let mut ext_id = header.extension;

    // Each block consumes at least two bytes, so the walk ends within data.len() / 2 steps
    while ext_id != ExtensionType::None as u8 {
        if offset + 2 > data.len() {
            return Err(UtpError::malformed(
                MalformedKind::ExtensionOverrun,
                format!("Extension {} header past end of packet", ext_id),
            ));
        }

        let next = data[offset];
        let len = data[offset + 1] as usize;
        offset += 2;

        if offset + len > data.len() {
            return Err(UtpError::malformed(
                MalformedKind::ExtensionOverrun,
                format!(
                    "Extension {} declares {} bytes, {} left",
                    ext_id,
                    len,
                    data.len() - offset
                ),
            ));
        }

        // A bitmask must be a non-empty multiple of 32 bits; bad blocks are skipped like unknown ones
        if ext_id == ExtensionType::SelectiveAck as u8 && len > 0 && len % 4 == 0 {
            selective_ack = Some(SelectiveAck::new(data[offset..offset + len].to_vec()));
        }

        offset += len;
        ext_id = next;
    }

    Ok(ParsedPacket {
        header,
        selective_ack,
        payload_offset: offset,
    })
}

/// Encode a datagram; the extension byte follows `selective_ack`
pub fn encode_packet(header: &Header, selective_ack: Option<&SelectiveAck>, payload: &[u8]) -> Bytes {
    let mut header = *header;
    header.extension = if selective_ack.is_some() {
        ExtensionType::SelectiveAck as u8
    } else {
        ExtensionType::None as u8
    };

    let ext_len = selective_ack.map(|s| 2 + s.bitmask.len()).unwrap_or(0);
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + ext_len + payload.len());

    header.encode_into(&mut buf);
    if let Some(sack) = selective_ack {
        sack.encode_into(&mut buf);
    }
    buf.put_slice(payload);

    buf.freeze()
}

/// `a < b` in wrapping sequence space
pub fn seq_less_than(a: u16, b: u16) -> bool {
    let diff = b.wrapping_sub(a);
    diff != 0 && diff < 0x8000
}

/// `a <= b` in wrapping sequence space
pub fn seq_less_or_equal(a: u16, b: u16) -> bool {
    a == b || seq_less_than(a, b)
}
