//! Overlay wire format.
//!
//! Every datagram carries one packet:
//!
//! ```text
//! [type: u16 BE][ack_id: u16 BE][dst: 16 bytes][src: 16 bytes][payload]
//! ```
//!
//! `ack_id == 0` means no acknowledgement is requested. Cleartext control
//! packets additionally carry a `[nonce: 16][mac: 16]` trailer keyed by
//! the network secret; all other traffic travels inside an `Encoded`
//! packet whose payload is `[counter: u64 BE][aead ciphertext]`, the
//! ciphertext sealing an inner `[type: u16 BE][payload]` pair. Relays
//! forward `Encoded` packets without being able to read the inner bytes.

use crate::error::{CoreError, CoreResult};
use crate::identity::NodeId;

/// Fixed header size: type + ack id + two identities.
pub const HEADER_SIZE: usize = 2 + 2 + NodeId::SIZE * 2;

/// Packet type tags.
///
/// The tag space is closed: decoding rejects any value not listed here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PacketType {
    /// Cleartext presence probe / hole-punch upgrade.
    Greet = 1,
    /// Key-exchange opening message.
    Handshake1 = 2,
    /// Key-exchange reply.
    Handshake2 = 3,
    /// Key-exchange confirmation.
    Handshake3 = 4,
    /// Self-description pushed to a new contact.
    Register = 5,
    /// Reply to `Register` carrying the responder's self-description.
    RegisterAck = 6,
    /// Full peer-table push.
    PeerExchange = 7,
    /// Peer-table reply.
    PeerExchangeAck = 8,
    /// Gossip announcement of a single peer record.
    PeerAnnounce = 9,
    /// Liveness probe.
    Ping = 10,
    /// Acknowledgement echoing a requested ack id.
    Ack = 11,
    /// Adapter frame payload.
    Data = 12,
    /// Sealed envelope around an inner packet.
    Encoded = 13,
    /// User chat text.
    ChatMsg = 14,
}

impl PacketType {
    /// True for types that travel in cleartext with the MAC trailer.
    ///
    /// Only connection-establishment traffic qualifies; everything else
    /// must ride inside a session.
    #[must_use]
    pub fn is_clear(self) -> bool {
        matches!(
            self,
            Self::Greet
                | Self::Handshake1
                | Self::Handshake2
                | Self::Handshake3
                | Self::Register
                | Self::RegisterAck
        )
    }
}

impl TryFrom<u16> for PacketType {
    type Error = CoreError;

    fn try_from(value: u16) -> CoreResult<Self> {
        Ok(match value {
            1 => Self::Greet,
            2 => Self::Handshake1,
            3 => Self::Handshake2,
            4 => Self::Handshake3,
            5 => Self::Register,
            6 => Self::RegisterAck,
            7 => Self::PeerExchange,
            8 => Self::PeerExchangeAck,
            9 => Self::PeerAnnounce,
            10 => Self::Ping,
            11 => Self::Ack,
            12 => Self::Data,
            13 => Self::Encoded,
            14 => Self::ChatMsg,
            other => return Err(CoreError::Protocol(format!("unknown packet type {other}"))),
        })
    }
}

/// A decoded overlay packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet type tag.
    pub packet_type: PacketType,
    /// Requested acknowledgement id; 0 when no ack is wanted.
    pub ack_id: u16,
    /// Destination identity (broadcast id addresses everyone).
    pub dst: NodeId,
    /// Sender identity.
    pub src: NodeId,
    /// Payload bytes following the header.
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build a packet with no ack request.
    #[must_use]
    pub fn new(packet_type: PacketType, dst: NodeId, src: NodeId, payload: Vec<u8>) -> Self {
        Self {
            packet_type,
            ack_id: 0,
            dst,
            src,
            payload,
        }
    }

    /// Serialize header and payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&(self.packet_type as u16).to_be_bytes());
        buf.extend_from_slice(&self.ack_id.to_be_bytes());
        buf.extend_from_slice(self.dst.as_bytes());
        buf.extend_from_slice(self.src.as_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Serialize only the header (the AEAD associated data of a sealed
    /// packet).
    #[must_use]
    pub fn header_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[..2].copy_from_slice(&(self.packet_type as u16).to_be_bytes());
        buf[2..4].copy_from_slice(&self.ack_id.to_be_bytes());
        buf[4..4 + NodeId::SIZE].copy_from_slice(self.dst.as_bytes());
        buf[4 + NodeId::SIZE..].copy_from_slice(self.src.as_bytes());
        buf
    }

    /// Parse a datagram.
    ///
    /// # Errors
    ///
    /// `CoreError::Protocol` for short datagrams or unknown type tags.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() < HEADER_SIZE {
            return Err(CoreError::Protocol(format!(
                "packet too short: {} bytes",
                data.len()
            )));
        }

        let packet_type = PacketType::try_from(u16::from_be_bytes([data[0], data[1]]))?;
        let ack_id = u16::from_be_bytes([data[2], data[3]]);

        let mut dst = [0u8; NodeId::SIZE];
        dst.copy_from_slice(&data[4..4 + NodeId::SIZE]);
        let mut src = [0u8; NodeId::SIZE];
        src.copy_from_slice(&data[4 + NodeId::SIZE..HEADER_SIZE]);

        Ok(Self {
            packet_type,
            ack_id,
            dst: NodeId::from_bytes(dst),
            src: NodeId::from_bytes(src),
            payload: data[HEADER_SIZE..].to_vec(),
        })
    }
}

/// Encode the inner `[type: u16 BE][payload]` pair sealed inside an
/// `Encoded` packet.
#[must_use]
pub fn encode_inner(packet_type: PacketType, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + payload.len());
    buf.extend_from_slice(&(packet_type as u16).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Decode the inner pair recovered from a sealed payload.
///
/// # Errors
///
/// `CoreError::Protocol` for short buffers or unknown inner types.
pub fn decode_inner(data: &[u8]) -> CoreResult<(PacketType, Vec<u8>)> {
    if data.len() < 2 {
        return Err(CoreError::Protocol("sealed payload too short".into()));
    }
    let packet_type = PacketType::try_from(u16::from_be_bytes([data[0], data[1]]))?;
    Ok((packet_type, data[2..].to_vec()))
}
