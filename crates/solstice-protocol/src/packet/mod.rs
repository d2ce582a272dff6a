//! Control packet framing and dispatch
//!
//! The fixed header carries the packet type in the high nibble, the
//! type-specific flags in the low nibble and a variable-length remaining
//! length field (one to four bytes). [`Packet::decode`] consumes exactly one
//! complete frame from the front of a buffer, returning `None` while the
//! frame is still partial so callers can keep reading from the transport.

pub mod ack;
pub mod connect;
pub mod publish;
pub mod subscribe;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};
use crate::types::PacketType;

pub use ack::{PubAckPacket, PubCompPacket, PubRecPacket, PubRelPacket};
use connect::{ConnAckPacket, ConnectPacket};
use publish::PublishPacket;
use subscribe::{SubAckPacket, SubscribePacket, UnsubAckPacket, UnsubscribePacket};

/// Largest value the four-byte remaining length field can express.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Decoded fixed header of a control packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    pub packet_type: PacketType,
    pub flags: u8,
    pub remaining_length: usize,
}

/// A decoded MQTT v3.1.1 control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Box<ConnectPacket>),
    ConnAck(ConnAckPacket),
    Publish(PublishPacket),
    PubAck(PubAckPacket),
    PubRec(PubRecPacket),
    PubRel(PubRelPacket),
    PubComp(PubCompPacket),
    Subscribe(SubscribePacket),
    SubAck(SubAckPacket),
    Unsubscribe(UnsubscribePacket),
    UnsubAck(UnsubAckPacket),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::ConnAck(_) => PacketType::ConnAck,
            Packet::Publish(_) => PacketType::Publish,
            Packet::PubAck(_) => PacketType::PubAck,
            Packet::PubRec(_) => PacketType::PubRec,
            Packet::PubRel(_) => PacketType::PubRel,
            Packet::PubComp(_) => PacketType::PubComp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::SubAck(_) => PacketType::SubAck,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::UnsubAck(_) => PacketType::UnsubAck,
            Packet::PingReq => PacketType::PingReq,
            Packet::PingResp => PacketType::PingResp,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }

    /// Attempts to decode one complete frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a full frame;
    /// nothing is consumed in that case.
    ///
    /// # Errors
    /// Returns an error for unknown packet types, invalid flag nibbles or a
    /// malformed body. The caller should drop the connection: framing cannot
    /// be resynchronised after a bad header.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Packet>> {
        let Some((header, header_len)) = peek_fixed_header(buf)? else {
            return Ok(None);
        };
        if buf.len() < header_len + header.remaining_length {
            return Ok(None);
        }

        buf.advance(header_len);
        let mut body = buf.split_to(header.remaining_length).freeze();
        let packet = Self::decode_body(&header, &mut body)?;
        if body.has_remaining() {
            return Err(ProtocolError::MalformedPacket(format!(
                "{} bytes left over after {:?} body",
                body.remaining(),
                header.packet_type
            )));
        }
        Ok(Some(packet))
    }

    fn decode_body(header: &FixedHeader, body: &mut Bytes) -> Result<Packet> {
        match header.packet_type {
            PacketType::Connect => {
                expect_flags(header, 0, "CONNECT")?;
                Ok(Packet::Connect(Box::new(ConnectPacket::decode_body(body)?)))
            }
            PacketType::ConnAck => {
                expect_flags(header, 0, "CONNACK")?;
                Ok(Packet::ConnAck(ConnAckPacket::decode_body(body)?))
            }
            PacketType::Publish => Ok(Packet::Publish(PublishPacket::decode_body(
                header.flags,
                body,
            )?)),
            PacketType::PubAck => {
                expect_flags(header, 0, "PUBACK")?;
                Ok(Packet::PubAck(PubAckPacket::decode_body(body)?))
            }
            PacketType::PubRec => {
                expect_flags(header, 0, "PUBREC")?;
                Ok(Packet::PubRec(PubRecPacket::decode_body(body)?))
            }
            PacketType::PubRel => {
                expect_flags(header, 0x02, "PUBREL")?;
                Ok(Packet::PubRel(PubRelPacket::decode_body(body)?))
            }
            PacketType::PubComp => {
                expect_flags(header, 0, "PUBCOMP")?;
                Ok(Packet::PubComp(PubCompPacket::decode_body(body)?))
            }
            PacketType::Subscribe => {
                expect_flags(header, 0x02, "SUBSCRIBE")?;
                Ok(Packet::Subscribe(SubscribePacket::decode_body(body)?))
            }
            PacketType::SubAck => {
                expect_flags(header, 0, "SUBACK")?;
                Ok(Packet::SubAck(SubAckPacket::decode_body(body)?))
            }
            PacketType::Unsubscribe => {
                expect_flags(header, 0x02, "UNSUBSCRIBE")?;
                Ok(Packet::Unsubscribe(UnsubscribePacket::decode_body(body)?))
            }
            PacketType::UnsubAck => {
                expect_flags(header, 0, "UNSUBACK")?;
                Ok(Packet::UnsubAck(UnsubAckPacket::decode_body(body)?))
            }
            PacketType::PingReq => {
                expect_empty(header, "PINGREQ")?;
                Ok(Packet::PingReq)
            }
            PacketType::PingResp => {
                expect_empty(header, "PINGRESP")?;
                Ok(Packet::PingResp)
            }
            PacketType::Disconnect => {
                expect_empty(header, "DISCONNECT")?;
                Ok(Packet::Disconnect)
            }
        }
    }

    /// Encodes the packet, fixed header included, appending to `buf`.
    ///
    /// # Errors
    /// Returns an error if a length field overflows its wire representation.
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        let body_len = self.body_len();
        buf.put_u8(self.packet_type().as_u8() << 4 | self.header_flags());
        encode_remaining_length(buf, body_len)?;

        match self {
            Packet::Connect(connect) => connect.encode_body(buf),
            Packet::ConnAck(connack) => connack.encode_body(buf),
            Packet::Publish(publish) => publish.encode_body(buf),
            Packet::PubAck(ack) => ack.encode_body(buf),
            Packet::PubRec(ack) => ack.encode_body(buf),
            Packet::PubRel(ack) => ack.encode_body(buf),
            Packet::PubComp(ack) => ack.encode_body(buf),
            Packet::Subscribe(subscribe) => subscribe.encode_body(buf),
            Packet::SubAck(suback) => suback.encode_body(buf),
            Packet::Unsubscribe(unsubscribe) => unsubscribe.encode_body(buf),
            Packet::UnsubAck(unsuback) => unsuback.encode_body(buf),
            Packet::PingReq | Packet::PingResp | Packet::Disconnect => Ok(()),
        }
    }

    /// Total size of the packet on the wire, fixed header included.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        let body_len = self.body_len();
        1 + remaining_length_size(body_len) + body_len
    }

    fn body_len(&self) -> usize {
        match self {
            Packet::Connect(connect) => connect.body_len(),
            Packet::ConnAck(_) => 2,
            Packet::Publish(publish) => publish.body_len(),
            Packet::PubAck(_)
            | Packet::PubRec(_)
            | Packet::PubRel(_)
            | Packet::PubComp(_)
            | Packet::UnsubAck(_) => 2,
            Packet::Subscribe(subscribe) => subscribe.body_len(),
            Packet::SubAck(suback) => suback.body_len(),
            Packet::Unsubscribe(unsubscribe) => unsubscribe.body_len(),
            Packet::PingReq | Packet::PingResp | Packet::Disconnect => 0,
        }
    }

    fn header_flags(&self) -> u8 {
        match self {
            Packet::Publish(publish) => publish.header_flags(),
            Packet::PubRel(_) | Packet::Subscribe(_) | Packet::Unsubscribe(_) => 0x02,
            _ => 0,
        }
    }
}

/// Parses the fixed header without consuming; returns the header and its
/// encoded length, or `None` if more bytes are needed.
fn peek_fixed_header(buf: &BytesMut) -> Result<Option<(FixedHeader, usize)>> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let first = buf[0];
    let packet_type = PacketType::try_from(first >> 4)?;
    let flags = first & 0x0F;

    let mut remaining_length: usize = 0;
    let mut shift = 0;
    let mut pos = 1;
    loop {
        if pos >= buf.len() {
            return Ok(None);
        }
        let byte = buf[pos];
        pos += 1;
        remaining_length |= usize::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 21 {
            return Err(ProtocolError::RemainingLengthTooLarge);
        }
    }

    Ok(Some((
        FixedHeader {
            packet_type,
            flags,
            remaining_length,
        },
        pos,
    )))
}

fn expect_flags(header: &FixedHeader, expected: u8, packet: &'static str) -> Result<()> {
    if header.flags != expected {
        return Err(ProtocolError::InvalidFlags {
            packet,
            flags: header.flags,
        });
    }
    Ok(())
}

fn expect_empty(header: &FixedHeader, packet: &'static str) -> Result<()> {
    expect_flags(header, 0, packet)?;
    if header.remaining_length != 0 {
        return Err(ProtocolError::MalformedPacket(format!(
            "{packet} carries a non-empty body"
        )));
    }
    Ok(())
}

pub(crate) fn encode_remaining_length<B: BufMut>(buf: &mut B, mut len: usize) -> Result<()> {
    if len > MAX_REMAINING_LENGTH {
        return Err(ProtocolError::RemainingLengthTooLarge);
    }
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if len == 0 {
            return Ok(());
        }
    }
}

pub(crate) fn remaining_length_size(len: usize) -> usize {
    match len {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

pub(crate) fn encode_string<B: BufMut>(buf: &mut B, s: &str) -> Result<()> {
    let len = u16::try_from(s.len()).map_err(|_| ProtocolError::PacketTooLarge {
        size: s.len(),
        max: usize::from(u16::MAX),
    })?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

pub(crate) fn decode_string(buf: &mut Bytes, field: &'static str) -> Result<String> {
    let raw = decode_binary(buf, field)?;
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8(field))
}

pub(crate) fn decode_binary(buf: &mut Bytes, field: &'static str) -> Result<Bytes> {
    if buf.remaining() < 2 {
        return Err(truncated(field));
    }
    let len = usize::from(buf.get_u16());
    if buf.remaining() < len {
        return Err(truncated(field));
    }
    Ok(buf.split_to(len))
}

pub(crate) fn decode_u16(buf: &mut Bytes, field: &'static str) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(truncated(field));
    }
    Ok(buf.get_u16())
}

pub(crate) fn truncated(field: &'static str) -> ProtocolError {
    ProtocolError::MalformedPacket(format!("truncated {field} field"))
}
