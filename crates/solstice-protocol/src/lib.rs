//! MQTT v3.1.1 wire protocol implementation
//!
//! Packet types, fixed-header framing and the encode/decode routines shared
//! by the solstice broker and its test clients. The codec is transport
//! agnostic: it works on [`bytes`] buffers and leaves all I/O to the caller.

pub mod error;
pub mod packet;
pub mod types;

pub use error::{ProtocolError, Result};
pub use packet::ack::{PubAckPacket, PubCompPacket, PubRecPacket, PubRelPacket};
pub use packet::connect::{ConnAckPacket, ConnectPacket, LastWill};
pub use packet::publish::PublishPacket;
pub use packet::subscribe::{
    SubAckPacket, SubscribePacket, TopicFilter, UnsubAckPacket, UnsubscribePacket,
};
pub use packet::{FixedHeader, Packet};
pub use types::{ConnectReturnCode, PacketType, QoS};
