use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while encoding or decoding MQTT v3.1.1 packets.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("invalid packet type: {0}")]
    InvalidPacketType(u8),

    #[error("invalid QoS value: {0}")]
    InvalidQoS(u8),

    #[error("invalid fixed-header flags 0x{flags:02x} for {packet}")]
    InvalidFlags { packet: &'static str, flags: u8 },

    #[error("remaining length exceeds protocol maximum")]
    RemainingLengthTooLarge,

    #[error("packet of {size} bytes exceeds maximum of {max}")]
    PacketTooLarge { size: usize, max: usize },

    #[error("invalid UTF-8 in {0} field")]
    InvalidUtf8(&'static str),

    #[error("unsupported protocol revision: {0}")]
    UnsupportedProtocolVersion(u8),
}
