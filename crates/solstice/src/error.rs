use solstice_protocol::ProtocolError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrokerError>;

/// Broker-level error type.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("password hashing failed: {0}")]
    PasswordHash(String),

    /// All 65 535 packet identifiers of a session are busy. Callers drop
    /// the delivery that needed the id rather than corrupt a live slot.
    #[error("packet identifier space exhausted")]
    PacketIdsExhausted,
}
