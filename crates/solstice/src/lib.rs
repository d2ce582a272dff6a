//! solstice — a lightweight MQTT v3.1.1 broker
//!
//! The crate is split along the same seam as the wire protocol: the
//! [`broker`] module holds the per-packet command engine that owns all
//! broker state (sessions, the topic tree, retained messages, inflight
//! tables), while [`server`] is the tokio plumbing that feeds it decoded
//! packets and flushes whatever the handlers staged.
//!
//! Handlers are synchronous and run to completion; a connection task locks
//! the engine for exactly one packet at a time. Delivery to *other*
//! connections never touches their buffers directly: the engine hands
//! pre-encoded frames to the owning task through a channel.

pub mod auth;
pub mod broker;
pub mod config;
pub mod error;
pub mod server;
pub mod stats;
pub mod topics;

pub use auth::Credentials;
pub use broker::{Broker, Conn, Outcome};
pub use config::BrokerConfig;
pub use error::{BrokerError, Result};
pub use server::Server;
pub use stats::BrokerStats;
