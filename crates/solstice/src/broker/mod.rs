//! The command-handling engine
//!
//! [`Broker`] owns every piece of broker state: the session table, the
//! topic tree with retained messages, and the credential table. One decoded
//! control packet enters through [`Broker::handle_command`] together with
//! the [`Conn`] it arrived on; the handler mutates state, stages reply
//! bytes into the connection's write buffer and reports what the transport
//! should do next through [`Outcome`].
//!
//! Handlers never block and never perform I/O. Frames destined for other
//! connections go through each session's handoff channel; the owning task
//! writes them out.

mod connect;
mod fanout;
mod lifecycle;
mod publish;
mod session;
mod subscribe;

pub use session::{InflightEntry, InflightTable, Session};

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use solstice_protocol::{Packet, PacketType};
use tracing::{error, warn};

use crate::auth::Credentials;
use crate::config::BrokerConfig;
use crate::stats::BrokerStats;
use crate::topics::{Topic, TopicTree};

/// What the transport must do after a handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Bytes were staged; flush them to the peer.
    Reply,
    /// Nothing to send.
    NoReply,
    /// Protocol violation or clean DISCONNECT; tear the transport down.
    Disconnect,
    /// CONNECT was refused; flush the staged CONNACK, then close.
    AuthReject(solstice_protocol::ConnectReturnCode),
}

/// Connection-side state, owned by the transport task that accepted the
/// socket. The engine stages reply bytes into `wbuf`; the task flushes
/// them. Before a successful CONNECT the connection is anonymous
/// (`client_id` is `None`) and only CONNECT is accepted from it.
#[derive(Debug)]
pub struct Conn {
    pub(crate) id: u64,
    pub(crate) client_id: Option<String>,
    wbuf: BytesMut,
    pub(crate) frames: flume::Sender<Bytes>,
}

impl Conn {
    #[must_use]
    pub fn new(id: u64, frames: flume::Sender<Bytes>) -> Self {
        Self {
            id,
            client_id: None,
            wbuf: BytesMut::with_capacity(4096),
            frames,
        }
    }

    #[must_use]
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Encodes a packet into the staging buffer. Encoding our own outbound
    /// packets only fails on length-field overflow, which would be an
    /// engine bug; it is logged rather than propagated.
    pub(crate) fn stage(&mut self, packet: &Packet) {
        if let Err(e) = packet.encode(&mut self.wbuf) {
            error!(packet_type = ?packet.packet_type(), "failed to stage packet: {e}");
        }
    }

    /// Appends pre-encoded bytes (retained messages) to the staging buffer.
    pub(crate) fn stage_raw(&mut self, frame: &[u8]) {
        self.wbuf.extend_from_slice(frame);
    }

    /// Takes everything staged so far for flushing.
    pub fn take_staged(&mut self) -> Option<Bytes> {
        if self.wbuf.is_empty() {
            None
        } else {
            Some(self.wbuf.split().freeze())
        }
    }

    #[must_use]
    pub fn staged_len(&self) -> usize {
        self.wbuf.len()
    }
}

/// Broker state and the per-packet state machine over it.
pub struct Broker {
    config: Arc<BrokerConfig>,
    credentials: Credentials,
    stats: Arc<BrokerStats>,
    pub(crate) sessions: HashMap<String, Session>,
    pub(crate) topics: TopicTree,
}

impl Broker {
    #[must_use]
    pub fn new(config: Arc<BrokerConfig>, credentials: Credentials, stats: Arc<BrokerStats>) -> Self {
        Self {
            config,
            credentials,
            stats,
            sessions: HashMap::new(),
            topics: TopicTree::new(),
        }
    }

    /// Dispatches one decoded packet from `conn` to its handler.
    pub fn handle_command(&mut self, conn: &mut Conn, packet: Packet) -> Outcome {
        if conn.client_id.is_none() && packet.packet_type() != PacketType::Connect {
            warn!(
                packet_type = ?packet.packet_type(),
                "packet before CONNECT, disconnecting"
            );
            return Outcome::Disconnect;
        }

        match packet {
            Packet::Connect(connect) => self.handle_connect(conn, *connect),
            Packet::Publish(publish) => self.handle_publish(conn, publish),
            Packet::PubAck(ack) => self.handle_puback(conn, &ack),
            Packet::PubRec(ack) => self.handle_pubrec(conn, &ack),
            Packet::PubRel(ack) => self.handle_pubrel(conn, &ack),
            Packet::PubComp(ack) => self.handle_pubcomp(conn, &ack),
            Packet::Subscribe(subscribe) => self.handle_subscribe(conn, subscribe),
            Packet::Unsubscribe(unsubscribe) => self.handle_unsubscribe(conn, unsubscribe),
            Packet::PingReq => self.handle_pingreq(conn),
            Packet::Disconnect => self.handle_disconnect(conn),
            Packet::ConnAck(_) | Packet::SubAck(_) | Packet::UnsubAck(_) | Packet::PingResp => {
                warn!(
                    packet_type = ?packet.packet_type(),
                    "server-side packet type from a client, disconnecting"
                );
                Outcome::Disconnect
            }
        }
    }

    pub(crate) fn session_mut(&mut self, conn: &Conn) -> Option<&mut Session> {
        self.sessions.get_mut(conn.client_id.as_deref()?)
    }

    /// Looks a session up by client id.
    #[must_use]
    pub fn session(&self, client_id: &str) -> Option<&Session> {
        self.sessions.get(client_id)
    }

    /// Looks a topic up by its normalised name.
    #[must_use]
    pub fn topic(&self, name: &str) -> Option<&Topic> {
        self.topics.get(name)
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn stats(&self) -> &BrokerStats {
        &self.stats
    }
}

/// Encodes a packet into a standalone frame.
pub(crate) fn encode_frame(packet: &Packet) -> solstice_protocol::Result<Bytes> {
    let mut buf = BytesMut::with_capacity(packet.encoded_len());
    packet.encode(&mut buf)?;
    Ok(buf.freeze())
}
