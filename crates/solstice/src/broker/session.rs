//! Per-client session state
//!
//! A [`Session`] outlives the TCP connection that created it when the
//! client connected with `clean_session = false`; the session table in the
//! engine owns it either way. While online it holds the handoff channel to
//! the connection task; while offline it accumulates queued messages.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use bytes::Bytes;
use solstice_protocol::{Packet, PublishPacket};
use tracing::warn;

use crate::error::{BrokerError, Result};

/// One tracked packet of an unfinished QoS flow.
#[derive(Debug, Clone)]
pub struct InflightEntry {
    pub packet: Packet,
    pub size: usize,
    pub sent_at: Instant,
}

impl InflightEntry {
    #[must_use]
    pub fn new(packet: Packet) -> Self {
        let size = packet.encoded_len();
        Self {
            packet,
            size,
            sent_at: Instant::now(),
        }
    }
}

/// Sparse table of inflight slots keyed by packet id. A slot is in use iff
/// its id is present.
#[derive(Debug, Default)]
pub struct InflightTable {
    slots: HashMap<u16, InflightEntry>,
}

impl InflightTable {
    /// Claims a free slot. An occupied slot is left untouched: a duplicate
    /// flow must not clobber live state. Returns whether the claim took.
    pub fn claim(&mut self, packet_id: u16, entry: InflightEntry) -> bool {
        match self.slots.entry(packet_id) {
            Entry::Vacant(slot) => {
                slot.insert(entry);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    /// Releases a slot, returning its entry. Releasing a free slot is a
    /// no-op, which makes duplicate acks from the peer harmless.
    pub fn release(&mut self, packet_id: u16) -> Option<InflightEntry> {
        self.slots.remove(&packet_id)
    }

    pub fn get_mut(&mut self, packet_id: u16) -> Option<&mut InflightEntry> {
        self.slots.get_mut(&packet_id)
    }

    #[must_use]
    pub fn contains(&self, packet_id: u16) -> bool {
        self.slots.contains_key(&packet_id)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }
}

/// Long-lived per-client record, keyed by client id in the session table.
#[derive(Debug)]
pub struct Session {
    pub client_id: String,
    pub online: bool,
    pub clean_session: bool,
    /// Connection that currently owns the session; stale teardowns from a
    /// connection that lost a takeover race must not detach a live one.
    pub(crate) conn_id: u64,
    outbound: Option<flume::Sender<Bytes>>,
    /// Normalised names of every topic this client is subscribed to, in
    /// subscription order.
    pub(crate) subscriptions: Vec<String>,
    /// Messages queued while offline; only populated when
    /// `clean_session = false`.
    pub(crate) outgoing: VecDeque<PublishPacket>,
    /// Outbound PUBLISH flows awaiting the peer's ack.
    pub(crate) i_msgs: InflightTable,
    /// The ack step this broker owes (or has last sent) per outbound flow.
    pub(crate) i_acks: InflightTable,
    /// Inbound QoS 2 flows awaiting the publisher's PUBREL.
    pub(crate) in_i_acks: InflightTable,
    pub has_inflight: bool,
    pub(crate) lwt: Option<PublishPacket>,
    next_mid: u16,
}

impl Session {
    #[must_use]
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            online: false,
            clean_session: true,
            conn_id: 0,
            outbound: None,
            subscriptions: Vec::new(),
            outgoing: VecDeque::new(),
            i_msgs: InflightTable::default(),
            i_acks: InflightTable::default(),
            in_i_acks: InflightTable::default(),
            has_inflight: false,
            lwt: None,
            next_mid: 1,
        }
    }

    pub(crate) fn attach(&mut self, conn_id: u64, outbound: flume::Sender<Bytes>) {
        self.online = true;
        self.conn_id = conn_id;
        self.outbound = Some(outbound);
    }

    pub(crate) fn detach(&mut self) {
        self.online = false;
        self.outbound = None;
    }

    /// Allocates a packet id not currently tracked by any outbound inflight
    /// slot, advancing a wrap-around counter that never yields zero.
    ///
    /// # Errors
    /// Returns [`BrokerError::PacketIdsExhausted`] when every id is busy.
    pub fn next_free_mid(&mut self) -> Result<u16> {
        for _ in 0..u16::MAX {
            let candidate = self.next_mid;
            self.next_mid = if self.next_mid == u16::MAX {
                1
            } else {
                self.next_mid + 1
            };
            if !self.i_msgs.contains(candidate) && !self.i_acks.contains(candidate) {
                return Ok(candidate);
            }
        }
        Err(BrokerError::PacketIdsExhausted)
    }

    /// Hands a pre-encoded frame to the owning connection task. Returns
    /// false when the session has no usable channel or it is full.
    pub(crate) fn send_frame(&self, frame: Bytes) -> bool {
        let Some(ref outbound) = self.outbound else {
            return false;
        };
        match outbound.try_send(frame) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    client_id = %self.client_id,
                    "outbound channel unavailable, dropping frame: {e}"
                );
                false
            }
        }
    }

    pub(crate) fn track_subscription(&mut self, name: String) {
        if !self.subscriptions.contains(&name) {
            self.subscriptions.push(name);
        }
    }

    pub(crate) fn refresh_has_inflight(&mut self) {
        self.has_inflight =
            !(self.i_msgs.is_empty() && self.i_acks.is_empty() && self.in_i_acks.is_empty());
    }

    #[must_use]
    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    #[must_use]
    pub fn queued_messages(&self) -> usize {
        self.outgoing.len()
    }

    #[must_use]
    pub fn outbound_inflight(&self, packet_id: u16) -> bool {
        self.i_msgs.contains(packet_id)
    }

    #[must_use]
    pub fn inbound_inflight(&self, packet_id: u16) -> bool {
        self.in_i_acks.contains(packet_id)
    }
}
