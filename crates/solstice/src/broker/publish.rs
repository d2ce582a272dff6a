//! PUBLISH handling and the QoS acknowledgement flows

use std::time::Instant;

use solstice_protocol::{
    Packet, PubAckPacket, PubCompPacket, PubRecPacket, PubRelPacket, PublishPacket, QoS,
};
use tracing::{debug, error};

use super::{encode_frame, Broker, Conn, InflightEntry, Outcome};
use crate::topics::normalize_topic;

impl Broker {
    pub(crate) fn handle_publish(&mut self, conn: &mut Conn, publish: PublishPacket) -> Outcome {
        let Some(client_id) = conn.client_id.clone() else {
            return Outcome::Disconnect;
        };
        self.stats.message_received();
        debug!(
            %client_id,
            topic = %publish.topic,
            qos = publish.qos.as_u8(),
            retain = publish.retain,
            packet_id = ?publish.packet_id,
            payload_len = publish.payload.len(),
            "received PUBLISH"
        );

        let name = normalize_topic(&publish.topic);
        let mut message = publish.clone();
        message.topic = name.clone();

        let topic = self.topics.get_or_create(&name);
        if publish.retain {
            if publish.payload.is_empty() {
                // An empty retained payload clears the slot (§3.3.1.3).
                topic.retained = None;
                debug!(topic = %name, "retained message cleared");
            } else {
                match encode_frame(&Packet::Publish(message.clone())) {
                    Ok(frame) => {
                        topic.retained = Some(frame);
                        debug!(topic = %name, "retained message stored");
                    }
                    Err(e) => error!(topic = %name, "failed to encode retained message: {e}"),
                }
            }
        }

        self.publish_message(&name, &message);

        match publish.qos {
            QoS::AtMostOnce => Outcome::NoReply,
            QoS::AtLeastOnce => {
                let Some(packet_id) = publish.packet_id else {
                    return Outcome::Disconnect;
                };
                conn.stage(&Packet::PubAck(PubAckPacket::new(packet_id)));
                debug!(%client_id, packet_id, "sending PUBACK");
                Outcome::Reply
            }
            QoS::ExactlyOnce => {
                let Some(packet_id) = publish.packet_id else {
                    return Outcome::Disconnect;
                };
                if let Some(session) = self.sessions.get_mut(&client_id) {
                    // The broker now owes the publisher the rest of the
                    // QoS 2 receive side; remember it until the PUBREL.
                    session.in_i_acks.claim(
                        packet_id,
                        InflightEntry::new(Packet::PubRec(PubRecPacket::new(packet_id))),
                    );
                    session.has_inflight = true;
                }
                conn.stage(&Packet::PubRec(PubRecPacket::new(packet_id)));
                debug!(%client_id, packet_id, "sending PUBREC");
                Outcome::Reply
            }
        }
    }

    /// Completes an outbound QoS 1 flow.
    pub(crate) fn handle_puback(&mut self, conn: &mut Conn, ack: &PubAckPacket) -> Outcome {
        let Some(session) = self.session_mut(conn) else {
            return Outcome::Disconnect;
        };
        debug!(
            client_id = %session.client_id,
            packet_id = ack.packet_id,
            "received PUBACK"
        );
        if session.i_msgs.release(ack.packet_id).is_none() {
            debug!(packet_id = ack.packet_id, "PUBACK for an id not inflight, ignoring");
        }
        session.i_acks.release(ack.packet_id);
        session.refresh_has_inflight();
        Outcome::NoReply
    }

    /// Advances an outbound QoS 2 flow from awaiting-PUBREC to
    /// awaiting-PUBCOMP by answering with PUBREL.
    pub(crate) fn handle_pubrec(&mut self, conn: &mut Conn, ack: &PubRecPacket) -> Outcome {
        let Some(session) = self.session_mut(conn) else {
            return Outcome::Disconnect;
        };
        debug!(
            client_id = %session.client_id,
            packet_id = ack.packet_id,
            "received PUBREC"
        );
        if let Some(entry) = session.i_acks.get_mut(ack.packet_id) {
            entry.packet = Packet::PubRel(PubRelPacket::new(ack.packet_id));
            entry.sent_at = Instant::now();
        }
        conn.stage(&Packet::PubRel(PubRelPacket::new(ack.packet_id)));
        debug!(packet_id = ack.packet_id, "sending PUBREL");
        Outcome::Reply
    }

    /// Completes an inbound QoS 2 flow. The message itself was delivered to
    /// subscribers when the PUBLISH arrived; this only settles the ack.
    pub(crate) fn handle_pubrel(&mut self, conn: &mut Conn, ack: &PubRelPacket) -> Outcome {
        let Some(session) = self.session_mut(conn) else {
            return Outcome::Disconnect;
        };
        debug!(
            client_id = %session.client_id,
            packet_id = ack.packet_id,
            "received PUBREL"
        );
        if session.in_i_acks.release(ack.packet_id).is_none() {
            debug!(packet_id = ack.packet_id, "PUBREL for an id not inflight, ignoring");
        }
        session.refresh_has_inflight();
        conn.stage(&Packet::PubComp(PubCompPacket::new(ack.packet_id)));
        debug!(packet_id = ack.packet_id, "sending PUBCOMP");
        Outcome::Reply
    }

    /// Completes an outbound QoS 2 flow.
    pub(crate) fn handle_pubcomp(&mut self, conn: &mut Conn, ack: &PubCompPacket) -> Outcome {
        let Some(session) = self.session_mut(conn) else {
            return Outcome::Disconnect;
        };
        debug!(
            client_id = %session.client_id,
            packet_id = ack.packet_id,
            "received PUBCOMP"
        );
        session.i_acks.release(ack.packet_id);
        if session.i_msgs.release(ack.packet_id).is_none() {
            debug!(packet_id = ack.packet_id, "PUBCOMP for an id not inflight, ignoring");
        }
        session.refresh_has_inflight();
        Outcome::NoReply
    }
}
