//! Publish fan-out
//!
//! Materialises one inbound PUBLISH into per-subscriber outbound packets.
//! Each subscriber sees the message at `min(publish QoS, granted QoS)`, so
//! the frame is re-encoded per subscriber: the packet id field exists on
//! the wire only above QoS 0.

use solstice_protocol::{Packet, PubAckPacket, PubRecPacket, PublishPacket, QoS};
use tracing::{debug, error, warn};

use super::{encode_frame, Broker, InflightEntry};

impl Broker {
    /// Delivers `publish` to every current subscriber of `topic`.
    ///
    /// Offline subscribers with a persistent session get the message queued;
    /// offline clean sessions drop it. Online deliveries above QoS 0 claim a
    /// fresh packet id and register the outbound inflight state before the
    /// frame is handed to the owning connection task.
    pub(crate) fn publish_message(&mut self, topic: &str, publish: &PublishPacket) {
        let subscribers: Vec<_> = match self.topics.get(topic) {
            Some(t) => t.subscribers().cloned().collect(),
            None => return,
        };

        for subscriber in subscribers {
            let Some(session) = self.sessions.get_mut(&subscriber.client_id) else {
                // Subscriber entry outlived its session; nothing to do.
                continue;
            };

            let effective_qos = publish.qos.min(subscriber.qos);
            let mut outgoing = publish.clone();
            outgoing.qos = effective_qos;
            outgoing.retain = false;
            outgoing.dup = false;
            outgoing.packet_id = None;

            if !session.online {
                if !session.clean_session {
                    session.outgoing.push_back(outgoing);
                    debug!(
                        client_id = %subscriber.client_id,
                        topic,
                        queued = session.outgoing.len(),
                        "subscriber offline, message queued"
                    );
                }
                continue;
            }

            if effective_qos != QoS::AtMostOnce {
                let mid = match session.next_free_mid() {
                    Ok(mid) => mid,
                    Err(e) => {
                        warn!(
                            client_id = %subscriber.client_id,
                            topic,
                            "skipping delivery: {e}"
                        );
                        continue;
                    }
                };
                outgoing.packet_id = Some(mid);

                session
                    .i_msgs
                    .claim(mid, InflightEntry::new(Packet::Publish(outgoing.clone())));
                let ack = if effective_qos == QoS::AtLeastOnce {
                    Packet::PubAck(PubAckPacket::new(mid))
                } else {
                    Packet::PubRec(PubRecPacket::new(mid))
                };
                session.i_acks.claim(mid, InflightEntry::new(ack));
                session.has_inflight = true;
            }

            let frame = match encode_frame(&Packet::Publish(outgoing.clone())) {
                Ok(frame) => frame,
                Err(e) => {
                    error!(topic, "failed to encode outbound PUBLISH: {e}");
                    continue;
                }
            };

            if session.send_frame(frame) {
                self.stats.message_sent();
                debug!(
                    client_id = %subscriber.client_id,
                    topic,
                    qos = effective_qos.as_u8(),
                    packet_id = ?outgoing.packet_id,
                    payload_len = outgoing.payload.len(),
                    "sending PUBLISH"
                );
            } else if let Some(mid) = outgoing.packet_id {
                // The frame never left; do not leave its flow dangling.
                session.i_msgs.release(mid);
                session.i_acks.release(mid);
                session.refresh_has_inflight();
            }
        }
    }
}
