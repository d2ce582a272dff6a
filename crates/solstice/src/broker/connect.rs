//! CONNECT handling and session setup

use std::time::{SystemTime, UNIX_EPOCH};

use solstice_protocol::{
    ConnAckPacket, ConnectPacket, ConnectReturnCode, Packet, PubAckPacket, PubRecPacket,
    PublishPacket, QoS,
};
use tracing::{debug, error, info, warn};

use super::{encode_frame, Broker, Conn, InflightEntry, Outcome, Session};
use crate::topics::normalize_topic;

/// Synthesised client ids carry the broker prefix plus a monotonic
/// nanosecond timestamp, so concurrent anonymous clients stay distinct.
fn generate_client_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("sol-{nanos}")
}

impl Broker {
    pub(crate) fn handle_connect(&mut self, conn: &mut Conn, connect: ConnectPacket) -> Outcome {
        // A second CONNECT on a live connection is a protocol violation.
        if conn.client_id.is_some() {
            info!(
                client_id = %connect.client_id,
                "double CONNECT on a live connection, disconnecting"
            );
            return Outcome::Disconnect;
        }

        if !self.config.allow_anonymous {
            let authenticated = match (&connect.username, &connect.password) {
                (Some(username), Some(password)) => self.credentials.verify(username, password),
                _ => false,
            };
            if !authenticated {
                debug!(
                    client_id = %connect.client_id,
                    "sending CONNACK rc={}",
                    ConnectReturnCode::BadUsernameOrPassword.as_u8()
                );
                conn.stage(&Packet::ConnAck(ConnAckPacket::new(
                    false,
                    ConnectReturnCode::BadUsernameOrPassword,
                )));
                return Outcome::AuthReject(ConnectReturnCode::BadUsernameOrPassword);
            }
        }

        // An unnamed client cannot resume a session: there is nothing to
        // key the resumption on.
        if connect.client_id.is_empty() && !connect.clean_session {
            debug!(
                "sending CONNACK rc={}",
                ConnectReturnCode::NotAuthorized.as_u8()
            );
            conn.stage(&Packet::ConnAck(ConnAckPacket::new(
                false,
                ConnectReturnCode::NotAuthorized,
            )));
            return Outcome::AuthReject(ConnectReturnCode::NotAuthorized);
        }

        let client_id = if connect.client_id.is_empty() {
            generate_client_id()
        } else {
            connect.client_id.clone()
        };

        if self.sessions.get(&client_id).is_some_and(|s| s.online) {
            info!(
                %client_id,
                "CONNECT for a client id already online, disconnecting the new connection"
            );
            return Outcome::Disconnect;
        }

        let session = self
            .sessions
            .entry(client_id.clone())
            .or_insert_with(|| Session::new(client_id.clone()));
        session.clean_session = connect.clean_session;
        session.attach(conn.id, conn.frames.clone());

        let mut stale_subscriptions = Vec::new();
        if connect.clean_session {
            // A clean start drops whatever the previous incarnation left.
            stale_subscriptions = std::mem::take(&mut session.subscriptions);
            session.outgoing.clear();
        } else {
            // Resume: flush messages queued while offline, oldest first,
            // ahead of the CONNACK and any new traffic.
            let queued: Vec<PublishPacket> = session.outgoing.drain(..).collect();
            for mut publish in queued {
                if publish.qos != QoS::AtMostOnce {
                    let mid = match session.next_free_mid() {
                        Ok(mid) => mid,
                        Err(e) => {
                            warn!(%client_id, "dropping queued message: {e}");
                            continue;
                        }
                    };
                    publish.packet_id = Some(mid);
                    let packet = Packet::Publish(publish);
                    session.i_msgs.claim(mid, InflightEntry::new(packet.clone()));
                    let ack = match packet {
                        Packet::Publish(ref p) if p.qos == QoS::AtLeastOnce => {
                            Packet::PubAck(PubAckPacket::new(mid))
                        }
                        _ => Packet::PubRec(PubRecPacket::new(mid)),
                    };
                    session.i_acks.claim(mid, InflightEntry::new(ack));
                    session.has_inflight = true;
                    conn.stage(&packet);
                } else {
                    conn.stage(&Packet::Publish(publish));
                }
            }
        }

        for name in stale_subscriptions {
            if let Some(topic) = self.topics.get_mut(&name) {
                topic.unsubscribe(&client_id);
            }
        }

        if let Some(ref will) = connect.will {
            let will_topic = normalize_topic(&will.topic);
            let mut lwt = PublishPacket::new(will_topic.clone(), will.payload.clone());
            lwt.qos = will.qos;
            lwt.retain = will.retain;

            let topic = self.topics.get_or_create(&will_topic);
            if will.retain {
                // Pre-encode the will so it is ready to replay to future
                // subscribers. A QoS > 0 will gets a placeholder id here;
                // live deliveries allocate their own.
                let mut frame = lwt.clone();
                if frame.qos != QoS::AtMostOnce {
                    frame.packet_id = Some(0);
                }
                match encode_frame(&Packet::Publish(frame)) {
                    Ok(encoded) => topic.retained = Some(encoded),
                    Err(e) => error!(topic = %will_topic, "failed to encode retained will: {e}"),
                }
            }

            info!(
                %client_id,
                topic = %will_topic,
                qos = will.qos.as_u8(),
                retain = will.retain,
                payload_len = will.payload.len(),
                "will message recorded"
            );
            if let Some(session) = self.sessions.get_mut(&client_id) {
                session.lwt = Some(lwt);
            }
        }

        conn.stage(&Packet::ConnAck(ConnAckPacket::new(
            false,
            ConnectReturnCode::Accepted,
        )));
        conn.client_id = Some(client_id.clone());
        self.stats.client_connected();

        info!(
            %client_id,
            clean_session = connect.clean_session,
            keep_alive = connect.keep_alive,
            "new client connected"
        );
        Outcome::Reply
    }
}
