//! SUBSCRIBE and UNSUBSCRIBE handling

use solstice_protocol::{Packet, SubAckPacket, SubscribePacket, UnsubAckPacket, UnsubscribePacket};
use tracing::debug;

use super::{Broker, Conn, Outcome};
use crate::topics::{normalize_filter, Subscription};

impl Broker {
    /// Installs each requested filter, replaying retained messages ahead of
    /// the SUBACK. A trailing `/#` expands over every topic currently below
    /// the prefix by sharing a single subscription record across them.
    pub(crate) fn handle_subscribe(&mut self, conn: &mut Conn, subscribe: SubscribePacket) -> Outcome {
        let Some(client_id) = conn.client_id.clone() else {
            return Outcome::Disconnect;
        };
        debug!(%client_id, filters = subscribe.filters.len(), "received SUBSCRIBE");

        let mut granted = Vec::with_capacity(subscribe.filters.len());
        let mut installed = Vec::new();

        for filter in &subscribe.filters {
            let (name, wildcard) = normalize_filter(&filter.filter);
            debug!(topic = %name, qos = filter.qos.as_u8(), wildcard, "subscribing");

            if wildcard {
                let shared = Subscription::new(client_id.clone(), filter.qos);
                self.topics.for_each_descendant(&name, |topic| {
                    topic.subscribe(shared.clone());
                    if let Some(ref retained) = topic.retained {
                        conn.stage_raw(retained);
                    }
                    installed.push(topic.name.clone());
                });
            }

            let topic = self.topics.get_or_create(&name);
            topic.subscribe(Subscription::new(client_id.clone(), filter.qos));
            if let Some(ref retained) = topic.retained {
                conn.stage_raw(retained);
            }
            installed.push(name);

            // Granted QoS mirrors the request; no downgrade policy.
            granted.push(filter.qos);
        }

        if let Some(session) = self.sessions.get_mut(&client_id) {
            for name in installed {
                session.track_subscription(name);
            }
        }

        conn.stage(&Packet::SubAck(SubAckPacket::new(
            subscribe.packet_id,
            granted,
        )));
        debug!(%client_id, "sending SUBACK");
        Outcome::Reply
    }

    pub(crate) fn handle_unsubscribe(
        &mut self,
        conn: &mut Conn,
        unsubscribe: UnsubscribePacket,
    ) -> Outcome {
        let Some(client_id) = conn.client_id.clone() else {
            return Outcome::Disconnect;
        };
        debug!(%client_id, "received UNSUBSCRIBE");

        let mut removed = Vec::new();
        for filter in &unsubscribe.filters {
            let (name, wildcard) = normalize_filter(filter);
            if wildcard {
                self.topics.for_each_descendant(&name, |topic| {
                    if topic.unsubscribe(&client_id) {
                        removed.push(topic.name.clone());
                    }
                });
            }
            if let Some(topic) = self.topics.get_mut(&name) {
                if topic.unsubscribe(&client_id) {
                    removed.push(name);
                }
            }
        }

        if let Some(session) = self.sessions.get_mut(&client_id) {
            session.subscriptions.retain(|name| !removed.contains(name));
        }

        conn.stage(&Packet::UnsubAck(UnsubAckPacket::new(unsubscribe.packet_id)));
        debug!(%client_id, "sending UNSUBACK");
        Outcome::Reply
    }
}
