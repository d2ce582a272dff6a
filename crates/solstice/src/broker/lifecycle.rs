//! Connection lifecycle: PINGREQ, DISCONNECT and transport loss

use solstice_protocol::Packet;
use tracing::{debug, info};

use super::{Broker, Conn, Outcome};

impl Broker {
    pub(crate) fn handle_pingreq(&mut self, conn: &mut Conn) -> Outcome {
        debug!(client_id = ?conn.client_id(), "received PINGREQ");
        conn.stage(&Packet::PingResp);
        Outcome::Reply
    }

    /// A clean DISCONNECT discards the will; the rest of the teardown runs
    /// in [`Broker::connection_closed`] once the transport drops.
    pub(crate) fn handle_disconnect(&mut self, conn: &mut Conn) -> Outcome {
        if let Some(session) = self.session_mut(conn) {
            debug!(client_id = %session.client_id, "received DISCONNECT");
            session.lwt = None;
        }
        Outcome::Disconnect
    }

    /// Tears down the binding between a connection and its session. Called
    /// by the transport for every close, clean or not; `unexpected` is true
    /// for socket loss, keepalive expiry and protocol violations, and makes
    /// the recorded will message fire.
    pub fn connection_closed(&mut self, conn: &mut Conn, unexpected: bool) {
        let Some(client_id) = conn.client_id.take() else {
            return;
        };
        let Some(session) = self.sessions.get_mut(&client_id) else {
            return;
        };
        // A connection that lost a takeover race must not detach the
        // session that beat it.
        if !session.online || session.conn_id != conn.id {
            return;
        }
        session.detach();

        let will = if unexpected { session.lwt.take() } else { None };
        let clean_session = session.clean_session;
        let subscriptions = if clean_session {
            std::mem::take(&mut session.subscriptions)
        } else {
            Vec::new()
        };

        if clean_session {
            self.sessions.remove(&client_id);
        }
        for name in &subscriptions {
            if let Some(topic) = self.topics.get_mut(name) {
                debug!(%client_id, topic = %name, "removing subscription");
                topic.unsubscribe(&client_id);
            }
        }

        if let Some(will) = will {
            let topic = will.topic.clone();
            info!(%client_id, topic = %topic, "publishing will message");
            self.publish_message(&topic, &will);
        }

        self.stats.client_disconnected();
        info!(%client_id, clean_session, unexpected, "client disconnected");
    }
}
