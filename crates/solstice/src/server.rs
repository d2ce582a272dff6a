//! TCP server plumbing
//!
//! Accepts connections and runs one task per client. The task reads frames
//! into a reused buffer, feeds decoded packets to the shared engine one at
//! a time, flushes whatever the handler staged, and drains the session's
//! outbound channel for frames other connections fanned out to it. The
//! engine lock is held only across a single `handle_command` call; all I/O
//! happens outside it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use solstice_protocol::Packet;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::auth::Credentials;
use crate::broker::{Broker, Conn, Outcome};
use crate::config::BrokerConfig;
use crate::error::Result;
use crate::stats::BrokerStats;

/// Effectively no deadline, for clients that negotiated keepalive 0.
const IDLE_FOREVER: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// The listening broker: accept loop plus the shared command engine.
pub struct Server {
    config: Arc<BrokerConfig>,
    broker: Arc<Mutex<Broker>>,
    stats: Arc<BrokerStats>,
    listener: TcpListener,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Binds the configured address and assembles the engine.
    ///
    /// # Errors
    /// Returns an error if the listener cannot be bound.
    pub async fn bind(config: BrokerConfig, credentials: Credentials) -> Result<Self> {
        let config = Arc::new(config);
        let listener = TcpListener::bind(config.bind_address).await?;
        info!("MQTT broker listening on {}", listener.local_addr()?);

        let stats = Arc::new(BrokerStats::new());
        let broker = Arc::new(Mutex::new(Broker::new(
            Arc::clone(&config),
            credentials,
            Arc::clone(&stats),
        )));
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            broker,
            stats,
            listener,
            shutdown_tx,
        })
    }

    /// The bound address; useful when binding port 0.
    ///
    /// # Errors
    /// Returns an error if the local address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Cloneable handle that stops [`Server::run`] when fired.
    #[must_use]
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Direct handle to the engine, for introspection.
    #[must_use]
    pub fn engine(&self) -> Arc<Mutex<Broker>> {
        Arc::clone(&self.broker)
    }

    /// Runs the accept loop until the shutdown handle fires.
    ///
    /// # Errors
    /// Returns an error if the listener breaks irrecoverably.
    pub async fn run(self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut next_conn_id: u64 = 0;

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            next_conn_id += 1;
                            let conn_id = next_conn_id;
                            debug!(%addr, conn_id, "accepted connection");
                            let broker = Arc::clone(&self.broker);
                            let config = Arc::clone(&self.config);
                            let stats = Arc::clone(&self.stats);
                            let shutdown_rx = self.shutdown_tx.subscribe();
                            tokio::spawn(serve_connection(
                                broker,
                                config,
                                stats,
                                stream,
                                conn_id,
                                shutdown_rx,
                            ));
                        }
                        Err(e) => warn!("accept failed: {e}"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    let snapshot = self.stats.snapshot();
                    info!(
                        connections_total = snapshot.connections_total,
                        messages_received = snapshot.messages_received,
                        messages_sent = snapshot.messages_sent,
                        "shutting down"
                    );
                    return Ok(());
                }
            }
        }
    }
}

/// Keepalive grace: one and a half times the negotiated interval.
fn keepalive_window(keep_alive: u16) -> Duration {
    if keep_alive == 0 {
        IDLE_FOREVER
    } else {
        Duration::from_millis(u64::from(keep_alive) * 1500)
    }
}

async fn serve_connection(
    broker: Arc<Mutex<Broker>>,
    config: Arc<BrokerConfig>,
    stats: Arc<BrokerStats>,
    stream: TcpStream,
    conn_id: u64,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    stream.set_nodelay(true).ok();
    let (mut reader, mut writer) = stream.into_split();

    let (frames_tx, frames_rx) = flume::bounded(config.channel_capacity);
    let mut conn = Conn::new(conn_id, frames_tx);
    let mut read_buf = BytesMut::with_capacity(4096);

    // Until the CONNECT arrives the deadline is the connect grace period.
    let mut idle_window = Duration::from_secs(config.connect_timeout_secs);
    let mut last_inbound = tokio::time::Instant::now();
    let mut unexpected = true;

    'conn: loop {
        let deadline = last_inbound + idle_window;
        tokio::select! {
            read = reader.read_buf(&mut read_buf) => {
                let n = match read {
                    Ok(n) => n,
                    Err(e) => {
                        debug!(conn_id, "read error: {e}");
                        break 'conn;
                    }
                };
                if n == 0 {
                    debug!(conn_id, "connection closed by peer");
                    break 'conn;
                }
                stats.add_bytes_received(n as u64);
                last_inbound = tokio::time::Instant::now();

                if read_buf.len() > config.max_packet_size {
                    warn!(conn_id, "inbound frame exceeds maximum packet size");
                    break 'conn;
                }

                loop {
                    let packet = match Packet::decode(&mut read_buf) {
                        Ok(Some(packet)) => packet,
                        Ok(None) => break,
                        Err(e) => {
                            warn!(conn_id, "malformed packet: {e}");
                            break 'conn;
                        }
                    };
                    if let Packet::Connect(ref connect) = packet {
                        idle_window = keepalive_window(connect.keep_alive);
                    }
                    let clean_close = matches!(packet, Packet::Disconnect);

                    let outcome = broker.lock().handle_command(&mut conn, packet);

                    if let Some(staged) = conn.take_staged() {
                        if let Err(e) = writer.write_all(&staged).await {
                            debug!(conn_id, "write error: {e}");
                            break 'conn;
                        }
                        stats.add_bytes_sent(staged.len() as u64);
                    }

                    match outcome {
                        Outcome::Reply | Outcome::NoReply => {}
                        Outcome::Disconnect => {
                            unexpected = !clean_close;
                            break 'conn;
                        }
                        Outcome::AuthReject(code) => {
                            debug!(conn_id, code = code.as_u8(), "authentication rejected");
                            unexpected = false;
                            break 'conn;
                        }
                    }
                }
            }

            frame = frames_rx.recv_async() => {
                // The channel cannot close while `conn` holds its sender.
                let Ok(frame) = frame else { break 'conn };
                if let Err(e) = writer.write_all(&frame).await {
                    debug!(conn_id, "write error: {e}");
                    break 'conn;
                }
                stats.add_bytes_sent(frame.len() as u64);
                while let Ok(more) = frames_rx.try_recv() {
                    if let Err(e) = writer.write_all(&more).await {
                        debug!(conn_id, "write error: {e}");
                        break 'conn;
                    }
                    stats.add_bytes_sent(more.len() as u64);
                }
            }

            _ = tokio::time::sleep_until(deadline) => {
                warn!(
                    conn_id,
                    client_id = ?conn.client_id(),
                    "keepalive window expired, disconnecting"
                );
                break 'conn;
            }

            _ = shutdown_rx.recv() => {
                unexpected = false;
                break 'conn;
            }
        }
    }

    broker.lock().connection_closed(&mut conn, unexpected);
    writer.shutdown().await.ok();
}
