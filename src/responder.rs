//! Authoritative end of the tunnel
//!
//! The responder sees one query name at a time. It decodes the segment,
//! routes it to the connection's transmission control (creating one on
//! SYN) and returns the CNAME target carrying whatever that connection
//! has to say next. Accepted tunnels are handed to the application as
//! in-memory byte streams; a pump task per connection moves bytes between
//! that stream and the transmission control.

use crate::backlog::SegmentBacklog;
use crate::codec::SegmentCodec;
use crate::segment::{Flags, Segment};
use crate::tc::{Role, TcConfig, TcState, TransmissionControl};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How often the connection table is swept for dead tunnels
const REAP_INTERVAL: Duration = Duration::from_secs(1);

/// Largest read from the application per pump iteration
const PUMP_CHUNK: usize = 4096;

#[derive(Debug, Clone)]
pub struct ResponderConfig {
    pub codec: SegmentCodec,
    pub tc: TcConfig,
    pub idle_timeout: Duration,
    pub closed_linger: Duration,
    pub answer_ttl: u32,
    pub stream_buffer: usize,
}

/// A tunnel opened by a remote initiator
#[derive(Debug)]
pub struct AcceptedTunnel {
    pub conn_id: u16,
    /// Application side of the tunnel; dropping it closes the connection
    pub stream: DuplexStream,
}

type SharedTc = Arc<Mutex<TransmissionControl>>;

struct Connection {
    tc: SharedTc,
    notify: Arc<Notify>,
    last_seen: Instant,
}

struct Table {
    connections: HashMap<u16, Connection>,
    last_reap: Instant,
}

pub struct Responder {
    config: ResponderConfig,
    table: Mutex<Table>,
    accept_tx: mpsc::Sender<AcceptedTunnel>,
    cancel: CancellationToken,
}

fn lock_tc(tc: &SharedTc) -> MutexGuard<'_, TransmissionControl> {
    tc.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Responder {
    pub fn new(config: ResponderConfig, accept_tx: mpsc::Sender<AcceptedTunnel>) -> Self {
        Self {
            config,
            table: Mutex::new(Table {
                connections: HashMap::new(),
                last_reap: Instant::now(),
            }),
            accept_tx,
            cancel: CancellationToken::new(),
        }
    }

    pub fn codec(&self) -> &SegmentCodec {
        &self.config.codec
    }

    pub fn answer_ttl(&self) -> u32 {
        self.config.answer_ttl
    }

    /// Whether `name` is one of our own answers being resolved by a resolver
    pub fn is_chase(&self, name: &str) -> bool {
        let codec = &self.config.codec;
        codec.owns(name) && codec.decode(name).flags.contains(Flags::RESPONSE)
    }

    /// Tunnels currently tracked, including closed ones still lingering
    pub fn connection_count(&self) -> usize {
        self.lock_table().connections.len()
    }

    /// Reset every tunnel and stop all pump tasks
    pub fn shutdown(&self) {
        self.cancel.cancel();
        let now = Instant::now();
        let mut table = self.lock_table();
        for (_, conn) in table.connections.drain() {
            lock_tc(&conn.tc).reset(now);
            conn.notify.notify_one();
        }
    }

    fn lock_table(&self) -> MutexGuard<'_, Table> {
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Answer a query name with the CNAME target of the next outgoing segment
    ///
    /// Returns `None` for names outside the tunnel namespace, or for garbage
    /// that cannot be attributed to any connection.
    pub fn answer(&self, query_name: &str) -> Option<String> {
        let codec = &self.config.codec;
        if !codec.owns(query_name) {
            return None;
        }

        let now = Instant::now();
        let segment = codec.decode(query_name);
        if segment.flags.contains(Flags::RESPONSE) {
            // A resolver chasing one of our own answers
            return None;
        }

        let mut table = self.lock_table();
        if now.duration_since(table.last_reap) >= REAP_INTERVAL {
            table.last_reap = now;
            self.reap(&mut table.connections, now);
        }

        let mut reply = if segment.is_malformed() {
            let id = codec.peek_id(query_name)?;
            let conn = table.connections.get_mut(&id)?;
            conn.last_seen = now;
            let mut tc = lock_tc(&conn.tc);
            tc.record_malformed();
            log::debug!("[Responder] malformed query on connection {:04x}", id);
            tc.keep_alive_segment()
        } else if let Some(conn) = table.connections.get_mut(&segment.id) {
            conn.last_seen = now;
            let reply = {
                let mut tc = lock_tc(&conn.tc);
                tc.receive(segment, now);
                tc.next_response(now)
            };
            conn.notify.notify_one();
            reply
        } else if segment.flags.contains(Flags::SYN) && !segment.flags.contains(Flags::ACK) {
            self.accept(&mut table.connections, segment, now)
        } else {
            log::debug!(
                "[Responder] segment for unknown connection {:04x}, resetting",
                segment.id
            );
            Segment::new(segment.id, Flags::RST, 0, segment.seq, Bytes::new())
        };

        reply.flags.insert(Flags::RESPONSE);
        match codec.encode(&reply) {
            Ok(name) => Some(name),
            Err(e) => {
                log::error!("[Responder] cannot encode reply {:?}: {}", reply, e);
                None
            }
        }
    }

    fn accept(
        &self,
        connections: &mut HashMap<u16, Connection>,
        syn: Segment,
        now: Instant,
    ) -> Segment {
        let id = syn.id;
        let peer_next = syn.seq.wrapping_add(1);
        let mut tc = TransmissionControl::new(
            id,
            Role::Responder,
            self.config.tc.clone(),
            Arc::new(SegmentBacklog::new()),
        );
        tc.receive(syn, now);

        let (app_side, tunnel_side) = tokio::io::duplex(self.config.stream_buffer);
        let tunnel = AcceptedTunnel {
            conn_id: id,
            stream: app_side,
        };
        if let Err(e) = self.accept_tx.try_send(tunnel) {
            log::warn!("[Responder] cannot hand over connection {:04x}: {}", id, e);
            return Segment::new(id, Flags::RST, 0, peer_next, Bytes::new());
        }

        let reply = tc.next_response(now);
        let tc = Arc::new(Mutex::new(tc));
        let notify = Arc::new(Notify::new());
        tokio::spawn(pump(
            Arc::clone(&tc),
            Arc::clone(&notify),
            tunnel_side,
            self.cancel.child_token(),
        ));

        log::info!("[Responder] accepted connection {:04x}", id);
        connections.insert(
            id,
            Connection {
                tc,
                notify,
                last_seen: now,
            },
        );
        reply
    }

    fn reap(&self, connections: &mut HashMap<u16, Connection>, now: Instant) {
        let idle_timeout = self.config.idle_timeout;
        let closed_linger = self.config.closed_linger;

        connections.retain(|id, conn| {
            let idle = now.duration_since(conn.last_seen);
            let mut tc = lock_tc(&conn.tc);
            let keep = match tc.state() {
                TcState::Closed => idle < closed_linger,
                _ => idle < idle_timeout,
            };
            if !keep {
                log::info!(
                    "[Responder] dropping connection {:04x} ({}, idle {:?})",
                    id,
                    tc.state().as_str(),
                    idle
                );
                tc.reset(now);
                conn.notify.notify_one();
            }
            keep
        });
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Move bytes between the application's stream and the transmission control
async fn pump(
    tc: SharedTc,
    notify: Arc<Notify>,
    stream: DuplexStream,
    cancel: CancellationToken,
) {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut buf = vec![0u8; PUMP_CHUNK];
    let mut local_eof = false;
    let mut write_shut = false;

    loop {
        let (received, peer_done, state, capacity) = {
            let mut tc = lock_tc(&tc);
            (
                tc.take_received(),
                tc.peer_finished(),
                tc.state(),
                tc.send_capacity(),
            )
        };

        if let Some(data) = received {
            let written = tokio::select! {
                _ = cancel.cancelled() => {
                    lock_tc(&tc).reset(Instant::now());
                    break;
                }
                written = writer.write_all(&data) => written,
            };
            if let Err(e) = written {
                log::debug!("[Responder] application stream write failed: {}", e);
                local_eof = true;
                lock_tc(&tc).close(Instant::now());
            }
        }
        if peer_done && !write_shut {
            write_shut = true;
            tokio::select! {
                _ = cancel.cancelled() => {
                    lock_tc(&tc).reset(Instant::now());
                    break;
                }
                result = writer.shutdown() => {
                    if let Err(e) = result {
                        log::debug!("[Responder] application stream shutdown failed: {}", e);
                    }
                }
            }
        }
        if state == TcState::Closed {
            break;
        }

        let want = if local_eof { 0 } else { capacity.min(buf.len()) };
        tokio::select! {
            _ = cancel.cancelled() => {
                lock_tc(&tc).reset(Instant::now());
                break;
            }
            _ = notify.notified() => {}
            read = reader.read(&mut buf[..want]), if want > 0 => {
                let mut tc = lock_tc(&tc);
                match read {
                    Ok(0) | Err(_) => {
                        local_eof = true;
                        tc.close(Instant::now());
                    }
                    Ok(n) => {
                        let accepted = tc.write(&buf[..n]);
                        if accepted < n {
                            log::debug!(
                                "[Responder] connection {:04x} closing, discarded {} bytes",
                                tc.id(),
                                n - accepted
                            );
                            local_eof = true;
                        }
                    }
                }
            }
        }
    }

    log::debug!("[Responder] pump finished");
}
