//! Proxied connection driver
//!
//! Binds one local byte stream to one initiator-side transmission control
//! and runs the query pump: pop a segment, resolve it, feed the answer back,
//! pace the next round. Exactly one DNS query is in flight per connection.

use crate::backlog::SegmentBacklog;
use crate::codec::SegmentCodec;
use crate::config::TunnelConfig;
use crate::resolver::{FaultInjector, ResolveError, Resolver};
use crate::tc::{Role, TcState, TcStats, TransmissionControl};
use crate::timing::Pacing;
use crate::{Result, TunnelError};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Chunks buffered between the endpoint reader task and the loop
const APP_CHANNEL_DEPTH: usize = 8;

/// Largest single read from the local endpoint
const APP_READ_CHUNK: usize = 4096;

/// What one pass of the transport loop achieved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoundOutcome {
    /// Nothing was queued
    Idle,
    /// Query answered, but no application data arrived
    Sent,
    /// Query answered with fresh application data
    Delivered,
    /// Timeout, resolver error, unusable answer or injected drop
    QueryFailed,
    /// Connection reached its terminal state
    Finished,
}

/// How long to pause after a round; `None` runs the next round at once
///
/// Idle and failed rounds always wait out the busy-wait interval, even with
/// more segments queued.
fn pause_after(
    outcome: RoundOutcome,
    queued: bool,
    pacing: Pacing,
    busy_wait: Duration,
) -> Option<Duration> {
    match outcome {
        RoundOutcome::Finished => None,
        RoundOutcome::Idle | RoundOutcome::QueryFailed => Some(busy_wait),
        _ if queued => None,
        RoundOutcome::Delivered => Some(pacing.ack_delay),
        RoundOutcome::Sent => Some(pacing.keepalive_interval),
    }
}

/// Why the pause between rounds ended
enum Wake {
    Timer,
    Cancelled,
    Stop,
    App(Option<Bytes>),
}

/// A local endpoint waiting to be tunneled
pub struct ProxiedConnection<E> {
    conn_id: u16,
    codec: SegmentCodec,
    config: TunnelConfig,
    resolver: Arc<dyn Resolver>,
    injector: Arc<dyn FaultInjector>,
    endpoint: E,
    cancel: CancellationToken,
}

impl<E> ProxiedConnection<E>
where
    E: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        config: &TunnelConfig,
        conn_id: u16,
        resolver: Arc<dyn Resolver>,
        injector: Arc<dyn FaultInjector>,
        endpoint: E,
    ) -> Result<Self> {
        config.validate().map_err(TunnelError::InvalidConfig)?;
        let codec = config.codec()?;

        Ok(Self {
            conn_id,
            codec,
            config: config.clone(),
            resolver,
            injector,
            endpoint,
            cancel: CancellationToken::new(),
        })
    }

    pub fn conn_id(&self) -> u16 {
        self.conn_id
    }

    /// Token that aborts the connection, including a pending `start()`
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Open the tunnel and wait until it is established
    pub async fn start(self) -> Result<ConnectionHandle> {
        let conn_id = self.conn_id;
        let handshake_timeout = self.config.transport.handshake_timeout;
        let cancel = self.cancel.clone();
        let stop = CancellationToken::new();

        let mut tc = TransmissionControl::new(
            conn_id,
            Role::Initiator,
            self.config.tc_config(&self.codec),
            Arc::new(SegmentBacklog::new()),
        );
        tc.open(Instant::now());

        let (state_tx, mut state_rx) = watch::channel(tc.state());
        let (reader, writer) = tokio::io::split(self.endpoint);
        let (app_tx, app_rx) = mpsc::channel(APP_CHANNEL_DEPTH);
        let reader_task = tokio::spawn(read_endpoint(reader, app_tx, cancel.child_token()));

        let driver = Driver {
            tc,
            codec: self.codec,
            resolver: self.resolver,
            injector: self.injector,
            writer,
            app_rx,
            app_open: true,
            pending_app: None,
            undelivered: None,
            write_shut: false,
            state_tx,
            cancel: cancel.clone(),
            stop: stop.clone(),
            busy_wait: self.config.transport.busy_wait_interval,
            linger: self.config.transport.linger,
        };
        let task = tokio::spawn(async move {
            let stats = driver.run().await;
            reader_task.abort();
            stats
        });

        log::info!("[Conn {:04x}] opening tunnel", conn_id);
        let handshake = async {
            loop {
                let state = *state_rx.borrow_and_update();
                match state {
                    TcState::Established | TcState::Closing => return Ok(()),
                    TcState::Closed => return Err(TunnelError::HandshakeFailed(conn_id)),
                    TcState::SynSent | TcState::SynReceived => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(TunnelError::HandshakeFailed(conn_id));
                }
            }
        };

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(TunnelError::Cancelled),
            result = tokio::time::timeout(handshake_timeout, handshake) => match result {
                Ok(result) => result,
                Err(_) => Err(TunnelError::HandshakeTimeout(handshake_timeout)),
            },
        };

        match outcome {
            Ok(()) => {
                log::info!("[Conn {:04x}] established", conn_id);
                Ok(ConnectionHandle {
                    conn_id,
                    state_rx,
                    stop,
                    cancel,
                    task,
                })
            }
            Err(e) => {
                log::warn!("[Conn {:04x}] handshake failed: {}", conn_id, e);
                cancel.cancel();
                let _ = task.await;
                Err(e)
            }
        }
    }
}

/// Control over a running tunnel
pub struct ConnectionHandle {
    conn_id: u16,
    state_rx: watch::Receiver<TcState>,
    stop: CancellationToken,
    cancel: CancellationToken,
    task: JoinHandle<TcStats>,
}

impl ConnectionHandle {
    pub fn conn_id(&self) -> u16 {
        self.conn_id
    }

    pub fn state(&self) -> TcState {
        *self.state_rx.borrow()
    }

    /// Close gracefully once queued data has been delivered
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Abort immediately
    pub fn kill(&self) {
        self.cancel.cancel();
    }

    /// Wait for the driver to exit and collect its counters
    pub async fn wait(self) -> Result<TcStats> {
        Ok(self.task.await?)
    }
}

struct Driver<E> {
    tc: TransmissionControl,
    codec: SegmentCodec,
    resolver: Arc<dyn Resolver>,
    injector: Arc<dyn FaultInjector>,
    writer: WriteHalf<E>,
    app_rx: mpsc::Receiver<Bytes>,
    app_open: bool,
    /// Application bytes the TC could not take yet
    pending_app: Option<Bytes>,
    /// Decoded bytes the endpoint refused last time
    undelivered: Option<Bytes>,
    write_shut: bool,
    state_tx: watch::Sender<TcState>,
    cancel: CancellationToken,
    stop: CancellationToken,
    busy_wait: Duration,
    linger: Duration,
}

impl<E> Driver<E>
where
    E: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn run(mut self) -> TcStats {
        let id = self.tc.id();
        let mut stopping = false;

        loop {
            let now = Instant::now();
            self.feed_application(now);
            if !stopping && self.stop.is_cancelled() {
                stopping = true;
                log::debug!("[Conn {:04x}] stop requested", id);
                self.tc.close(now);
            }
            self.tc.tick(now);
            self.publish_state();

            let outcome = if self.tc.state() == TcState::Closed {
                RoundOutcome::Finished
            } else {
                self.round().await
            };
            self.flush_endpoint().await;
            self.publish_state();

            if outcome == RoundOutcome::Finished
                || self.cancel.is_cancelled()
                || self.tc.state() == TcState::Closed
            {
                break;
            }
            let queued = !self.tc.backlog().is_empty();
            let Some(wait) = pause_after(outcome, queued, self.tc.pacing(), self.busy_wait) else {
                continue;
            };

            match self.pause(wait, stopping).await {
                Wake::Cancelled => break,
                Wake::Timer | Wake::Stop => {}
                Wake::App(chunk) => self.accept_application(chunk),
            }
        }

        if self.cancel.is_cancelled() {
            log::info!("[Conn {:04x}] killed", id);
            self.tc.reset(Instant::now());
        } else {
            self.linger().await;
        }
        self.publish_state();

        let stats = self.tc.stats();
        log::info!(
            "[Conn {:04x}] closed: {} bytes out, {} bytes in, {} retransmissions",
            id,
            stats.bytes_sent,
            stats.bytes_received,
            stats.retransmissions
        );
        stats
    }

    /// One DNS round trip for the next queued segment
    async fn round(&mut self) -> RoundOutcome {
        let Some(segment) = self.tc.backlog().pop() else {
            return RoundOutcome::Idle;
        };
        let segment = self.tc.stamp(segment);
        let id = self.tc.id();

        let name = match self.codec.encode(&segment) {
            Ok(name) => name,
            Err(e) => {
                log::error!("[Conn {:04x}] cannot encode {:?}: {}", id, segment, e);
                return RoundOutcome::QueryFailed;
            }
        };

        let answer = tokio::select! {
            _ = self.cancel.cancelled() => return RoundOutcome::Finished,
            answer = self.resolver.lookup_cname(&name) => answer,
        };
        let answer = match answer {
            Ok(_) if self.injector.should_drop() => Err(ResolveError::Dropped),
            other => other,
        };

        let target = match answer {
            Ok(target) => target,
            Err(e) => {
                log::debug!("[Conn {:04x}] query failed: {}", id, e);
                self.tc.increase_timing_interval();
                return RoundOutcome::QueryFailed;
            }
        };

        let incoming = self.codec.decode(&target);
        if incoming.is_malformed() {
            log::debug!("[Conn {:04x}] discarding malformed answer", id);
            self.tc.record_malformed();
            self.tc.increase_timing_interval();
            return RoundOutcome::Sent;
        }

        let keep_alive = incoming.is_keep_alive();
        let fresh = self.tc.receive(incoming, Instant::now());
        if keep_alive {
            self.tc.increase_timing_interval();
        } else {
            self.tc.decrease_timing_interval();
        }

        if self.tc.state() == TcState::Closed {
            RoundOutcome::Finished
        } else if fresh {
            RoundOutcome::Delivered
        } else {
            RoundOutcome::Sent
        }
    }

    /// Write decoded bytes out to the local endpoint
    async fn flush_endpoint(&mut self) {
        let data = match self.undelivered.take() {
            Some(mut held) => {
                if let Some(more) = self.tc.take_received() {
                    let mut joined = held.to_vec();
                    joined.extend_from_slice(&more);
                    held = Bytes::from(joined);
                }
                Some(held)
            }
            None => self.tc.take_received(),
        };

        let writer = &mut self.writer;
        let cancel = &self.cancel;

        if let Some(data) = data {
            let written = tokio::select! {
                _ = cancel.cancelled() => None,
                written = async {
                    writer.write_all(&data).await?;
                    writer.flush().await
                } => Some(written),
            };
            match written {
                Some(Ok(())) => {}
                Some(Err(e)) => {
                    log::warn!("[Conn {:04x}] local endpoint write failed: {}", self.tc.id(), e);
                    self.tc.increase_timing_interval();
                    self.undelivered = Some(data);
                    return;
                }
                None => {
                    self.undelivered = Some(data);
                    return;
                }
            }
        }

        if self.tc.peer_finished() && !self.write_shut {
            self.write_shut = true;
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = writer.shutdown() => {
                    if let Err(e) = result {
                        log::debug!("[Conn {:04x}] local endpoint shutdown failed: {}", self.tc.id(), e);
                    }
                }
            }
        }
    }

    /// Move whatever the endpoint has produced into the TC without waiting
    fn feed_application(&mut self, now: Instant) {
        if let Some(pending) = self.pending_app.take() {
            self.push_to_tc(pending);
        }
        while self.app_open && self.pending_app.is_none() && self.tc.send_capacity() > 0 {
            match self.app_rx.try_recv() {
                Ok(chunk) => self.push_to_tc(chunk),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.app_open = false;
                    log::debug!("[Conn {:04x}] local endpoint closed", self.tc.id());
                    self.tc.close(now);
                }
            }
        }
    }

    fn accept_application(&mut self, chunk: Option<Bytes>) {
        match chunk {
            Some(chunk) => self.push_to_tc(chunk),
            None => {
                self.app_open = false;
                log::debug!("[Conn {:04x}] local endpoint closed", self.tc.id());
                self.tc.close(Instant::now());
            }
        }
    }

    fn push_to_tc(&mut self, chunk: Bytes) {
        let accepted = self.tc.write(&chunk);
        if accepted < chunk.len() {
            match self.tc.state() {
                TcState::Closing | TcState::Closed => {
                    log::debug!(
                        "[Conn {:04x}] discarding {} bytes written after close",
                        self.tc.id(),
                        chunk.len() - accepted
                    );
                }
                _ => self.pending_app = Some(chunk.slice(accepted..)),
            }
        }
    }

    /// Sleep for `wait`, waking early for cancellation, stop or new application data
    async fn pause(&mut self, wait: Duration, stopping: bool) -> Wake {
        let can_read = self.app_open && self.pending_app.is_none() && self.tc.send_capacity() > 0;
        tokio::select! {
            _ = self.cancel.cancelled() => Wake::Cancelled,
            _ = self.stop.cancelled(), if !stopping => Wake::Stop,
            _ = tokio::time::sleep(wait) => Wake::Timer,
            chunk = self.app_rx.recv(), if can_read => Wake::App(chunk),
        }
    }

    /// Give the closing exchange a moment, then repeat the final segment once
    async fn linger(&mut self) {
        tokio::select! {
            _ = self.cancel.cancelled() => return,
            _ = tokio::time::sleep(self.linger) => {}
        }

        let Some(last) = self.tc.backlog().latest() else {
            return;
        };
        if last.flags.is_empty() {
            return;
        }

        let last = self.tc.stamp(last);
        let name = match self.codec.encode(&last) {
            Ok(name) => name,
            Err(e) => {
                log::warn!("[Conn {:04x}] cannot encode final segment: {}", self.tc.id(), e);
                return;
            }
        };
        log::debug!("[Conn {:04x}] sending final {:?}", self.tc.id(), last.flags);
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            result = self.resolver.lookup_cname(&name) => {
                if let Err(e) = result {
                    log::debug!("[Conn {:04x}] final segment unanswered: {}", self.tc.id(), e);
                }
            }
        }
    }

    fn publish_state(&self) {
        self.state_tx.send_if_modified(|state| {
            let current = self.tc.state();
            if *state == current {
                false
            } else {
                *state = current;
                true
            }
        });
    }
}

/// Forward bytes from the local endpoint into the loop
async fn read_endpoint<R>(mut reader: ReadHalf<R>, app_tx: mpsc::Sender<Bytes>, cancel: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; APP_READ_CHUNK];
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return,
            read = reader.read(&mut buf) => read,
        };
        match read {
            Ok(0) => return,
            Ok(n) => {
                if app_tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                log::debug!("Local endpoint read failed: {}", e);
                return;
            }
        }
    }
}
