//! Transmission control: reliable ordered delivery over the segment stream
//!
//! One instance per tunnel endpoint. The state machine is I/O free: callers
//! feed it incoming segments and the current time, and it deposits outgoing
//! segments into its [`SegmentBacklog`].
//!
//! ```text
//!            open()                 SYN|ACK
//! Closed ───────────▶ SynSent ──────────────────▶ Established
//!   │                                               ▲   │ close() / FIN
//!   │ SYN (responder)            ACK                │   ▼
//!   └──────────────▶ SynReceived ───────────────────┘ Closing ──▶ Closed
//! ```
//!
//! Sequence numbers count bytes; SYN and FIN each take one number. The
//! initiator drives all timers (acknowledgement, keep-alive, retransmission)
//! because it is the side issuing queries. The responder can only speak when
//! asked, so it retransmits whenever a query fails to acknowledge what it
//! previously answered with.

use crate::backlog::SegmentBacklog;
use crate::segment::{Flags, Segment};
use crate::timing::{AdaptiveTiming, Pacing, TimingConfig};
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Which end of the DNS exchange this endpoint is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Issues DNS queries
    Initiator,
    /// Answers DNS queries
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcState {
    Closed,
    SynSent,
    SynReceived,
    Established,
    Closing,
}

impl TcState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TcState::Closed => "closed",
            TcState::SynSent => "syn-sent",
            TcState::SynReceived => "syn-received",
            TcState::Established => "established",
            TcState::Closing => "closing",
        }
    }
}

/// Transmission control tuning
#[derive(Debug, Clone)]
pub struct TcConfig {
    /// Largest payload per segment, derived from the suffix domain
    pub segment_payload: usize,
    /// Unacknowledged data segments allowed in flight
    pub window_segments: usize,
    /// Initiator waits this long without acknowledgement progress before resending
    pub retransmission_interval: Duration,
    /// Consecutive fruitless retransmission rounds before the connection is reset
    pub max_retransmissions: u32,
    /// Application bytes buffered ahead of segmentation; also caps
    /// received bytes the application has not drained yet
    pub send_buffer: usize,
    pub timing: TimingConfig,
}

impl Default for TcConfig {
    fn default() -> Self {
        Self {
            segment_payload: 128,
            window_segments: 8,
            retransmission_interval: Duration::from_secs(2),
            max_retransmissions: 30,
            send_buffer: 64 * 1024,
            timing: TimingConfig::default(),
        }
    }
}

/// Per-connection counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcStats {
    pub segments_sent: u64,
    pub segments_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub retransmissions: u64,
    pub duplicates: u64,
    pub out_of_order: u64,
    pub malformed: u64,
    /// In-order segments turned away because the application fell behind
    pub refused: u64,
}

/// `a < b` in wrapping sequence space
fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

pub struct TransmissionControl {
    id: u16,
    role: Role,
    state: TcState,
    config: TcConfig,
    timing: AdaptiveTiming,
    backlog: Arc<SegmentBacklog>,

    // send side
    snd_una: u32,
    snd_nxt: u32,
    send_buf: BytesMut,
    unacked: VecDeque<Segment>,
    close_requested: bool,
    fin_sent: bool,
    fin_acked: bool,

    // receive side
    rcv_nxt: u32,
    reassembly: BTreeMap<u32, (Bytes, bool)>,
    inbound: BytesMut,
    peer_fin: bool,

    // timers
    ack_due: Option<Instant>,
    last_output: Instant,
    last_progress: Instant,
    retries: u32,

    was_reset: bool,
    stats: TcStats,
}

impl TransmissionControl {
    pub fn new(id: u16, role: Role, config: TcConfig, backlog: Arc<SegmentBacklog>) -> Self {
        let now = Instant::now();
        Self {
            id,
            role,
            state: TcState::Closed,
            timing: AdaptiveTiming::new(config.timing.clone()),
            config,
            backlog,
            snd_una: 0,
            snd_nxt: 0,
            send_buf: BytesMut::new(),
            unacked: VecDeque::new(),
            close_requested: false,
            fin_sent: false,
            fin_acked: false,
            rcv_nxt: 0,
            reassembly: BTreeMap::new(),
            inbound: BytesMut::new(),
            peer_fin: false,
            ack_due: None,
            last_output: now,
            last_progress: now,
            retries: 0,
            was_reset: false,
            stats: TcStats::default(),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> TcState {
        self.state
    }

    pub fn stats(&self) -> TcStats {
        self.stats
    }

    pub fn backlog(&self) -> &Arc<SegmentBacklog> {
        &self.backlog
    }

    /// Whether the connection ended with a reset rather than a teardown exchange
    pub fn was_reset(&self) -> bool {
        self.was_reset
    }

    pub fn pacing(&self) -> Pacing {
        self.timing.pacing()
    }

    pub fn increase_timing_interval(&mut self) {
        self.timing.increase_timing_interval();
    }

    pub fn decrease_timing_interval(&mut self) {
        self.timing.decrease_timing_interval();
    }

    pub fn record_malformed(&mut self) {
        self.stats.malformed += 1;
    }

    /// Start the handshake (initiator only)
    pub fn open(&mut self, now: Instant) {
        if self.role != Role::Initiator || self.state != TcState::Closed {
            log::warn!(
                "[TC {:04x}] open ignored in state {} as {:?}",
                self.id,
                self.state.as_str(),
                self.role
            );
            return;
        }

        let syn = Segment::new(self.id, Flags::SYN, self.snd_nxt, 0, Bytes::new());
        self.snd_nxt = self.snd_nxt.wrapping_add(1);
        self.push_unacked(syn.clone(), now);
        self.emit(syn, now);
        self.state = TcState::SynSent;
        log::debug!("[TC {:04x}] SYN sent", self.id);
    }

    /// Queue application bytes; returns how many were accepted
    pub fn write(&mut self, data: &[u8]) -> usize {
        let writable = matches!(
            self.state,
            TcState::SynSent | TcState::SynReceived | TcState::Established
        );
        if !writable || self.close_requested {
            return 0;
        }

        let n = data.len().min(self.send_capacity());
        self.send_buf.extend_from_slice(&data[..n]);
        n
    }

    /// Room left in the send buffer
    pub fn send_capacity(&self) -> usize {
        self.config.send_buffer.saturating_sub(self.send_buf.len())
    }

    /// Bytes queued by the application but not yet acknowledged by the peer
    pub fn outstanding(&self) -> usize {
        self.send_buf.len() + self.unacked.iter().map(|s| s.payload.len()).sum::<usize>()
    }

    /// Drain bytes received in order
    pub fn take_received(&mut self) -> Option<Bytes> {
        if self.inbound.is_empty() {
            return None;
        }
        let data = self.inbound.split().freeze();
        // Room again for segments held while the buffer was full
        self.drain_reassembly();
        Some(data)
    }

    /// Peer has closed and everything it sent has been drained
    pub fn peer_finished(&self) -> bool {
        self.peer_fin && self.inbound.is_empty()
    }

    /// Begin an orderly close; FIN follows the bytes already queued
    pub fn close(&mut self, now: Instant) {
        match self.state {
            TcState::Established | TcState::SynReceived => {
                self.close_requested = true;
                self.state = TcState::Closing;
                log::debug!("[TC {:04x}] closing", self.id);
                self.tick(now);
            }
            TcState::SynSent => {
                // FIN follows the handshake and any bytes already written
                self.close_requested = true;
                log::debug!("[TC {:04x}] close requested during handshake", self.id);
            }
            TcState::Closing | TcState::Closed => {}
        }
    }

    /// Abort the connection, notifying the peer with RST
    pub fn reset(&mut self, now: Instant) {
        if self.state == TcState::Closed {
            return;
        }
        let rst = Segment::new(
            self.id,
            Flags::RST | Flags::ACK,
            self.snd_nxt,
            self.rcv_nxt,
            Bytes::new(),
        );
        self.emit(rst, now);
        self.unacked.clear();
        self.was_reset = true;
        self.state = TcState::Closed;
        log::debug!("[TC {:04x}] reset", self.id);
    }

    /// Refresh the acknowledgement of a segment about to leave
    pub fn stamp(&mut self, mut segment: Segment) -> Segment {
        if segment.flags.contains(Flags::ACK) {
            segment.ack = self.rcv_nxt;
            self.ack_due = None;
        }
        segment
    }

    /// Segment carrying nothing but the current acknowledgement
    pub fn keep_alive_segment(&mut self) -> Segment {
        self.ack_due = None;
        Segment::new(
            self.id,
            Flags::ACK | Flags::KEEP_ALIVE,
            self.snd_nxt,
            self.rcv_nxt,
            Bytes::new(),
        )
    }

    /// Responder side: the segment to answer the current query with
    pub fn next_response(&mut self, now: Instant) -> Segment {
        self.tick(now);
        match self.backlog.pop() {
            Some(segment) => self.stamp(segment),
            None => self.keep_alive_segment(),
        }
    }

    /// Process one incoming segment; returns true if it delivered fresh bytes
    pub fn receive(&mut self, segment: Segment, now: Instant) -> bool {
        if segment.is_malformed() {
            self.stats.malformed += 1;
            return false;
        }
        if segment.id != self.id {
            log::warn!(
                "[TC {:04x}] dropping segment for connection {:04x}",
                self.id,
                segment.id
            );
            return false;
        }
        self.stats.segments_received += 1;

        if segment.flags.contains(Flags::RST) {
            log::info!("[TC {:04x}] reset by peer", self.id);
            self.unacked.clear();
            self.was_reset = true;
            self.state = TcState::Closed;
            return false;
        }

        match self.state {
            TcState::Closed => {
                if self.role == Role::Responder
                    && segment.flags.contains(Flags::SYN)
                    && !segment.flags.contains(Flags::ACK)
                    && self.snd_nxt == 0
                {
                    self.accept_syn(&segment, now);
                }
                false
            }
            TcState::SynSent => {
                if segment.flags.contains(Flags::SYN | Flags::ACK)
                    && segment.ack == self.snd_nxt
                {
                    self.handle_ack(segment.ack, now);
                    self.rcv_nxt = segment.seq.wrapping_add(1);
                    self.ack_due = Some(now);
                    self.state = if self.close_requested {
                        TcState::Closing
                    } else {
                        TcState::Established
                    };
                    log::debug!("[TC {:04x}] established", self.id);
                    self.tick(now);
                }
                false
            }
            TcState::SynReceived => {
                if segment.flags.contains(Flags::SYN) && !segment.flags.contains(Flags::ACK) {
                    // Our SYN|ACK went missing
                    if self.backlog.is_empty() {
                        self.retransmit(now);
                    }
                    return false;
                }
                if segment.flags.contains(Flags::ACK) && seq_le(self.snd_nxt, segment.ack) {
                    self.state = TcState::Established;
                    log::debug!("[TC {:04x}] established", self.id);
                    self.process(segment, now)
                } else {
                    false
                }
            }
            TcState::Established | TcState::Closing => self.process(segment, now),
        }
    }

    fn accept_syn(&mut self, syn: &Segment, now: Instant) {
        self.rcv_nxt = syn.seq.wrapping_add(1);
        let syn_ack = Segment::new(
            self.id,
            Flags::SYN | Flags::ACK,
            self.snd_nxt,
            self.rcv_nxt,
            Bytes::new(),
        );
        self.snd_nxt = self.snd_nxt.wrapping_add(1);
        self.push_unacked(syn_ack.clone(), now);
        self.emit(syn_ack, now);
        self.state = TcState::SynReceived;
        log::debug!("[TC {:04x}] SYN received", self.id);
    }

    fn process(&mut self, segment: Segment, now: Instant) -> bool {
        let progressed = segment.flags.contains(Flags::ACK) && self.handle_ack(segment.ack, now);

        let fresh = if !segment.payload.is_empty() || segment.flags.contains(Flags::FIN) {
            self.accept_data(segment, now)
        } else {
            false
        };

        if self.peer_fin && self.state == TcState::Established {
            log::debug!("[TC {:04x}] peer closed", self.id);
            self.close_requested = true;
            self.state = TcState::Closing;
        }

        if self.role == Role::Responder
            && !progressed
            && !self.unacked.is_empty()
            && self.backlog.is_empty()
        {
            self.retransmit(now);
        }

        self.maybe_finish(now);
        self.tick(now);
        fresh
    }

    /// Apply a cumulative acknowledgement; true if it advanced
    fn handle_ack(&mut self, ack: u32, now: Instant) -> bool {
        if !seq_lt(self.snd_una, ack) || !seq_le(ack, self.snd_nxt) {
            return false;
        }

        while let Some(front) = self.unacked.front() {
            let end = front.seq.wrapping_add(front.seq_len());
            if seq_le(end, ack) {
                if front.flags.contains(Flags::FIN) {
                    self.fin_acked = true;
                }
                self.unacked.pop_front();
            } else {
                break;
            }
        }

        self.snd_una = ack;
        self.retries = 0;
        self.last_progress = now;
        true
    }

    fn accept_data(&mut self, segment: Segment, now: Instant) -> bool {
        let fin = segment.flags.contains(Flags::FIN);
        let len = segment.payload.len() as u32;
        let end = segment.seq.wrapping_add(len);

        if seq_lt(self.rcv_nxt, segment.seq) {
            let window = (self.config.window_segments * self.config.segment_payload.max(1)) as u32;
            if segment.seq.wrapping_sub(self.rcv_nxt) <= window {
                self.reassembly.insert(segment.seq, (segment.payload, fin));
                self.stats.out_of_order += 1;
            }
            self.ack_due = Some(now);
            return false;
        }

        if seq_lt(end, self.rcv_nxt) || (end == self.rcv_nxt && (!fin || self.peer_fin)) {
            self.stats.duplicates += 1;
            self.ack_due = Some(now);
            return false;
        }

        if len > 0 && self.receive_buffer_full() {
            // Left unacknowledged; the peer resends once the application reads
            self.stats.refused += 1;
            self.ack_due = Some(now);
            return false;
        }

        let skip = self.rcv_nxt.wrapping_sub(segment.seq) as usize;
        let delivered = self.deliver(&segment.payload[skip..], fin);
        self.drain_reassembly();

        let delay = self.timing.pacing().ack_delay;
        if self.peer_fin {
            self.ack_due = Some(now);
        } else if self.ack_due.is_none() {
            self.ack_due = Some(now + delay);
        }
        delivered > 0
    }

    fn deliver(&mut self, data: &[u8], fin: bool) -> usize {
        self.inbound.extend_from_slice(data);
        self.rcv_nxt = self.rcv_nxt.wrapping_add(data.len() as u32);
        self.stats.bytes_received += data.len() as u64;
        if fin && !self.peer_fin {
            self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            self.peer_fin = true;
        }
        data.len()
    }

    /// Undrained inbound bytes are capped at the send buffer size
    fn receive_buffer_full(&self) -> bool {
        self.inbound.len() >= self.config.send_buffer
    }

    fn drain_reassembly(&mut self) {
        while let Some((&seq, _)) = self.reassembly.first_key_value() {
            if self.peer_fin || seq_lt(self.rcv_nxt, seq) || self.receive_buffer_full() {
                break;
            }
            let Some((payload, fin)) = self.reassembly.remove(&seq) else {
                break;
            };
            let end = seq.wrapping_add(payload.len() as u32);
            if seq_lt(self.rcv_nxt, end) || (end == self.rcv_nxt && fin) {
                let skip = self.rcv_nxt.wrapping_sub(seq) as usize;
                self.deliver(&payload[skip..], fin);
            }
        }
        if self.peer_fin {
            self.reassembly.clear();
        }
    }

    fn maybe_finish(&mut self, now: Instant) {
        if self.state == TcState::Closing && self.fin_acked && self.peer_fin {
            log::debug!("[TC {:04x}] closed", self.id);
            self.state = TcState::Closed;
            if self.ack_due.is_some() {
                // Final acknowledgement of the peer's FIN
                let ack = self.keep_alive_segment();
                self.emit(ack, now);
            }
        }
    }

    /// Advance timers and produce whatever segments are due
    pub fn tick(&mut self, now: Instant) {
        match self.state {
            TcState::Closed => return,
            TcState::Established | TcState::Closing => self.segmentize(now),
            TcState::SynSent | TcState::SynReceived => {}
        }

        if self.role == Role::Initiator {
            self.initiator_timers(now);
        }
    }

    fn segmentize(&mut self, now: Instant) {
        let payload_len = self.config.segment_payload.max(1);
        while !self.send_buf.is_empty() && self.data_in_flight() < self.config.window_segments {
            let n = payload_len.min(self.send_buf.len());
            let payload = self.send_buf.split_to(n).freeze();
            let segment = Segment::new(self.id, Flags::ACK, self.snd_nxt, self.rcv_nxt, payload);
            self.snd_nxt = self.snd_nxt.wrapping_add(n as u32);
            self.stats.bytes_sent += n as u64;
            self.push_unacked(segment.clone(), now);
            self.emit(segment, now);
        }

        if self.close_requested && !self.fin_sent && self.send_buf.is_empty() {
            let fin = Segment::new(
                self.id,
                Flags::FIN | Flags::ACK,
                self.snd_nxt,
                self.rcv_nxt,
                Bytes::new(),
            );
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            self.fin_sent = true;
            self.push_unacked(fin.clone(), now);
            self.emit(fin, now);
            log::debug!("[TC {:04x}] FIN sent", self.id);
        }
    }

    fn initiator_timers(&mut self, now: Instant) {
        let pacing = self.timing.pacing();
        let rto = self.config.retransmission_interval;

        if !self.unacked.is_empty() {
            if self.backlog.is_empty() && now.duration_since(self.last_progress) >= rto {
                self.retransmit(now);
                if self.state == TcState::Closed {
                    return;
                }
            }
        } else if self.state == TcState::Closing
            && self.fin_acked
            && !self.peer_fin
            && now.duration_since(self.last_progress) >= rto
        {
            // Waiting on the peer's FIN
            self.retries += 1;
            self.last_progress = now;
            if self.retries > self.config.max_retransmissions {
                log::info!("[TC {:04x}] peer never closed, giving up", self.id);
                self.state = TcState::Closed;
                return;
            }
        }

        if !self.backlog.is_empty() {
            return;
        }

        let ack_ready = self.ack_due.is_some_and(|due| due <= now);
        let idle = now.duration_since(self.last_output) >= pacing.keepalive_interval;
        let polling = matches!(self.state, TcState::Established | TcState::Closing);
        if ack_ready || (polling && idle) {
            let probe = self.keep_alive_segment();
            self.emit(probe, now);
        }
    }

    fn retransmit(&mut self, now: Instant) {
        self.retries += 1;
        self.last_progress = now;
        if self.retries > self.config.max_retransmissions {
            log::warn!(
                "[TC {:04x}] no progress after {} retransmissions",
                self.id,
                self.config.max_retransmissions
            );
            self.reset(now);
            return;
        }

        let pending: Vec<Segment> = self.unacked.iter().cloned().collect();
        log::debug!(
            "[TC {:04x}] retransmitting {} segment(s), attempt {}",
            self.id,
            pending.len(),
            self.retries
        );
        for segment in pending {
            let segment = self.stamp(segment);
            self.stats.retransmissions += 1;
            self.emit(segment, now);
        }
    }

    fn data_in_flight(&self) -> usize {
        self.unacked.iter().filter(|s| !s.payload.is_empty()).count()
    }

    fn push_unacked(&mut self, segment: Segment, now: Instant) {
        if self.unacked.is_empty() {
            self.last_progress = now;
        }
        self.unacked.push_back(segment);
    }

    fn emit(&mut self, segment: Segment, now: Instant) {
        if segment.flags.contains(Flags::ACK) {
            self.ack_due = None;
        }
        self.stats.segments_sent += 1;
        self.last_output = now;
        self.backlog.absorb(segment);
    }
}

impl std::fmt::Debug for TransmissionControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransmissionControl")
            .field("id", &format_args!("{:04x}", self.id))
            .field("role", &self.role)
            .field("state", &self.state)
            .field("snd_una", &self.snd_una)
            .field("snd_nxt", &self.snd_nxt)
            .field("rcv_nxt", &self.rcv_nxt)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TcConfig {
        TcConfig {
            segment_payload: 4,
            window_segments: 4,
            retransmission_interval: Duration::from_secs(1),
            max_retransmissions: 3,
            send_buffer: 1024,
            timing: TimingConfig::default(),
        }
    }

    fn pair() -> (TransmissionControl, TransmissionControl) {
        let client = TransmissionControl::new(
            7,
            Role::Initiator,
            config(),
            Arc::new(SegmentBacklog::new()),
        );
        let server = TransmissionControl::new(
            7,
            Role::Responder,
            config(),
            Arc::new(SegmentBacklog::new()),
        );
        (client, server)
    }

    /// One DNS round trip: next client segment up, server answer down
    fn round_trip(
        client: &mut TransmissionControl,
        server: &mut TransmissionControl,
        now: Instant,
    ) -> Option<Segment> {
        client.tick(now);
        let query = client.backlog().pop()?;
        let query = client.stamp(query);
        server.receive(query, now);
        let answer = server.next_response(now);
        client.receive(answer.clone(), now);
        Some(answer)
    }

    fn establish(now: Instant) -> (TransmissionControl, TransmissionControl) {
        let (mut client, mut server) = pair();
        client.open(now);
        assert_eq!(client.state(), TcState::SynSent);

        let syn = client.backlog().pop().unwrap();
        assert!(syn.flags.contains(Flags::SYN));
        server.receive(syn, now);
        assert_eq!(server.state(), TcState::SynReceived);

        let syn_ack = server.next_response(now);
        assert!(syn_ack.flags.contains(Flags::SYN | Flags::ACK));
        client.receive(syn_ack, now);
        assert_eq!(client.state(), TcState::Established);

        // The client acknowledges the SYN|ACK right away
        round_trip(&mut client, &mut server, now).unwrap();
        assert_eq!(server.state(), TcState::Established);
        (client, server)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len as u8).collect()
    }

    #[test]
    fn test_handshake() {
        let now = Instant::now();
        let (client, server) = establish(now);
        assert_eq!(client.rcv_nxt, 1);
        assert_eq!(server.rcv_nxt, 1);
        assert!(client.unacked.is_empty());
        assert!(server.unacked.is_empty());
    }

    #[test]
    fn test_open_only_from_initiator() {
        let now = Instant::now();
        let (_, mut server) = pair();
        server.open(now);
        assert_eq!(server.state(), TcState::Closed);
        assert!(server.backlog().is_empty());
    }

    #[test]
    fn test_data_is_chunked_to_segment_payload() {
        let now = Instant::now();
        let (mut client, mut server) = establish(now);

        assert_eq!(client.write(b"hello world"), 11);
        client.tick(now);
        assert_eq!(client.backlog().len(), 3);

        let mut received = Vec::new();
        for _ in 0..3 {
            let seg = client.backlog().pop().unwrap();
            assert!(seg.payload.len() <= 4);
            let seg = client.stamp(seg);
            assert!(server.receive(seg, now));
            let answer = server.next_response(now);
            client.receive(answer, now);
            received.extend_from_slice(&server.take_received().unwrap());
        }
        assert_eq!(received, b"hello world");
        assert_eq!(client.outstanding(), 0);
    }

    #[test]
    fn test_out_of_order_is_reassembled() {
        let now = Instant::now();
        let (mut client, mut server) = establish(now);

        client.write(b"abcdefgh");
        client.tick(now);
        let first = client.backlog().pop().unwrap();
        let second = client.backlog().pop().unwrap();

        assert!(!server.receive(second, now));
        assert!(server.take_received().is_none());
        assert_eq!(server.stats().out_of_order, 1);

        assert!(server.receive(first, now));
        assert_eq!(server.take_received().unwrap().as_ref(), b"abcdefgh");
    }

    #[test]
    fn test_duplicate_is_not_delivered_twice() {
        let now = Instant::now();
        let (mut client, mut server) = establish(now);

        client.write(b"abc");
        client.tick(now);
        let seg = client.backlog().pop().unwrap();

        assert!(server.receive(seg.clone(), now));
        assert!(!server.receive(seg, now));
        assert_eq!(server.take_received().unwrap().as_ref(), b"abc");
        assert_eq!(server.stats().duplicates, 1);
    }

    #[test]
    fn test_initiator_retransmits_lost_data() {
        let now = Instant::now();
        let (mut client, mut server) = establish(now);

        client.write(b"lost");
        client.tick(now);
        let _dropped = client.backlog().pop().unwrap();

        client.tick(now + Duration::from_millis(500));
        assert!(client.backlog().is_empty());

        let later = now + Duration::from_secs(2);
        client.tick(later);
        let resent = client.backlog().pop().unwrap();
        assert_eq!(resent.payload.as_ref(), b"lost");
        assert_eq!(client.stats().retransmissions, 1);

        assert!(server.receive(resent, later));
        assert_eq!(server.take_received().unwrap().as_ref(), b"lost");
    }

    #[test]
    fn test_responder_retransmits_when_query_does_not_ack() {
        let now = Instant::now();
        let (mut client, mut server) = establish(now);

        server.write(b"down");
        let t1 = now + Duration::from_secs(2);
        client.tick(t1);
        let query = client.backlog().pop().unwrap();
        let query = client.stamp(query);
        server.receive(query, t1);
        let lost = server.next_response(t1);
        assert_eq!(lost.payload.as_ref(), b"down");

        // Next poll carries a stale ack, so the answer is the retransmission
        let t2 = now + Duration::from_secs(4);
        let answer = round_trip(&mut client, &mut server, t2).unwrap();
        assert_eq!(answer.payload.as_ref(), b"down");
        assert_eq!(client.take_received().unwrap().as_ref(), b"down");
        assert_eq!(server.stats().retransmissions, 1);
    }

    #[test]
    fn test_keep_alive_when_idle() {
        let now = Instant::now();
        let (mut client, _server) = establish(now);

        client.tick(now);
        assert!(client.backlog().is_empty());

        let later = now + client.pacing().keepalive_interval;
        client.tick(later);
        let probe = client.backlog().pop().unwrap();
        assert!(probe.is_keep_alive());
        assert!(probe.payload.is_empty());
    }

    #[test]
    fn test_delayed_ack_after_data() {
        let now = Instant::now();
        let (mut client, mut server) = establish(now);

        server.write(b"ping");
        let t = now + Duration::from_secs(2);
        let answer = round_trip(&mut client, &mut server, t).unwrap();
        assert_eq!(answer.payload.as_ref(), b"ping");

        client.tick(t);
        assert!(client.backlog().is_empty());

        let later = t + client.pacing().ack_delay;
        client.tick(later);
        let ack = client.backlog().pop().unwrap();
        assert!(ack.flags.contains(Flags::ACK | Flags::KEEP_ALIVE));
        assert_eq!(ack.ack, 1 + 4);
    }

    #[test]
    fn test_window_limits_segments_in_flight() {
        let now = Instant::now();
        let (mut client, _server) = establish(now);

        client.write(&[0u8; 100]);
        client.tick(now);
        assert_eq!(client.backlog().len(), 4);
        assert_eq!(client.outstanding(), 100);
    }

    #[test]
    fn test_receive_buffer_caps_undrained_bytes() {
        let now = Instant::now();
        let (mut client, mut server) = establish(now);
        server.config.send_buffer = 8;

        client.write(&pattern(16));
        client.tick(now);
        let mut segments = Vec::new();
        while let Some(seg) = client.backlog().pop() {
            segments.push(client.stamp(seg));
        }
        assert_eq!(segments.len(), 4);

        for seg in &segments {
            server.receive(seg.clone(), now);
        }
        assert_eq!(server.rcv_nxt, 1 + 8);
        assert_eq!(server.stats().refused, 1);
        assert_eq!(server.next_response(now).ack, 1 + 8);

        // Draining makes room; the resent segment also releases the held one
        assert_eq!(server.take_received().unwrap().len(), 8);
        server.receive(segments[2].clone(), now);
        assert_eq!(server.rcv_nxt, 1 + 16);
        assert_eq!(server.take_received().unwrap().as_ref(), &pattern(16)[8..]);
    }

    #[test]
    fn test_close_during_handshake_keeps_written_data() {
        let now = Instant::now();
        let (mut client, mut server) = pair();
        client.open(now);
        assert_eq!(client.write(b"hi!"), 3);
        client.close(now);
        assert_eq!(client.state(), TcState::SynSent);
        assert!(!client.was_reset());

        let syn = client.backlog().pop().unwrap();
        server.receive(syn, now);
        client.receive(server.next_response(now), now);
        assert_eq!(client.state(), TcState::Closing);

        while let Some(seg) = client.backlog().pop() {
            let seg = client.stamp(seg);
            server.receive(seg, now);
        }
        assert_eq!(server.take_received().unwrap().as_ref(), b"hi!");
        assert!(server.peer_finished());
    }

    #[test]
    fn test_local_close_teardown() {
        let now = Instant::now();
        let (mut client, mut server) = establish(now);

        client.write(b"bye");
        client.close(now);
        assert_eq!(client.state(), TcState::Closing);
        assert_eq!(client.write(b"more"), 0);

        let data = client.backlog().pop().unwrap();
        let fin = client.backlog().pop().unwrap();
        assert_eq!(data.payload.as_ref(), b"bye");
        assert!(fin.flags.contains(Flags::FIN));

        server.receive(data, now);
        server.receive(fin, now);
        assert!(!server.peer_finished());
        assert_eq!(server.take_received().unwrap().as_ref(), b"bye");
        assert!(server.peer_finished());
        assert_eq!(server.state(), TcState::Closing);

        let server_fin = server.next_response(now);
        assert!(server_fin.flags.contains(Flags::FIN));
        client.receive(server_fin, now);
        assert_eq!(client.state(), TcState::Closed);
        assert!(!client.was_reset());

        // Final acknowledgement of the server's FIN
        let last = client.backlog().latest().unwrap();
        assert!(!last.flags.is_empty());
        server.receive(client.stamp(last), now);
        assert_eq!(server.state(), TcState::Closed);
    }

    #[test]
    fn test_remote_close_teardown() {
        let now = Instant::now();
        let (mut client, mut server) = establish(now);

        server.close(now);
        assert_eq!(server.state(), TcState::Closing);

        // Idle long enough for the client to poll
        let t = now + Duration::from_secs(2);
        let answer = round_trip(&mut client, &mut server, t).unwrap();
        assert!(answer.flags.contains(Flags::FIN));
        assert_eq!(client.state(), TcState::Closing);
        assert!(client.peer_finished());

        // The client's FIN goes out immediately and acknowledges the server's
        round_trip(&mut client, &mut server, t).unwrap();
        assert_eq!(server.state(), TcState::Closed);
        assert_eq!(client.state(), TcState::Closed);
    }

    #[test]
    fn test_handshake_gives_up_after_budget() {
        let now = Instant::now();
        let (mut client, _server) = pair();
        client.open(now);
        client.backlog().pop();

        let mut at = now;
        for _ in 0..10 {
            at += Duration::from_secs(1);
            client.tick(at);
            client.backlog().pop();
        }
        assert_eq!(client.state(), TcState::Closed);
        assert!(client.was_reset());
    }

    #[test]
    fn test_reset_from_peer() {
        let now = Instant::now();
        let (mut client, _server) = establish(now);
        let rst = Segment::new(7, Flags::RST, 0, 0, Bytes::new());
        client.receive(rst, now);
        assert_eq!(client.state(), TcState::Closed);
        assert!(client.was_reset());
    }

    #[test]
    fn test_foreign_and_malformed_segments_ignored() {
        let now = Instant::now();
        let (mut client, _server) = establish(now);

        let foreign = Segment::new(8, Flags::ACK, 1, 1, Bytes::from_static(b"nope"));
        assert!(!client.receive(foreign, now));
        assert!(!client.receive(Segment::malformed(), now));
        assert!(client.take_received().is_none());
        assert_eq!(client.stats().malformed, 1);
    }

    #[test]
    fn test_seq_comparisons_wrap() {
        assert!(seq_lt(u32::MAX, 0));
        assert!(seq_lt(1, 2));
        assert!(!seq_lt(2, 1));
        assert!(seq_le(5, 5));
    }
}
