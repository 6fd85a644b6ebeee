//! Per-connection reliability engine
//!
//! A `Connection` tracks one accepted 4-tuple: sequence state, the queue of
//! unacknowledged segments, segments waiting for window space, the RTT
//! estimator and the single retransmission deadline.
//!
//! Connections never talk to the IP layer directly. Every segment they emit is
//! queued in their outbox and drained by the owner (see `iface::stack`).

use std::collections::VecDeque;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};

use crate::config::StackConfig;
use crate::error::{Result, StackError};
use crate::transport::tcp::{build_segment, flags, TcpHeader};

/// Identifies a connection: (remote address, remote port, local address, local port).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub remote_addr: Ipv4Addr,
    pub remote_port: u16,
    pub local_addr: Ipv4Addr,
    pub local_port: u16,
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.remote_addr, self.remote_port, self.local_addr, self.local_port
        )
    }
}

/// Requests an application makes through a `ConnectionHandle`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send { key: ConnectionKey, data: Vec<u8> },
    Close { key: ConnectionKey },
}

/// Cloneable application-side reference to a connection.
///
/// Operations are queued to the owning stack and applied on its next poll.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    key: ConnectionKey,
    commands: Sender<Command>,
}

impl ConnectionHandle {
    pub fn new(key: ConnectionKey, commands: Sender<Command>) -> Self {
        ConnectionHandle { key, commands }
    }

    pub fn key(&self) -> ConnectionKey {
        self.key
    }

    pub fn send(&self, data: &[u8]) -> Result<()> {
        self.commands
            .send(Command::Send { key: self.key, data: data.to_vec() })
            .map_err(|_| StackError::ChannelClosed)
    }

    pub fn close(&self) -> Result<()> {
        self.commands
            .send(Command::Close { key: self.key })
            .map_err(|_| StackError::ChannelClosed)
    }
}

/// Upward notification: received bytes, or an empty slice once the peer closed.
///
/// Segments without payload (pure ACKs) are never reported, so an empty slice
/// always means end of stream.
pub type Receiver = Box<dyn FnMut(&ConnectionHandle, &[u8])>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// SYN+ACK sent, handshake ACK not yet seen.
    SynReceived,
    Established,
    /// Peer sent FIN, we have not closed yet.
    CloseWait,
    /// We closed first and wait for the peer's FIN.
    FinWait,
    /// We closed after the peer; waiting for our FIN to be acknowledged.
    LastAck,
    /// Ready to be evicted from the connection table.
    Closed,
}

/// Smoothed RTT, RTT variance and the derived retransmission timeout.
///
/// The first sample seeds the estimator directly, later samples are smoothed
/// with gains 1/8 and 1/4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttEstimator {
    srtt: Duration,
    rttvar: Duration,
    rto: Duration,
    sampled: bool,
}

impl RttEstimator {
    pub fn new(initial_rto: Duration) -> Self {
        RttEstimator {
            srtt: initial_rto,
            rttvar: initial_rto / 2,
            rto: initial_rto,
            sampled: false,
        }
    }

    pub fn sample(&mut self, elapsed: Duration) {
        if !self.sampled {
            self.srtt = elapsed;
            self.rttvar = elapsed / 2;
            self.sampled = true;
        } else {
            self.srtt = (self.srtt * 7 + elapsed) / 8;
            let deviation = if elapsed > self.srtt {
                elapsed - self.srtt
            } else {
                self.srtt - elapsed
            };
            self.rttvar = (self.rttvar * 3 + deviation) / 4;
        }
        self.rto = self.srtt + self.rttvar * 4;
    }

    pub fn srtt(&self) -> Duration {
        self.srtt
    }

    pub fn rttvar(&self) -> Duration {
        self.rttvar
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    pub fn has_sample(&self) -> bool {
        self.sampled
    }
}

/// A transmitted, not yet acknowledged segment.
#[derive(Debug, Clone)]
struct InFlight {
    /// None once retransmitted, so it never produces an RTT sample.
    sent_at: Option<Instant>,
    seq: u32,
    len: usize,
    segment: Vec<u8>,
}

/// A segment built by `send` that did not fit in the window yet.
#[derive(Debug, Clone)]
struct Pending {
    seq: u32,
    len: usize,
    segment: Vec<u8>,
}

/// `a <= b` in sequence space.
fn seq_le(a: u32, b: u32) -> bool {
    (b.wrapping_sub(a) as i32) >= 0
}

pub struct Connection {
    key: ConnectionKey,
    handle: ConnectionHandle,
    state: State,

    /// Next sequence number we will send.
    seq_current: u32,
    /// Next sequence number expected from the peer.
    expected_seq: u32,
    /// Last acknowledgment number the peer sent us.
    peer_ack: u32,
    fin_received: bool,
    /// Sequence number our FIN occupies, once closed.
    fin_seq: Option<u32>,
    /// FIN waiting for the pending queue to drain.
    fin_held: bool,

    in_flight: VecDeque<InFlight>,
    pending: VecDeque<Pending>,
    mss: usize,
    window_limit: usize,
    occupancy: usize,

    rtt: RttEstimator,
    retransmit_at: Option<Instant>,
    close_timeout: Duration,
    close_deadline: Option<Instant>,
    idle_timeout: Duration,
    /// Evicted when the peer stays silent past this instant.
    idle_deadline: Instant,

    receiver: Option<Receiver>,
    outbox: VecDeque<Vec<u8>>,
}

impl Connection {
    /// State for a connection whose SYN (sequence `peer_seq`) was just answered
    /// with a SYN+ACK carrying our initial sequence number `isn`.
    pub fn new(
        now: Instant,
        key: ConnectionKey,
        isn: u32,
        peer_seq: u32,
        config: &StackConfig,
        commands: Sender<Command>,
    ) -> Self {
        Connection {
            key,
            handle: ConnectionHandle::new(key, commands),
            state: State::SynReceived,
            seq_current: isn.wrapping_add(1),
            expected_seq: peer_seq.wrapping_add(1),
            peer_ack: isn.wrapping_add(1),
            fin_received: false,
            fin_seq: None,
            fin_held: false,
            in_flight: VecDeque::new(),
            pending: VecDeque::new(),
            mss: config.mss,
            window_limit: config.mss,
            occupancy: 0,
            rtt: RttEstimator::new(config.initial_rto),
            retransmit_at: None,
            close_timeout: config.close_timeout,
            close_deadline: None,
            idle_timeout: config.idle_timeout,
            idle_deadline: now + config.idle_timeout,
            receiver: None,
            outbox: VecDeque::new(),
        }
    }

    pub fn key(&self) -> ConnectionKey {
        self.key
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn seq_current(&self) -> u32 {
        self.seq_current
    }

    pub fn expected_seq(&self) -> u32 {
        self.expected_seq
    }

    pub fn peer_ack(&self) -> u32 {
        self.peer_ack
    }

    pub fn window_limit(&self) -> usize {
        self.window_limit
    }

    pub fn occupancy(&self) -> usize {
        self.occupancy
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    pub fn retransmit_deadline(&self) -> Option<Instant> {
        self.retransmit_at
    }

    /// Set the upward notification callback. The last registration wins.
    pub fn register_receiver<F>(&mut self, receiver: F)
    where
        F: FnMut(&ConnectionHandle, &[u8]) + 'static,
    {
        self.receiver = Some(Box::new(receiver));
    }

    /// Drain the segments queued for transmission to the remote address.
    pub fn take_outgoing(&mut self) -> VecDeque<Vec<u8>> {
        std::mem::take(&mut self.outbox)
    }

    /// Handle one inbound segment addressed to this connection.
    ///
    /// Only segments starting exactly at the expected sequence number are
    /// accepted; anything else is dropped without touching state. FIN is the
    /// exception and is always honoured.
    pub fn process_segment(&mut self, now: Instant, seq: u32, ack: u32, seg_flags: u16, payload: &[u8]) {
        if seg_flags & flags::FIN != 0 {
            self.idle_deadline = now + self.idle_timeout;
            self.on_fin(ack);
            return;
        }

        if seq != self.expected_seq {
            log::trace!(
                "{}: out of order segment seq={} expected={}, dropped",
                self.key,
                seq,
                self.expected_seq
            );
            return;
        }

        self.idle_deadline = now + self.idle_timeout;
        self.expected_seq = self.expected_seq.wrapping_add(payload.len() as u32);
        if !payload.is_empty() {
            self.deliver(payload);
        }
        self.peer_ack = ack;

        if seg_flags & flags::ACK == 0 {
            return;
        }

        if self.state == State::SynReceived {
            log::debug!("{}: SYN_RCVD -> ESTABLISHED", self.key);
            self.state = State::Established;
        }

        if !payload.is_empty() {
            self.queue_control(self.seq_current, flags::ACK, self.expected_seq);
        }

        self.on_ack(now, ack);
    }

    fn on_fin(&mut self, ack: u32) {
        self.peer_ack = ack;

        // The FIN occupies one sequence number; a retransmitted FIN must not
        // advance it twice or notify the application again.
        if !self.fin_received {
            self.fin_received = true;
            self.deliver(&[]);
            self.expected_seq = self.expected_seq.wrapping_add(1);
            let next = match self.state {
                State::FinWait => State::Closed,
                State::SynReceived | State::Established => State::CloseWait,
                other => other,
            };
            log::debug!("{}: peer closed, {:?} -> {:?}", self.key, self.state, next);
            self.state = next;
        }

        self.queue_control(self.seq_current, flags::ACK, self.expected_seq);
    }

    fn on_ack(&mut self, now: Instant, ack: u32) {
        let had_outstanding = self.occupancy > 0;
        self.retransmit_at = None;

        // Cumulative ack: retire every segment the ack fully covers, stopping
        // at the first one starting at `ack`.
        let mut sample = None;
        while let Some(front) = self.in_flight.front() {
            if front.seq == ack || !seq_le(front.seq.wrapping_add(front.len as u32), ack) {
                break;
            }
            if let Some(front) = self.in_flight.pop_front() {
                self.occupancy = self.occupancy.saturating_sub(front.len);
                sample = front.sent_at;
            }
        }

        if let Some(sent_at) = sample {
            self.rtt.sample(now.saturating_duration_since(sent_at));
            log::trace!(
                "{}: rtt sample srtt={:?} rttvar={:?} rto={:?}",
                self.key,
                self.rtt.srtt(),
                self.rtt.rttvar(),
                self.rtt.rto()
            );
        }

        if had_outstanding && self.occupancy == 0 {
            self.window_limit += self.mss;
        }

        self.admit_pending(now);

        if !self.in_flight.is_empty() {
            self.retransmit_at = Some(now + self.rtt.rto());
        }

        if let Some(fin_seq) = self.fin_seq {
            if self.state == State::LastAck && seq_le(fin_seq.wrapping_add(1), ack) {
                log::debug!("{}: FIN acknowledged, LAST_ACK -> CLOSED", self.key);
                self.state = State::Closed;
            }
        }
    }

    /// Move pending segments into flight, in order, while they fit the window.
    fn admit_pending(&mut self, now: Instant) {
        while let Some(head) = self.pending.front() {
            if self.occupancy + head.len > self.window_limit {
                break;
            }
            if let Some(head) = self.pending.pop_front() {
                self.occupancy += head.len;
                self.outbox.push_back(head.segment.clone());
                self.in_flight.push_back(InFlight {
                    sent_at: Some(now),
                    seq: head.seq,
                    len: head.len,
                    segment: head.segment,
                });
            }
        }

        if self.fin_held && self.pending.is_empty() {
            self.fin_held = false;
            if let Some(fin_seq) = self.fin_seq {
                log::debug!("{}: pending data sent, releasing FIN", self.key);
                self.queue_control(fin_seq, flags::FIN | flags::ACK, self.expected_seq);
            }
        }
    }

    /// Segment `data` into MSS-sized chunks and send or queue each one.
    pub fn send(&mut self, now: Instant, data: &[u8]) {
        if self.fin_seq.is_some() || self.state == State::Closed {
            log::warn!("{}: send after close, {} bytes dropped", self.key, data.len());
            return;
        }

        for chunk in data.chunks(self.mss) {
            let seq = self.seq_current;
            let header = TcpHeader::new(
                self.key.local_port,
                self.key.remote_port,
                seq,
                self.expected_seq,
                flags::ACK,
            );
            let segment = build_segment(header, chunk, self.key.local_addr, self.key.remote_addr);
            self.seq_current = seq.wrapping_add(chunk.len() as u32);

            let len = chunk.len();
            if self.pending.is_empty() && self.occupancy + len <= self.window_limit {
                self.occupancy += len;
                self.outbox.push_back(segment.clone());
                self.in_flight.push_back(InFlight { sent_at: Some(now), seq, len, segment });
                if self.retransmit_at.is_none() {
                    self.retransmit_at = Some(now + self.rtt.rto());
                }
            } else {
                self.pending.push_back(Pending { seq, len, segment });
            }
        }
    }

    /// Send our FIN. It is not retransmitted.
    ///
    /// With data still waiting for window space the FIN is held back and goes
    /// out right after the last pending segment.
    pub fn close(&mut self, now: Instant) {
        let next = match self.state {
            State::SynReceived | State::Established => State::FinWait,
            State::CloseWait => State::LastAck,
            State::FinWait | State::LastAck | State::Closed => return,
        };
        log::debug!("{}: closing, {:?} -> {:?}", self.key, self.state, next);
        self.state = next;

        let seq = self.seq_current;
        if self.pending.is_empty() {
            self.queue_control(seq, flags::FIN | flags::ACK, self.expected_seq);
        } else {
            self.fin_held = true;
        }
        self.fin_seq = Some(seq);
        self.seq_current = seq.wrapping_add(1);
        self.close_deadline = Some(now + self.close_timeout);
    }

    /// Retransmission timeout: halve the window and resend the oldest
    /// unacknowledged segment.
    pub fn on_retransmit_timeout(&mut self, now: Instant) {
        self.window_limit /= 2;

        if let Some(head) = self.in_flight.front_mut() {
            head.sent_at = None;
            log::debug!(
                "{}: retransmitting seq={} len={}, window now {}",
                self.key,
                head.seq,
                head.len,
                self.window_limit
            );
            self.outbox.push_back(head.segment.clone());
            self.retransmit_at = Some(now + self.rtt.rto());
        }
    }

    /// Fire the timers that are due at `now`.
    pub fn poll(&mut self, now: Instant) {
        if let Some(deadline) = self.retransmit_at {
            if deadline <= now {
                self.retransmit_at = None;
                self.on_retransmit_timeout(now);
            }
        }

        if let Some(deadline) = self.close_deadline {
            if deadline <= now && self.state != State::Closed {
                log::debug!("{}: close timeout in {:?}, evicting", self.key, self.state);
                self.state = State::Closed;
            }
        }

        if self.idle_deadline <= now && self.state != State::Closed {
            log::info!("{}: peer silent in {:?}, evicting", self.key, self.state);
            self.state = State::Closed;
        }
    }

    /// Earliest instant at which `poll` has work to do.
    pub fn poll_at(&self) -> Option<Instant> {
        [self.retransmit_at, self.close_deadline, Some(self.idle_deadline)]
            .into_iter()
            .flatten()
            .min()
    }

    fn deliver(&mut self, payload: &[u8]) {
        if let Some(receiver) = self.receiver.as_mut() {
            receiver(&self.handle, payload);
        }
    }

    /// Queue a payload-less segment.
    fn queue_control(&mut self, seq: u32, seg_flags: u16, ack: u32) {
        let header = TcpHeader::new(
            self.key.local_port,
            self.key.remote_port,
            seq,
            ack,
            seg_flags,
        );
        let segment = build_segment(header, &[], self.key.local_addr, self.key.remote_addr);
        self.outbox.push_back(segment);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.key)
            .field("state", &self.state)
            .field("seq_current", &self.seq_current)
            .field("expected_seq", &self.expected_seq)
            .field("window_limit", &self.window_limit)
            .field("occupancy", &self.occupancy)
            .field("in_flight", &self.in_flight.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tcp::{segment_checksum, TCP_HEADER_LEN};
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::mpsc;

    const MSS: usize = 100;
    const ISN: u32 = 5000;
    const PEER_ISN: u32 = 9000;

    fn key() -> ConnectionKey {
        ConnectionKey {
            remote_addr: Ipv4Addr::new(10, 0, 0, 2),
            remote_port: 40000,
            local_addr: Ipv4Addr::new(10, 0, 0, 1),
            local_port: 80,
        }
    }

    fn established(now: Instant) -> (Connection, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel();
        let config = StackConfig::default().with_mss(MSS);
        let mut conn = Connection::new(now, key(), ISN, PEER_ISN, &config, tx);
        // Handshake ACK
        conn.process_segment(now, PEER_ISN + 1, ISN + 1, flags::ACK, &[]);
        assert_eq!(conn.state(), State::Established);
        (conn, rx)
    }

    fn headers(conn: &mut Connection) -> Vec<(TcpHeader, usize)> {
        conn.take_outgoing()
            .into_iter()
            .map(|seg| {
                assert_eq!(segment_checksum(key().local_addr, key().remote_addr, &seg), 0);
                (TcpHeader::from_bytes(&seg).unwrap(), seg.len() - TCP_HEADER_LEN)
            })
            .collect()
    }

    #[test]
    fn test_in_order_data_is_delivered_and_acked() {
        let now = Instant::now();
        let (mut conn, _rx) = established(now);
        let received = Rc::new(RefCell::new(Vec::new()));
        let sink = received.clone();
        conn.register_receiver(move |_, data| sink.borrow_mut().push(data.to_vec()));

        conn.process_segment(now, PEER_ISN + 1, ISN + 1, flags::ACK, b"hello");

        assert_eq!(conn.expected_seq(), PEER_ISN + 6);
        assert_eq!(*received.borrow(), vec![b"hello".to_vec()]);
        let out = headers(&mut conn);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0.flags(), flags::ACK);
        assert_eq!(out[0].0.ack_number, PEER_ISN + 6);
        assert_eq!(out[0].0.seq_number, ISN + 1);
        assert_eq!(out[0].1, 0);
    }

    #[test]
    fn test_out_of_order_segment_is_dropped() {
        let now = Instant::now();
        let (mut conn, _rx) = established(now);
        let calls = Rc::new(RefCell::new(0));
        let counter = calls.clone();
        conn.register_receiver(move |_, _| *counter.borrow_mut() += 1);

        conn.process_segment(now, PEER_ISN + 50, ISN + 1, flags::ACK, b"late");

        assert_eq!(conn.expected_seq(), PEER_ISN + 1);
        assert_eq!(*calls.borrow(), 0);
        assert!(conn.take_outgoing().is_empty());
    }

    #[test]
    fn test_send_respects_window_and_queues_rest() {
        let now = Instant::now();
        let (mut conn, _rx) = established(now);

        conn.send(now, &[7u8; 250]);

        // Window starts at one MSS: one chunk goes out, two wait.
        let out = headers(&mut conn);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0.seq_number, ISN + 1);
        assert_eq!(out[0].0.ack_number, PEER_ISN + 1);
        assert_eq!(out[0].1, MSS);
        assert_eq!(conn.occupancy(), MSS);
        assert_eq!(conn.in_flight_len(), 1);
        assert_eq!(conn.pending_len(), 2);
        assert_eq!(conn.seq_current(), ISN + 251);
        assert_eq!(conn.retransmit_deadline(), Some(now + Duration::from_secs(1)));
    }

    #[test]
    fn test_ack_drains_and_admits_pending() {
        let now = Instant::now();
        let (mut conn, _rx) = established(now);
        conn.send(now, &[7u8; 250]);
        conn.take_outgoing();

        let later = now + Duration::from_millis(200);
        conn.process_segment(later, PEER_ISN + 1, ISN + 1 + MSS as u32, flags::ACK, &[]);

        // Window grew to 2 MSS, both queued chunks fit.
        assert_eq!(conn.window_limit(), 2 * MSS);
        let out = headers(&mut conn);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].0.seq_number, ISN + 1 + MSS as u32);
        assert_eq!(out[1].0.seq_number, ISN + 1 + 2 * MSS as u32);
        assert_eq!(out[1].1, 50);
        assert_eq!(conn.occupancy(), 150);
        assert_eq!(conn.pending_len(), 0);
        assert_eq!(conn.rtt().srtt(), Duration::from_millis(200));
    }

    #[test]
    fn test_cumulative_ack_retires_all() {
        let now = Instant::now();
        let (tx, _rx) = mpsc::channel();
        let config = StackConfig::default().with_mss(MSS);
        let mut conn = Connection::new(now, key(), ISN, PEER_ISN, &config, tx);
        conn.window_limit = 3 * MSS;

        conn.send(now, &[1u8; 3 * MSS]);
        assert_eq!(conn.in_flight_len(), 3);
        assert_eq!(conn.occupancy(), 3 * MSS);

        conn.process_segment(now, PEER_ISN + 1, ISN + 1 + 3 * MSS as u32, flags::ACK, &[]);
        assert_eq!(conn.in_flight_len(), 0);
        assert_eq!(conn.occupancy(), 0);
        assert_eq!(conn.retransmit_deadline(), None);
        assert_eq!(conn.window_limit(), 4 * MSS);
    }

    #[test]
    fn test_partial_ack_stops_at_matching_segment() {
        let now = Instant::now();
        let (tx, _rx) = mpsc::channel();
        let config = StackConfig::default().with_mss(MSS);
        let mut conn = Connection::new(now, key(), ISN, PEER_ISN, &config, tx);
        conn.window_limit = 3 * MSS;
        conn.send(now, &[1u8; 3 * MSS]);

        conn.process_segment(now, PEER_ISN + 1, ISN + 1 + MSS as u32, flags::ACK, &[]);
        assert_eq!(conn.in_flight_len(), 2);
        assert_eq!(conn.occupancy(), 2 * MSS);
        // No additive increase: data still outstanding.
        assert_eq!(conn.window_limit(), 3 * MSS);
        assert!(conn.retransmit_deadline().is_some());
    }

    #[test]
    fn test_rtt_seed_then_smoothing() {
        let now = Instant::now();
        let (mut conn, _rx) = established(now);

        conn.send(now, &[1u8; 10]);
        let t1 = now + Duration::from_millis(800);
        conn.process_segment(t1, PEER_ISN + 1, ISN + 11, flags::ACK, &[]);
        assert!(conn.rtt().has_sample());
        assert_eq!(conn.rtt().srtt(), Duration::from_millis(800));
        assert_eq!(conn.rtt().rttvar(), Duration::from_millis(400));
        assert_eq!(conn.rtt().rto(), Duration::from_millis(2400));

        conn.send(t1, &[1u8; 10]);
        let t2 = t1 + Duration::from_millis(400);
        conn.process_segment(t2, PEER_ISN + 1, ISN + 21, flags::ACK, &[]);
        // srtt = 0.875 * 800 + 0.125 * 400
        assert_eq!(conn.rtt().srtt(), Duration::from_millis(750));
        // rttvar = 0.75 * 400 + 0.25 * |400 - 750|
        assert_eq!(conn.rtt().rttvar(), Duration::from_micros(387_500));
        assert_eq!(conn.rtt().rto(), Duration::from_millis(2300));
    }

    #[test]
    fn test_timeout_retransmits_head_and_halves_window() {
        let now = Instant::now();
        let (mut conn, _rx) = established(now);
        conn.window_limit = 400;
        conn.send(now, &[1u8; 2 * MSS]);
        conn.take_outgoing();

        let t1 = now + Duration::from_secs(1);
        conn.poll(t1);
        assert_eq!(conn.window_limit(), 200);
        let out = headers(&mut conn);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0.seq_number, ISN + 1);
        assert_eq!(conn.retransmit_deadline(), Some(t1 + Duration::from_secs(1)));

        // Not due yet: nothing happens.
        conn.poll(t1 + Duration::from_millis(500));
        assert!(conn.take_outgoing().is_empty());

        let t2 = t1 + Duration::from_secs(1);
        conn.poll(t2);
        assert_eq!(conn.window_limit(), 100);
        let out = headers(&mut conn);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0.seq_number, ISN + 1);

        // A retransmitted segment never yields an RTT sample.
        conn.process_segment(t2, PEER_ISN + 1, ISN + 1 + MSS as u32, flags::ACK, &[]);
        assert!(!conn.rtt().has_sample());
        assert_eq!(conn.in_flight_len(), 1);
    }

    #[test]
    fn test_additive_increase_once_per_drained_round() {
        let now = Instant::now();
        let (mut conn, _rx) = established(now);
        assert_eq!(conn.window_limit(), MSS);

        for round in 1..=3u32 {
            conn.send(now, &[1u8; MSS]);
            let ack = ISN + 1 + round * MSS as u32;
            conn.process_segment(now, PEER_ISN + 1, ack, flags::ACK, &[]);
            assert_eq!(conn.window_limit(), (round as usize + 1) * MSS);
        }

        // A pure ACK with nothing outstanding changes nothing.
        conn.process_segment(now, PEER_ISN + 1, ISN + 1 + 3 * MSS as u32, flags::ACK, &[]);
        assert_eq!(conn.window_limit(), 4 * MSS);
    }

    #[test]
    fn test_peer_fin_notifies_and_acks() {
        let now = Instant::now();
        let (mut conn, _rx) = established(now);
        let received = Rc::new(RefCell::new(Vec::new()));
        let sink = received.clone();
        conn.register_receiver(move |_, data| sink.borrow_mut().push(data.to_vec()));

        conn.process_segment(now, PEER_ISN + 1, ISN + 1, flags::FIN | flags::ACK, &[]);

        assert_eq!(*received.borrow(), vec![Vec::<u8>::new()]);
        assert_eq!(conn.state(), State::CloseWait);
        let out = headers(&mut conn);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0.ack_number, PEER_ISN + 2);
        assert_eq!(out[0].0.seq_number, ISN + 1);

        // A retransmitted FIN is acknowledged with the same number.
        conn.process_segment(now, PEER_ISN + 1, ISN + 1, flags::FIN | flags::ACK, &[]);
        let out = headers(&mut conn);
        assert_eq!(out[0].0.ack_number, PEER_ISN + 2);
    }

    #[test]
    fn test_passive_close_reaches_closed() {
        let now = Instant::now();
        let (mut conn, _rx) = established(now);
        conn.process_segment(now, PEER_ISN + 1, ISN + 1, flags::FIN | flags::ACK, &[]);
        conn.take_outgoing();

        conn.close(now);
        assert_eq!(conn.state(), State::LastAck);
        let out = headers(&mut conn);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0.flags(), flags::FIN | flags::ACK);
        assert_eq!(out[0].0.seq_number, ISN + 1);
        assert_eq!(out[0].0.ack_number, PEER_ISN + 2);

        conn.process_segment(now, PEER_ISN + 2, ISN + 2, flags::ACK, &[]);
        assert_eq!(conn.state(), State::Closed);
    }

    #[test]
    fn test_active_close_then_peer_fin() {
        let now = Instant::now();
        let (mut conn, _rx) = established(now);

        conn.close(now);
        assert_eq!(conn.state(), State::FinWait);
        // Closing twice sends nothing more.
        conn.close(now);
        assert_eq!(headers(&mut conn).len(), 1);

        conn.process_segment(now, PEER_ISN + 1, ISN + 2, flags::FIN | flags::ACK, &[]);
        assert_eq!(conn.state(), State::Closed);
        let out = headers(&mut conn);
        assert_eq!(out[0].0.seq_number, ISN + 2);
    }

    #[test]
    fn test_close_timeout_evicts() {
        let now = Instant::now();
        let (mut conn, _rx) = established(now);
        conn.close(now);
        assert_eq!(conn.poll_at(), Some(now + Duration::from_secs(30)));

        conn.poll(now + Duration::from_secs(29));
        assert_eq!(conn.state(), State::FinWait);
        conn.poll(now + Duration::from_secs(30));
        assert_eq!(conn.state(), State::Closed);
    }

    #[test]
    fn test_handle_queues_commands() {
        let now = Instant::now();
        let (conn, rx) = established(now);
        let handle = conn.handle();
        handle.send(b"abc").unwrap();
        handle.close().unwrap();

        assert_eq!(rx.try_recv().unwrap(), Command::Send { key: key(), data: b"abc".to_vec() });
        assert_eq!(rx.try_recv().unwrap(), Command::Close { key: key() });

        drop(rx);
        assert!(matches!(handle.send(b"x"), Err(StackError::ChannelClosed)));
    }

    #[test]
    fn test_empty_slice_only_signals_peer_close() {
        let now = Instant::now();
        let (tx, _rx) = mpsc::channel();
        let config = StackConfig::default().with_mss(MSS);
        let mut conn = Connection::new(now, key(), ISN, PEER_ISN, &config, tx);
        let received = Rc::new(RefCell::new(Vec::new()));
        let sink = received.clone();
        conn.register_receiver(move |_, data| sink.borrow_mut().push(data.to_vec()));

        // Handshake ACK, data, then a pure ACK: only the data is reported.
        conn.process_segment(now, PEER_ISN + 1, ISN + 1, flags::ACK, &[]);
        conn.process_segment(now, PEER_ISN + 1, ISN + 1, flags::ACK, b"hi");
        conn.process_segment(now, PEER_ISN + 3, ISN + 1, flags::ACK, &[]);
        assert_eq!(conn.state(), State::Established);
        assert_eq!(*received.borrow(), vec![b"hi".to_vec()]);

        conn.process_segment(now, PEER_ISN + 3, ISN + 1, flags::FIN | flags::ACK, &[]);
        conn.process_segment(now, PEER_ISN + 3, ISN + 1, flags::FIN | flags::ACK, &[]);
        assert_eq!(*received.borrow(), vec![b"hi".to_vec(), Vec::new()]);
    }

    #[test]
    fn test_unanswered_syn_is_evicted_when_idle() {
        let now = Instant::now();
        let (tx, _rx) = mpsc::channel();
        let config = StackConfig::default().with_idle_timeout(Duration::from_secs(10));
        let mut conn = Connection::new(now, key(), ISN, PEER_ISN, &config, tx);
        assert_eq!(conn.poll_at(), Some(now + Duration::from_secs(10)));

        conn.poll(now + Duration::from_secs(9));
        assert_eq!(conn.state(), State::SynReceived);
        conn.poll(now + Duration::from_secs(10));
        assert_eq!(conn.state(), State::Closed);
    }

    #[test]
    fn test_accepted_segment_refreshes_idle_deadline() {
        let now = Instant::now();
        let (tx, _rx) = mpsc::channel();
        let config = StackConfig::default().with_idle_timeout(Duration::from_secs(10));
        let mut conn = Connection::new(now, key(), ISN, PEER_ISN, &config, tx);

        let t1 = now + Duration::from_secs(8);
        conn.process_segment(t1, PEER_ISN + 1, ISN + 1, flags::ACK, &[]);
        conn.poll(now + Duration::from_secs(12));
        assert_eq!(conn.state(), State::Established);

        // An out of order segment does not count as activity.
        conn.process_segment(t1 + Duration::from_secs(5), PEER_ISN + 40, ISN + 1, flags::ACK, b"x");
        conn.poll(t1 + Duration::from_secs(10));
        assert_eq!(conn.state(), State::Closed);
    }

    #[test]
    fn test_peer_sequence_wraps() {
        let now = Instant::now();
        let (tx, _rx) = mpsc::channel();
        let config = StackConfig::default().with_mss(MSS);
        let mut conn = Connection::new(now, key(), ISN, u32::MAX, &config, tx);
        assert_eq!(conn.expected_seq(), 0);
        let received = Rc::new(RefCell::new(Vec::new()));
        let sink = received.clone();
        conn.register_receiver(move |_, data| sink.borrow_mut().extend_from_slice(data));

        conn.process_segment(now, 0, ISN + 1, flags::ACK, b"abc");

        assert_eq!(*received.borrow(), b"abc".to_vec());
        assert_eq!(conn.expected_seq(), 3);
        let out = headers(&mut conn);
        assert_eq!(out[0].0.ack_number, 3);
    }

    #[test]
    fn test_cumulative_ack_across_sequence_wrap() {
        let now = Instant::now();
        let (tx, _rx) = mpsc::channel();
        let config = StackConfig::default().with_mss(MSS);
        let isn = u32::MAX - 150;
        let mut conn = Connection::new(now, key(), isn, PEER_ISN, &config, tx);
        conn.window_limit = 3 * MSS;

        // Segments start at MAX-149, MAX-49 (ends past the wrap) and 50.
        conn.send(now, &[1u8; 3 * MSS]);
        assert_eq!(conn.in_flight_len(), 3);
        assert_eq!(conn.seq_current(), 150);

        conn.process_segment(now, PEER_ISN + 1, 50, flags::ACK, &[]);
        assert_eq!(conn.in_flight_len(), 1);
        assert_eq!(conn.occupancy(), MSS);

        conn.process_segment(now, PEER_ISN + 1, 150, flags::ACK, &[]);
        assert_eq!(conn.in_flight_len(), 0);
        assert_eq!(conn.window_limit(), 4 * MSS);
    }

    #[test]
    fn test_close_holds_fin_behind_pending_data() {
        let now = Instant::now();
        let (mut conn, _rx) = established(now);
        conn.send(now, &[7u8; 250]);
        conn.close(now);
        assert_eq!(conn.state(), State::FinWait);

        // Only the chunk that fit the window; the FIN waits.
        let out = headers(&mut conn);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0.flags(), flags::ACK);

        conn.process_segment(now, PEER_ISN + 1, ISN + 1 + MSS as u32, flags::ACK, &[]);
        let out = headers(&mut conn);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].0.seq_number, ISN + 1 + MSS as u32);
        assert_eq!(out[1].0.seq_number, ISN + 1 + 2 * MSS as u32);
        assert_eq!(out[2].0.flags(), flags::FIN | flags::ACK);
        assert_eq!(out[2].0.seq_number, ISN + 251);
        assert_eq!(out[2].1, 0);

        // Released once.
        conn.process_segment(now, PEER_ISN + 1, ISN + 251, flags::ACK, &[]);
        assert!(conn.take_outgoing().is_empty());
    }
}
