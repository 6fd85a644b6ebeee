//! Listening TCP server
//!
//! Demultiplexes inbound segments by 4-tuple, answers SYNs and owns the
//! connection table.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::mpsc::Sender;
use std::time::Instant;

use rand::{Rng, RngCore};

use crate::config::StackConfig;
use crate::error::{Result, StackError};
use crate::transport::connection::{Command, Connection, ConnectionKey, State};
use crate::transport::tcp::{build_segment, flags, segment_checksum, TcpHeader};

/// Accept notification, invoked once per new connection.
pub type Monitor = Box<dyn FnMut(&mut Connection)>;

/// A TCP segment ready to be handed to the IP layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub dst: Ipv4Addr,
    pub segment: Vec<u8>,
}

/// What the server did with an inbound segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentOutcome {
    /// A SYN created (or replaced) this connection.
    Accepted(ConnectionKey),
    /// Handed to an existing connection.
    Dispatched(ConnectionKey),
    WrongPort,
    BadChecksum,
    /// No connection matches the 4-tuple.
    Unknown,
    Malformed,
}

pub struct TcpServer {
    port: u16,
    config: StackConfig,
    verify_checksums: bool,
    connections: HashMap<ConnectionKey, Connection>,
    monitor: Option<Monitor>,
    rng: Box<dyn RngCore>,
    commands: Sender<Command>,
    outbox: VecDeque<Outgoing>,
}

impl TcpServer {
    /// Listen on `port`. `rng` supplies initial sequence numbers, `commands`
    /// is handed to every connection handle.
    pub fn new<R>(port: u16, config: StackConfig, rng: R, commands: Sender<Command>) -> Self
    where
        R: RngCore + 'static,
    {
        TcpServer {
            port,
            config,
            verify_checksums: true,
            connections: HashMap::new(),
            monitor: None,
            rng: Box::new(rng),
            commands,
            outbox: VecDeque::new(),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_verify_checksums(&mut self, verify: bool) {
        self.verify_checksums = verify;
    }

    /// Set the accept callback. The last registration wins.
    pub fn register_monitor<F>(&mut self, monitor: F)
    where
        F: FnMut(&mut Connection) + 'static,
    {
        self.monitor = Some(Box::new(monitor));
    }

    pub fn connection(&self, key: &ConnectionKey) -> Option<&Connection> {
        self.connections.get(key)
    }

    pub fn connection_mut(&mut self, key: &ConnectionKey) -> Option<&mut Connection> {
        self.connections.get_mut(key)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Handle one TCP segment that arrived from `src` for `dst`.
    pub fn receive_segment(
        &mut self,
        now: Instant,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        segment: &[u8],
    ) -> SegmentOutcome {
        let header = match TcpHeader::from_bytes(segment) {
            Some(header) => header,
            None => {
                log::warn!("Discarding truncated TCP segment from {}", src);
                return SegmentOutcome::Malformed;
            }
        };

        if header.dst_port != self.port {
            log::trace!("Segment for port {} ignored, listening on {}", header.dst_port, self.port);
            return SegmentOutcome::WrongPort;
        }

        if self.verify_checksums && segment_checksum(src, dst, segment) != 0 {
            log::warn!("Invalid segment from {}:{}: bad checksum", src, header.src_port);
            return SegmentOutcome::BadChecksum;
        }

        let payload = match header.payload(segment) {
            Some(payload) => payload,
            None => {
                log::warn!("Discarding segment from {} with bad data offset", src);
                return SegmentOutcome::Malformed;
            }
        };

        let key = ConnectionKey {
            remote_addr: src,
            remote_port: header.src_port,
            local_addr: dst,
            local_port: header.dst_port,
        };

        if header.is_syn() {
            self.accept(now, key, header.seq_number);
            SegmentOutcome::Accepted(key)
        } else if let Some(connection) = self.connections.get_mut(&key) {
            connection.process_segment(
                now,
                header.seq_number,
                header.ack_number,
                header.flags(),
                payload,
            );
            SegmentOutcome::Dispatched(key)
        } else {
            log::warn!("{} (segment without a known connection)", key);
            SegmentOutcome::Unknown
        }
    }

    fn accept(&mut self, now: Instant, key: ConnectionKey, peer_seq: u32) {
        let isn: u32 = self.rng.gen_range(0..=0xffff);
        let ack = peer_seq.wrapping_add(1);

        let header = TcpHeader::new(key.local_port, key.remote_port, isn, ack, flags::SYN | flags::ACK);
        let segment = build_segment(header, &[], key.local_addr, key.remote_addr);
        self.outbox.push_back(Outgoing { dst: key.remote_addr, segment });

        let connection = Connection::new(now, key, isn, peer_seq, &self.config, self.commands.clone());
        if self.connections.insert(key, connection).is_some() {
            log::debug!("{}: duplicate SYN replaced existing connection", key);
        }
        log::info!("{}: accepted, isn={}", key, isn);

        if let (Some(monitor), Some(connection)) = (self.monitor.as_mut(), self.connections.get_mut(&key)) {
            monitor(connection);
        }
    }

    /// Apply an application command queued through a connection handle.
    pub fn apply(&mut self, now: Instant, command: Command) -> Result<()> {
        match command {
            Command::Send { key, data } => {
                let connection = self.connections.get_mut(&key).ok_or(StackError::UnknownConnection)?;
                connection.send(now, &data);
            }
            Command::Close { key } => {
                let connection = self.connections.get_mut(&key).ok_or(StackError::UnknownConnection)?;
                connection.close(now);
            }
        }
        Ok(())
    }

    /// Fire due timers on every connection.
    pub fn poll(&mut self, now: Instant) {
        for connection in self.connections.values_mut() {
            connection.poll(now);
        }
    }

    pub fn poll_at(&self) -> Option<Instant> {
        self.connections.values().filter_map(Connection::poll_at).min()
    }

    /// Drain every segment queued by the server and its connections.
    pub fn take_outgoing(&mut self) -> Vec<Outgoing> {
        let mut outgoing: Vec<Outgoing> = self.outbox.drain(..).collect();
        for connection in self.connections.values_mut() {
            let dst = connection.key().remote_addr;
            outgoing.extend(
                connection
                    .take_outgoing()
                    .into_iter()
                    .map(|segment| Outgoing { dst, segment }),
            );
        }
        outgoing
    }

    /// Drop closed connections from the table. Returns how many were removed.
    ///
    /// Drain `take_outgoing` first, a closing connection may still have a
    /// final ACK queued.
    pub fn evict_closed(&mut self) -> usize {
        let before = self.connections.len();
        self.connections.retain(|key, connection| {
            let keep = connection.state() != State::Closed;
            if !keep {
                log::info!("{}: closed, removed from table", key);
            }
            keep
        });
        before - self.connections.len()
    }
}
