//! The coordinating stack
//!
//! `Stack` owns the IP layer, the TCP server and the link, and processes one
//! event at a time: a received packet, queued application commands, or timer
//! expiry. Nothing inside it is shared, so no connection is ever mutated from
//! two places at once.

use std::net::Ipv4Addr;
use std::sync::mpsc::{self, Receiver};
use std::time::Instant;

use rand::RngCore;

use crate::config::StackConfig;
use crate::error::Result;
use crate::iface::ip::{Datagram, IpLayer};
use crate::iface::link::Link;
use crate::network::RoutingTable;
use crate::transport::{Command, Connection, TcpServer};

/// Statistics about the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackStats {
    pub active_connections: usize,
    pub routes: usize,
    pub host_address: Option<Ipv4Addr>,
}

pub struct Stack<L> {
    ip: IpLayer<L>,
    server: TcpServer,
    datagrams: Receiver<Datagram>,
    commands: Receiver<Command>,
}

impl<L: Link> Stack<L> {
    /// Build a stack that listens for TCP connections on `listen_port`.
    pub fn new<R>(link: L, listen_port: u16, config: StackConfig, rng: R) -> Self
    where
        R: RngCore + 'static,
    {
        let (datagram_tx, datagrams) = mpsc::channel();
        let (command_tx, commands) = mpsc::channel();

        let mut ip = IpLayer::new(link, &config);
        ip.register_receiver(datagram_tx);

        let mut server = TcpServer::new(listen_port, config, rng, command_tx);
        server.set_verify_checksums(!ip.link().ignore_checksum());

        Stack { ip, server, datagrams, commands }
    }

    pub fn set_host_address(&mut self, addr: Ipv4Addr) -> Result<()> {
        self.ip.set_host_address(addr)
    }

    pub fn set_routing_table(&mut self, routes: RoutingTable) {
        self.ip.set_routing_table(routes);
    }

    /// Set the accept callback, see `TcpServer::register_monitor`.
    pub fn register_monitor<F>(&mut self, monitor: F)
    where
        F: FnMut(&mut Connection) + 'static,
    {
        self.server.register_monitor(monitor);
    }

    pub fn ip(&self) -> &IpLayer<L> {
        &self.ip
    }

    pub fn ip_mut(&mut self) -> &mut IpLayer<L> {
        &mut self.ip
    }

    pub fn server(&self) -> &TcpServer {
        &self.server
    }

    pub fn server_mut(&mut self) -> &mut TcpServer {
        &mut self.server
    }

    /// Process one packet received from the link.
    ///
    /// Errors are logged and the packet is dropped; they never reach the caller.
    pub fn receive_packet(&mut self, now: Instant, packet: &[u8]) {
        match self.ip.receive(packet) {
            Ok(disposition) => log::trace!("Packet handled: {:?}", disposition),
            Err(e) => log::warn!("Dropping packet: {}", e),
        }

        while let Ok(datagram) = self.datagrams.try_recv() {
            let outcome = self
                .server
                .receive_segment(now, datagram.src, datagram.dst, &datagram.payload);
            log::trace!("Segment from {}: {:?}", datagram.src, outcome);
        }

        self.apply_commands(now);
        self.flush();
    }

    /// Apply queued application commands and fire due timers.
    pub fn poll(&mut self, now: Instant) {
        self.apply_commands(now);
        self.server.poll(now);
        self.flush();
        self.server.evict_closed();
    }

    /// Earliest instant at which `poll` has timer work to do.
    pub fn poll_at(&self) -> Option<Instant> {
        self.server.poll_at()
    }

    pub fn stats(&self) -> StackStats {
        StackStats {
            active_connections: self.server.len(),
            routes: self.ip.routing_table().len(),
            host_address: self.ip.host_address(),
        }
    }

    fn apply_commands(&mut self, now: Instant) {
        while let Ok(command) = self.commands.try_recv() {
            if let Err(e) = self.server.apply(now, command) {
                log::warn!("Dropping application command: {}", e);
            }
        }
    }

    /// Hand every queued TCP segment to the IP layer.
    fn flush(&mut self) {
        for outgoing in self.server.take_outgoing() {
            if let Err(e) = self.ip.send(&outgoing.segment, outgoing.dst) {
                log::warn!("Failed to send segment to {}: {}", outgoing.dst, e);
            }
        }
    }
}
