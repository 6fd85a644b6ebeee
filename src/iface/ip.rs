//! IP layer: local delivery, forwarding and Time-Exceeded generation.

use std::net::Ipv4Addr;
use std::sync::mpsc::Sender;

use crate::config::{StackConfig, TimeExceededRoute};
use crate::error::{Result, StackError};
use crate::iface::link::Link;
use crate::network::ipv4::{protocol, Ipv4Header, IPV4_HEADER_LEN};
use crate::network::{checksum, icmp, RoutingTable};

/// A TCP payload delivered to the local host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub payload: Vec<u8>,
}

/// What the IP layer did with an inbound packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handed to the registered receiver.
    Delivered,
    /// Addressed to us but nobody consumes it.
    Dropped,
    Forwarded { next_hop: Ipv4Addr },
    /// TTL ran out; an ICMP Time-Exceeded was sent instead.
    TimeExceeded { next_hop: Ipv4Addr },
}

pub struct IpLayer<L> {
    link: L,
    local_addr: Option<Ipv4Addr>,
    routes: RoutingTable,
    receiver: Option<Sender<Datagram>>,
    default_ttl: u8,
    time_exceeded_route: TimeExceededRoute,
}

impl<L: Link> IpLayer<L> {
    pub fn new(link: L, config: &StackConfig) -> Self {
        IpLayer {
            link,
            local_addr: None,
            routes: RoutingTable::default(),
            receiver: None,
            default_ttl: config.default_ttl,
            time_exceeded_route: config.time_exceeded_route,
        }
    }

    /// Set the local address. Only allowed once.
    pub fn set_host_address(&mut self, addr: Ipv4Addr) -> Result<()> {
        if self.local_addr.is_some() {
            return Err(StackError::AddressAlreadySet);
        }
        log::info!("Host address set to {}", addr);
        self.local_addr = Some(addr);
        Ok(())
    }

    pub fn host_address(&self) -> Option<Ipv4Addr> {
        self.local_addr
    }

    /// Replace the whole forwarding table.
    pub fn set_routing_table(&mut self, routes: RoutingTable) {
        log::debug!("Routing table replaced ({} routes)", routes.len());
        self.routes = routes;
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routes
    }

    /// Set where locally addressed TCP payloads go. The last registration wins.
    pub fn register_receiver(&mut self, receiver: Sender<Datagram>) {
        self.receiver = Some(receiver);
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn next_hop(&self, dst: Ipv4Addr) -> Result<Ipv4Addr> {
        self.routes.lookup(dst).ok_or(StackError::NoRoute(dst))
    }

    /// Handle one packet received from the link.
    pub fn receive(&mut self, packet: &[u8]) -> Result<Disposition> {
        let local_addr = self.local_addr.ok_or(StackError::AddressUnset)?;
        let header = Ipv4Header::from_bytes(packet).ok_or(StackError::Malformed("IPv4 header"))?;
        let payload = header.payload(packet).ok_or(StackError::Malformed("IPv4 length"))?;

        if !self.link.ignore_checksum() && checksum(&packet[..header.header_len()]) != 0 {
            return Err(StackError::BadChecksum);
        }

        if header.dst_addr == local_addr {
            return Ok(self.deliver(&header, payload));
        }

        let ttl = header.ttl.saturating_sub(1);
        if ttl > 0 {
            let next_hop = self.next_hop(header.dst_addr)?;
            let forwarded = Ipv4Header { ttl, ..header }.build_packet(payload);
            self.link.transmit(&forwarded, next_hop)?;
            log::trace!("Forwarded {} -> {} via {}", header.src_addr, header.dst_addr, next_hop);
            Ok(Disposition::Forwarded { next_hop })
        } else {
            let message = icmp::time_exceeded(packet);
            let reply = Ipv4Header {
                id: header.id,
                flags_frag_offset: header.flags_frag_offset,
                ..Ipv4Header::new(protocol::ICMP, local_addr, header.src_addr, self.default_ttl, message.len())
            }
            .build_packet(&message);

            let target = match self.time_exceeded_route {
                TimeExceededRoute::Source => header.src_addr,
                TimeExceededRoute::LocalAddress => local_addr,
            };
            let next_hop = self.next_hop(target)?;
            self.link.transmit(&reply, next_hop)?;
            log::debug!(
                "TTL exceeded for {} -> {}, ICMP sent via {}",
                header.src_addr,
                header.dst_addr,
                next_hop
            );
            Ok(Disposition::TimeExceeded { next_hop })
        }
    }

    fn deliver(&mut self, header: &Ipv4Header, payload: &[u8]) -> Disposition {
        if header.protocol != protocol::TCP {
            log::trace!("Unsupported protocol {} from {}, dropped", header.protocol, header.src_addr);
            return Disposition::Dropped;
        }

        let receiver = match self.receiver.as_ref() {
            Some(receiver) => receiver,
            None => return Disposition::Dropped,
        };

        let datagram = Datagram {
            src: header.src_addr,
            dst: header.dst_addr,
            payload: payload.to_vec(),
        };
        if receiver.send(datagram).is_err() {
            log::warn!("TCP receiver went away, unregistering it");
            self.receiver = None;
            return Disposition::Dropped;
        }
        Disposition::Delivered
    }

    /// Wrap a TCP segment in an IPv4 header and transmit it towards `dst`.
    pub fn send(&mut self, segment: &[u8], dst: Ipv4Addr) -> Result<()> {
        let local_addr = self.local_addr.ok_or(StackError::AddressUnset)?;
        let next_hop = self.next_hop(dst)?;
        let packet = Ipv4Header::new(protocol::TCP, local_addr, dst, self.default_ttl, segment.len())
            .build_packet(segment);
        debug_assert_eq!(packet.len(), IPV4_HEADER_LEN + segment.len());
        self.link.transmit(&packet, next_hop)?;
        Ok(())
    }
}
