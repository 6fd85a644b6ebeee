//! Link transport boundary
//!
//! The IP layer hands every outbound packet to a `Link` together with the
//! next-hop address it was routed to. Inbound packets are fed to the stack by
//! whoever drives the link (see `Stack::receive_packet`).

use std::io;
use std::net::Ipv4Addr;

use tun_tap::{Iface, Mode};

/// Largest packet read from a link in one go (MTU plus some overhead).
pub const MAX_PACKET_LEN: usize = 1504;

pub trait Link {
    /// Transmit one network-layer packet towards `next_hop`.
    fn transmit(&mut self, packet: &[u8], next_hop: Ipv4Addr) -> io::Result<()>;

    /// Whether inbound TCP checksums should be trusted without validation.
    fn ignore_checksum(&self) -> bool {
        false
    }
}

impl<L: Link + ?Sized> Link for &mut L {
    fn transmit(&mut self, packet: &[u8], next_hop: Ipv4Addr) -> io::Result<()> {
        (**self).transmit(packet, next_hop)
    }

    fn ignore_checksum(&self) -> bool {
        (**self).ignore_checksum()
    }
}

/// A link backed by a kernel TUN device.
///
/// The tunnel is point-to-point, so the next hop is only logged.
pub struct TunLink {
    iface: Iface,
    ignore_checksum: bool,
}

impl TunLink {
    /// Create (or attach to) the TUN device `name`, without packet info.
    ///
    /// Root/sudo privileges are required to create the device.
    pub fn new(name: &str) -> io::Result<Self> {
        let iface = Iface::without_packet_info(name, Mode::Tun)?;
        log::info!("TUN device created: {}", iface.name());
        Ok(TunLink { iface, ignore_checksum: false })
    }

    /// Skip TCP checksum validation, e.g. when the kernel offloads checksums.
    pub fn with_ignore_checksum(mut self, ignore: bool) -> Self {
        self.ignore_checksum = ignore;
        self
    }

    pub fn name(&self) -> &str {
        self.iface.name()
    }

    /// Make `recv` return `WouldBlock` instead of waiting for a packet.
    pub fn set_non_blocking(&self) -> io::Result<()> {
        self.iface.set_non_blocking()
    }

    /// Read one packet into `buf`.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.iface.recv(buf)
    }
}

impl Link for TunLink {
    fn transmit(&mut self, packet: &[u8], next_hop: Ipv4Addr) -> io::Result<()> {
        log::trace!("TUN {}: {} bytes via {}", self.iface.name(), packet.len(), next_hop);
        self.iface.send(packet).map(|_| ())
    }

    fn ignore_checksum(&self) -> bool {
        self.ignore_checksum
    }
}

/// Test double that records every transmitted packet.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingLink {
    pub sent: Vec<(Vec<u8>, Ipv4Addr)>,
    pub ignore_checksum: bool,
}

#[cfg(test)]
impl Link for RecordingLink {
    fn transmit(&mut self, packet: &[u8], next_hop: Ipv4Addr) -> io::Result<()> {
        self.sent.push((packet.to_vec(), next_hop));
        Ok(())
    }

    fn ignore_checksum(&self) -> bool {
        self.ignore_checksum
    }
}
