//! IPv4 protocol implementation
//!
//! This module provides IPv4 header parsing and serialization, checksum
//! calculation, and CIDR prefixes used by the routing table.
//!
//! Only the fixed 20-byte header is ever produced. Received headers with
//! options are accepted; their options are skipped.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::StackError;
use crate::network::checksum;
use byteorder::{BigEndian, ByteOrder};

pub const IPV4_HEADER_LEN: usize = 20;
const IPV4_VERSION: u8 = 4;
const DEFAULT_IHL: u8 = 5; // 5 * 4 = 20 bytes (standard header length)

/// IPv4 packet header structure
///
/// Represents the standard 20-byte IPv4 header as defined in RFC 791
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    pub version: u8,
    pub ihl: u8, // Internet Header Length
    pub tos: u8, // DSCP + ECN
    pub total_len: u16,
    pub id: u16,
    pub flags_frag_offset: u16, // Flags and Fragment Offset
    pub ttl: u8,                // Time to Live
    pub protocol: u8,           // Next Protocol
    pub checksum: u16,
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
}

impl Ipv4Header {
    /// Create a header for a locally originated packet carrying `payload_len` bytes.
    ///
    /// Identification and flags are zero, DSCP/ECN is zero. The checksum is
    /// left at zero; call `update_checksum` before serializing.
    pub fn new(
        protocol: u8,
        src_addr: Ipv4Addr,
        dst_addr: Ipv4Addr,
        ttl: u8,
        payload_len: usize,
    ) -> Self {
        Ipv4Header {
            version: IPV4_VERSION,
            ihl: DEFAULT_IHL,
            tos: 0,
            total_len: (IPV4_HEADER_LEN + payload_len) as u16,
            id: 0,
            flags_frag_offset: 0,
            ttl,
            protocol,
            checksum: 0,
            src_addr,
            dst_addr,
        }
    }

    /// Parse IPv4 header from byte slice
    ///
    /// Returns None if the data is too short, the version field is not 4 or
    /// the header length field is smaller than the fixed header.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < IPV4_HEADER_LEN {
            return None;
        }

        let version = (data[0] & 0xF0) >> 4;
        let ihl = data[0] & 0x0F;
        if version != IPV4_VERSION || ihl < DEFAULT_IHL {
            return None;
        }

        Some(Ipv4Header {
            version,
            ihl,
            tos: data[1],
            total_len: BigEndian::read_u16(&data[2..4]),
            id: BigEndian::read_u16(&data[4..6]),
            flags_frag_offset: BigEndian::read_u16(&data[6..8]),
            ttl: data[8],
            protocol: data[9],
            checksum: BigEndian::read_u16(&data[10..12]),
            src_addr: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
            dst_addr: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
        })
    }

    /// Convert IPv4 header to bytes
    ///
    /// Always emits the fixed 20-byte form, options are never written.
    pub fn to_bytes(&self) -> [u8; IPV4_HEADER_LEN] {
        let mut bytes = [0u8; IPV4_HEADER_LEN];
        bytes[0] = (self.version << 4) | DEFAULT_IHL;
        bytes[1] = self.tos;
        BigEndian::write_u16(&mut bytes[2..4], self.total_len);
        BigEndian::write_u16(&mut bytes[4..6], self.id);
        BigEndian::write_u16(&mut bytes[6..8], self.flags_frag_offset);
        bytes[8] = self.ttl;
        bytes[9] = self.protocol;
        BigEndian::write_u16(&mut bytes[10..12], self.checksum);
        bytes[12..16].copy_from_slice(&self.src_addr.octets());
        bytes[16..20].copy_from_slice(&self.dst_addr.octets());

        bytes
    }

    /// Recalculate the checksum over the header with the checksum field zeroed.
    pub fn update_checksum(&mut self) {
        self.checksum = 0;
        self.checksum = checksum(&self.to_bytes());
    }

    /// Get the header length in bytes, as announced by the IHL field
    pub fn header_len(&self) -> usize {
        (self.ihl as usize) * 4
    }

    /// Slice the payload out of a received packet.
    ///
    /// The total length field bounds the payload so that link-layer padding is
    /// not handed to the layer above.
    pub fn payload<'a>(&self, packet: &'a [u8]) -> Option<&'a [u8]> {
        let end = (self.total_len as usize).min(packet.len());
        packet.get(self.header_len()..end)
    }

    /// Serialize this header (checksum recomputed) followed by `payload`.
    ///
    /// The total length is set to 20 + payload length.
    pub fn build_packet(mut self, payload: &[u8]) -> Vec<u8> {
        self.ihl = DEFAULT_IHL;
        self.total_len = (IPV4_HEADER_LEN + payload.len()) as u16;
        self.update_checksum();

        let mut packet = Vec::with_capacity(self.total_len as usize);
        packet.extend_from_slice(&self.to_bytes());
        packet.extend_from_slice(payload);
        packet
    }
}

/// IPv4 protocol constants
pub mod protocol {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
}

/// An IPv4 network prefix such as `10.0.0.0/8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Cidr {
    address: Ipv4Addr,
    prefix_len: u8,
}

impl Ipv4Cidr {
    /// Returns None if `prefix_len` exceeds 32.
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Option<Self> {
        if prefix_len > 32 {
            return None;
        }
        Some(Ipv4Cidr { address, prefix_len })
    }

    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn netmask(&self) -> u32 {
        match self.prefix_len {
            0 => 0,
            len => u32::MAX << (32 - len as u32),
        }
    }

    /// Whether `addr` falls inside this prefix.
    ///
    /// Host bits set in the configured address are ignored.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let mask = self.netmask();
        u32::from(self.address) & mask == u32::from(addr) & mask
    }
}

impl FromStr for Ipv4Cidr {
    type Err = StackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StackError::InvalidCidr(s.to_string());
        let (addr, prefix) = s.trim().split_once('/').ok_or_else(invalid)?;
        let address: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        let prefix_len: u8 = prefix.parse().map_err(|_| invalid())?;
        Ipv4Cidr::new(address, prefix_len).ok_or_else(invalid)
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}
