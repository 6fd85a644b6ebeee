//! ICMP (Internet Control Message Protocol) implementation
//!
//! This module provides the ICMP header codec and the construction of
//! Time-Exceeded messages emitted when a forwarded packet runs out of TTL.

use crate::network::checksum;
use byteorder::{BigEndian, ByteOrder};

/// ICMP header length in bytes
pub const ICMP_HEADER_LEN: usize = 8;

/// ICMP message types
pub const ICMP_TYPE_TIME_EXCEEDED: u8 = 11;

/// Code for "time to live exceeded in transit"
pub const ICMP_CODE_TTL_EXCEEDED: u8 = 0;

/// Bytes of the offending datagram quoted in an error message:
/// its 20-byte header plus the first 8 payload bytes.
pub const QUOTED_LEN: usize = 28;

/// ICMP packet header structure
///
/// Represents the standard 8-byte ICMP header as defined in RFC 792
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpHeader {
    pub msg_type: u8,  // ICMP message type
    pub msg_code: u8,  // ICMP message code
    pub checksum: u16, // ICMP checksum
    pub rest: [u8; 4], // Type-specific data, unused for Time-Exceeded
}

impl IcmpHeader {
    /// Parse ICMP header from byte slice
    ///
    /// Returns None if the data is too short to contain a valid ICMP header
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < ICMP_HEADER_LEN {
            return None;
        }

        Some(IcmpHeader {
            msg_type: data[0],
            msg_code: data[1],
            checksum: BigEndian::read_u16(&data[2..4]),
            rest: [data[4], data[5], data[6], data[7]],
        })
    }

    /// Convert ICMP header to bytes
    pub fn to_bytes(&self) -> [u8; ICMP_HEADER_LEN] {
        let mut bytes = [0u8; ICMP_HEADER_LEN];
        bytes[0] = self.msg_type;
        bytes[1] = self.msg_code;
        BigEndian::write_u16(&mut bytes[2..4], self.checksum);
        bytes[4..8].copy_from_slice(&self.rest);
        bytes
    }

    /// Check if this is a Time-Exceeded message
    pub fn is_time_exceeded(&self) -> bool {
        self.msg_type == ICMP_TYPE_TIME_EXCEEDED
    }
}

/// Build a Time-Exceeded message quoting `original`.
///
/// `original` must be the packet as it was received, before its TTL was
/// decremented. At most its first 28 bytes are quoted.
pub fn time_exceeded(original: &[u8]) -> Vec<u8> {
    let quoted = &original[..original.len().min(QUOTED_LEN)];
    let header = IcmpHeader {
        msg_type: ICMP_TYPE_TIME_EXCEEDED,
        msg_code: ICMP_CODE_TTL_EXCEEDED,
        checksum: 0,
        rest: [0; 4],
    };

    let mut message = Vec::with_capacity(ICMP_HEADER_LEN + quoted.len());
    message.extend_from_slice(&header.to_bytes());
    message.extend_from_slice(quoted);

    let sum = checksum(&message);
    BigEndian::write_u16(&mut message[2..4], sum);
    message
}
