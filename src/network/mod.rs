//! Network layer wire formats
//!
//! This module contains the codecs used by the IP layer:
//! - IPv4: header encoding/decoding and CIDR prefixes
//! - ICMP: header codec and Time-Exceeded construction
//! - Routing: static forwarding table with longest-prefix match

pub mod icmp;
pub mod ipv4;
pub mod route;

// Re-export commonly used items
pub use icmp::{IcmpHeader, ICMP_TYPE_TIME_EXCEEDED};
pub use ipv4::{protocol, Ipv4Cidr, Ipv4Header};
pub use route::{Route, RoutingTable};

/// Calculate Internet checksum
///
/// Algorithm: Sum data in 16-bit chunks, add carry bits to the sum,
/// and return the one's complement of the result.
/// Used for IPv4, ICMP and (with a pseudo-header) TCP checksums.
/// Running it over data that already carries a valid checksum yields 0.
pub fn checksum(data: &[u8]) -> u16 {
    !fold(sum_words(0, data))
}

/// Add `data` as big-endian 16-bit words to a running 32-bit sum.
pub(crate) fn sum_words(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }

    // Odd trailing byte is padded with zero
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }

    sum
}

/// Fold the carries of a 32-bit sum back into 16 bits.
pub(crate) fn fold(mut sum: u32) -> u16 {
    while (sum >> 16) > 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}
