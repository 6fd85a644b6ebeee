//! TCP (Transmission Control Protocol) wire format
//!
//! This module provides TCP header parsing and serialization, and the
//! pseudo-header checksum used to build and validate segments.

use std::net::Ipv4Addr;

use crate::network::{fold, protocol, sum_words};
use byteorder::{BigEndian, ByteOrder};

pub const TCP_HEADER_LEN: usize = 20;

/// Window advertised on every outgoing segment.
pub const DEFAULT_WINDOW: u16 = 0xffff;

/// TCP flag bits, as found in the low bits of the offset/flags word.
pub mod flags {
    pub const FIN: u16 = 0x0001;
    pub const SYN: u16 = 0x0002;
    pub const ACK: u16 = 0x0010;
    pub const MASK: u16 = 0x01ff;
}

/// TCP packet header structure
///
/// Represents the standard 20-byte TCP header as defined in RFC 793
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_number: u32,
    pub ack_number: u32,
    pub data_offset_and_flags: u16, // Data offset (4 bits) + Reserved (3 bits) + Flags (9 bits)
    pub window_size: u16,
    pub checksum: u16,
    pub urgent_ptr: u16,
}

impl TcpHeader {
    /// Create an option-less header with the given flags and a zero checksum.
    pub fn new(src_port: u16, dst_port: u16, seq_number: u32, ack_number: u32, flags: u16) -> Self {
        TcpHeader {
            src_port,
            dst_port,
            seq_number,
            ack_number,
            data_offset_and_flags: ((TCP_HEADER_LEN as u16 / 4) << 12) | (flags & flags::MASK),
            window_size: DEFAULT_WINDOW,
            checksum: 0,
            urgent_ptr: 0,
        }
    }

    /// Parse TCP header from byte slice
    ///
    /// Returns None if the data is too short to contain a valid TCP header
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < TCP_HEADER_LEN {
            return None;
        }

        Some(TcpHeader {
            src_port: BigEndian::read_u16(&data[0..2]),
            dst_port: BigEndian::read_u16(&data[2..4]),
            seq_number: BigEndian::read_u32(&data[4..8]),
            ack_number: BigEndian::read_u32(&data[8..12]),
            data_offset_and_flags: BigEndian::read_u16(&data[12..14]),
            window_size: BigEndian::read_u16(&data[14..16]),
            checksum: BigEndian::read_u16(&data[16..18]),
            urgent_ptr: BigEndian::read_u16(&data[18..20]),
        })
    }

    /// Convert TCP header to bytes
    pub fn to_bytes(&self) -> [u8; TCP_HEADER_LEN] {
        let mut bytes = [0u8; TCP_HEADER_LEN];
        BigEndian::write_u16(&mut bytes[0..2], self.src_port);
        BigEndian::write_u16(&mut bytes[2..4], self.dst_port);
        BigEndian::write_u32(&mut bytes[4..8], self.seq_number);
        BigEndian::write_u32(&mut bytes[8..12], self.ack_number);
        BigEndian::write_u16(&mut bytes[12..14], self.data_offset_and_flags);
        BigEndian::write_u16(&mut bytes[14..16], self.window_size);
        BigEndian::write_u16(&mut bytes[16..18], self.checksum);
        BigEndian::write_u16(&mut bytes[18..20], self.urgent_ptr);
        bytes
    }

    pub fn flags(&self) -> u16 {
        self.data_offset_and_flags & flags::MASK
    }

    /// Check if SYN flag is set
    pub fn is_syn(&self) -> bool {
        self.flags() & flags::SYN != 0
    }

    /// Get the data offset (header length) in bytes
    pub fn data_offset(&self) -> usize {
        ((self.data_offset_and_flags >> 12) as usize) * 4
    }

    /// Slice the payload out of a segment, honouring the data offset.
    pub fn payload<'a>(&self, segment: &'a [u8]) -> Option<&'a [u8]> {
        let offset = self.data_offset();
        if offset < TCP_HEADER_LEN {
            return None;
        }
        segment.get(offset..)
    }
}

/// Checksum over the IPv4 pseudo-header followed by `segment`.
///
/// Over a segment whose checksum field is already filled in correctly the
/// result is 0.
pub fn segment_checksum(src_addr: Ipv4Addr, dst_addr: Ipv4Addr, segment: &[u8]) -> u16 {
    // Pseudo header: src_ip(4) + dst_ip(4) + zero(1) + protocol(1) + tcp_len(2)
    let mut pseudo_header = [0u8; 12];
    pseudo_header[0..4].copy_from_slice(&src_addr.octets());
    pseudo_header[4..8].copy_from_slice(&dst_addr.octets());
    pseudo_header[9] = protocol::TCP;
    BigEndian::write_u16(&mut pseudo_header[10..12], segment.len() as u16);

    let sum = sum_words(sum_words(0, &pseudo_header), segment);
    !fold(sum)
}

/// Serialize `header` and `payload` into a segment with its checksum filled in.
///
/// `src_addr`/`dst_addr` are the IP addresses the segment travels between.
pub fn build_segment(
    header: TcpHeader,
    payload: &[u8],
    src_addr: Ipv4Addr,
    dst_addr: Ipv4Addr,
) -> Vec<u8> {
    let mut segment = Vec::with_capacity(TCP_HEADER_LEN + payload.len());
    segment.extend_from_slice(&TcpHeader { checksum: 0, ..header }.to_bytes());
    segment.extend_from_slice(payload);

    let sum = segment_checksum(src_addr, dst_addr, &segment);
    BigEndian::write_u16(&mut segment[16..18], sum);
    segment
}
