//! Error type shared by every layer of the stack.

use std::net::Ipv4Addr;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StackError>;

#[derive(Debug, Error)]
pub enum StackError {
    /// No routing table entry covers the address.
    #[error("no route to {0}")]
    NoRoute(Ipv4Addr),

    #[error("host address has not been configured")]
    AddressUnset,

    #[error("host address is already configured")]
    AddressAlreadySet,

    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    #[error("checksum mismatch")]
    BadChecksum,

    #[error("invalid CIDR notation: {0}")]
    InvalidCidr(String),

    #[error("no such connection")]
    UnknownConnection,

    /// The coordinating stack was dropped while a handle was still in use.
    #[error("stack command channel closed")]
    ChannelClosed,

    #[error("link I/O error: {0}")]
    Io(#[from] std::io::Error),
}
