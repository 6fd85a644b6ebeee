//! Interface layer
//!
//! This module ties the codecs and the TCP engine to a physical link:
//! - link: the `Link` boundary and a TUN-backed implementation
//! - ip: local delivery, forwarding and ICMP Time-Exceeded
//! - stack: the single coordinator that serialises every event

pub mod ip;
pub mod link;
pub mod stack;

// Re-export commonly used items
pub use ip::{Datagram, Disposition, IpLayer};
pub use link::{Link, TunLink};
pub use stack::{Stack, StackStats};
