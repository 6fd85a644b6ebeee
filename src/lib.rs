//! A minimal TCP/IP stack running over an arbitrary link
//!
//! This library provides:
//! - IPv4 local delivery and forwarding with longest-prefix-match routing
//! - ICMP Time-Exceeded generation when a forwarded packet runs out of TTL
//! - A single-port TCP server with cumulative acknowledgment, RTT estimation,
//!   retransmission timeouts and an AIMD congestion window
//!
//! The stack is sans-IO: callers feed packets and the current time in, and
//! transmit through a `Link`.

pub mod config;
pub mod error;
pub mod iface;
pub mod network;
pub mod transport;

// Re-export commonly used types
pub use config::{StackConfig, TimeExceededRoute};
pub use error::{Result, StackError};
pub use iface::{Link, Stack, TunLink};
pub use network::{Ipv4Header, RoutingTable};
pub use transport::{Connection, ConnectionHandle, ConnectionKey, TcpHeader, TcpServer};
