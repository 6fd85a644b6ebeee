//! Transport layer implementation
//!
//! This module contains the TCP side of the stack:
//! - tcp: segment header codec and checksums
//! - connection: per-connection reliability engine
//! - server: listening socket and connection table

pub mod connection;
pub mod server;
pub mod tcp;

// Re-export commonly used items
pub use connection::{Command, Connection, ConnectionHandle, ConnectionKey, RttEstimator, State};
pub use server::{Outgoing, SegmentOutcome, TcpServer};
pub use tcp::TcpHeader;
