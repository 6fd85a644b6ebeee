//! Utility functions for the demos
//!
//! Host-side TUN configuration shared by the demo binaries.

pub mod network;

pub use network::*;
