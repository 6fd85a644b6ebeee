//! A TCP echo server on a TUN interface
//!
//! Creates `tun0`, gives the host side 10.0.0.254/24 and runs the stack as
//! 10.0.0.1, echoing everything received on port 7. Packets for other
//! addresses are routed with the table given as first argument (lines of
//! `<cidr> <next-hop>`), or through the host by default.
//!
//! ```sh
//! sudo RUST_LOG=debug cargo run --example echo [routes.txt]
//! nc 10.0.0.1 7
//! ```
//!
//! Note: Root/sudo privileges are required to create and configure the TUN device.

use std::io;
use std::net::Ipv4Addr;
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;
use toy_tcpip::iface::link::MAX_PACKET_LEN;
use toy_tcpip::{RoutingTable, Stack, StackConfig, TunLink};

mod utils;
use utils::network::configure_interface;

const LOCAL_ADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const ECHO_PORT: u16 = 7;
const DEFAULT_ROUTES: &str = "0.0.0.0/0 10.0.0.254\n";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let routes: RoutingTable = match std::env::args().nth(1) {
        Some(path) => std::fs::read_to_string(path)?.parse()?,
        None => DEFAULT_ROUTES.parse()?,
    };

    let link = TunLink::new("tun0")?;
    configure_interface(link.name(), "10.0.0.254/24")?;
    link.set_non_blocking()?;

    let mut stack = Stack::new(link, ECHO_PORT, StackConfig::default(), StdRng::from_entropy());
    stack.set_host_address(LOCAL_ADDR)?;
    stack.set_routing_table(routes);
    stack.register_monitor(|conn| {
        log::info!("New connection {}", conn.key());
        conn.register_receiver(|handle, data| {
            if data.is_empty() {
                log::info!("{} closed by peer", handle.key());
                if let Err(e) = handle.close() {
                    log::warn!("Close failed: {}", e);
                }
            } else if let Err(e) = handle.send(data) {
                log::warn!("Echo failed: {}", e);
            }
        });
    });

    println!("Echo server listening on {}:{}", LOCAL_ADDR, ECHO_PORT);
    println!("Try: nc {} {}", LOCAL_ADDR, ECHO_PORT);

    let mut buf = [0u8; MAX_PACKET_LEN];
    loop {
        match stack.ip().link().recv(&mut buf) {
            Ok(nbytes) => stack.receive_packet(Instant::now(), &buf[..nbytes]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(Duration::from_millis(1)),
            Err(e) => return Err(e.into()),
        }
        stack.poll(Instant::now());
    }
}
