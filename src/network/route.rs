//! Static forwarding table, CIDR as in rfc1519/rfc4632.

use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::{Result, StackError};
use crate::network::ipv4::Ipv4Cidr;

/// A prefix of addresses that should be sent towards `next_hop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub net: Ipv4Cidr,
    pub next_hop: Ipv4Addr,
}

impl Route {
    pub fn new(net: Ipv4Cidr, next_hop: Ipv4Addr) -> Self {
        Route { net, next_hop }
    }
}

/// An ordered routing table.
///
/// Order matters only to break ties: among matching routes of equal prefix
/// length the one appearing last wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTable {
    routes: Vec<Route>,
}

impl RoutingTable {
    pub fn new(routes: Vec<Route>) -> Self {
        RoutingTable { routes }
    }

    /// Build a table from `(cidr, next_hop)` string pairs.
    pub fn from_pairs<S: AsRef<str>>(pairs: &[(S, S)]) -> Result<Self> {
        let mut routes = Vec::with_capacity(pairs.len());
        for (net, hop) in pairs {
            let net: Ipv4Cidr = net.as_ref().parse()?;
            let next_hop = hop
                .as_ref()
                .trim()
                .parse()
                .map_err(|_| StackError::InvalidCidr(hop.as_ref().to_string()))?;
            routes.push(Route::new(net, next_hop));
        }
        Ok(RoutingTable { routes })
    }

    pub fn push(&mut self, route: Route) {
        self.routes.push(route);
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Find the next hop for `addr` by longest-prefix match.
    pub fn lookup(&self, addr: Ipv4Addr) -> Option<Ipv4Addr> {
        let mut best_match: Option<&Route> = None;
        for route in &self.routes {
            if !route.net.contains(addr) {
                continue;
            }

            // `>=` so that later entries win ties.
            match best_match {
                Some(best) if best.net.prefix_len() > route.net.prefix_len() => {}
                _ => best_match = Some(route),
            }
        }
        best_match.map(|route| route.next_hop)
    }
}

/// Parses one `<cidr> <next-hop>` pair per line. Blank lines and lines
/// starting with `#` are skipped.
impl FromStr for RoutingTable {
    type Err = StackError;

    fn from_str(s: &str) -> Result<Self> {
        let mut pairs = Vec::new();
        for line in s.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next(), fields.next()) {
                (Some(net), Some(hop), None) => pairs.push((net, hop)),
                _ => return Err(StackError::InvalidCidr(line.to_string())),
            }
        }
        RoutingTable::from_pairs(&pairs)
    }
}
