//! Server endpoints and host name resolution.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};

use tracing::debug;

use crate::error::{RpcError, RpcResult};

/// Well-known NFS port, used when nothing overrides it.
pub const NFS_PORT: u16 = 2049;

/// Transport protocol of an endpoint.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

/// A connection target: transport address plus protocol.
///
/// Ordering and equality compare the raw address bytes (family, IP octets,
/// port in network order) and then the protocol, so the value can key the
/// session registry.
#[derive(Copy, Clone, Debug)]
pub struct PeerAddress {
    addr: SocketAddr,
    protocol: Protocol,
}

impl PeerAddress {
    pub fn new(addr: SocketAddr, protocol: Protocol) -> Self {
        Self { addr, protocol }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn set_port(&mut self, port: u16) {
        self.addr.set_port(port);
    }

    pub fn set_protocol(&mut self, protocol: Protocol) {
        self.protocol = protocol;
    }

    /// RPC network id (RFC 5665) of this endpoint.
    pub fn netid(&self) -> &'static str {
        match (self.protocol, self.addr) {
            (Protocol::Tcp, SocketAddr::V4(_)) => "tcp",
            (Protocol::Tcp, SocketAddr::V6(_)) => "tcp6",
            (Protocol::Udp, SocketAddr::V4(_)) => "udp",
            (Protocol::Udp, SocketAddr::V6(_)) => "udp6",
        }
    }

    /// Universal address: the IP in its usual text form followed by the port
    /// as two dot-separated decimal bytes, e.g. `10.0.0.1.8.1` for port 2049.
    pub fn universal_address(&self) -> String {
        let port = self.addr.port();
        format!("{}.{}.{}", self.addr.ip(), port >> 8, port & 0xff)
    }

    /// Bytes compared by `Ord`/`Eq`: family tag, IP octets, port.
    fn raw(&self) -> ([u8; 16], u8, u16) {
        match self.addr.ip() {
            IpAddr::V4(ip) => {
                let mut octets = [0_u8; 16];
                octets[..4].copy_from_slice(&ip.octets());
                (octets, 4, self.addr.port())
            }
            IpAddr::V6(ip) => (ip.octets(), 6, self.addr.port()),
        }
    }
}

impl PartialEq for PeerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PeerAddress {}

impl PartialOrd for PeerAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PeerAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        let (a_ip, a_family, a_port) = self.raw();
        let (b_ip, b_family, b_port) = other.raw();
        a_family
            .cmp(&b_family)
            .then_with(|| a_ip.cmp(&b_ip))
            .then_with(|| a_port.cmp(&b_port))
            .then_with(|| self.protocol.cmp(&other.protocol))
    }
}

impl Hash for PeerAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw().hash(state);
        self.protocol.hash(state);
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.netid())
    }
}

/// Produces the candidate endpoints for a host, one at a time.
///
/// Numeric literals are used as-is; names go through the system resolver.
/// Every candidate gets the forced port and protocol, if any.
#[derive(Debug, Clone)]
pub struct AddressResolver {
    candidates: Vec<IpAddr>,
    next: usize,
    port: u16,
    protocol: Protocol,
}

impl AddressResolver {
    /// Resolves `host`, which may be an IPv4 literal, an IPv6 literal (with
    /// or without brackets) or a host name.
    pub async fn resolve(host: &str) -> RpcResult<AddressResolver> {
        let candidates = match parse_literal(host)? {
            Some(ip) => vec![ip],
            None => {
                let mut found = Vec::new();
                for addr in tokio::net::lookup_host((host, NFS_PORT)).await? {
                    if !found.contains(&addr.ip()) {
                        found.push(addr.ip());
                    }
                }
                found
            }
        };
        if candidates.is_empty() {
            return Err(RpcError::AddressNotFound);
        }
        debug!("Resolved {} to {:?}", host, candidates);
        Ok(AddressResolver::from_candidates(candidates))
    }

    /// Builds a resolver over an already known list of addresses.
    pub fn from_candidates(candidates: Vec<IpAddr>) -> AddressResolver {
        AddressResolver { candidates, next: 0, port: NFS_PORT, protocol: Protocol::Tcp }
    }

    pub fn force_port(&mut self, port: u16) {
        self.port = port;
    }

    pub fn force_protocol(&mut self, protocol: Protocol) {
        self.protocol = protocol;
    }

    /// Yields the next candidate, or [`RpcError::AddressNotFound`] once the
    /// list is exhausted.
    pub fn next_address(&mut self) -> RpcResult<PeerAddress> {
        let ip = *self.candidates.get(self.next).ok_or(RpcError::AddressNotFound)?;
        self.next += 1;
        Ok(PeerAddress::new(SocketAddr::new(ip, self.port), self.protocol))
    }

    /// Starts the sequence over from the first candidate.
    pub fn rewind(&mut self) {
        self.next = 0;
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

/// Recognizes numeric hosts so they skip the resolver. Returns `Ok(None)`
/// for anything that should be looked up by name.
fn parse_literal(host: &str) -> RpcResult<Option<IpAddr>> {
    if let Some(inner) = host.strip_prefix('[') {
        let literal = inner
            .strip_suffix(']')
            .ok_or_else(|| RpcError::BadAddress(host.to_string()))?;
        return literal
            .parse::<IpAddr>()
            .map(Some)
            .map_err(|_| RpcError::BadAddress(host.to_string()));
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(Some(ip));
    }
    // Dotted digits that fail to parse (e.g. "10.0.0.300") are a typo, not a name.
    let dotted_digits = !host.is_empty() && host.chars().all(|c| c.is_ascii_digit() || c == '.');
    if host.contains(':') || dotted_digits {
        return Err(RpcError::BadAddress(host.to_string()));
    }
    Ok(None)
}
