use rand::Rng as _;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

pub const ID_LEN: usize = 20;
pub const TOKEN_LEN: usize = 8;

/// Compact node info: 20-byte node id + 4-byte IPv4 + 2-byte big-endian port.
pub const COMPACT_NODE_LEN: usize = 26;
const COMPACT_PEER_LEN: usize = 6;

// Neighbor ids keep this many leading bytes of the target id.
const NEIGHBOR_PREFIX_LEN: usize = 15;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub [u8; ID_LEN]);

impl NodeId {
    pub fn random() -> Self {
        let mut id = [0u8; ID_LEN];
        rand::rng().fill(&mut id[..]);
        Self(id)
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let id: [u8; ID_LEN] = bytes.try_into().ok()?;
        Some(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// An id sharing a long prefix with `self`, so the owner of `self` is
    /// likely to hand our address out when it relays other lookups.
    pub fn neighbor(&self) -> Self {
        let mut out = self.0;
        for b in &mut out[NEIGHBOR_PREFIX_LEN..] {
            *b = !*b;
        }
        Self(out)
    }

    pub fn distance(&self, other: &[u8; ID_LEN]) -> [u8; ID_LEN] {
        let mut out = [0u8; ID_LEN];
        for (i, b) in out.iter_mut().enumerate() {
            *b = self.0[i] ^ other[i];
        }
        out
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(self.0))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Random bytes for transaction ids, tokens and throwaway node ids.
pub fn random_identifier(len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    rand::rng().fill(&mut out[..]);
    out
}

pub fn neighbor_identifier(target: &NodeId) -> NodeId {
    target.neighbor()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl Node {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }

    /// Compact form; `None` for IPv6 nodes, which have no 26-byte encoding.
    #[cfg(test)]
    pub fn to_compact(&self) -> Option<[u8; COMPACT_NODE_LEN]> {
        let SocketAddr::V4(v4) = self.addr else {
            return None;
        };
        let mut out = [0u8; COMPACT_NODE_LEN];
        out[..20].copy_from_slice(&self.id.0);
        out[20..24].copy_from_slice(&v4.ip().octets());
        out[24..].copy_from_slice(&v4.port().to_be_bytes());
        Some(out)
    }
}

/// Parses a compact node list. A buffer whose length is not a multiple of 26
/// yields no nodes at all.
pub fn parse_compact_nodes(buf: &[u8]) -> Vec<Node> {
    if buf.len() % COMPACT_NODE_LEN != 0 {
        return Vec::new();
    }
    buf.chunks_exact(COMPACT_NODE_LEN)
        .map(|chunk| {
            let mut id = [0u8; ID_LEN];
            id.copy_from_slice(&chunk[..20]);
            let ip = Ipv4Addr::new(chunk[20], chunk[21], chunk[22], chunk[23]);
            let port = u16::from_be_bytes([chunk[24], chunk[25]]);
            Node::new(NodeId(id), SocketAddr::V4(SocketAddrV4::new(ip, port)))
        })
        .collect()
}

#[cfg(test)]
pub fn encode_compact_nodes(nodes: &[Node]) -> Vec<u8> {
    nodes.iter().filter_map(Node::to_compact).flatten().collect()
}

/// Compact peer info from a `get_peers` `values` entry: 4-byte IPv4 + port.
pub fn parse_compact_peer(bytes: &[u8]) -> Option<SocketAddr> {
    if bytes.len() != COMPACT_PEER_LEN {
        return None;
    }
    let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
    let port = u16::from_be_bytes([bytes[4], bytes[5]]);
    Some(SocketAddr::new(IpAddr::V4(ip), port))
}

pub fn is_publicly_routable_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            if v4.is_private() || v4.is_loopback() || v4.is_unspecified() {
                return false;
            }
            if v4.is_link_local() || v4.is_multicast() || v4.is_broadcast() {
                return false;
            }

            // Documentation and benchmark ranges.
            let o = v4.octets();
            if (o[0] == 192 && o[1] == 0 && o[2] == 2)
                || (o[0] == 198 && o[1] == 51 && o[2] == 100)
                || (o[0] == 203 && o[1] == 0 && o[2] == 113)
                || (o[0] == 198 && (o[1] == 18 || o[1] == 19))
            {
                return false;
            }
            true
        }
        IpAddr::V6(v6) => {
            if v6.is_loopback() || v6.is_unspecified() || v6.is_multicast() {
                return false;
            }
            if v6.is_unique_local() || v6.is_unicast_link_local() {
                return false;
            }
            let seg = v6.segments();
            !(seg[0] == 0x2001 && seg[1] == 0x0db8)
        }
    }
}
