//! Network interfaces, their packet header and the neighbor cache.
//!
//! An interface is a thread that moves packets to and from a link. The stack only sees its pid,
//! its addresses and link-layer address. Packets travelling between a layer and an interface
//! carry a [`NetifHdr`] snip in front of the network layer header, naming the interface and the
//! link-layer addresses.
//!
//! [`NetifHdr`]: struct.NetifHdr.html
use std::collections::BTreeMap;

use byteorder::{ByteOrder, NetworkEndian};

use crate::thread::Pid;
use crate::wire::{Error, Ipv6Address, Ipv6Cidr, Result};

/// The default hop limit of a new interface.
pub const DEFAULT_HOP_LIMIT: u8 = 64;

/// The configuration of one interface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Netif {
    pid: Pid,
    addrs: Vec<Ipv6Cidr>,
    hop_limit: u8,
    l2addr: Vec<u8>,
}

impl Netif {
    /// An interface served by the thread `pid`, without addresses.
    pub fn new(pid: Pid) -> Self {
        Netif {
            pid,
            addrs: Vec::new(),
            hop_limit: DEFAULT_HOP_LIMIT,
            l2addr: Vec::new(),
        }
    }

    /// Add an address with its prefix.
    pub fn with_addr(mut self, addr: Ipv6Cidr) -> Self {
        self.addrs.push(addr);
        self
    }

    pub fn with_hop_limit(mut self, hop_limit: u8) -> Self {
        self.hop_limit = hop_limit;
        self
    }

    pub fn with_l2addr(mut self, l2addr: &[u8]) -> Self {
        self.l2addr = l2addr.to_vec();
        self
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn addrs(&self) -> &[Ipv6Cidr] {
        &self.addrs
    }

    pub fn hop_limit(&self) -> u8 {
        self.hop_limit
    }

    pub fn l2addr(&self) -> &[u8] {
        &self.l2addr
    }

    /// Check if the interface owns the address, or listens to the multicast group.
    pub fn has_addr(&self, addr: &Ipv6Address) -> bool {
        self.addrs.iter().any(|cidr| cidr.address() == *addr)
            || self.addrs.iter().any(|cidr| cidr.address().solicited_node_multicast() == *addr)
            || *addr == Ipv6Address::LINK_LOCAL_ALL_NODES
    }
}

/// Flags of the interface header.
pub mod flags {
    /// Send to or received from the link-layer broadcast address.
    pub const BROADCAST: u8 = 0x01;
    /// Send to or received from a link-layer multicast address.
    pub const MULTICAST: u8 = 0x02;
}

// The interface header in the packet buffer
//
// +--------+--------+--------+--------+
// |src len |dst len |   interface pid |
// +--------+--------+--------+--------+
// |  interface pid  | flags  |reserved|
// +--------+--------+--------+--------+
// | src link-layer address ...
// +--------+--------+--------+--------+
// | dst link-layer address ...
// +--------+--------+--------+--------+
mod field {
    use crate::wire::field::Field;

    pub const SRC_LEN: usize = 0;
    pub const DST_LEN: usize = 1;
    pub const IFACE:   Field = 2..6;
    pub const FLAGS:   usize = 6;
    pub const ADDRS:   usize = 8;
}

/// The interface header of a packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetifHdr {
    pub iface: Pid,
    pub flags: u8,
    pub src_l2addr: Vec<u8>,
    pub dst_l2addr: Vec<u8>,
}

impl NetifHdr {
    /// A header for the interface, without link-layer addresses.
    pub fn new(iface: Pid) -> Self {
        NetifHdr {
            iface,
            flags: 0,
            src_l2addr: Vec::new(),
            dst_l2addr: Vec::new(),
        }
    }

    pub fn parse(buffer: &[u8]) -> Result<NetifHdr> {
        if buffer.len() < field::ADDRS {
            return Err(Error::Truncated);
        }

        let src_len = usize::from(buffer[field::SRC_LEN]);
        let dst_len = usize::from(buffer[field::DST_LEN]);
        let src_end = field::ADDRS + src_len;
        let dst_end = src_end + dst_len;
        if buffer.len() < dst_end {
            return Err(Error::Truncated);
        }

        Ok(NetifHdr {
            iface: Pid(NetworkEndian::read_u32(&buffer[field::IFACE])),
            flags: buffer[field::FLAGS],
            src_l2addr: buffer[field::ADDRS..src_end].to_vec(),
            dst_l2addr: buffer[src_end..dst_end].to_vec(),
        })
    }

    pub fn buffer_len(&self) -> usize {
        field::ADDRS + self.src_l2addr.len() + self.dst_l2addr.len()
    }

    pub fn emit(&self, buffer: &mut [u8]) {
        let src_end = field::ADDRS + self.src_l2addr.len();
        buffer[field::SRC_LEN] = self.src_l2addr.len() as u8;
        buffer[field::DST_LEN] = self.dst_l2addr.len() as u8;
        NetworkEndian::write_u32(&mut buffer[field::IFACE], self.iface.0);
        buffer[field::FLAGS] = self.flags;
        buffer[field::FLAGS + 1] = 0;
        buffer[field::ADDRS..src_end].copy_from_slice(&self.src_l2addr);
        buffer[src_end..self.buffer_len()].copy_from_slice(&self.dst_l2addr);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = vec![0; self.buffer_len()];
        self.emit(&mut buffer);
        buffer
    }
}

/// A reachable neighbor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Neighbor {
    pub iface: Pid,
    pub l2addr: Vec<u8>,
}

/// Maps next hops to the interface and link-layer address they are reachable through.
///
/// Entries are static, there is no neighbor discovery that would add or expire them.
#[derive(Clone, Debug, Default)]
pub struct NeighborCache {
    entries: BTreeMap<Ipv6Address, Neighbor>,
}

impl NeighborCache {
    pub fn new() -> Self {
        NeighborCache::default()
    }

    pub fn fill(&mut self, addr: Ipv6Address, neighbor: Neighbor) {
        self.entries.insert(addr, neighbor);
    }

    pub fn remove(&mut self, addr: &Ipv6Address) -> Option<Neighbor> {
        self.entries.remove(addr)
    }

    /// Find the neighbor to send a packet for `dst` to.
    pub fn resolve(&self, dst: &Ipv6Address) -> Option<&Neighbor> {
        self.entries.get(dst)
    }
}
