//! The protocol registry.
//!
//! Threads announce their interest in packets of a protocol type by registering an [`Entry`],
//! a demultiplexing context paired with their pid. Layers look up the receivers of a packet by
//! type and context and hand each of them one reference to the packet.
//!
//! The registry is plain data. It does not lock, a [`Stack`] wraps it in a read-write lock.
//!
//! [`Entry`]: struct.Entry.html
//! [`Stack`]: ../stack/struct.Stack.html
use crate::layer::{self, icmpv6, tcp};
use crate::pktbuf::{Pktbuf, Snip};
use crate::thread::Pid;
use crate::wire::IpProtocol;

/// The context matching every packet of a type.
pub const CTX_ALL: u32 = 0xffff_ffff;

/// The type of a snip and the key of a registry bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NetType {
    /// Octets that have not been interpreted yet.
    Undef,
    /// The interface header, see `netif::NetifHdr`.
    Netif,
    Ipv6,
    Icmpv6,
    Tcp,
    Udp,
}

impl NetType {
    const BUCKETS: usize = 5;

    /// The IP protocol number of the type.
    ///
    /// Types that are no IP payload map to the reserved protocol.
    pub fn protnum(self) -> IpProtocol {
        match self {
            NetType::Ipv6 => IpProtocol::Ipv6,
            NetType::Icmpv6 => IpProtocol::Icmpv6,
            NetType::Tcp => IpProtocol::Tcp,
            NetType::Udp => IpProtocol::Udp,
            NetType::Undef | NetType::Netif => IpProtocol::Reserved,
        }
    }

    fn bucket(self) -> Option<usize> {
        match self {
            NetType::Undef => None,
            NetType::Netif => Some(0),
            NetType::Ipv6 => Some(1),
            NetType::Icmpv6 => Some(2),
            NetType::Tcp => Some(3),
            NetType::Udp => Some(4),
        }
    }
}

impl From<IpProtocol> for NetType {
    fn from(protocol: IpProtocol) -> Self {
        match protocol {
            IpProtocol::Ipv6 => NetType::Ipv6,
            IpProtocol::Icmpv6 => NetType::Icmpv6,
            IpProtocol::Tcp => NetType::Tcp,
            IpProtocol::Udp => NetType::Udp,
            _ => NetType::Undef,
        }
    }
}

/// A registration of a thread for a demultiplexing context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Entry {
    pub ctx: u32,
    pub pid: Pid,
}

/// A position in the registrations of a type, see [`Registry::first`].
///
/// The position is only meaningful as long as the registry is not modified.
///
/// [`Registry::first`]: struct.Registry.html#method.first
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cursor {
    pub entry: Entry,
    position: usize,
}

/// One list of registrations for each protocol type.
#[derive(Debug, Default)]
pub struct Registry {
    buckets: [Vec<Entry>; NetType::BUCKETS],
}

impl Entry {
    pub fn new(ctx: u32, pid: Pid) -> Self {
        Entry { ctx, pid }
    }
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Add an entry in front of all others of the type.
    ///
    /// Nothing happens for `NetType::Undef`, it has no bucket.
    pub fn register(&mut self, ty: NetType, entry: Entry) {
        if let Some(bucket) = self.bucket_mut(ty) {
            bucket.insert(0, entry);
        }
    }

    /// Remove one registration that equals `entry`, if any.
    pub fn unregister(&mut self, ty: NetType, entry: Entry) {
        if let Some(bucket) = self.bucket_mut(ty) {
            if let Some(position) = bucket.iter().position(|other| *other == entry) {
                bucket.remove(position);
            }
        }
    }

    /// Find the first entry registered for the context.
    pub fn lookup(&self, ty: NetType, ctx: u32) -> Option<Entry> {
        self.first(ty, ctx).map(|cursor| cursor.entry)
    }

    /// Count the entries registered for exactly this context.
    pub fn count(&self, ty: NetType, ctx: u32) -> usize {
        self.iter(ty, ctx).count()
    }

    /// Position at the first entry registered for the context.
    pub fn first(&self, ty: NetType, ctx: u32) -> Option<Cursor> {
        self.find_from(ty, ctx, 0)
    }

    /// Advance to the next entry with the same context.
    ///
    /// Identical registrations are visited once each.
    pub fn get_next(&self, ty: NetType, cursor: Cursor) -> Option<Cursor> {
        self.find_from(ty, cursor.entry.ctx, cursor.position + 1)
    }

    /// Iterate over all entries of the context, in registration order from newest to oldest.
    pub fn iter(&self, ty: NetType, ctx: u32) -> impl Iterator<Item=Entry> + '_ {
        self.bucket(ty).iter()
            .filter(move |entry| entry.ctx == ctx)
            .cloned()
    }

    fn find_from(&self, ty: NetType, ctx: u32, start: usize) -> Option<Cursor> {
        let bucket = self.bucket(ty);
        let offset = bucket.get(start..)?.iter().position(|entry| entry.ctx == ctx)?;
        Some(Cursor { entry: bucket[start + offset], position: start + offset })
    }

    fn bucket(&self, ty: NetType) -> &[Entry] {
        match ty.bucket() {
            Some(idx) => &self.buckets[idx],
            None => &[],
        }
    }

    fn bucket_mut(&mut self, ty: NetType) -> Option<&mut Vec<Entry>> {
        let idx = ty.bucket()?;
        Some(&mut self.buckets[idx])
    }
}

/// Compute and store the checksum of the header snip `hdr`.
///
/// The checksum covers the chain starting at `hdr` and the pseudo header derived from the
/// network layer snip `pseudo`. Only types with a checksum over a pseudo header are supported,
/// all others return `Error::NoChecksum`.
pub fn calc_csum(pktbuf: &Pktbuf, hdr: Snip, pseudo: Snip) -> layer::Result<()> {
    match pktbuf.ty(hdr) {
        Some(NetType::Icmpv6) => icmpv6::calc_csum(pktbuf, hdr, pseudo),
        Some(NetType::Tcp) => tcp::calc_csum(pktbuf, hdr, pseudo),
        Some(_) => Err(layer::Error::NoChecksum),
        None => Err(layer::Error::Fault),
    }
}
