//! The shared state of one network stack instance.
//!
//! Every layer thread and every TCB holds a reference to the [`Stack`]: the packet buffer, the
//! protocol registry, the thread table and the interface configuration. Multiple stacks are
//! independent of each other, which keeps tests from interfering.
//!
//! [`Stack`]: struct.Stack.html
use core::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use spin::{Once, RwLock};

use crate::layer::{ipv6, tcp};
use crate::layer::tcp::{FourTuple, IsnGenerator};
use crate::netif::{Neighbor, NeighborCache, Netif};
use crate::netreg::{Entry, NetType, Registry};
use crate::pktbuf::{Pktbuf, Snip};
use crate::thread::{Msg, Pid, Threads};
use crate::wire::{Ipv6Address, TcpSeqNumber};

/// Ports from here on up are handed out for active opens.
pub const EPHEMERAL_PORT_START: u16 = 1024;

/// The configuration of a stack.
#[derive(Clone, Debug)]
pub struct Config {
    pub ipv6: ipv6::Config,
    pub tcp: tcp::Config,
    /// The stack size of the layer threads.
    pub thread_stack_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ipv6: ipv6::Config::default(),
            tcp: tcp::Config::default(),
            thread_stack_size: 256 * 1024,
        }
    }
}

pub struct Stack {
    config: Config,
    pktbuf: Pktbuf,
    netreg: RwLock<Registry>,
    threads: Threads,
    netifs: RwLock<Vec<Netif>>,
    neighbors: RwLock<NeighborCache>,
    pub(crate) ipv6_pid: Once<Option<Pid>>,
    pub(crate) tcp_pid: Once<Option<Pid>>,
    isn: IsnGenerator,
    epoch: Instant,
    nonce: AtomicU64,
}

impl Stack {
    pub fn new(config: Config) -> Arc<Self> {
        Stack::with_pktbuf(config, Pktbuf::new())
    }

    /// Create a stack using a specific, possibly bounded, packet buffer.
    pub fn with_pktbuf(config: Config, pktbuf: Pktbuf) -> Arc<Self> {
        Arc::new(Stack {
            config,
            pktbuf,
            netreg: RwLock::new(Registry::new()),
            threads: Threads::new(),
            netifs: RwLock::new(Vec::new()),
            neighbors: RwLock::new(NeighborCache::new()),
            ipv6_pid: Once::new(),
            tcp_pid: Once::new(),
            isn: IsnGenerator::from_entropy(),
            epoch: Instant::now(),
            nonce: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pktbuf(&self) -> &Pktbuf {
        &self.pktbuf
    }

    pub fn netreg(&self) -> &RwLock<Registry> {
        &self.netreg
    }

    pub fn threads(&self) -> &Threads {
        &self.threads
    }

    pub fn register(&self, ty: NetType, entry: Entry) {
        self.netreg.write().register(ty, entry)
    }

    pub fn unregister(&self, ty: NetType, entry: Entry) {
        self.netreg.write().unregister(ty, entry)
    }

    pub fn add_interface(&self, netif: Netif) {
        net_debug!("stack: interface {} with {} addresses", netif.pid(), netif.addrs().len());
        self.netifs.write().push(netif)
    }

    /// A copy of the configured interfaces.
    pub fn netifs(&self) -> Vec<Netif> {
        self.netifs.read().clone()
    }

    pub fn netif(&self, pid: Pid) -> Option<Netif> {
        self.netifs.read().iter()
            .find(|netif| netif.pid() == pid)
            .cloned()
    }

    /// Make `addr` reachable through the interface `iface`.
    pub fn add_neighbor(&self, addr: Ipv6Address, iface: Pid, l2addr: &[u8]) {
        self.neighbors.write().fill(addr, Neighbor {
            iface,
            l2addr: l2addr.to_vec(),
        })
    }

    pub fn resolve(&self, dst: &Ipv6Address) -> Option<Neighbor> {
        self.neighbors.read().resolve(dst).cloned()
    }

    /// Check if packets to `dst` are meant for this stack.
    pub fn accepts(&self, dst: &Ipv6Address) -> bool {
        dst.is_loopback() || self.netifs.read().iter().any(|netif| netif.has_addr(dst))
    }

    /// Select the source address for a packet towards `dst`.
    ///
    /// Only addresses of `iface` are considered if it is given. Among the candidates the one
    /// sharing the longest prefix with `dst` wins, with link-local destinations only answered
    /// from link-local addresses.
    pub fn best_source(&self, iface: Option<Pid>, dst: &Ipv6Address) -> Option<Ipv6Address> {
        if dst.is_loopback() {
            return Some(Ipv6Address::LOOPBACK);
        }

        let netifs = self.netifs.read();
        netifs.iter()
            .filter(|netif| iface.map_or(true, |pid| netif.pid() == pid))
            .flat_map(|netif| netif.addrs().iter().map(|cidr| cidr.address()))
            .filter(|addr| addr.is_unicast())
            .filter(|addr| !dst.is_link_local() || addr.is_link_local())
            .max_by_key(|addr| addr.common_prefix_len(dst))
    }

    /// Post a message, giving back the packet reference it carries if the thread is gone.
    pub fn deliver(&self, pid: Pid, msg: Msg) -> bool {
        match self.threads.send(pid, msg) {
            Ok(()) => true,
            Err(Msg::Rcv(pkt)) | Err(Msg::Snd(pkt)) => {
                net_debug!("stack: {} is gone, dropping packet", pid);
                self.pktbuf.release(pkt);
                false
            },
            Err(Msg::Abort) => false,
        }
    }

    /// Hand a packet travelling up to all receivers registered for the context.
    ///
    /// Returns the number of receivers. If there are none, the reference of the caller is still
    /// owned by the caller.
    pub fn dispatch_receive(&self, ty: NetType, ctx: u32, pkt: Snip) -> usize {
        self.dispatch(ty, ctx, Msg::Rcv(pkt), pkt)
    }

    /// Hand a packet travelling down to all receivers registered for the context.
    pub fn dispatch_send(&self, ty: NetType, ctx: u32, pkt: Snip) -> usize {
        self.dispatch(ty, ctx, Msg::Snd(pkt), pkt)
    }

    fn dispatch(&self, ty: NetType, ctx: u32, msg: Msg, pkt: Snip) -> usize {
        let targets: Vec<Pid> = self.netreg.read()
            .iter(ty, ctx)
            .map(|entry| entry.pid)
            .collect();
        if targets.is_empty() {
            return 0;
        }

        self.pktbuf.hold(pkt, targets.len() - 1);
        for &pid in &targets {
            self.deliver(pid, msg);
        }
        targets.len()
    }

    /// The initial sequence number of a new connection.
    pub fn initial_seq(&self, connection: FourTuple) -> TcpSeqNumber {
        self.isn.get_isn(connection, self.epoch.elapsed())
    }

    /// Draw a random port outside of the reserved range.
    pub fn random_port(&self) -> u16 {
        let nonce = self.nonce.fetch_add(1, Ordering::Relaxed);
        let span = u64::from(u16::max_value() - EPHEMERAL_PORT_START) + 1;
        EPHEMERAL_PORT_START + (self.isn.pseudo_random(nonce) % span) as u16
    }
}

impl fmt::Debug for Stack {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Stack")
            .field("config", &self.config)
            .field("pktbuf", &self.pktbuf)
            .field("netifs", &*self.netifs.read())
            .finish()
    }
}
